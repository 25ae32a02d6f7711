//! Description of a program invocation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to run: program, arguments, working directory and deadline.
///
/// A spec is frozen once it is handed to [`Command::new`](crate::Command::new).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// The program to execute.
    pub program: String,
    /// Arguments passed verbatim, without shell interpretation.
    pub args: Vec<String>,
    /// Working directory; inherits the parent's when `None`.
    pub cwd: Option<PathBuf>,
    /// Wall-clock budget; `None` or zero means unbounded.
    pub timeout: Option<Duration>,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting.
    pub env_clear: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// The effective deadline, treating zero as "no deadline".
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }

    /// Shell-escaped rendering of the command line, for logs and messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| shell_escape::escape(Cow::Borrowed(part)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments_in_order() {
        let spec = CommandSpec::new("grep")
            .arg("-n")
            .args(["needle", "haystack.txt"])
            .cwd("/tmp")
            .env("LC_ALL", "C");

        assert_eq!(spec.program, "grep");
        assert_eq!(spec.args, vec!["-n", "needle", "haystack.txt"]);
        assert_eq!(spec.working_dir(), Some(Path::new("/tmp")));
        assert_eq!(spec.env.get("LC_ALL").map(String::as_str), Some("C"));
        assert!(!spec.env_clear);
    }

    #[test]
    fn zero_timeout_is_unbounded() {
        assert_eq!(CommandSpec::new("sleep").deadline(), None);
        assert_eq!(
            CommandSpec::new("sleep").timeout(Duration::ZERO).deadline(),
            None
        );
        assert_eq!(
            CommandSpec::new("sleep")
                .timeout(Duration::from_secs(2))
                .deadline(),
            Some(Duration::from_secs(2))
        );
    }

    #[cfg(unix)]
    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("echo").args(["hello world", "plain"]);
        assert_eq!(spec.display(), "echo 'hello world' plain");
    }
}
