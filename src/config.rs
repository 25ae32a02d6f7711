//! Per-invocation start options and the optional TOML defaults file.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::decode::encoding_for_label;
use crate::error::Result;
use crate::observer::{CallbackObserver, ObserverSet, StreamObserver, TextCallback};
use crate::process::ProcessHandle;
use crate::spec::CommandSpec;

/// Options passed once to [`Command::start`](crate::Command::start).
#[derive(Clone)]
pub struct StartConfig {
    /// Echo scanned output to the parent's console.
    pub print: bool,
    /// Collect scanned output into [`ExecResult::output`](crate::ExecResult::output).
    pub capture: bool,
    /// Block in `start` until the process terminated.
    pub wait: bool,
    pub scan_stdout: bool,
    pub scan_stderr: bool,
    /// Give the child its own console (Windows) or session (Unix). Output is
    /// not scanned.
    pub detach_new_console: bool,
    /// Start the child without a visible window (Windows). Output is not
    /// scanned.
    pub hide_window: bool,
    /// Character set of the child's output; UTF-8 when `None`.
    pub encoding: Option<&'static Encoding>,
    /// Kill the child when Ctrl+C or SIGTERM reaches this process.
    pub cancel_on_signal: bool,
    pub cancel_token: Option<CancellationToken>,
    on_char: Option<TextCallback>,
    on_line: Option<TextCallback>,
    observers: Vec<Arc<dyn StreamObserver>>,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            print: false,
            capture: false,
            wait: false,
            scan_stdout: false,
            scan_stderr: false,
            detach_new_console: false,
            hide_window: false,
            encoding: None,
            cancel_on_signal: true,
            cancel_token: None,
            on_char: None,
            on_line: None,
            observers: Vec::new(),
        }
    }
}

impl fmt::Debug for StartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartConfig")
            .field("print", &self.print)
            .field("capture", &self.capture)
            .field("wait", &self.wait)
            .field("scan_stdout", &self.scan_stdout)
            .field("scan_stderr", &self.scan_stderr)
            .field("detach_new_console", &self.detach_new_console)
            .field("hide_window", &self.hide_window)
            .field("encoding", &self.encoding.map(Encoding::name))
            .field("cancel_on_signal", &self.cancel_on_signal)
            .field("cancel_token", &self.cancel_token.is_some())
            .field("on_char", &self.on_char.is_some())
            .field("on_line", &self.on_line.is_some())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl StartConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait, capture and scan both streams: the common "run and collect" case.
    pub fn collect() -> Self {
        Self::default()
            .wait(true)
            .capture(true)
            .scan_stdout(true)
            .scan_stderr(true)
    }

    pub fn print(mut self, print: bool) -> Self {
        self.print = print;
        self
    }

    pub fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn scan_stdout(mut self, scan: bool) -> Self {
        self.scan_stdout = scan;
        self
    }

    pub fn scan_stderr(mut self, scan: bool) -> Self {
        self.scan_stderr = scan;
        self
    }

    pub fn detach_new_console(mut self, detach: bool) -> Self {
        self.detach_new_console = detach;
        self
    }

    pub fn hide_window(mut self, hide: bool) -> Self {
        self.hide_window = hide;
        self
    }

    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Set the encoding by label, e.g. `"cp866"` or `"windows-1251"`.
    pub fn encoding_label(self, label: &str) -> Result<Self> {
        Ok(self.encoding(encoding_for_label(label)?))
    }

    pub fn cancel_on_signal(mut self, enabled: bool) -> Self {
        self.cancel_on_signal = enabled;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Called with every decoded character of a scanned stream.
    pub fn on_char<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &ProcessHandle) + Send + Sync + 'static,
    {
        self.on_char = Some(Arc::new(callback));
        self
    }

    /// Called with every complete line of a scanned stream, terminator
    /// excluded.
    pub fn on_line<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &ProcessHandle) + Send + Sync + 'static,
    {
        self.on_line = Some(Arc::new(callback));
        self
    }

    /// Register an additional observer; observers run in registration order,
    /// after the `on_char`/`on_line` closures.
    pub fn observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Output goes straight to the console and cannot be scanned.
    pub(crate) fn console_mode(&self) -> bool {
        self.detach_new_console || self.hide_window
    }

    pub(crate) fn build_observer(&self) -> Option<Arc<dyn StreamObserver>> {
        let mut set = ObserverSet::default();
        let callbacks = CallbackObserver {
            on_char: self.on_char.clone(),
            on_line: self.on_line.clone(),
        };
        if !callbacks.is_empty() {
            set.push(Arc::new(callbacks));
        }
        for observer in &self.observers {
            set.push(Arc::clone(observer));
        }
        set.into_observer()
    }
}

/// Start flags of the `[start]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StartFlags {
    pub print: bool,
    pub capture: bool,
    pub wait: bool,
    pub scan_stdout: bool,
    pub scan_stderr: bool,
    pub detach_new_console: bool,
    pub hide_window: bool,
}

/// Defaults shared by many invocations, loaded from TOML:
///
/// ```toml
/// encoding = "cp866"
/// timeout_ms = 30000
/// cancel_on_signal = true
///
/// [start]
/// wait = true
/// capture = true
/// scan_stdout = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecDefaults {
    #[serde(default)]
    pub start: StartFlags,
    /// Encoding label applied to scanned output.
    #[serde(default)]
    pub encoding: Option<String>,
    /// Deadline applied to specs that have none; 0 leaves them unbounded.
    #[serde(default = "ExecDefaults::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "ExecDefaults::default_cancel_on_signal")]
    pub cancel_on_signal: bool,
}

impl Default for ExecDefaults {
    fn default() -> Self {
        Self {
            start: StartFlags::default(),
            encoding: None,
            timeout_ms: Self::default_timeout_ms(),
            cancel_on_signal: Self::default_cancel_on_signal(),
        }
    }
}

impl ExecDefaults {
    const MIN_TIMEOUT_MS: u64 = 10;

    const fn default_timeout_ms() -> u64 {
        0
    }

    const fn default_cancel_on_signal() -> bool {
        true
    }

    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        let defaults: Self = toml::from_str(source).context("failed to parse exec defaults")?;
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read exec defaults from {}", path.display()))?;
        Self::from_toml_str(&source)
            .with_context(|| format!("invalid exec defaults in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.timeout_ms == 0 || self.timeout_ms >= Self::MIN_TIMEOUT_MS,
            "timeout_ms must be at least {}ms (or 0 to disable)",
            Self::MIN_TIMEOUT_MS
        );
        if let Some(label) = &self.encoding {
            encoding_for_label(label)?;
        }
        ensure!(
            !(self.start.detach_new_console && (self.start.capture || self.start.print)),
            "start.detach_new_console cannot be combined with capture or print"
        );
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// A start config carrying these defaults.
    pub fn start_config(&self) -> Result<StartConfig> {
        let flags = &self.start;
        let config = StartConfig::default()
            .print(flags.print)
            .capture(flags.capture)
            .wait(flags.wait)
            .scan_stdout(flags.scan_stdout)
            .scan_stderr(flags.scan_stderr)
            .detach_new_console(flags.detach_new_console)
            .hide_window(flags.hide_window)
            .cancel_on_signal(self.cancel_on_signal);
        match &self.encoding {
            Some(label) => config.encoding_label(label),
            None => Ok(config),
        }
    }

    /// Fill in the default deadline when `spec` has none.
    pub fn apply_to(&self, spec: CommandSpec) -> CommandSpec {
        match (spec.deadline(), self.timeout()) {
            (None, Some(timeout)) => spec.timeout(timeout),
            _ => spec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let defaults = ExecDefaults::from_toml_str("").expect("empty config");
        assert_eq!(defaults, ExecDefaults::default());
        assert!(defaults.cancel_on_signal);
        assert_eq!(defaults.timeout(), None);
    }

    #[test]
    fn start_table_maps_onto_start_config() {
        let defaults = ExecDefaults::from_toml_str(
            r#"
            encoding = "windows-1251"
            timeout_ms = 1500
            cancel_on_signal = false

            [start]
            wait = true
            capture = true
            scan_stdout = true
            "#,
        )
        .expect("valid config");

        let config = defaults.start_config().expect("known encoding");
        assert!(config.wait && config.capture && config.scan_stdout);
        assert!(!config.scan_stderr);
        assert!(!config.cancel_on_signal);
        assert_eq!(config.encoding.map(Encoding::name), Some("windows-1251"));

        let spec = defaults.apply_to(CommandSpec::new("dir"));
        assert_eq!(spec.deadline(), Some(Duration::from_millis(1500)));

        let explicit = defaults.apply_to(CommandSpec::new("dir").timeout(Duration::from_secs(9)));
        assert_eq!(explicit.deadline(), Some(Duration::from_secs(9)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let tiny = ExecDefaults::from_toml_str("timeout_ms = 3");
        assert!(tiny.is_err());

        let unknown = ExecDefaults::from_toml_str(r#"encoding = "klingon""#)
            .expect_err("unknown label must fail");
        assert!(format!("{unknown:#}").contains("klingon"));

        let detached_capture = ExecDefaults::from_toml_str(
            "[start]\ndetach_new_console = true\ncapture = true\n",
        );
        assert!(detached_capture.is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "timeout_ms = \"soon\"").expect("write config");

        let err = ExecDefaults::load(file.path()).expect_err("type mismatch");
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));
    }

    #[test]
    fn callbacks_and_observers_collapse_into_one() {
        let config = StartConfig::collect();
        assert!(config.build_observer().is_none());
        assert!(!config.console_mode());

        let config = config
            .on_line(|_line, _process| {})
            .observer(Arc::new(crate::observer::CallbackObserver::default()));
        assert!(config.build_observer().is_some());

        let rendered = format!("{config:?}");
        assert!(rendered.contains("on_line: true"));
        assert!(rendered.contains("observers: 1"));
    }

    #[test]
    fn signal_cancellation_defaults_on() {
        assert!(StartConfig::new().cancel_on_signal);
        assert!(StartConfig::new().hide_window(true).console_mode());
    }
}
