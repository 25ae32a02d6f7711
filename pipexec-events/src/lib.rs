//! Structured events emitted while a pipexec command runs.
//!
//! The schema covers the process lifecycle (started, exited) and the decoded
//! character and line traffic observed on each output stream. Consumers that
//! prefer draining a channel over registering callbacks receive these values,
//! and they serialize to JSON for logging or auditing pipelines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic version of the serialized event schema exported by this crate.
pub const EVENT_SCHEMA_VERSION: &str = "0.1.0";

/// Wraps an [`ExecEvent`] with schema metadata so downstream consumers can
/// negotiate compatibility before processing an event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedExecEvent {
    /// Semantic version describing the schema of the nested event payload.
    pub schema_version: String,
    /// Concrete event emitted by the engine.
    pub event: ExecEvent,
}

impl VersionedExecEvent {
    /// Creates a new [`VersionedExecEvent`] using the current
    /// [`EVENT_SCHEMA_VERSION`].
    pub fn new(event: ExecEvent) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            event,
        }
    }

    /// Returns the nested [`ExecEvent`], consuming the wrapper.
    pub fn into_event(self) -> ExecEvent {
        self.event
    }
}

impl From<ExecEvent> for VersionedExecEvent {
    fn from(event: ExecEvent) -> Self {
        Self::new(event)
    }
}

/// Sink for processing [`ExecEvent`] instances.
pub trait EventEmitter {
    /// Invoked for each event emitted by a running command.
    fn emit(&mut self, event: &ExecEvent);
}

impl<F> EventEmitter for F
where
    F: FnMut(&ExecEvent),
{
    fn emit(&mut self, event: &ExecEvent) {
        self(event);
    }
}

/// JSON helper utilities for serializing and deserializing exec events.
#[cfg(feature = "serde-json")]
pub mod json {
    use super::{ExecEvent, VersionedExecEvent};

    /// Serializes an event into a JSON string.
    pub fn to_string(event: &ExecEvent) -> serde_json::Result<String> {
        serde_json::to_string(event)
    }

    /// Deserializes an event from a JSON string.
    pub fn from_str(payload: &str) -> serde_json::Result<ExecEvent> {
        serde_json::from_str(payload)
    }

    /// Serializes a [`VersionedExecEvent`] wrapper.
    pub fn versioned_to_string(event: &ExecEvent) -> serde_json::Result<String> {
        serde_json::to_string(&VersionedExecEvent::new(event.clone()))
    }

    /// Deserializes a [`VersionedExecEvent`] wrapper.
    pub fn versioned_from_str(payload: &str) -> serde_json::Result<VersionedExecEvent> {
        serde_json::from_str(payload)
    }
}

#[cfg(feature = "telemetry-tracing")]
mod tracing_support {
    use tracing::Level;

    use super::{EVENT_SCHEMA_VERSION, EventEmitter, ExecEvent};

    /// Emits structured events as `tracing` events at the specified level.
    #[derive(Debug, Clone)]
    pub struct TracingEmitter {
        level: Level,
    }

    impl TracingEmitter {
        /// Creates a new [`TracingEmitter`] with the provided [`Level`].
        pub fn new(level: Level) -> Self {
            Self { level }
        }
    }

    impl Default for TracingEmitter {
        fn default() -> Self {
            Self {
                level: Level::DEBUG,
            }
        }
    }

    macro_rules! emit_at {
        ($level:expr, $event:expr) => {
            tracing::event!(
                target: "pipexec_events",
                $level,
                schema_version = EVENT_SCHEMA_VERSION,
                kind = $event.kind(),
                event = ?$event,
                "pipexec_event"
            )
        };
    }

    impl EventEmitter for TracingEmitter {
        fn emit(&mut self, event: &ExecEvent) {
            match self.level {
                Level::TRACE => emit_at!(Level::TRACE, event),
                Level::DEBUG => emit_at!(Level::DEBUG, event),
                Level::INFO => emit_at!(Level::INFO, event),
                Level::WARN => emit_at!(Level::WARN, event),
                Level::ERROR => emit_at!(Level::ERROR, event),
            }
        }
    }
}

#[cfg(feature = "telemetry-tracing")]
pub use tracing_support::TracingEmitter;

/// Output stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted over the life of one command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ExecEvent {
    /// The child process was spawned.
    #[serde(rename = "process.started")]
    Started(ProcessStartedEvent),
    /// Decoded text arrived on one of the scanned streams.
    #[serde(rename = "stream.char")]
    Char(StreamTextEvent),
    /// A complete line (terminator excluded) was observed.
    #[serde(rename = "stream.line")]
    Line(StreamTextEvent),
    /// The process terminated and every scanner drained.
    #[serde(rename = "process.exited")]
    Exited(ProcessExitedEvent),
}

impl ExecEvent {
    /// Short name of the event variant, matching its serialized tag.
    pub const fn kind(&self) -> &'static str {
        match self {
            ExecEvent::Started(_) => "process.started",
            ExecEvent::Char(_) => "stream.char",
            ExecEvent::Line(_) => "stream.line",
            ExecEvent::Exited(_) => "process.exited",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessStartedEvent {
    /// Program that was launched.
    pub program: String,
    /// OS process id, when the platform reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamTextEvent {
    /// Stream the text was read from.
    pub stream: StreamKind,
    /// Decoded text.
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessExitedEvent {
    /// Exit code reported by the OS, `-1` when unknown.
    pub exit_code: i32,
    /// Whether the OS reported a successful exit.
    pub success: bool,
    /// The process was killed after its deadline elapsed.
    #[serde(default)]
    pub timed_out: bool,
    /// The process was killed by a cancellation request or signal.
    #[serde(default)]
    pub cancelled: bool,
    /// Terminating signal on Unix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}
