//! Consumers of decoded stream traffic.
//!
//! A [`StreamObserver`] receives every character and every complete line a
//! scanner decodes, plus start/exit notifications from the command. Closures
//! registered through [`StartConfig::on_char`](crate::StartConfig::on_char)
//! and [`StartConfig::on_line`](crate::StartConfig::on_line) are adapted into
//! observers; [`event_channel`] turns the same traffic into
//! [`ExecEvent`]s a caller drains at its own pace.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pipexec_events::{
    EventEmitter, ExecEvent, ProcessExitedEvent, ProcessStartedEvent, StreamKind,
    StreamTextEvent,
};
use tokio::sync::mpsc;

use crate::process::ProcessHandle;
use crate::result::ExitInfo;

/// Callback receiving one decoded character (as a `&str`) or one line.
pub type TextCallback = Arc<dyn Fn(&str, &ProcessHandle) + Send + Sync>;

pub trait StreamObserver: Send + Sync {
    /// One decoded character from `stream`.
    fn on_char(&self, _ch: &str, _stream: StreamKind, _process: &ProcessHandle) {}

    /// One complete line, terminator excluded.
    fn on_line(&self, _line: &str, _stream: StreamKind, _process: &ProcessHandle) {}

    fn on_start(&self, _process: &ProcessHandle) {}

    /// Fired once the process exited and every scanner drained.
    fn on_exit(&self, _exit: &ExitInfo, _process: &ProcessHandle) {}
}

/// Adapts the `on_char` / `on_line` closures of a start config.
#[derive(Default, Clone)]
pub(crate) struct CallbackObserver {
    pub(crate) on_char: Option<TextCallback>,
    pub(crate) on_line: Option<TextCallback>,
}

impl CallbackObserver {
    pub(crate) fn is_empty(&self) -> bool {
        self.on_char.is_none() && self.on_line.is_none()
    }
}

impl StreamObserver for CallbackObserver {
    fn on_char(&self, ch: &str, _stream: StreamKind, process: &ProcessHandle) {
        if let Some(callback) = &self.on_char {
            callback(ch, process);
        }
    }

    fn on_line(&self, line: &str, _stream: StreamKind, process: &ProcessHandle) {
        if let Some(callback) = &self.on_line {
            callback(line, process);
        }
    }
}

/// Dispatches to several observers in registration order.
#[derive(Default, Clone)]
pub(crate) struct ObserverSet {
    observers: Vec<Arc<dyn StreamObserver>>,
}

impl ObserverSet {
    pub(crate) fn push(&mut self, observer: Arc<dyn StreamObserver>) {
        self.observers.push(observer);
    }

    /// `None` when nothing is registered, so scanners can skip dispatch.
    pub(crate) fn into_observer(self) -> Option<Arc<dyn StreamObserver>> {
        match self.observers.len() {
            0 => None,
            1 => self.observers.into_iter().next(),
            _ => Some(Arc::new(self)),
        }
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl StreamObserver for ObserverSet {
    fn on_char(&self, ch: &str, stream: StreamKind, process: &ProcessHandle) {
        for observer in &self.observers {
            observer.on_char(ch, stream, process);
        }
    }

    fn on_line(&self, line: &str, stream: StreamKind, process: &ProcessHandle) {
        for observer in &self.observers {
            observer.on_line(line, stream, process);
        }
    }

    fn on_start(&self, process: &ProcessHandle) {
        for observer in &self.observers {
            observer.on_start(process);
        }
    }

    fn on_exit(&self, exit: &ExitInfo, process: &ProcessHandle) {
        for observer in &self.observers {
            observer.on_exit(exit, process);
        }
    }
}

/// Forwards stream traffic to any [`EventEmitter`], e.g. the
/// `TracingEmitter` of `pipexec-events`.
pub struct EmitterObserver<E> {
    emitter: Mutex<E>,
    chars: bool,
}

impl<E: EventEmitter + Send> EmitterObserver<E> {
    pub fn new(emitter: E) -> Self {
        Self {
            emitter: Mutex::new(emitter),
            chars: true,
        }
    }

    /// Skip per-character events and only emit lines and lifecycle events.
    pub fn lines_only(mut self) -> Self {
        self.chars = false;
        self
    }

    fn emit(&self, event: ExecEvent) {
        self.emitter.lock().emit(&event);
    }
}

impl<E: EventEmitter + Send> StreamObserver for EmitterObserver<E> {
    fn on_char(&self, ch: &str, stream: StreamKind, _process: &ProcessHandle) {
        if self.chars {
            self.emit(ExecEvent::Char(StreamTextEvent {
                stream,
                text: ch.to_string(),
            }));
        }
    }

    fn on_line(&self, line: &str, stream: StreamKind, _process: &ProcessHandle) {
        self.emit(ExecEvent::Line(StreamTextEvent {
            stream,
            text: line.to_string(),
        }));
    }

    fn on_start(&self, process: &ProcessHandle) {
        self.emit(ExecEvent::Started(ProcessStartedEvent {
            program: process.program().to_string(),
            pid: process.pid(),
        }));
    }

    fn on_exit(&self, exit: &ExitInfo, _process: &ProcessHandle) {
        self.emit(ExecEvent::Exited(ProcessExitedEvent::from(exit)));
    }
}

/// Observer that sends every event into an unbounded channel.
pub type ChannelObserver = EmitterObserver<ChannelEmitter>;

pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<ExecEvent>,
}

impl EventEmitter for ChannelEmitter {
    fn emit(&mut self, event: &ExecEvent) {
        // The receiver may have been dropped; the command keeps running.
        let _ = self.tx.send(event.clone());
    }
}

/// Observer plus the receiving end of its events. The channel closes when the
/// observer (and therefore the command's scanners) is dropped.
pub fn event_channel() -> (Arc<ChannelObserver>, mpsc::UnboundedReceiver<ExecEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(EmitterObserver::new(ChannelEmitter { tx })), rx)
}
