//! Character and line scanning of a child's output stream.
//!
//! A [`StreamScanner`] consumes one byte stream until end-of-stream, decodes
//! it incrementally and, per decoded character, optionally echoes it to the
//! console, appends it to the shared [`Capture`] buffer, and notifies the
//! observer. Lines end at `\n` or at a standalone `\r`; `\r\n` is a single
//! terminator. Text after the last terminator is never reported as a line.

use std::io::{self, ErrorKind};
use std::mem;
use std::sync::Arc;

use encoding_rs::Encoding;
use parking_lot::Mutex;
use pipexec_events::StreamKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::decode::TextDecoder;
use crate::observer::StreamObserver;
use crate::process::ProcessHandle;

const READ_BUFFER_SIZE: usize = 8_192;

/// Text buffer shared by the scanners of one command. When both stdout and
/// stderr are scanned, this is where the two streams merge.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    text: Arc<Mutex<String>>,
}

impl Capture {
    pub fn push_str(&self, text: &str) {
        self.text.lock().push_str(text);
    }

    /// Move the captured text out, leaving the buffer empty.
    pub fn take(&self) -> String {
        mem::take(&mut *self.text.lock())
    }
}

/// Splits decoded characters into lines.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    line: String,
    after_cr: bool,
}

impl LineAccumulator {
    /// Feed one character; returns the finished line when `ch` ends one.
    pub fn push(&mut self, ch: char) -> Option<String> {
        match ch {
            '\n' if self.after_cr => {
                self.after_cr = false;
                None
            }
            '\n' => Some(mem::take(&mut self.line)),
            '\r' => {
                self.after_cr = true;
                Some(mem::take(&mut self.line))
            }
            other => {
                self.after_cr = false;
                self.line.push(other);
                None
            }
        }
    }

    /// Text received since the last terminator.
    pub fn pending(&self) -> &str {
        &self.line
    }
}

/// Counters reported when a scanner finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub bytes: u64,
    pub chars: u64,
    pub lines: u64,
    /// Trailing text that had no terminator and was not delivered as a line.
    pub unterminated: String,
}

/// Destination of echoed text.
enum Console {
    Stdout(tokio::io::Stdout),
    Stderr(tokio::io::Stderr),
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl Console {
    /// The parent's stream of the same kind as the scanned one.
    fn for_stream(stream: StreamKind) -> Self {
        match stream {
            StreamKind::Stdout => Console::Stdout(tokio::io::stdout()),
            StreamKind::Stderr => Console::Stderr(tokio::io::stderr()),
        }
    }

    async fn echo(&mut self, text: &str) -> io::Result<()> {
        match self {
            Console::Stdout(out) => write_flushed(out, text).await,
            Console::Stderr(out) => write_flushed(out, text).await,
            Console::Writer(out) => write_flushed(out, text).await,
        }
    }
}

async fn write_flushed<W>(out: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(text.as_bytes()).await?;
    out.flush().await
}

pub struct StreamScanner {
    stream: StreamKind,
    decoder: TextDecoder,
    lines: LineAccumulator,
    console: Option<Console>,
    capture: Option<Capture>,
    observer: Option<Arc<dyn StreamObserver>>,
    process: ProcessHandle,
    summary: ScanSummary,
}

impl StreamScanner {
    pub fn new(stream: StreamKind, process: ProcessHandle) -> Self {
        Self {
            stream,
            decoder: TextDecoder::new(None),
            lines: LineAccumulator::default(),
            console: None,
            capture: None,
            observer: None,
            process,
            summary: ScanSummary::default(),
        }
    }

    pub fn encoding(mut self, encoding: Option<&'static Encoding>) -> Self {
        self.decoder = TextDecoder::new(encoding);
        self
    }

    /// Echo decoded text to the console stream matching this scanner.
    pub fn print(mut self, print: bool) -> Self {
        let stream = self.stream;
        self.console = print.then(|| Console::for_stream(stream));
        self
    }

    /// Echo decoded text to `writer` instead of the console.
    pub fn echo_to<W>(mut self, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.console = Some(Console::Writer(Box::new(writer)));
        self
    }

    pub fn capture(mut self, capture: Option<Capture>) -> Self {
        self.capture = capture;
        self
    }

    pub fn observer(mut self, observer: Option<Arc<dyn StreamObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Consume `reader` until end-of-stream.
    ///
    /// Read errors other than `Interrupted` end the scan as if the stream
    /// closed.
    pub async fn scan<R>(mut self, mut reader: R) -> ScanSummary
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut text = String::new();
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(
                        program = self.process.program(),
                        stream = %self.stream,
                        error = %err,
                        "stream read failed, finishing scan"
                    );
                    break;
                }
            };
            self.summary.bytes += read as u64;

            text.clear();
            self.decoder.decode(&buf[..read], &mut text);
            self.emit(&text).await;
        }

        text.clear();
        self.decoder.finish(&mut text);
        self.emit(&text).await;

        self.summary.unterminated = self.lines.pending().to_string();
        if !self.summary.unterminated.is_empty() {
            trace!(
                program = self.process.program(),
                stream = %self.stream,
                len = self.summary.unterminated.len(),
                "stream ended without a line terminator"
            );
        }
        self.summary
    }

    async fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(console) = &mut self.console {
            if let Err(err) = console.echo(text).await {
                trace!(stream = %self.stream, error = %err, "console echo failed");
            }
        }
        self.feed(text);
    }

    /// Synchronous part of scanning: capture, character and line dispatch.
    pub fn feed(&mut self, text: &str) {
        if let Some(capture) = &self.capture {
            capture.push_str(text);
        }
        let mut utf8 = [0u8; 4];
        for ch in text.chars() {
            self.summary.chars += 1;
            if let Some(observer) = &self.observer {
                observer.on_char(ch.encode_utf8(&mut utf8), self.stream, &self.process);
            }
            if let Some(line) = self.lines.push(ch) {
                self.summary.lines += 1;
                if let Some(observer) = &self.observer {
                    observer.on_line(&line, self.stream, &self.process);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        chars: Mutex<String>,
        lines: Mutex<Vec<String>>,
    }

    impl StreamObserver for Recorder {
        fn on_char(&self, ch: &str, _stream: StreamKind, _process: &ProcessHandle) {
            self.chars.lock().push_str(ch);
        }

        fn on_line(&self, line: &str, _stream: StreamKind, _process: &ProcessHandle) {
            self.lines.lock().push(line.to_string());
        }
    }

    fn scanner(recorder: &Arc<Recorder>, capture: &Capture) -> StreamScanner {
        StreamScanner::new(StreamKind::Stdout, ProcessHandle::detached("test"))
            .capture(Some(capture.clone()))
            .observer(Some(Arc::clone(recorder) as Arc<dyn StreamObserver>))
    }

    #[test]
    fn crlf_is_a_single_terminator() {
        let mut lines = LineAccumulator::default();
        let got: Vec<String> = "a\r\nb\rc\n\nd"
            .chars()
            .filter_map(|ch| lines.push(ch))
            .collect();
        assert_eq!(got, vec!["a", "b", "c", ""]);
        assert_eq!(lines.pending(), "d");
    }

    #[test]
    fn consecutive_carriage_returns_are_separate_lines() {
        let mut lines = LineAccumulator::default();
        let got: Vec<String> = "x\r\ry".chars().filter_map(|ch| lines.push(ch)).collect();
        assert_eq!(got, vec!["x", ""]);
    }

    #[tokio::test]
    async fn trailing_partial_line_is_not_delivered() {
        let recorder = Arc::new(Recorder::default());
        let capture = Capture::default();

        let summary = scanner(&recorder, &capture)
            .scan(&b"one\ntwo\nthree"[..])
            .await;

        assert_eq!(*recorder.lines.lock(), vec!["one", "two"]);
        assert_eq!(summary.lines, 2);
        assert_eq!(summary.unterminated, "three");
        assert_eq!(capture.take(), "one\ntwo\nthree");
    }

    #[tokio::test]
    async fn characters_concatenate_to_capture() {
        let recorder = Arc::new(Recorder::default());
        let capture = Capture::default();
        let input = "héllo\r\nwörld\n";

        let summary = scanner(&recorder, &capture).scan(input.as_bytes()).await;

        let captured = capture.take();
        assert_eq!(*recorder.chars.lock(), captured);
        assert_eq!(captured, input);
        assert_eq!(summary.chars, input.chars().count() as u64);
        assert_eq!(summary.bytes, input.len() as u64);
        assert!(capture.take().is_empty());
    }

    #[tokio::test]
    async fn split_reads_decode_whole_characters() {
        let recorder = Arc::new(Recorder::default());
        let capture = Capture::default();
        let bytes = "ü\n".as_bytes().to_vec();
        let reader = tokio_test_reader(vec![bytes[..1].to_vec(), bytes[1..].to_vec()]);

        scanner(&recorder, &capture).scan(reader).await;

        assert_eq!(*recorder.lines.lock(), vec!["ü"]);
        assert_eq!(*recorder.chars.lock(), "ü\n");
    }

    #[tokio::test]
    async fn configured_encoding_applies_before_capture() {
        let capture = Capture::default();
        let encoding = crate::decode::encoding_for_label("windows-1252").ok();

        StreamScanner::new(StreamKind::Stderr, ProcessHandle::detached("legacy"))
            .encoding(encoding)
            .capture(Some(capture.clone()))
            .scan(&[0x63, 0x61, 0x66, 0xE9, b'\n'][..])
            .await;

        assert_eq!(capture.take(), "café\n");
    }

    #[tokio::test]
    async fn echo_receives_every_decoded_character() {
        let (echo, mut console) = tokio::io::duplex(1024);
        let input = "out\r\npartial";

        let summary = StreamScanner::new(StreamKind::Stdout, ProcessHandle::detached("echo"))
            .echo_to(echo)
            .scan(input.as_bytes())
            .await;

        let mut echoed = String::new();
        console.read_to_string(&mut echoed).await.expect("echo read");
        assert_eq!(echoed, input);
        assert_eq!(summary.lines, 1);
    }

    #[tokio::test]
    async fn echo_writes_decoded_text_not_raw_bytes() {
        let (echo, mut console) = tokio::io::duplex(1024);
        let encoding = crate::decode::encoding_for_label("windows-1252").ok();

        StreamScanner::new(StreamKind::Stderr, ProcessHandle::detached("legacy"))
            .encoding(encoding)
            .echo_to(echo)
            .scan(&[0x63, 0x61, 0x66, 0xE9][..])
            .await;

        let mut echoed = String::new();
        console.read_to_string(&mut echoed).await.expect("echo read");
        assert_eq!(echoed, "café");
    }

    #[test]
    fn print_routes_each_stream_to_its_console_stream() {
        let process = ProcessHandle::detached("route");
        let stdout = StreamScanner::new(StreamKind::Stdout, process.clone()).print(true);
        let stderr = StreamScanner::new(StreamKind::Stderr, process.clone()).print(true);
        let silent = StreamScanner::new(StreamKind::Stdout, process).print(false);

        assert!(matches!(stdout.console, Some(Console::Stdout(_))));
        assert!(matches!(stderr.console, Some(Console::Stderr(_))));
        assert!(silent.console.is_none());
    }

    /// Reader that yields each chunk in a separate `read` call.
    fn tokio_test_reader(chunks: Vec<Vec<u8>>) -> impl AsyncRead + Unpin {
        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.write_all(&chunk).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });
        rx
    }
}
