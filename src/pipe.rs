//! In-memory links between commands.
//!
//! A [`PipeLink`] is declared when one command pipes a stream into another and
//! materialized lazily by whichever side starts first. The producing side
//! forwards bytes through a [`Tee`], which can feed several sinks (a
//! downstream command and a local scanner) from one OS pipe. The consuming
//! side reads the link as an [`AsyncRead`] that hits end-of-stream once every
//! write end is dropped.

use std::cmp;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use parking_lot::Mutex;
use pipexec_events::StreamKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Chunks buffered per link before the tee applies backpressure.
const LINK_CAPACITY: usize = 16;
const READ_BUFFER_SIZE: usize = 8_192;

#[derive(Default)]
struct LinkState {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: Option<mpsc::Receiver<Bytes>>,
    materialized: bool,
    write_closed: bool,
}

impl LinkState {
    fn materialize(&mut self) {
        if !self.materialized {
            let (tx, rx) = mpsc::channel(LINK_CAPACITY);
            self.tx = Some(tx);
            self.rx = Some(rx);
            self.materialized = true;
        }
    }
}

/// Byte channel from `upstream` to `downstream`.
pub struct PipeLink {
    upstream: String,
    downstream: String,
    state: Mutex<LinkState>,
}

impl PipeLink {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            state: Mutex::new(LinkState::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_materialized(&self) -> bool {
        self.state.lock().materialized
    }

    /// A new write end, or `None` once the link was closed for writing.
    pub fn writer(&self) -> Option<LinkWriter> {
        let mut state = self.state.lock();
        state.materialize();
        state.tx.clone().map(|tx| LinkWriter { tx })
    }

    /// Drop the link's own write end. Readers see end-of-stream once every
    /// writer handed out by [`writer`](Self::writer) is dropped too.
    pub fn close_write(&self) {
        let mut state = self.state.lock();
        if state.write_closed {
            return;
        }
        state.materialize();
        state.tx = None;
        state.write_closed = true;
        trace!(
            upstream = %self.upstream,
            downstream = %self.downstream,
            "link write end closed"
        );
    }

    /// The read end. Only the first call gets it.
    pub fn reader(&self) -> Option<LinkReader> {
        let mut state = self.state.lock();
        state.materialize();
        state.rx.take().map(|rx| LinkReader {
            rx,
            pending: Bytes::new(),
        })
    }
}

impl std::fmt::Debug for PipeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PipeLink")
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .field("materialized", &state.materialized)
            .field("write_closed", &state.write_closed)
            .finish()
    }
}

/// Write end of a link.
#[derive(Debug, Clone)]
pub struct LinkWriter {
    tx: mpsc::Sender<Bytes>,
}

impl LinkWriter {
    /// Returns `false` when the reader is gone.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(chunk).await.is_ok()
    }
}

/// Read end of a link.
#[derive(Debug)]
pub struct LinkReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl AsyncRead for LinkReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = cmp::min(self.pending.len(), buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Duplicates one output stream into every sink.
pub struct Tee {
    program: String,
    stream: StreamKind,
    sinks: Vec<LinkWriter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeeSummary {
    pub bytes: u64,
    /// Sinks whose reader went away before end-of-stream.
    pub dropped_sinks: usize,
}

impl Tee {
    pub fn new(program: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            program: program.into(),
            stream,
            sinks: Vec::new(),
        }
    }

    pub fn sink(mut self, writer: LinkWriter) -> Self {
        self.sinks.push(writer);
        self
    }

    /// Forward `reader` to every sink until end-of-stream, then wait for
    /// `exited` before closing the sinks.
    ///
    /// A sink whose reader is gone is dropped. Once every sink is gone the
    /// tee stops reading and closes `reader`, so the producer sees a broken
    /// pipe the way it would in a shell. A tee built without sinks drains the
    /// producer until end-of-stream.
    pub async fn run<R, F>(mut self, mut reader: R, exited: F) -> TeeSummary
    where
        R: AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut summary = TeeSummary::default();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(
                        program = %self.program,
                        stream = %self.stream,
                        error = %err,
                        "tee read failed"
                    );
                    break;
                }
            };
            summary.bytes += read as u64;
            if self.sinks.is_empty() {
                continue;
            }

            let chunk = Bytes::copy_from_slice(&buf[..read]);
            let mut open = Vec::with_capacity(self.sinks.len());
            for sink in self.sinks.drain(..) {
                if sink.send(chunk.clone()).await {
                    open.push(sink);
                } else {
                    summary.dropped_sinks += 1;
                    debug!(
                        program = %self.program,
                        stream = %self.stream,
                        "link reader gone, dropping sink"
                    );
                }
            }
            self.sinks = open;
            if self.sinks.is_empty() {
                debug!(
                    program = %self.program,
                    stream = %self.stream,
                    "every link reader gone, closing producer pipe"
                );
                break;
            }
        }
        drop(reader);

        exited.await;
        debug!(
            program = %self.program,
            stream = %self.stream,
            sinks = self.sinks.len(),
            bytes = summary.bytes,
            "closing link"
        );
        drop(self.sinks);
        summary
    }
}

/// Copy `source` into the child's stdin, then close it. A child that exits
/// or closes its stdin early ends the copy without error.
pub async fn feed_stdin<R>(program: String, mut source: R, mut stdin: ChildStdin) -> u64
where
    R: AsyncRead + Unpin,
{
    let copied = match tokio::io::copy(&mut source, &mut stdin).await {
        Ok(copied) => copied,
        Err(err) if err.kind() == ErrorKind::BrokenPipe => {
            trace!(program = %program, "stdin closed by child");
            return 0;
        }
        Err(err) => {
            debug!(program = %program, error = %err, "stdin feed failed");
            return 0;
        }
    };
    if let Err(err) = stdin.shutdown().await {
        trace!(program = %program, error = %err, "stdin shutdown failed");
    }
    copied
}
