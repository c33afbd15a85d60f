//! Bounded byte pipe connecting adjacent pipeline stages.
//!
//! Semantics match an OS pipe: the writer suspends when the buffer is full
//! (backpressure), the reader suspends when it is empty, dropping the writer
//! signals EOF, and dropping the reader turns further writes into broken
//! pipes. Stage *i* owns the writer, stage *i+1* owns the reader, so bytes
//! arrive downstream in exactly the order produced.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, ReadBuf};

/// Default pipe capacity (matches the Linux kernel pipe default).
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct Inner {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Inner {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Writing end of an inter-stage pipe.
pub struct PipeWriter {
    shared: Arc<Mutex<Inner>>,
}

/// Reading end of an inter-stage pipe.
pub struct PipeReader {
    shared: Arc<Mutex<Inner>>,
}

/// Create a bounded pipe with the given capacity.
pub fn byte_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Mutex::new(Inner {
        buf: VecDeque::with_capacity(capacity.min(8 * 1024)),
        capacity: capacity.max(1),
        writer_closed: false,
        reader_closed: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

impl PipeWriter {
    /// Write the whole chunk, suspending while the buffer is full.
    ///
    /// Returns `BrokenPipe` once the reader has been dropped.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            offset += self.write_some(&data[offset..]).await?;
        }
        Ok(())
    }

    async fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        std::future::poll_fn(|cx| {
            let mut inner = self.shared.lock().expect("pipe lock poisoned");
            if inner.reader_closed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed",
                )));
            }
            let available = inner.capacity.saturating_sub(inner.buf.len());
            if available == 0 {
                inner.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = data.len().min(available);
            inner.buf.extend(&data[..n]);
            inner.wake_reader();
            Poll::Ready(Ok(n))
        })
        .await
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut inner = self.shared.lock().expect("pipe lock poisoned");
        inner.writer_closed = true;
        inner.wake_reader();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.shared.lock().expect("pipe lock poisoned");

        if inner.buf.is_empty() {
            if inner.writer_closed {
                return Poll::Ready(Ok(())); // EOF
            }
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.remaining().min(inner.buf.len());
        let (front, back) = inner.buf.as_slices();
        if n <= front.len() {
            buf.put_slice(&front[..n]);
        } else {
            buf.put_slice(front);
            buf.put_slice(&back[..n - front.len()]);
        }
        inner.buf.drain(..n);
        inner.wake_writer();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut inner = self.shared.lock().expect("pipe lock poisoned");
        inner.reader_closed = true;
        inner.buf.clear();
        inner.wake_writer();
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader").finish()
    }
}
