//! A bounded in-memory byte queue connecting the follower's frame puller to
//! a channel writer. Writes block once `capacity` bytes are buffered, which
//! is the sole backpressure path from local disk back to the leader. The
//! writer half can close the queue with an error, which the reader observes
//! after draining the remaining bytes.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    assert!(capacity > 0, "pipe capacity must be non-zero");
    let shared = Arc::new(Mutex::new(Inner {
        buf: VecDeque::new(),
        capacity,
        close: Close::Open,
        reader_gone: false,
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

struct Inner {
    buf: VecDeque<u8>,
    capacity: usize,
    close: Close,
    reader_gone: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

enum Close {
    Open,
    Eof,
    // io::Error isn't Clone; keep enough to rebuild it on every read.
    Failed { kind: io::ErrorKind, msg: String },
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

pub struct PipeWriter {
    shared: Arc<Mutex<Inner>>,
}

pub struct PipeReader {
    shared: Arc<Mutex<Inner>>,
}

impl PipeWriter {
    /// Close the queue carrying `err`: the reader drains buffered bytes and
    /// then fails with it.
    pub fn close_with_error(&mut self, err: io::Error) {
        let mut inner = self.shared.lock().unwrap();
        if matches!(inner.close, Close::Open) {
            inner.close = Close::Failed {
                kind: err.kind(),
                msg: err.to_string(),
            };
        }
        inner.wake_reader();
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.shared.lock().unwrap();
        if inner.reader_gone {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if !matches!(inner.close, Close::Open) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let space = inner.capacity - inner.buf.len();
        if space == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = space.min(data.len());
        inner.buf.extend(&data[..n]);
        inner.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.shared.lock().unwrap();
        if matches!(inner.close, Close::Open) {
            inner.close = Close::Eof;
        }
        inner.wake_reader();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut inner = self.shared.lock().unwrap();
        if matches!(inner.close, Close::Open) {
            inner.close = Close::Eof;
        }
        inner.wake_reader();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.shared.lock().unwrap();

        if !inner.buf.is_empty() {
            let n = inner.buf.len().min(buf.remaining());
            let (front, back) = inner.buf.as_slices();
            let take = front.len().min(n);
            buf.put_slice(&front[..take]);
            if take < n {
                buf.put_slice(&back[..n - take]);
            }
            inner.buf.drain(..n);
            inner.wake_writer();
            return Poll::Ready(Ok(()));
        }

        match &inner.close {
            Close::Open => {
                inner.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Close::Eof => Poll::Ready(Ok(())),
            Close::Failed { kind, msg } => Poll::Ready(Err(io::Error::new(*kind, msg.clone()))),
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut inner = self.shared.lock().unwrap();
        inner.reader_gone = true;
        inner.wake_writer();
    }
}
