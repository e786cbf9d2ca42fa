//! Socket-level limits for the gateway's accept layer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{sleep, Sleep};

/// An accepted socket holding one accept-cap slot.
///
/// The permit is acquired before the accept and released when this stream
/// is dropped, i.e. when the connection closes; that makes the semaphore
/// count live connections rather than serialised requests. The socket is
/// shared with the connection's disconnect watchdog, so all I/O goes
/// through the readiness API rather than exclusive polls. Reads and writes
/// carry stall deadlines so a dead or malicious peer cannot pin a slot
/// forever: the deadline arms when an operation would block and resets on
/// progress.
pub(crate) struct GuardedStream {
    inner: Arc<TcpStream>,
    _permit: OwnedSemaphorePermit,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl GuardedStream {
    pub(crate) fn new(
        inner: Arc<TcpStream>,
        permit: OwnedSemaphorePermit,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            _permit: permit,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn timed_out(operation: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("socket {operation} timed out"))
}

impl AsyncRead for GuardedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => match this.inner.try_read(buf.initialize_unfilled()) {
                    Ok(count) => {
                        buf.advance(count);
                        this.read_deadline = None;
                        return Poll::Ready(Ok(()));
                    }
                    // Readiness was stale; re-register and try again.
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                    Err(error) => {
                        this.read_deadline = None;
                        return Poll::Ready(Err(error));
                    }
                },
                Poll::Ready(Err(error)) => {
                    this.read_deadline = None;
                    return Poll::Ready(Err(error));
                }
                Poll::Pending => {
                    let deadline = this
                        .read_deadline
                        .get_or_insert_with(|| Box::pin(sleep(this.read_timeout)));
                    return match deadline.as_mut().poll(cx) {
                        Poll::Ready(()) => Poll::Ready(Err(timed_out("read"))),
                        Poll::Pending => Poll::Pending,
                    };
                }
            }
        }
    }
}

impl AsyncWrite for GuardedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match this.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(())) => match this.inner.try_write(buf) {
                    Ok(count) => {
                        this.write_deadline = None;
                        return Poll::Ready(Ok(count));
                    }
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                    Err(error) => {
                        this.write_deadline = None;
                        return Poll::Ready(Err(error));
                    }
                },
                Poll::Ready(Err(error)) => {
                    this.write_deadline = None;
                    return Poll::Ready(Err(error));
                }
                Poll::Pending => {
                    let deadline = this
                        .write_deadline
                        .get_or_insert_with(|| Box::pin(sleep(this.write_timeout)));
                    return match deadline.as_mut().poll(cx) {
                        Poll::Ready(()) => Poll::Ready(Err(timed_out("write"))),
                        Poll::Pending => Poll::Pending,
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // TCP writes are unbuffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The socket closes when its last reference (this stream and the
        // watchdog's handle) is dropped.
        Poll::Ready(Ok(()))
    }
}
