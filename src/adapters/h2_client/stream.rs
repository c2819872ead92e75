use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Byte stream over one HTTP/2 CONNECT exchange: reads come from the
/// response body, writes go to the request body.
///
/// `poll_shutdown` ends the request body, so the proxy sees end of stream
/// while the response keeps flowing. Dropping a stream that was not shut
/// down resets it with CANCEL.
pub struct H2Stream {
    recv: RecvStream,
    send: SendStream<Bytes>,
    buffer: Bytes,
    send_closed: bool,
}

impl H2Stream {
    pub fn new(recv: RecvStream, send: SendStream<Bytes>) -> Self {
        Self {
            recv,
            send,
            buffer: Bytes::new(),
            send_closed: false,
        }
    }

    fn reset_error(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        Poll::Ready(match ready!(self.send.poll_reset(cx)) {
            Ok(Reason::NO_ERROR) | Ok(Reason::CANCEL) | Ok(Reason::STREAM_CLOSED) => {
                io::ErrorKind::BrokenPipe.into()
            }
            Ok(reason) => h2_to_io_error(reason.into()),
            Err(e) => h2_to_io_error(e),
        })
    }
}

impl fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Stream")
            .field("buffered", &self.buffer.len())
            .field("send_closed", &self.send_closed)
            .finish()
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buffer.is_empty() {
                let n = this.buffer.len().min(buf.remaining());
                buf.put_slice(&this.buffer.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    if let Err(e) = this.recv.flow_control().release_capacity(data.len()) {
                        return Poll::Ready(Err(h2_to_io_error(e)));
                    }
                    this.buffer = data;
                }
                Some(Err(e)) => {
                    return Poll::Ready(match e.reason() {
                        Some(Reason::NO_ERROR) | Some(Reason::CANCEL) => Ok(()),
                        Some(Reason::STREAM_CLOSED) => Err(io::ErrorKind::BrokenPipe.into()),
                        _ => Err(h2_to_io_error(e)),
                    })
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.send_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }

        this.send.reserve_capacity(buf.len());
        let written = match ready!(this.send.poll_capacity(cx)) {
            Some(Ok(capacity)) => {
                let n = capacity.min(buf.len());
                this.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .ok()
                    .map(|()| n)
            }
            Some(Err(_)) | None => None,
        };
        match written {
            Some(n) => Poll::Ready(Ok(n)),
            None => this.reset_error(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.send_closed {
            return Poll::Ready(Ok(()));
        }
        this.send_closed = true;
        Poll::Ready(
            this.send
                .send_data(Bytes::new(), true)
                .map_err(h2_to_io_error),
        )
    }
}

impl Drop for H2Stream {
    fn drop(&mut self) {
        if !self.send_closed {
            self.send.send_reset(Reason::CANCEL);
        }
    }
}

fn h2_to_io_error(e: h2::Error) -> io::Error {
    if e.is_io() {
        e.into_io()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "h2 I/O error"))
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}
