//! Reader enforcing a length announced ahead of the data.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, ReadBuf};

/// Yields exactly `size` bytes of the inner reader.
///
/// Data past `size` is never read. Hitting EOF early fails with
/// [io::ErrorKind::UnexpectedEof], e.g. when a file shrinks after its size went into a tar
/// header.
pub struct SizedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: AsyncRead + Unpin> SizedReader<R> {
    pub fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let max = this.remaining.min(buf.remaining() as u64) as usize;
        let count = {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max));
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };

        if count == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("data ended {} bytes early", this.remaining),
            )));
        }

        buf.advance(count);
        this.remaining -= count as u64;
        Poll::Ready(Ok(()))
    }
}
