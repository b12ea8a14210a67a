//! [AsyncWrite] adapter feeding a bounded channel, used as a response body sink.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Error;
use futures::{future::FutureExt, ready};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::Sender;

use proxmox_io::ByteBuffer;
use proxmox_lang::error::io_err_other;
use proxmox_lang::io_format_err;

/// Chunks sent through the channel. Errors abort whatever consumes the receiver.
pub type ChunkSender = Sender<Result<Vec<u8>, Error>>;

type SendResult = io::Result<ChunkSender>;

enum WriterState {
    Ready,
    Sending(Pin<Box<dyn Future<Output = SendResult> + Send + 'static>>),
}

/// Buffers writes and sends them as chunks of up to `buf_size` bytes.
///
/// Sending waits for free channel capacity, so a slow receiver throttles the writer.
/// Shutting down flushes the remaining data and drops the sender.
pub struct AsyncChannelWriter {
    sender: Option<ChunkSender>,
    buf: ByteBuffer,
    state: WriterState,
}

impl AsyncChannelWriter {
    pub fn new(sender: ChunkSender, buf_size: usize) -> Self {
        Self {
            sender: Some(sender),
            buf: ByteBuffer::with_capacity(buf_size),
            state: WriterState::Ready,
        }
    }

    fn poll_write_impl(
        &mut self,
        cx: &mut Context,
        buf: &[u8],
        flush: bool,
    ) -> Poll<io::Result<usize>> {
        loop {
            match &mut self.state {
                WriterState::Ready => {
                    if flush {
                        if self.buf.is_empty() {
                            return Poll::Ready(Ok(0));
                        }
                    } else {
                        let free_size = self.buf.free_size();
                        if free_size > buf.len() || self.buf.is_empty() {
                            let count = free_size.min(buf.len());
                            self.buf.get_free_mut_slice()[..count].copy_from_slice(&buf[..count]);
                            self.buf.add_size(count);
                            return Poll::Ready(Ok(count));
                        }
                    }

                    let sender = match self.sender.take() {
                        Some(sender) => sender,
                        None => return Poll::Ready(Err(io_err_other("channel writer is closed"))),
                    };

                    let data = self.buf.remove_data(self.buf.len()).to_vec();
                    let future = async move {
                        sender
                            .send(Ok(data))
                            .await
                            .map(move |_| sender)
                            .map_err(|_| io_format_err!("receiver dropped"))
                    };

                    self.state = WriterState::Sending(future.boxed());
                }
                WriterState::Sending(ref mut future) => match ready!(future.as_mut().poll(cx)) {
                    Ok(sender) => {
                        self.sender = Some(sender);
                        self.state = WriterState::Ready;
                    }
                    Err(err) => {
                        self.state = WriterState::Ready;
                        return Poll::Ready(Err(err));
                    }
                },
            }
        }
    }
}

impl AsyncWrite for AsyncChannelWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.poll_write_impl(cx, buf, false)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(this.poll_write_impl(cx, &[], true)) {
            Ok(_) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.sender.is_none() && this.buf.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(this.poll_write_impl(cx, &[], true))?;
        this.sender = None;
        Poll::Ready(Ok(()))
    }
}
