//! Batch writer over a tokio [`AsyncWrite`] sink.
//!
//! Same state machine and framing as the blocking writer; only the draining
//! of rendered bytes into the sink is asynchronous.

use super::{FLUSH_THRESHOLD, WriterCore, WriterState};
use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::format::BatchFormat;
use crate::message::{
    BodyEvent, MessageKind, OperationHost, OperationMessage, OperationRequestMessage,
    OperationResponseMessage,
};
use bytes::Buf;
use http::Method;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncWrite, AsyncWriteExt};

async fn drain_output_async<W: AsyncWrite + Unpin>(core: &mut WriterCore, output: &mut W) -> Result<()> {
    if core.out.is_empty() {
        return Ok(());
    }
    let result = output.write_all(&core.out).await.map_err(BatchError::from);
    core.out.clear();
    core.fault(result)
}

/// Writes a batch of requests or responses to an [`AsyncWrite`] sink.
pub struct AsyncBatchWriter<W: AsyncWrite + Unpin> {
    core: WriterCore,
    current: Option<OperationMessage>,
    output: W,
}

impl<W: AsyncWrite + Unpin> AsyncBatchWriter<W> {
    pub fn new(output: W, kind: MessageKind, format: BatchFormat, settings: BatchSettings) -> Self {
        Self {
            core: WriterCore::new(kind, &format, settings),
            current: None,
            output,
        }
    }

    pub fn state(&self) -> WriterState {
        self.core.state()
    }

    async fn drain(&mut self) -> Result<()> {
        drain_output_async(&mut self.core, &mut self.output).await
    }

    pub async fn write_start_batch(&mut self) -> Result<()> {
        self.core.start_batch()?;
        self.drain().await
    }

    pub async fn write_start_changeset(&mut self) -> Result<String> {
        let group = self.core.start_changeset(&mut self.current, None)?;
        self.drain().await?;
        Ok(group)
    }

    pub async fn write_start_changeset_with_id(&mut self, id: &str) -> Result<String> {
        let group = self.core.start_changeset(&mut self.current, Some(id))?;
        self.drain().await?;
        Ok(group)
    }

    pub async fn write_end_changeset(&mut self) -> Result<()> {
        self.core.end_changeset(&mut self.current)?;
        self.drain().await
    }

    pub async fn create_operation_request_message(
        &mut self,
        method: Method,
        url: &str,
        content_id: Option<&str>,
    ) -> Result<OperationRequestMessage<'_, AsyncWriteHost<'_, W>>> {
        let (line, message) = self
            .core
            .create_request(&mut self.current, method, url, content_id)?;
        self.drain().await?;
        let message = self.current.insert(message);
        let host = AsyncWriteHost {
            core: &mut self.core,
            output: &mut self.output,
        };
        Ok(OperationRequestMessage::new(line, message, host))
    }

    pub async fn create_operation_response_message(
        &mut self,
    ) -> Result<OperationResponseMessage<'_, AsyncWriteHost<'_, W>>> {
        let message = self.core.create_response(&mut self.current)?;
        self.drain().await?;
        let message = self.current.insert(message);
        let host = AsyncWriteHost {
            core: &mut self.core,
            output: &mut self.output,
        };
        Ok(OperationResponseMessage::new(message, host))
    }

    /// Close the batch and flush the sink.
    pub async fn write_end_batch(&mut self) -> Result<()> {
        self.core.end_batch(&mut self.current)?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.drain().await?;
        let result = self.output.flush().await.map_err(BatchError::from);
        self.core.fault(result)
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

/// Writer side of an operation message created by [`AsyncBatchWriter`].
pub struct AsyncWriteHost<'a, W> {
    core: &'a mut WriterCore,
    output: &'a mut W,
}

impl<W: AsyncWrite + Unpin> OperationHost for AsyncWriteHost<'_, W> {
    type Stream<'s>
        = AsyncOperationWriteStream<'s, W>
    where
        Self: 's;

    fn open_stream<'s>(&'s mut self, message: &'s mut OperationMessage) -> Result<Self::Stream<'s>> {
        self.core.on_body_event(message, BodyEvent::Requested)?;
        Ok(AsyncOperationWriteStream {
            core: &mut *self.core,
            output: &mut *self.output,
            message,
            disposed: false,
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

/// Async body stream of an operation being written.
///
/// `poll_shutdown` completes the operation without shutting down the batch
/// sink. Dropping the stream also completes it; the framing is then written
/// by the next writer call.
pub struct AsyncOperationWriteStream<'a, W: AsyncWrite + Unpin> {
    core: &'a mut WriterCore,
    output: &'a mut W,
    message: &'a mut OperationMessage,
    disposed: bool,
}

impl<W: AsyncWrite + Unpin> AsyncOperationWriteStream<'_, W> {
    fn mark_disposed(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.core.on_body_event(self.message, BodyEvent::Disposed)
    }

    /// Complete the operation and write its framing.
    pub async fn close(mut self) -> Result<()> {
        self.mark_disposed()?;
        drain_output_async(&mut *self.core, &mut *self.output).await
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.core.out.is_empty() {
            let written = match ready!(Pin::new(&mut *self.output).poll_write(cx, &self.core.out)) {
                Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
                other => other,
            };
            match written {
                Ok(count) => self.core.out.advance(count),
                Err(err) => {
                    self.core.poison(&err);
                    return Poll::Ready(Err(err));
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for AsyncOperationWriteStream<'_, W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.core.out.len() >= FLUSH_THRESHOLD {
            ready!(this.poll_drain(cx))?;
        }
        this.core.write_body(buf).map_err(BatchError::into_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut *this.output).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.mark_disposed().map_err(BatchError::into_io)?;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut *this.output).poll_flush(cx)
    }
}

impl<W: AsyncWrite + Unpin> Drop for AsyncOperationWriteStream<'_, W> {
    fn drop(&mut self) {
        let _ = self.mark_disposed();
    }
}
