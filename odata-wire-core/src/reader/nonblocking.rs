//! Batch reader over a tokio [`AsyncRead`] source.

use super::stream::Step;
use super::{ReaderCore, ReaderState};
use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::format::BatchFormat;
use crate::message::{
    BodyEvent, MessageKind, OperationHost, OperationMessage, OperationRequestMessage,
    OperationResponseMessage,
};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Reads a batch of requests or responses from an [`AsyncRead`] source.
pub struct AsyncBatchReader<R: AsyncRead + Unpin> {
    core: ReaderCore,
    current: Option<OperationMessage>,
    input: R,
}

impl<R: AsyncRead + Unpin> AsyncBatchReader<R> {
    pub fn new(input: R, kind: MessageKind, format: BatchFormat, settings: BatchSettings) -> Self {
        Self {
            core: ReaderCore::new(kind, &format, settings),
            current: None,
            input,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.core.state()
    }

    /// Move to the next operation or changeset boundary.
    pub async fn read(&mut self) -> Result<bool> {
        self.current = None;
        loop {
            match self.core.advance()? {
                Step::Ready(more) => return Ok(more),
                Step::NeedMore => self.core.fill_from_async(&mut self.input).await?,
            }
        }
    }

    pub fn create_operation_request_message(
        &mut self,
    ) -> Result<OperationRequestMessage<'_, AsyncReadHost<'_, R>>> {
        let (line, message) = self.core.create_request()?;
        let message = self.current.insert(message);
        let host = AsyncReadHost {
            core: &mut self.core,
            input: &mut self.input,
        };
        Ok(OperationRequestMessage::new(line, message, host))
    }

    pub fn create_operation_response_message(
        &mut self,
    ) -> Result<OperationResponseMessage<'_, AsyncReadHost<'_, R>>> {
        let message = self.core.create_response()?;
        let message = self.current.insert(message);
        let host = AsyncReadHost {
            core: &mut self.core,
            input: &mut self.input,
        };
        Ok(OperationResponseMessage::new(message, host))
    }

    pub fn into_inner(self) -> R {
        self.input
    }
}

/// Reader side of an operation message created by [`AsyncBatchReader`].
pub struct AsyncReadHost<'a, R> {
    core: &'a mut ReaderCore,
    input: &'a mut R,
}

impl<R: AsyncRead + Unpin> OperationHost for AsyncReadHost<'_, R> {
    type Stream<'s>
        = AsyncOperationReadStream<'s, R>
    where
        Self: 's;

    fn open_stream<'s>(&'s mut self, message: &'s mut OperationMessage) -> Result<Self::Stream<'s>> {
        self.core.on_body_event(message, BodyEvent::Requested)?;
        Ok(AsyncOperationReadStream {
            core: &mut *self.core,
            input: &mut *self.input,
            message,
            disposed: false,
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// Async body stream of an operation being read.
pub struct AsyncOperationReadStream<'a, R: AsyncRead + Unpin> {
    core: &'a mut ReaderCore,
    input: &'a mut R,
    message: &'a mut OperationMessage,
    disposed: bool,
}

impl<R: AsyncRead + Unpin> AsyncOperationReadStream<'_, R> {
    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.core.on_body_event(self.message, BodyEvent::Disposed)
    }

    pub fn close(mut self) -> Result<()> {
        self.dispose()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for AsyncOperationReadStream<'_, R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let step = this
                .core
                .read_body(buf.initialize_unfilled())
                .map_err(BatchError::into_io)?;
            match step {
                Step::Ready(count) => {
                    buf.advance(count);
                    return Poll::Ready(Ok(()));
                }
                Step::NeedMore => {
                    ready!(this.core.poll_fill(cx, this.input)).map_err(BatchError::into_io)?;
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> Drop for AsyncOperationReadStream<'_, R> {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_async_json_responses() {
        let document = r#"{"responses": [
            {"id": "1", "atomicityGroup": "g1", "status": 201,
             "headers": {"Content-Type": "application/json"}, "body": {"ID": 1}},
            {"id": "2", "status": 200, "headers": {"Content-Type": "text/plain"}, "body": "hi"}
        ]}"#;
        let mut reader = AsyncBatchReader::new(
            document.as_bytes(),
            MessageKind::Response,
            BatchFormat::json(),
            BatchSettings::default(),
        );

        assert!(reader.read().await.unwrap());
        assert_eq!(reader.state(), ReaderState::ChangesetStart);
        assert!(reader.read().await.unwrap());
        {
            let mut response = reader.create_operation_response_message().unwrap();
            assert_eq!(response.status_code(), StatusCode::CREATED);
            assert_eq!(response.group_id(), Some("g1"));
            let mut body = Vec::new();
            response.get_stream().unwrap().read_to_end(&mut body).await.unwrap();
            assert_eq!(body, br#"{"ID":1}"#);
        }
        assert!(reader.read().await.unwrap());
        assert_eq!(reader.state(), ReaderState::ChangesetEnd);

        assert!(reader.read().await.unwrap());
        {
            let mut response = reader.create_operation_response_message().unwrap();
            assert_eq!(response.group_id(), None);
            let mut body = String::new();
            response.get_stream().unwrap().read_to_string(&mut body).await.unwrap();
            assert_eq!(body, "hi");
        }
        assert!(!reader.read().await.unwrap());
    }

    #[tokio::test]
    async fn test_async_content_length_is_strict() {
        let payload = "--b1\r\n\
            Content-Type: application/http\r\n\
            Content-Transfer-Encoding: binary\r\n\
            \r\n\
            HTTP/1.1 200 OK\r\n\
            Content-Length: 5\r\n\
            \r\n\
            hello world\r\n\
            --b1--\r\n";
        let format = BatchFormat::multipart_with_boundary("b1").unwrap();
        let mut reader =
            AsyncBatchReader::new(payload.as_bytes(), MessageKind::Response, format, BatchSettings::default());

        assert!(reader.read().await.unwrap());
        {
            let mut response = reader.create_operation_response_message().unwrap();
            let mut body = String::new();
            response.get_stream().unwrap().read_to_string(&mut body).await.unwrap();
            assert_eq!(body, "hello");
        }
        assert!(!reader.read().await.unwrap());
        assert_eq!(reader.state(), ReaderState::Completed);
    }
}
