//! Batch reader over a blocking [`std::io::Read`] source.

use super::stream::Step;
use super::{ReaderCore, ReaderState};
use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::format::BatchFormat;
use crate::message::{
    BodyEvent, MessageKind, OperationHost, OperationMessage, OperationRequestMessage,
    OperationResponseMessage,
};
use std::io::{self, Read};

/// Reads a batch of requests or responses from a [`Read`] source.
///
/// # Example
///
/// ```
/// use odata_wire_core::{BatchFormat, BatchReader, BatchSettings, MessageKind, ReaderState};
/// use std::io::Read;
///
/// let payload = "--b1\r\n\
///     Content-Type: application/http\r\n\
///     Content-Transfer-Encoding: binary\r\n\
///     \r\n\
///     HTTP/1.1 200 OK\r\n\
///     Content-Type: text/plain\r\n\
///     \r\n\
///     hello\r\n\
///     --b1--\r\n";
/// let format = BatchFormat::multipart_with_boundary("b1").unwrap();
/// let mut reader = BatchReader::new(payload.as_bytes(), MessageKind::Response, format, BatchSettings::default());
///
/// assert!(reader.read().unwrap());
/// let mut response = reader.create_operation_response_message().unwrap();
/// let mut body = String::new();
/// response.get_stream().unwrap().read_to_string(&mut body).unwrap();
/// assert_eq!(body, "hello");
///
/// assert!(!reader.read().unwrap());
/// assert_eq!(reader.state(), ReaderState::Completed);
/// ```
pub struct BatchReader<R: Read> {
    core: ReaderCore,
    current: Option<OperationMessage>,
    input: R,
}

impl<R: Read> BatchReader<R> {
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
    ///
    /// Returns `false` once the end of the batch has been reached.
    pub fn read(&mut self) -> Result<bool> {
        self.current = None;
        loop {
            match self.core.advance()? {
                Step::Ready(more) => return Ok(more),
                Step::NeedMore => self.core.fill_from(&mut self.input)?,
            }
        }
    }

    /// Message of the request operation the reader is positioned on.
    pub fn create_operation_request_message(&mut self) -> Result<OperationRequestMessage<'_, ReadHost<'_, R>>> {
        let (line, message) = self.core.create_request()?;
        let message = self.current.insert(message);
        let host = ReadHost {
            core: &mut self.core,
            input: &mut self.input,
        };
        Ok(OperationRequestMessage::new(line, message, host))
    }

    /// Message of the response operation the reader is positioned on.
    pub fn create_operation_response_message(&mut self) -> Result<OperationResponseMessage<'_, ReadHost<'_, R>>> {
        let message = self.core.create_response()?;
        let message = self.current.insert(message);
        let host = ReadHost {
            core: &mut self.core,
            input: &mut self.input,
        };
        Ok(OperationResponseMessage::new(message, host))
    }

    pub fn into_inner(self) -> R {
        self.input
    }
}

/// Reader side of an operation message created by [`BatchReader`].
pub struct ReadHost<'a, R> {
    core: &'a mut ReaderCore,
    input: &'a mut R,
}

impl<R: Read> OperationHost for ReadHost<'_, R> {
    type Stream<'s>
        = OperationReadStream<'s, R>
    where
        Self: 's;

    fn open_stream<'s>(&'s mut self, message: &'s mut OperationMessage) -> Result<Self::Stream<'s>> {
        self.core.on_body_event(message, BodyEvent::Requested)?;
        Ok(OperationReadStream {
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

/// Body stream of an operation being read.
pub struct OperationReadStream<'a, R: Read> {
    core: &'a mut ReaderCore,
    input: &'a mut R,
    message: &'a mut OperationMessage,
    disposed: bool,
}

impl<R: Read> OperationReadStream<'_, R> {
    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.core.on_body_event(self.message, BodyEvent::Disposed)
    }

    /// Release the stream so the reader can move on.
    pub fn close(mut self) -> Result<()> {
        self.dispose()
    }
}

impl<R: Read> Read for OperationReadStream<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.core.read_body(buf).map_err(BatchError::into_io)? {
                Step::Ready(count) => return Ok(count),
                Step::NeedMore => self
                    .core
                    .fill_from(self.input)
                    .map_err(BatchError::into_io)?,
            }
        }
    }
}

impl<R: Read> Drop for OperationReadStream<'_, R> {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}
