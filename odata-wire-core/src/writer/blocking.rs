//! Batch writer over a blocking [`std::io::Write`] sink.

use super::{FLUSH_THRESHOLD, WriterCore, WriterState};
use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::format::BatchFormat;
use crate::message::{
    BodyEvent, MessageKind, OperationHost, OperationMessage, OperationRequestMessage,
    OperationResponseMessage,
};
use http::Method;
use std::io::{self, Write};

/// Hand everything rendered so far to the sink.
fn drain_output<W: Write>(core: &mut WriterCore, output: &mut W) -> Result<()> {
    if core.out.is_empty() {
        return Ok(());
    }
    let result = output.write_all(&core.out).map_err(BatchError::from);
    core.out.clear();
    core.fault(result)
}

/// Writes a batch of requests or responses to a [`Write`] sink.
///
/// # Example
///
/// ```
/// use odata_wire_core::{BatchFormat, BatchSettings, BatchWriter, MessageKind};
/// use http::Method;
///
/// let format = BatchFormat::multipart_with_boundary("batch_1").unwrap();
/// let mut writer = BatchWriter::new(Vec::new(), MessageKind::Request, format, BatchSettings::default());
///
/// writer.write_start_batch().unwrap();
/// {
///     let mut request = writer
///         .create_operation_request_message(Method::GET, "http://host/service/Customers", None)
///         .unwrap();
///     request.set_header("Accept", "application/json").unwrap();
/// }
/// writer.write_end_batch().unwrap();
///
/// let payload = String::from_utf8(writer.into_inner()).unwrap();
/// assert!(payload.starts_with("--batch_1\r\n"));
/// assert!(payload.ends_with("--batch_1--\r\n"));
/// ```
pub struct BatchWriter<W: Write> {
    core: WriterCore,
    current: Option<OperationMessage>,
    output: W,
}

impl<W: Write> BatchWriter<W> {
    pub fn new(output: W, kind: MessageKind, format: BatchFormat, settings: BatchSettings) -> Self {
        Self {
            core: WriterCore::new(kind, &format, settings),
            current: None,
            output,
        }
    }

    /// Current writer state.
    pub fn state(&self) -> WriterState {
        self.core.state()
    }

    fn drain(&mut self) -> Result<()> {
        drain_output(&mut self.core, &mut self.output)
    }

    pub fn write_start_batch(&mut self) -> Result<()> {
        self.core.start_batch()?;
        self.drain()
    }

    /// Open a changeset with a generated boundary (or atomicity group),
    /// which is returned.
    pub fn write_start_changeset(&mut self) -> Result<String> {
        let group = self.core.start_changeset(&mut self.current, None)?;
        self.drain()?;
        Ok(group)
    }

    /// Open a changeset with a caller-chosen boundary (or atomicity group).
    pub fn write_start_changeset_with_id(&mut self, id: &str) -> Result<String> {
        let group = self.core.start_changeset(&mut self.current, Some(id))?;
        self.drain()?;
        Ok(group)
    }

    pub fn write_end_changeset(&mut self) -> Result<()> {
        self.core.end_changeset(&mut self.current)?;
        self.drain()
    }

    /// Start a request operation.
    ///
    /// The returned message borrows the writer; drop it (or close its body
    /// stream) before calling the writer again.
    pub fn create_operation_request_message(
        &mut self,
        method: Method,
        url: &str,
        content_id: Option<&str>,
    ) -> Result<OperationRequestMessage<'_, WriteHost<'_, W>>> {
        let (line, message) = self
            .core
            .create_request(&mut self.current, method, url, content_id)?;
        self.drain()?;
        let message = self.current.insert(message);
        let host = WriteHost {
            core: &mut self.core,
            output: &mut self.output,
        };
        Ok(OperationRequestMessage::new(line, message, host))
    }

    /// Start a response operation.
    pub fn create_operation_response_message(
        &mut self,
    ) -> Result<OperationResponseMessage<'_, WriteHost<'_, W>>> {
        let message = self.core.create_response(&mut self.current)?;
        self.drain()?;
        let message = self.current.insert(message);
        let host = WriteHost {
            core: &mut self.core,
            output: &mut self.output,
        };
        Ok(OperationResponseMessage::new(message, host))
    }

    /// Close the batch and flush the sink.
    pub fn write_end_batch(&mut self) -> Result<()> {
        self.core.end_batch(&mut self.current)?;
        self.flush()
    }

    /// Write buffered framing and flush the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.drain()?;
        let result = self.output.flush().map_err(BatchError::from);
        self.core.fault(result)
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }

    /// Unwrap the sink. Framing not yet flushed is lost.
    pub fn into_inner(self) -> W {
        self.output
    }
}

/// Writer side of an operation message created by [`BatchWriter`].
pub struct WriteHost<'a, W> {
    core: &'a mut WriterCore,
    output: &'a mut W,
}

impl<W: Write> OperationHost for WriteHost<'_, W> {
    type Stream<'s>
        = OperationWriteStream<'s, W>
    where
        Self: 's;

    fn open_stream<'s>(&'s mut self, message: &'s mut OperationMessage) -> Result<Self::Stream<'s>> {
        self.core.on_body_event(message, BodyEvent::Requested)?;
        Ok(OperationWriteStream {
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

/// Body stream of an operation being written.
///
/// Dropping the stream completes the operation; [`close`](Self::close) does
/// the same but reports errors.
pub struct OperationWriteStream<'a, W: Write> {
    core: &'a mut WriterCore,
    output: &'a mut W,
    message: &'a mut OperationMessage,
    disposed: bool,
}

impl<W: Write> OperationWriteStream<'_, W> {
    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.core.on_body_event(self.message, BodyEvent::Disposed)?;
        drain_output(self.core, self.output)
    }

    /// Complete the operation.
    pub fn close(mut self) -> Result<()> {
        self.dispose()
    }
}

impl<W: Write> Write for OperationWriteStream<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.write_body(buf).map_err(BatchError::into_io)?;
        if self.core.out.len() >= FLUSH_THRESHOLD {
            drain_output(self.core, self.output).map_err(BatchError::into_io)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        drain_output(self.core, self.output).map_err(BatchError::into_io)?;
        self.output.flush()
    }
}

impl<W: Write> Drop for OperationWriteStream<'_, W> {
    fn drop(&mut self) {
        // A failure here has already moved the writer to Exception.
        let _ = self.dispose();
    }
}
