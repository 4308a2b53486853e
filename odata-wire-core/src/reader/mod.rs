//! Batch reader.
//!
//! [`ReaderCore`] parses a batch payload out of a byte buffer and reports
//! when it needs more input. The blocking
//! [`BatchReader`](blocking::BatchReader) and async
//! [`AsyncBatchReader`](nonblocking::AsyncBatchReader) only refill that
//! buffer from their source, so both produce identical results and errors.
//!
//! Each call to `read` moves to the next item of the batch:
//!
//! ```text
//! Initial -> Operation | ChangesetStart | Completed
//! Operation -> Operation | ChangesetStart | ChangesetEnd | Completed
//! ChangesetStart -> Operation | ChangesetEnd
//! ChangesetEnd -> Operation | ChangesetStart | Completed
//! ```
//!
//! An operation's message must be created before reading on. Any error
//! moves the reader to `Exception`.

pub mod blocking;
pub(crate) mod json;
pub(crate) mod multipart;
pub mod nonblocking;
pub(crate) mod stream;

use crate::buffer::BatchBuffer;
use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::format::BatchFormat;
use crate::headers::{HOST, OperationHeaders};
use crate::message::{BodyEvent, MessageKind, OperationMessage, RequestLine, is_changeset_method};
use crate::uri::{
    ContentIdScope, PayloadUriConverter, ScopedUriConverter, create_operation_request_uri,
    url_from_host,
};
use bytes::{Buf, Bytes};
use http::{Method, StatusCode};
use std::fmt;
use std::io::Read;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};
use url::Url;

use self::json::JsonReplay;
use self::multipart::MultipartParser;
use self::stream::{BatchReaderStream, Step};

/// Batch reader states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Nothing has been read yet.
    Initial,
    /// Positioned on an operation.
    Operation,
    /// Positioned on the start of a changeset.
    ChangesetStart,
    /// Positioned on the end of a changeset.
    ChangesetEnd,
    /// The whole batch has been read.
    Completed,
    /// An error occurred; the reader is unusable.
    Exception,
}

impl ReaderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderState::Initial => "Initial",
            ReaderState::Operation => "Operation",
            ReaderState::ChangesetStart => "ChangesetStart",
            ReaderState::ChangesetEnd => "ChangesetEnd",
            ReaderState::Completed => "Completed",
            ReaderState::Exception => "Exception",
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the caller on the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationState {
    None,
    MessageCreated,
    StreamRequested,
    StreamDisposed,
}

/// Where the current operation's body comes from.
#[derive(Debug)]
pub(crate) enum BodyCursor {
    None,
    /// `Content-Length` bytes, then whatever precedes the next boundary is skipped.
    Length { remaining: u64 },
    /// Up to the next boundary delimiter.
    Delimited { at_start: bool, exhausted: bool },
    /// Already decoded (JSON batches).
    Buffered(Bytes),
}

#[derive(Debug)]
pub(crate) enum StartLine {
    Request { method: Method, raw_url: String },
    Response { status: StatusCode },
}

/// An operation parsed off the wire whose message has not been created yet.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub(crate) line: StartLine,
    pub(crate) headers: OperationHeaders,
    pub(crate) content_id: Option<String>,
}

/// Reader state shared by the multipart and JSON parsers.
pub(crate) struct ReaderContext {
    state: ReaderState,
    op_state: OperationState,
    kind: MessageKind,
    settings: BatchSettings,
    scope: ContentIdScope,
    batch_size: usize,
    changeset_size: usize,
    /// Boundary (multipart) or atomicity group (JSON) of the open changeset.
    group: Option<String>,
    pending: Option<PendingOperation>,
    pub(crate) body: BodyCursor,
}

impl ReaderContext {
    fn new(kind: MessageKind, settings: BatchSettings) -> Self {
        Self {
            state: ReaderState::Initial,
            op_state: OperationState::None,
            kind,
            settings,
            scope: ContentIdScope::new(),
            batch_size: 0,
            changeset_size: 0,
            group: None,
            pending: None,
            body: BodyCursor::None,
        }
    }

    pub(crate) fn state(&self) -> ReaderState {
        self.state
    }

    pub(crate) fn kind(&self) -> MessageKind {
        self.kind
    }

    pub(crate) fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub(crate) fn set_state(&mut self, state: ReaderState) {
        debug!(from = %self.state, to = %state, "batch reader transition");
        self.state = state;
    }

    fn count_batch_part(&mut self) -> Result<()> {
        self.batch_size += 1;
        let max = self.settings.quotas.max_parts_per_batch;
        if self.batch_size > max {
            return Err(BatchError::MaxPartsPerBatchExceeded(max));
        }
        Ok(())
    }

    fn count_changeset_operation(&mut self) -> Result<()> {
        self.changeset_size += 1;
        let max = self.settings.quotas.max_operations_per_changeset;
        if self.changeset_size > max {
            return Err(BatchError::MaxOperationsPerChangesetExceeded(max));
        }
        Ok(())
    }

    /// Count an operation against the batch or changeset quota.
    pub(crate) fn count_operation(&mut self) -> Result<()> {
        if self.group.is_some() {
            self.count_changeset_operation()
        } else {
            self.count_batch_part()
        }
    }

    pub(crate) fn enter_changeset(&mut self, group: String) -> Result<()> {
        self.count_batch_part()?;
        debug!(changeset = %group, "changeset started");
        self.group = Some(group);
        self.changeset_size = 0;
        self.scope.reset();
        self.set_state(ReaderState::ChangesetStart);
        Ok(())
    }

    pub(crate) fn leave_changeset(&mut self) {
        self.group = None;
        self.changeset_size = 0;
        self.scope.reset();
    }

    /// Reject methods that may not appear inside a changeset.
    pub(crate) fn validate_method(&self, method: &Method) -> Result<()> {
        if self.group.is_some() && !is_changeset_method(method) {
            return Err(BatchError::InvalidChangesetMethod(method.to_string()));
        }
        Ok(())
    }

    pub(crate) fn enter_operation(&mut self, pending: PendingOperation, body: BodyCursor) {
        trace!(content_id = ?pending.content_id, changeset = ?self.group, "operation found");
        self.pending = Some(pending);
        self.body = body;
        self.op_state = OperationState::None;
        self.set_state(ReaderState::Operation);
    }

    /// Check that the current operation can be left behind.
    fn leave_operation(&mut self) -> Result<()> {
        match self.op_state {
            OperationState::None => Err(BatchError::NoMessageCreated),
            OperationState::StreamRequested => Err(BatchError::InvalidReaderState {
                action: "read on while an operation content stream is open",
                state: self.state.as_str(),
            }),
            OperationState::MessageCreated | OperationState::StreamDisposed => Ok(()),
        }
    }

    /// Absolute URL of a request read from the payload.
    fn resolve_url(&self, raw_url: &str, headers: &OperationHeaders) -> Result<Url> {
        let base_uri = self.settings.base_uri.as_ref();
        if raw_url.starts_with('/')
            && let Some(host) = headers.get(HOST)?
        {
            return url_from_host(raw_url, host, base_uri);
        }
        let scoped = ScopedUriConverter {
            custom: self.settings.converter(),
            scope: &self.scope,
        };
        create_operation_request_uri(raw_url, base_uri, Some(&scoped as &dyn PayloadUriConverter))
    }

    fn take_pending(&mut self, action: &'static str) -> Result<PendingOperation> {
        if self.state != ReaderState::Operation {
            return Err(BatchError::InvalidReaderState {
                action,
                state: self.state.as_str(),
            });
        }
        if self.op_state != OperationState::None {
            return Err(BatchError::OperationCompleted(
                "a message was already created for this operation",
            ));
        }
        self.pending.take().ok_or(BatchError::InvalidReaderState {
            action,
            state: self.state.as_str(),
        })
    }
}

/// Payload parser selected by [`BatchFormat`].
enum Source {
    Multipart(MultipartParser),
    Json(JsonReplay),
}

/// The reader state machine.
pub(crate) struct ReaderCore {
    source: Source,
    ctx: ReaderContext,
    /// An `advance` returned `NeedMore` and will be resumed.
    advancing: bool,
}

impl ReaderCore {
    pub(crate) fn new(kind: MessageKind, format: &BatchFormat, settings: BatchSettings) -> Self {
        let buffer = BatchBuffer::new(settings.quotas.max_received_message_size);
        let source = match format {
            BatchFormat::Multipart { boundary } => Source::Multipart(MultipartParser::new(
                BatchReaderStream::new(buffer, boundary.clone()),
            )),
            BatchFormat::Json => Source::Json(JsonReplay::new(buffer)),
        };
        Self {
            source,
            ctx: ReaderContext::new(kind, settings),
            advancing: false,
        }
    }

    pub(crate) fn state(&self) -> ReaderState {
        self.ctx.state
    }

    fn fault<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && self.ctx.state != ReaderState::Exception
        {
            warn!(error = %err, state = %self.ctx.state, "batch reader faulted");
            self.ctx.state = ReaderState::Exception;
        }
        result
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        self.fault(result)
    }

    fn buffer(&mut self) -> &mut BatchBuffer {
        match &mut self.source {
            Source::Multipart(parser) => &mut parser.stream.buffer,
            Source::Json(replay) => &mut replay.buffer,
        }
    }

    /// Move to the next item. `Ready(false)` once the batch is complete.
    pub(crate) fn advance(&mut self) -> Result<Step<bool>> {
        self.guarded(|core| {
            match core.ctx.state {
                ReaderState::Completed => return Ok(Step::Ready(false)),
                ReaderState::Exception => {
                    return Err(BatchError::InvalidReaderState {
                        action: "read the next batch item",
                        state: ReaderState::Exception.as_str(),
                    });
                }
                ReaderState::Operation if !core.advancing => core.ctx.leave_operation()?,
                _ => {}
            }
            core.advancing = true;

            let step = match &mut core.source {
                Source::Multipart(parser) => parser.advance(&mut core.ctx)?,
                Source::Json(replay) => replay.advance(&mut core.ctx)?,
            };
            Ok(match step {
                Step::NeedMore => Step::NeedMore,
                Step::Ready(()) => {
                    core.advancing = false;
                    Step::Ready(core.ctx.state != ReaderState::Completed)
                }
            })
        })
    }

    pub(crate) fn create_request(&mut self) -> Result<(RequestLine, OperationMessage)> {
        self.guarded(|core| {
            let ctx = &mut core.ctx;
            ctx.kind.expect(MessageKind::Request)?;
            let pending = ctx.take_pending("create an operation request message")?;
            let StartLine::Request { method, raw_url } = pending.line else {
                return Err(BatchError::WrongOperationKind {
                    requested: MessageKind::Request.as_str(),
                    payload: MessageKind::Response.as_str(),
                });
            };

            let url = ctx.resolve_url(&raw_url, &pending.headers)?;
            if let (Some(id), Some(_)) = (&pending.content_id, &ctx.group) {
                ctx.scope.add(id, url.clone())?;
            }
            ctx.op_state = OperationState::MessageCreated;

            let message = OperationMessage::new(pending.content_id, ctx.group.clone())
                .with_headers(pending.headers);
            let line = RequestLine {
                method,
                url,
                raw_url,
            };
            Ok((line, message))
        })
    }

    pub(crate) fn create_response(&mut self) -> Result<OperationMessage> {
        self.guarded(|core| {
            let ctx = &mut core.ctx;
            ctx.kind.expect(MessageKind::Response)?;
            let pending = ctx.take_pending("create an operation response message")?;
            let StartLine::Response { status } = pending.line else {
                return Err(BatchError::WrongOperationKind {
                    requested: MessageKind::Response.as_str(),
                    payload: MessageKind::Request.as_str(),
                });
            };
            ctx.op_state = OperationState::MessageCreated;
            Ok(OperationMessage::new(pending.content_id, ctx.group.clone())
                .with_headers(pending.headers)
                .with_status(status))
        })
    }

    pub(crate) fn on_body_event(&mut self, message: &mut OperationMessage, event: BodyEvent) -> Result<()> {
        self.guarded(|core| {
            message.apply(event)?;
            core.ctx.op_state = match event {
                BodyEvent::Requested => OperationState::StreamRequested,
                BodyEvent::Disposed => OperationState::StreamDisposed,
            };
            Ok(())
        })
    }

    /// Copy body bytes of the current operation into `dst`; `Ready(0)` at
    /// the end of the body.
    pub(crate) fn read_body(&mut self, dst: &mut [u8]) -> Result<Step<usize>> {
        self.guarded(|core| {
            if core.ctx.op_state != OperationState::StreamRequested {
                return Err(BatchError::InvalidReaderState {
                    action: "read an operation body",
                    state: core.ctx.state.as_str(),
                });
            }
            let stream = match &mut core.source {
                Source::Multipart(parser) => Some(&mut parser.stream),
                Source::Json(_) => None,
            };
            match (&mut core.ctx.body, stream) {
                (BodyCursor::Length { remaining }, Some(stream)) => stream.read_with_length(dst, remaining),
                (BodyCursor::Delimited { at_start, exhausted }, Some(stream)) => {
                    if *exhausted {
                        return Ok(Step::Ready(0));
                    }
                    Ok(match stream.read_with_delimiter(dst, at_start) {
                        Step::NeedMore => Step::NeedMore,
                        Step::Ready((count, reached)) => {
                            *exhausted = reached;
                            Step::Ready(count)
                        }
                    })
                }
                (BodyCursor::Buffered(bytes), _) => {
                    let count = bytes.len().min(dst.len());
                    dst[..count].copy_from_slice(&bytes[..count]);
                    bytes.advance(count);
                    Ok(Step::Ready(count))
                }
                _ => Ok(Step::Ready(0)),
            }
        })
    }

    pub(crate) fn fill_from<R: Read>(&mut self, input: &mut R) -> Result<()> {
        let result = self.buffer().fill_from(input);
        self.fault(result)
    }

    pub(crate) async fn fill_from_async<R: AsyncRead + Unpin>(&mut self, input: &mut R) -> Result<()> {
        let result = self.buffer().fill_from_async(input).await;
        self.fault(result)
    }

    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>, input: &mut (impl AsyncRead + Unpin)) -> Poll<Result<()>> {
        let result = ready!(self.buffer().poll_fill_from(cx, input));
        Poll::Ready(self.fault(result))
    }
}
