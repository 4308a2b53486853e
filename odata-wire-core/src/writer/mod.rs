//! Batch writer.
//!
//! [`WriterCore`] is the state machine shared by the blocking
//! [`BatchWriter`](blocking::BatchWriter) and the async
//! [`AsyncBatchWriter`](nonblocking::AsyncBatchWriter). It never performs
//! I/O: every call renders framing into an output buffer which the driver
//! then drains into its `Write` / `AsyncWrite` sink.
//!
//! ```text
//! Start -> BatchStarted -> ChangesetStarted -> OperationCreated
//!                |                 ^                 |
//!                v                 |                 v
//!         OperationCreated --------+--- OperationStreamRequested
//!                |                                   |
//!                v                                   v
//!          BatchCompleted <-- ChangesetCompleted <-- OperationStreamDisposed
//! ```
//!
//! Any error moves the writer to `Exception`, after which every call fails.

pub mod blocking;
pub(crate) mod json;
pub(crate) mod multipart;
pub mod nonblocking;

use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::format::BatchFormat;
use crate::message::{
    BodyEvent, MessageKind, OperationMessage, OperationStage, RequestLine, is_changeset_method,
};
use crate::uri::{
    ContentIdScope, PayloadUriConverter, PayloadUriOption, ScopedUriConverter,
    create_operation_request_uri, request_target,
};
use bytes::BytesMut;
use http::Method;
use std::fmt;
use tracing::{debug, trace, warn};

use self::json::JsonFraming;
use self::multipart::MultipartFraming;

/// Buffered output size at which body streams hand bytes to the sink.
pub(crate) const FLUSH_THRESHOLD: usize = 8 * 1024;

/// Batch writer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Start,
    BatchStarted,
    ChangesetStarted,
    OperationCreated,
    OperationStreamRequested,
    OperationStreamDisposed,
    ChangesetCompleted,
    BatchCompleted,
    Exception,
}

impl WriterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriterState::Start => "Start",
            WriterState::BatchStarted => "BatchStarted",
            WriterState::ChangesetStarted => "ChangesetStarted",
            WriterState::OperationCreated => "OperationCreated",
            WriterState::OperationStreamRequested => "OperationStreamRequested",
            WriterState::OperationStreamDisposed => "OperationStreamDisposed",
            WriterState::ChangesetCompleted => "ChangesetCompleted",
            WriterState::BatchCompleted => "BatchCompleted",
            WriterState::Exception => "Exception",
        }
    }
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the framing needs to know to open an operation part.
pub(crate) struct OperationPart<'a> {
    pub(crate) content_id: Option<&'a str>,
    pub(crate) request: Option<RequestPart<'a>>,
}

pub(crate) struct RequestPart<'a> {
    pub(crate) method: &'a Method,
    /// Request-line target, already rendered per the payload URI option.
    pub(crate) target: &'a str,
    pub(crate) host: Option<&'a str>,
}

/// Wire encoding selected by [`BatchFormat`].
pub(crate) enum Framing {
    Multipart(MultipartFraming),
    Json(JsonFraming),
}

impl Framing {
    fn new(format: &BatchFormat, kind: MessageKind) -> Self {
        match format {
            BatchFormat::Multipart { boundary } => {
                Framing::Multipart(MultipartFraming::new(boundary.clone(), kind))
            }
            BatchFormat::Json => Framing::Json(JsonFraming::new(kind)),
        }
    }

    fn start_batch(&mut self, out: &mut BytesMut) {
        match self {
            Framing::Multipart(_) => {}
            Framing::Json(f) => f.start_batch(out),
        }
    }

    fn start_changeset(&mut self, out: &mut BytesMut, id: Option<&str>) -> Result<String> {
        match self {
            Framing::Multipart(f) => f.start_changeset(out, id),
            Framing::Json(f) => f.start_changeset(id),
        }
    }

    fn end_changeset(&mut self, out: &mut BytesMut) {
        match self {
            Framing::Multipart(f) => f.end_changeset(out),
            Framing::Json(f) => f.end_changeset(),
        }
    }

    fn start_operation(&mut self, out: &mut BytesMut, part: OperationPart<'_>) {
        match self {
            Framing::Multipart(f) => f.start_operation(out, part),
            Framing::Json(f) => f.start_operation(part),
        }
    }

    fn write_headers(&mut self, out: &mut BytesMut, message: &OperationMessage) {
        match self {
            Framing::Multipart(f) => f.write_headers(out, message),
            Framing::Json(_) => {}
        }
    }

    fn write_body(&mut self, out: &mut BytesMut, bytes: &[u8]) {
        match self {
            Framing::Multipart(_) => out.extend_from_slice(bytes),
            Framing::Json(f) => f.write_body(bytes),
        }
    }

    fn finish_operation(&mut self, out: &mut BytesMut, message: &OperationMessage) -> Result<()> {
        match self {
            Framing::Multipart(_) => Ok(()),
            Framing::Json(f) => f.finish_operation(out, message),
        }
    }

    fn end_batch(&mut self, out: &mut BytesMut) {
        match self {
            Framing::Multipart(f) => f.end_batch(out),
            Framing::Json(f) => f.end_batch(out),
        }
    }
}

/// The writer state machine.
pub(crate) struct WriterCore {
    state: WriterState,
    kind: MessageKind,
    settings: BatchSettings,
    framing: Framing,
    pub(crate) out: BytesMut,
    scope: ContentIdScope,
    /// Boundary (multipart) or atomicity group (JSON) of the open changeset.
    changeset: Option<String>,
    batch_size: usize,
    changeset_size: usize,
}

impl WriterCore {
    pub(crate) fn new(kind: MessageKind, format: &BatchFormat, settings: BatchSettings) -> Self {
        Self {
            state: WriterState::Start,
            kind,
            settings,
            framing: Framing::new(format, kind),
            out: BytesMut::with_capacity(FLUSH_THRESHOLD),
            scope: ContentIdScope::new(),
            changeset: None,
            batch_size: 0,
            changeset_size: 0,
        }
    }

    pub(crate) fn state(&self) -> WriterState {
        self.state
    }

    /// Enter `Exception` after a failure.
    pub(crate) fn poison(&mut self, error: &dyn fmt::Display) {
        if self.state != WriterState::Exception {
            warn!(error = %error, state = %self.state, "batch writer faulted");
            self.state = WriterState::Exception;
        }
    }

    pub(crate) fn fault<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.poison(err);
        }
        result
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        self.fault(result)
    }

    fn validate_transition(&self, action: &'static str, target: WriterState) -> Result<()> {
        use WriterState::*;

        let allowed = match (self.state, target) {
            (Exception | BatchCompleted, _) => false,
            (Start, BatchStarted) => true,
            (Start, _) | (_, BatchStarted) => false,
            (OperationStreamRequested, OperationStreamDisposed) => true,
            (OperationStreamRequested, _) | (_, OperationStreamDisposed) => false,
            (OperationCreated, OperationStreamRequested) => true,
            (_, OperationStreamRequested) => false,
            (_, ChangesetStarted) => self.changeset.is_none(),
            (_, ChangesetCompleted) => self.changeset.is_some(),
            (_, BatchCompleted) => self.changeset.is_none(),
            (_, OperationCreated) => true,
            (_, Start | Exception) => false,
        };
        if !allowed {
            return Err(BatchError::InvalidWriterState {
                action,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn set_state(&mut self, state: WriterState) {
        debug!(from = %self.state, to = %state, "batch writer transition");
        self.state = state;
    }

    /// Flush the header block of an operation whose stream was never requested.
    fn finish_pending(&mut self, current: &mut Option<OperationMessage>) -> Result<()> {
        if let Some(mut message) = current.take()
            && message.stage() == OperationStage::Headers
        {
            self.framing.write_headers(&mut self.out, &message);
            self.framing.finish_operation(&mut self.out, &message)?;
            message.apply(BodyEvent::Disposed)?;
        }
        Ok(())
    }

    fn increase_batch_size(&mut self) -> Result<()> {
        self.batch_size += 1;
        let max = self.settings.quotas.max_parts_per_batch;
        if self.batch_size > max {
            return Err(BatchError::MaxPartsPerBatchExceeded(max));
        }
        Ok(())
    }

    fn increase_changeset_size(&mut self) -> Result<()> {
        self.changeset_size += 1;
        let max = self.settings.quotas.max_operations_per_changeset;
        if self.changeset_size > max {
            return Err(BatchError::MaxOperationsPerChangesetExceeded(max));
        }
        Ok(())
    }

    fn count_operation(&mut self) -> Result<()> {
        if self.changeset.is_some() {
            self.increase_changeset_size()
        } else {
            self.increase_batch_size()
        }
    }

    pub(crate) fn start_batch(&mut self) -> Result<()> {
        self.guarded(|core| {
            core.validate_transition("start the batch", WriterState::BatchStarted)?;
            core.framing.start_batch(&mut core.out);
            core.set_state(WriterState::BatchStarted);
            Ok(())
        })
    }

    pub(crate) fn start_changeset(
        &mut self,
        current: &mut Option<OperationMessage>,
        id: Option<&str>,
    ) -> Result<String> {
        self.guarded(|core| {
            core.validate_transition("start a changeset", WriterState::ChangesetStarted)?;
            core.finish_pending(current)?;
            core.increase_batch_size()?;
            let group = core.framing.start_changeset(&mut core.out, id)?;
            debug!(changeset = %group, "changeset started");
            core.scope.reset();
            core.changeset_size = 0;
            core.changeset = Some(group.clone());
            core.set_state(WriterState::ChangesetStarted);
            Ok(group)
        })
    }

    pub(crate) fn end_changeset(&mut self, current: &mut Option<OperationMessage>) -> Result<()> {
        self.guarded(|core| {
            core.validate_transition("end a changeset", WriterState::ChangesetCompleted)?;
            core.finish_pending(current)?;
            core.framing.end_changeset(&mut core.out);
            core.scope.reset();
            core.changeset_size = 0;
            core.changeset = None;
            core.set_state(WriterState::ChangesetCompleted);
            Ok(())
        })
    }

    pub(crate) fn create_request(
        &mut self,
        current: &mut Option<OperationMessage>,
        method: Method,
        url: &str,
        content_id: Option<&str>,
    ) -> Result<(RequestLine, OperationMessage)> {
        self.guarded(|core| {
            core.kind.expect(MessageKind::Request)?;
            core.validate_transition("create an operation request message", WriterState::OperationCreated)?;
            if core.changeset.is_some() && !is_changeset_method(&method) {
                return Err(BatchError::InvalidChangesetMethod(method.to_string()));
            }
            core.finish_pending(current)?;
            core.count_operation()?;

            let base_uri = core.settings.base_uri.as_ref();
            let scoped = ScopedUriConverter {
                custom: core.settings.converter(),
                scope: &core.scope,
            };
            let resolved = create_operation_request_uri(
                url,
                base_uri,
                Some(&scoped as &dyn PayloadUriConverter),
            )?;
            let option = match core.framing {
                // JSON items carry a single url field, so keep it resolvable.
                Framing::Json(_) if core.settings.payload_uri_option
                    == PayloadUriOption::AbsoluteResourcePathAndHost =>
                {
                    PayloadUriOption::AbsoluteUri
                }
                _ => core.settings.payload_uri_option,
            };
            let (target, host) = request_target(url, &resolved, base_uri, option, &core.scope);

            if let (Some(id), Some(_)) = (content_id, &core.changeset) {
                core.scope.add(id, resolved.clone())?;
            }

            core.framing.start_operation(
                &mut core.out,
                OperationPart {
                    content_id,
                    request: Some(RequestPart {
                        method: &method,
                        target: &target,
                        host: host.as_deref(),
                    }),
                },
            );
            trace!(method = %method, url = %target, content_id, "operation request created");
            core.set_state(WriterState::OperationCreated);

            let message = OperationMessage::new(content_id.map(str::to_string), core.changeset.clone());
            let line = RequestLine {
                method,
                url: resolved,
                raw_url: url.to_string(),
            };
            Ok((line, message))
        })
    }

    pub(crate) fn create_response(
        &mut self,
        current: &mut Option<OperationMessage>,
    ) -> Result<OperationMessage> {
        self.guarded(|core| {
            core.kind.expect(MessageKind::Response)?;
            core.validate_transition("create an operation response message", WriterState::OperationCreated)?;
            core.finish_pending(current)?;
            core.count_operation()?;
            core.framing.start_operation(
                &mut core.out,
                OperationPart {
                    content_id: None,
                    request: None,
                },
            );
            trace!(changeset = ?core.changeset, "operation response created");
            core.set_state(WriterState::OperationCreated);
            Ok(OperationMessage::new(None, core.changeset.clone()))
        })
    }

    /// Body stream lifecycle notification.
    pub(crate) fn on_body_event(&mut self, message: &mut OperationMessage, event: BodyEvent) -> Result<()> {
        self.guarded(|core| match event {
            BodyEvent::Requested => {
                message.verify_not_completed("the content stream can only be requested once")?;
                core.validate_transition(
                    "open an operation content stream",
                    WriterState::OperationStreamRequested,
                )?;
                core.framing.write_headers(&mut core.out, message);
                message.apply(BodyEvent::Requested)?;
                core.set_state(WriterState::OperationStreamRequested);
                Ok(())
            }
            BodyEvent::Disposed => {
                core.validate_transition(
                    "dispose an operation content stream",
                    WriterState::OperationStreamDisposed,
                )?;
                core.framing.finish_operation(&mut core.out, message)?;
                message.apply(BodyEvent::Disposed)?;
                core.set_state(WriterState::OperationStreamDisposed);
                Ok(())
            }
        })
    }

    pub(crate) fn write_body(&mut self, bytes: &[u8]) -> Result<()> {
        self.guarded(|core| {
            if core.state != WriterState::OperationStreamRequested {
                return Err(BatchError::InvalidWriterState {
                    action: "write an operation body",
                    state: core.state.as_str(),
                });
            }
            core.framing.write_body(&mut core.out, bytes);
            Ok(())
        })
    }

    pub(crate) fn end_batch(&mut self, current: &mut Option<OperationMessage>) -> Result<()> {
        self.guarded(|core| {
            core.validate_transition("end the batch", WriterState::BatchCompleted)?;
            core.finish_pending(current)?;
            core.framing.end_batch(&mut core.out);
            core.set_state(WriterState::BatchCompleted);
            Ok(())
        })
    }
}
