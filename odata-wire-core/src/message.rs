//! Operation messages embedded in a batch.
//!
//! An operation's headers and lifecycle stage live in an [`OperationMessage`]
//! owned by the batch reader or writer. Callers see it through the typed
//! [`OperationRequestMessage`] / [`OperationResponseMessage`] facades, which
//! borrow the reader or writer for as long as they are alive. That borrow is
//! what keeps a caller from starting a new operation while a body stream is
//! still open.
//!
//! The stage only moves forward:
//!
//! ```text
//! Headers --get_stream()--> StreamRequested --stream closed--> Completed
//!    \__________________ next operation / end of batch ________/
//! ```
//!
//! Once the stage leaves `Headers`, headers are frozen and the body stream
//! cannot be requested again.

use crate::error::{BatchError, Result};
use crate::headers::OperationHeaders;
use http::{Method, StatusCode};
use url::Url;

/// Whether a batch carries requests or responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        }
    }

    pub(crate) fn expect(self, requested: MessageKind) -> Result<()> {
        if self != requested {
            return Err(BatchError::WrongOperationKind {
                requested: requested.as_str(),
                payload: self.as_str(),
            });
        }
        Ok(())
    }
}

/// Check if `method` may be used for a request inside a changeset.
pub(crate) fn is_changeset_method(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
        || method.as_str() == "MERGE"
}

/// Lifecycle stage of an operation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStage {
    /// Headers may still be changed and the body stream requested.
    Headers,
    /// The body stream is open.
    StreamRequested,
    /// The body stream was closed, or the operation was skipped.
    Completed,
}

/// Notification from a body stream to the state machine that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyEvent {
    Requested,
    Disposed,
}

/// Request line of a request operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    /// Absolute URL after base URI and Content-ID resolution.
    pub url: Url,
    /// URL text as given by the caller or found on the wire.
    pub raw_url: String,
}

/// Headers and lifecycle state of one operation.
#[derive(Debug)]
pub struct OperationMessage {
    pub(crate) headers: OperationHeaders,
    pub(crate) status: StatusCode,
    pub(crate) content_id: Option<String>,
    pub(crate) group_id: Option<String>,
    pub(crate) stage: OperationStage,
}

impl OperationMessage {
    pub(crate) fn new(content_id: Option<String>, group_id: Option<String>) -> Self {
        Self {
            headers: OperationHeaders::new(),
            status: StatusCode::OK,
            content_id,
            group_id,
            stage: OperationStage::Headers,
        }
    }

    pub(crate) fn with_headers(mut self, headers: OperationHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn headers(&self) -> &OperationHeaders {
        &self.headers
    }

    pub fn stage(&self) -> OperationStage {
        self.stage
    }

    pub(crate) fn verify_not_completed(&self, action: &'static str) -> Result<()> {
        if self.stage != OperationStage::Headers {
            return Err(BatchError::OperationCompleted(action));
        }
        Ok(())
    }

    /// Move to the stage matching `event`.
    pub(crate) fn apply(&mut self, event: BodyEvent) -> Result<()> {
        match event {
            BodyEvent::Requested => {
                self.verify_not_completed("the content stream can only be requested once")?;
                self.stage = OperationStage::StreamRequested;
            }
            BodyEvent::Disposed => self.stage = OperationStage::Completed,
        }
        Ok(())
    }
}

/// The reader or writer side of an operation facade.
///
/// Implemented by the blocking and async batch readers and writers; `Stream`
/// is the body stream type each of them hands out.
pub trait OperationHost {
    /// Body stream returned by [`OperationHost::open_stream`].
    type Stream<'s>
    where
        Self: 's;

    /// Open the body stream of `message`.
    fn open_stream<'s>(&'s mut self, message: &'s mut OperationMessage) -> Result<Self::Stream<'s>>;

    /// True when messages come from a payload being read.
    fn is_read_only(&self) -> bool;
}

/// Generic request message interface, shared with top-level requests.
pub trait ODataRequestMessage {
    /// Body stream type.
    type Stream<'s>
    where
        Self: 's;

    fn method(&self) -> &Method;
    fn url(&self) -> &Url;
    fn headers(&self) -> &OperationHeaders;
    fn header(&self, name: &str) -> Result<Option<&str>>;
    fn set_header(&mut self, name: &str, value: &str) -> Result<()>;
    fn get_stream(&mut self) -> Result<Self::Stream<'_>>;
}

/// Generic response message interface, shared with top-level responses.
pub trait ODataResponseMessage {
    /// Body stream type.
    type Stream<'s>
    where
        Self: 's;

    fn status_code(&self) -> StatusCode;
    fn set_status_code(&mut self, status: StatusCode) -> Result<()>;
    fn headers(&self) -> &OperationHeaders;
    fn header(&self, name: &str) -> Result<Option<&str>>;
    fn set_header(&mut self, name: &str, value: &str) -> Result<()>;
    fn get_stream(&mut self) -> Result<Self::Stream<'_>>;
}

fn set_header_checked<H: OperationHost>(
    host: &H,
    message: &mut OperationMessage,
    name: &str,
    value: &str,
) -> Result<()> {
    if host.is_read_only() {
        return Err(BatchError::MessageReadOnly);
    }
    message.verify_not_completed("headers can no longer be modified")?;
    message.headers.set(name, value);
    Ok(())
}

/// A request operation inside a batch.
pub struct OperationRequestMessage<'a, H> {
    line: RequestLine,
    message: &'a mut OperationMessage,
    host: H,
}

impl<'a, H: OperationHost> OperationRequestMessage<'a, H> {
    pub(crate) fn new(line: RequestLine, message: &'a mut OperationMessage, host: H) -> Self {
        Self {
            line,
            message,
            host,
        }
    }

    pub fn method(&self) -> &Method {
        &self.line.method
    }

    /// Absolute request URL.
    pub fn url(&self) -> &Url {
        &self.line.url
    }

    /// Request URL as written in the payload, e.g. `$1/Orders`.
    pub fn raw_url(&self) -> &str {
        &self.line.raw_url
    }

    pub fn content_id(&self) -> Option<&str> {
        self.message.content_id.as_deref()
    }

    /// Changeset boundary (multipart) or atomicity group (JSON) of the
    /// enclosing changeset.
    pub fn group_id(&self) -> Option<&str> {
        self.message.group_id.as_deref()
    }

    pub fn headers(&self) -> &OperationHeaders {
        &self.message.headers
    }

    pub fn header(&self, name: &str) -> Result<Option<&str>> {
        self.message.headers.get(name)
    }

    pub fn stage(&self) -> OperationStage {
        self.message.stage
    }

    /// Set a header. Fails once the body stream has been requested.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        set_header_checked(&self.host, self.message, name, value)
    }

    /// Open the body stream. Can only be called once.
    pub fn get_stream(&mut self) -> Result<H::Stream<'_>> {
        self.host.open_stream(&mut *self.message)
    }
}

impl<H: OperationHost> ODataRequestMessage for OperationRequestMessage<'_, H> {
    type Stream<'s>
        = H::Stream<'s>
    where
        Self: 's;

    fn method(&self) -> &Method {
        OperationRequestMessage::method(self)
    }

    fn url(&self) -> &Url {
        OperationRequestMessage::url(self)
    }

    fn headers(&self) -> &OperationHeaders {
        OperationRequestMessage::headers(self)
    }

    fn header(&self, name: &str) -> Result<Option<&str>> {
        OperationRequestMessage::header(self, name)
    }

    fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        OperationRequestMessage::set_header(self, name, value)
    }

    fn get_stream(&mut self) -> Result<Self::Stream<'_>> {
        OperationRequestMessage::get_stream(self)
    }
}

/// A response operation inside a batch.
pub struct OperationResponseMessage<'a, H> {
    message: &'a mut OperationMessage,
    host: H,
}

impl<'a, H: OperationHost> OperationResponseMessage<'a, H> {
    pub(crate) fn new(message: &'a mut OperationMessage, host: H) -> Self {
        Self { message, host }
    }

    pub fn status_code(&self) -> StatusCode {
        self.message.status
    }

    /// Set the status written on the status line. Fails once the body stream
    /// has been requested.
    pub fn set_status_code(&mut self, status: StatusCode) -> Result<()> {
        if self.host.is_read_only() {
            return Err(BatchError::MessageReadOnly);
        }
        self.message
            .verify_not_completed("the status code can no longer be modified")?;
        self.message.status = status;
        Ok(())
    }

    /// Changeset the response belongs to, if any.
    pub fn group_id(&self) -> Option<&str> {
        self.message.group_id.as_deref()
    }

    pub fn headers(&self) -> &OperationHeaders {
        &self.message.headers
    }

    pub fn header(&self, name: &str) -> Result<Option<&str>> {
        self.message.headers.get(name)
    }

    pub fn stage(&self) -> OperationStage {
        self.message.stage
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        set_header_checked(&self.host, self.message, name, value)
    }

    pub fn get_stream(&mut self) -> Result<H::Stream<'_>> {
        self.host.open_stream(&mut *self.message)
    }
}

impl<H: OperationHost> ODataResponseMessage for OperationResponseMessage<'_, H> {
    type Stream<'s>
        = H::Stream<'s>
    where
        Self: 's;

    fn status_code(&self) -> StatusCode {
        OperationResponseMessage::status_code(self)
    }

    fn set_status_code(&mut self, status: StatusCode) -> Result<()> {
        OperationResponseMessage::set_status_code(self, status)
    }

    fn headers(&self) -> &OperationHeaders {
        OperationResponseMessage::headers(self)
    }

    fn header(&self, name: &str) -> Result<Option<&str>> {
        OperationResponseMessage::header(self, name)
    }

    fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        OperationResponseMessage::set_header(self, name, value)
    }

    fn get_stream(&mut self) -> Result<Self::Stream<'_>> {
        OperationResponseMessage::get_stream(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host whose stream is just the message stage after opening.
    struct StageHost {
        read_only: bool,
    }

    impl OperationHost for StageHost {
        type Stream<'s> = &'s mut OperationMessage;

        fn open_stream<'s>(&'s mut self, message: &'s mut OperationMessage) -> Result<Self::Stream<'s>> {
            message.apply(BodyEvent::Requested)?;
            Ok(message)
        }

        fn is_read_only(&self) -> bool {
            self.read_only
        }
    }

    fn request_line() -> RequestLine {
        RequestLine {
            method: Method::POST,
            url: Url::parse("http://host/service/Customers").unwrap(),
            raw_url: "Customers".to_string(),
        }
    }

    #[test]
    fn test_stream_can_only_be_requested_once() {
        let mut message = OperationMessage::new(Some("1".into()), None);
        let mut request =
            OperationRequestMessage::new(request_line(), &mut message, StageHost { read_only: false });

        assert_eq!(request.content_id(), Some("1"));
        request.set_header("Content-Type", "application/json").unwrap();

        let stream = request.get_stream().unwrap();
        assert_eq!(stream.stage, OperationStage::StreamRequested);

        assert!(matches!(
            request.get_stream(),
            Err(BatchError::OperationCompleted(_))
        ));
        assert!(matches!(
            request.set_header("Prefer", "return=minimal"),
            Err(BatchError::OperationCompleted(_))
        ));
    }

    #[test]
    fn test_read_only_messages_reject_changes() {
        let mut message = OperationMessage::new(None, Some("cs".into()));
        let mut response = OperationResponseMessage::new(&mut message, StageHost { read_only: true });

        assert_eq!(response.group_id(), Some("cs"));
        assert!(matches!(
            response.set_status_code(StatusCode::CREATED),
            Err(BatchError::MessageReadOnly)
        ));
        assert!(matches!(
            response.set_header("Location", "x"),
            Err(BatchError::MessageReadOnly)
        ));
    }

    #[test]
    fn test_status_code_frozen_after_stream() {
        let mut message = OperationMessage::new(None, None);
        let mut response = OperationResponseMessage::new(&mut message, StageHost { read_only: false });
        response.set_status_code(StatusCode::CREATED).unwrap();
        assert_eq!(response.status_code(), StatusCode::CREATED);

        let _ = response.get_stream().unwrap();
        assert!(response.set_status_code(StatusCode::OK).is_err());
    }

    #[test]
    fn test_changeset_methods() {
        assert!(is_changeset_method(&Method::POST));
        assert!(is_changeset_method(&Method::from_bytes(b"MERGE").unwrap()));
        assert!(!is_changeset_method(&Method::GET));
    }

    #[test]
    fn test_kind_mismatch() {
        assert!(MessageKind::Request.expect(MessageKind::Request).is_ok());
        assert!(matches!(
            MessageKind::Response.expect(MessageKind::Request),
            Err(BatchError::WrongOperationKind {
                requested: "request",
                payload: "response"
            })
        ));
    }
}
