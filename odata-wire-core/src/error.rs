//! Batch engine error types.

use thiserror::Error;

/// Result type for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors raised while reading or writing a batch payload.
///
/// Every variant carries a stable message code (see [`BatchError::code`]) so
/// callers can branch on the failure without matching message text. The same
/// error is produced whether the reader/writer is driven synchronously or
/// asynchronously.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A writer method was called in a state that forbids it.
    #[error("Cannot {action} while the batch writer is in state '{state}'")]
    InvalidWriterState {
        /// The attempted action.
        action: &'static str,
        /// The writer state at the time of the call.
        state: &'static str,
    },

    /// A reader method was called in a state that forbids it.
    #[error("Cannot {action} while the batch reader is in state '{state}'")]
    InvalidReaderState {
        /// The attempted action.
        action: &'static str,
        /// The reader state at the time of the call.
        state: &'static str,
    },

    /// The header stage of an operation is complete; headers are frozen and
    /// the content stream cannot be (re)opened.
    #[error("The operation message has already completed its header stage; {0}")]
    OperationCompleted(&'static str),

    /// A request operation was created on a response writer/reader or vice versa.
    #[error("Cannot create a {requested} operation on a {payload} batch")]
    WrongOperationKind {
        /// The kind of operation requested.
        requested: &'static str,
        /// The kind of payload being processed.
        payload: &'static str,
    },

    /// Headers or status of a message read from a payload cannot be changed.
    #[error("Operation messages read from a batch payload are read-only")]
    MessageReadOnly,

    /// The reader was advanced past an operation without creating its message.
    #[error("No operation message was created for the current operation before reading on")]
    NoMessageCreated,

    /// The same Content-ID was used twice inside one changeset.
    #[error("Duplicate Content-ID '{0}' within the same changeset")]
    DuplicateContentId(String),

    /// A changeset boundary repeats the batch boundary or an earlier changeset boundary.
    #[error("Boundary '{0}' is already used in this batch")]
    DuplicateBoundary(String),

    /// A relative URL was used but no base URI is configured.
    #[error("Relative URI '{0}' used in a batch operation but no base URI was specified")]
    RelativeUriWithoutBase(String),

    /// A `$`-prefixed URL did not match any Content-ID and no base URI is configured.
    #[error(
        "Relative URI '{0}' starting with '$' does not reference a known Content-ID and no base URI was specified"
    )]
    ContentIdReferenceWithoutBase(String),

    /// A URL could not be parsed.
    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// A `Content-Length` header was negative or not a number.
    #[error("Invalid Content-Length header value '{0}'")]
    InvalidContentLength(String),

    /// More than one header matched a case-insensitive lookup.
    #[error("Header '{0}' matches more than one header name case-insensitively")]
    AmbiguousHeader(String),

    /// A header with the exact same name already exists.
    #[error("Duplicate header '{0}'")]
    DuplicateHeader(String),

    /// The batch contains more parts than allowed.
    #[error("The number of parts in the batch exceeds the maximum of {0}")]
    MaxPartsPerBatchExceeded(usize),

    /// A changeset contains more operations than allowed.
    #[error("The number of operations in a changeset exceeds the maximum of {0}")]
    MaxOperationsPerChangesetExceeded(usize),

    /// The payload is larger than the configured maximum message size.
    #[error("The batch payload exceeds the maximum message size of {0} bytes")]
    MaxMessageSizeExceeded(u64),

    /// A non-modifying method was used inside a changeset.
    #[error("HTTP method '{0}' is not allowed for a request inside a changeset")]
    InvalidChangesetMethod(String),

    /// The payload does not follow the batch framing rules.
    #[error("Malformed batch payload: {0}")]
    Malformed(String),

    /// The batch content type is not a recognised batch format.
    #[error("Unsupported batch content type '{0}'")]
    UnsupportedContentType(String),

    /// A configuration value could not be parsed.
    #[error("Invalid setting {key}: {message}")]
    InvalidSetting {
        /// The setting name.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// JSON batch encoding or decoding failed.
    #[error("JSON batch error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Stable message code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidWriterState { .. } => "ODataBatchWriter_InvalidTransition",
            Self::InvalidReaderState { .. } => "ODataBatchReader_InvalidState",
            Self::OperationCompleted(_) => "ODataBatchOperationMessage_VerifyNotCompleted",
            Self::WrongOperationKind { .. } => "ODataBatch_WrongOperationKind",
            Self::MessageReadOnly => "ODataMessage_MustNotModifyMessage",
            Self::DuplicateBoundary(_) => "ODataBatch_DuplicateBoundary",
            Self::NoMessageCreated => "ODataBatchReader_NoMessageWasCreatedForOperation",
            Self::DuplicateContentId(_) => "ODataBatch_DuplicateContentIDsNotAllowed",
            Self::RelativeUriWithoutBase(_) => {
                "ODataBatchUtils_RelativeUriUsedWithoutBaseUriSpecified"
            }
            Self::ContentIdReferenceWithoutBase(_) => {
                "ODataBatchUtils_RelativeUriStartingWithDollarUsedWithoutBaseUriSpecified"
            }
            Self::InvalidUri(_) => "ODataBatch_InvalidUri",
            Self::InvalidContentLength(_) => "ODataBatchReaderStream_InvalidContentLengthSpecified",
            Self::AmbiguousHeader(_) => "ODataBatchOperationHeaders_AmbiguousHeader",
            Self::DuplicateHeader(_) => "ODataBatchReaderStream_DuplicateHeaderFound",
            Self::MaxPartsPerBatchExceeded(_) => "ODataBatch_MaxBatchSizeExceeded",
            Self::MaxOperationsPerChangesetExceeded(_) => "ODataBatch_MaxChangeSetSizeExceeded",
            Self::MaxMessageSizeExceeded(_) => "ODataBatch_MessageSizeQuotaExceeded",
            Self::InvalidChangesetMethod(_) => {
                "ODataBatchReaderStream_InvalidHttpMethodForChangeSetRequest"
            }
            Self::Malformed(_) => "ODataBatch_MalformedPayload",
            Self::UnsupportedContentType(_) => "ODataBatch_UnsupportedContentType",
            Self::InvalidSetting { .. } => "ODataBatch_InvalidSetting",
            Self::Json(_) => "ODataBatch_JsonError",
            Self::Io(_) => "ODataBatch_IoError",
        }
    }

    /// Check if this error is a protocol state violation.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidWriterState { .. }
                | Self::InvalidReaderState { .. }
                | Self::OperationCompleted(_)
                | Self::WrongOperationKind { .. }
                | Self::NoMessageCreated
                | Self::MessageReadOnly
        )
    }

    /// Check if this error is a quota violation.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            Self::MaxPartsPerBatchExceeded(_)
                | Self::MaxOperationsPerChangesetExceeded(_)
                | Self::MaxMessageSizeExceeded(_)
        )
    }

    /// Check if this error came from the underlying stream.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Convert this error for surfacing from a `std::io` trait method.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(err) => err,
            other => std::io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            BatchError::DuplicateContentId("1".into()).code(),
            "ODataBatch_DuplicateContentIDsNotAllowed"
        );
        assert_eq!(
            BatchError::RelativeUriWithoutBase("Customers".into()).code(),
            "ODataBatchUtils_RelativeUriUsedWithoutBaseUriSpecified"
        );
        assert_eq!(
            BatchError::ContentIdReferenceWithoutBase("$1".into()).code(),
            "ODataBatchUtils_RelativeUriStartingWithDollarUsedWithoutBaseUriSpecified"
        );
    }

    #[test]
    fn test_classification() {
        let err = BatchError::InvalidWriterState {
            action: "create an operation",
            state: "BatchCompleted",
        };
        assert!(err.is_state_violation());
        assert!(!err.is_quota_exceeded());
        assert!(BatchError::MaxPartsPerBatchExceeded(100).is_quota_exceeded());
        assert!(BatchError::from(std::io::Error::other("boom")).is_io());
    }

    #[test]
    fn test_into_io_keeps_io_errors() {
        let err = BatchError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.into_io().kind(), std::io::ErrorKind::BrokenPipe);

        let err = BatchError::malformed("bad boundary");
        assert_eq!(err.into_io().kind(), std::io::ErrorKind::Other);
    }
}
