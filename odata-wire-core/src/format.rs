//! Batch payload formats and payload-kind detection.

use crate::boundary::{create_batch_boundary, multipart_content_type, validate_boundary};
use crate::error::{BatchError, Result};
use crate::headers::OperationHeaders;
use mime::Mime;

/// `application/json` batch content type.
pub const JSON_BATCH_CONTENT_TYPE: &str = "application/json";

/// Kind of payload recognised by [`detect_payload_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Batch,
}

/// Wire format of a batch.
///
/// A format is constructed by the caller and handed to a reader or writer;
/// there is no process-wide default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchFormat {
    /// `multipart/mixed` with the given batch boundary.
    Multipart { boundary: String },
    /// JSON batch (`{"requests": [...]}` / `{"responses": [...]}`).
    Json,
}

impl BatchFormat {
    /// Multipart format with a freshly generated boundary.
    pub fn multipart() -> Self {
        BatchFormat::Multipart {
            boundary: create_batch_boundary(),
        }
    }

    /// Multipart format with a caller-chosen boundary.
    pub fn multipart_with_boundary(boundary: impl Into<String>) -> Result<Self> {
        let boundary = boundary.into();
        validate_boundary(&boundary)?;
        Ok(BatchFormat::Multipart { boundary })
    }

    pub fn json() -> Self {
        BatchFormat::Json
    }

    /// Format described by a message's `Content-Type` value.
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        let unsupported = || BatchError::UnsupportedContentType(content_type.to_string());
        let mime: Mime = content_type.trim().parse().map_err(|_| unsupported())?;

        if is_multipart_mixed(&mime) {
            let boundary = mime
                .get_param(mime::BOUNDARY)
                .map(|b| b.as_str().trim_matches('"').to_string())
                .ok_or_else(unsupported)?;
            return Self::multipart_with_boundary(boundary);
        }
        if mime.essence_str() == JSON_BATCH_CONTENT_TYPE {
            return Ok(BatchFormat::Json);
        }
        Err(unsupported())
    }

    /// Format of a message from its headers.
    pub fn from_headers(headers: &OperationHeaders) -> Result<Self> {
        let content_type = headers
            .content_type()?
            .ok_or_else(|| BatchError::UnsupportedContentType(String::new()))?;
        Self::from_content_type(content_type)
    }

    /// `Content-Type` value for the enclosing message.
    pub fn content_type(&self) -> String {
        match self {
            BatchFormat::Multipart { boundary } => multipart_content_type(boundary),
            BatchFormat::Json => JSON_BATCH_CONTENT_TYPE.to_string(),
        }
    }

    /// Batch boundary, for multipart.
    pub fn boundary(&self) -> Option<&str> {
        match self {
            BatchFormat::Multipart { boundary } => Some(boundary),
            BatchFormat::Json => None,
        }
    }
}

fn is_multipart_mixed(mime: &Mime) -> bool {
    mime.type_() == mime::MULTIPART && mime.subtype().as_str() == "mixed"
}

/// Detect a batch payload from the enclosing message's headers.
///
/// Only the headers are inspected: `multipart/mixed` with a `boundary`
/// parameter, or `application/json`, is a batch. Anything else, including a
/// missing or unparsable `Content-Type`, yields `None`.
pub fn detect_payload_kind(headers: &OperationHeaders) -> Option<PayloadKind> {
    let content_type = headers.try_get(crate::headers::CONTENT_TYPE)?;
    let mime: Mime = content_type.trim().parse().ok()?;

    let is_batch = (is_multipart_mixed(&mime) && mime.get_param(mime::BOUNDARY).is_some())
        || mime.essence_str() == JSON_BATCH_CONTENT_TYPE;
    is_batch.then_some(PayloadKind::Batch)
}
