//! JSON batch framing.
//!
//! A JSON batch is a single document:
//!
//! ```json
//! {"requests": [
//!   {"id": "1", "atomicityGroup": "g1", "method": "POST", "url": "Customers",
//!    "headers": {"Content-Type": "application/json"}, "body": {"Name": "A"}}
//! ]}
//! ```
//!
//! Changesets have no framing of their own: every item of a changeset
//! carries the changeset's `atomicityGroup`. Item bodies are embedded as
//! JSON when their `Content-Type` is JSON, as a string for `text/*`, and
//! base64 encoded otherwise, so an item is only emitted once its body
//! stream is closed.

use super::OperationPart;
use crate::error::{BatchError, Result};
use crate::headers::{CONTENT_TYPE, OperationHeaders};
use crate::message::{MessageKind, OperationMessage};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use mime::Mime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One request or response of a JSON batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct JsonBatchItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) id: Option<String>,
    #[serde(rename = "atomicityGroup", default, skip_serializing_if = "Option::is_none")]
    pub(crate) atomicity_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) status: Option<u16>,
    #[serde(default)]
    pub(crate) headers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) body: Option<Value>,
}

/// Top-level JSON batch document.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct JsonBatchDocument {
    #[serde(default)]
    pub(crate) requests: Option<Vec<JsonBatchItem>>,
    #[serde(default)]
    pub(crate) responses: Option<Vec<JsonBatchItem>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyEncoding {
    Json,
    Text,
    Binary,
}

fn body_encoding(content_type: Option<&str>) -> BodyEncoding {
    let Some(mime) = content_type.and_then(|ct| ct.trim().parse::<Mime>().ok()) else {
        return BodyEncoding::Binary;
    };
    if mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON) {
        BodyEncoding::Json
    } else if mime.type_() == mime::TEXT {
        BodyEncoding::Text
    } else {
        BodyEncoding::Binary
    }
}

/// Embed raw body bytes in a JSON item.
pub(crate) fn encode_body(content_type: Option<&str>, body: &[u8]) -> Result<Value> {
    match body_encoding(content_type) {
        BodyEncoding::Json => Ok(serde_json::from_slice(body)?),
        BodyEncoding::Text => std::str::from_utf8(body)
            .map(|text| Value::String(text.to_string()))
            .map_err(|_| BatchError::malformed("text body is not valid UTF-8")),
        BodyEncoding::Binary => Ok(Value::String(STANDARD.encode(body))),
    }
}

/// Raw body bytes of a JSON item.
pub(crate) fn decode_body(content_type: Option<&str>, body: &Value) -> Result<Bytes> {
    let encoding = body_encoding(content_type);
    match (encoding, body) {
        (BodyEncoding::Json, value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        (BodyEncoding::Text, Value::String(text)) => Ok(Bytes::copy_from_slice(text.as_bytes())),
        (BodyEncoding::Binary, Value::String(encoded)) => STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| BatchError::malformed(format!("invalid base64 body: {e}"))),
        (_, other) => Err(BatchError::malformed(format!(
            "expected a string body for a non-JSON content type, found {other}"
        ))),
    }
}

/// JSON header object from operation headers, in insertion order.
pub(crate) fn headers_to_json(headers: &OperationHeaders) -> Map<String, Value> {
    headers
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect()
}

/// Operation headers from a JSON header object.
pub(crate) fn headers_from_json(map: &Map<String, Value>) -> Result<OperationHeaders> {
    let mut headers = OperationHeaders::new();
    for (name, value) in map {
        let value = match value {
            Value::String(text) => text.clone(),
            Value::Number(_) | Value::Bool(_) => value.to_string(),
            other => {
                return Err(BatchError::malformed(format!(
                    "header '{name}' has a non-scalar value {other}"
                )));
            }
        };
        headers.add(name.clone(), value)?;
    }
    Ok(headers)
}

struct PendingItem {
    id: String,
    method: Option<String>,
    url: Option<String>,
}

pub(crate) struct JsonFraming {
    kind: MessageKind,
    items_written: usize,
    group: Option<String>,
    used_groups: Vec<String>,
    pending: Option<PendingItem>,
    body: BytesMut,
}

impl JsonFraming {
    pub(crate) fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            items_written: 0,
            group: None,
            used_groups: Vec::new(),
            pending: None,
            body: BytesMut::new(),
        }
    }

    pub(crate) fn start_batch(&mut self, out: &mut BytesMut) {
        match self.kind {
            MessageKind::Request => out.put_slice(b"{\"requests\":["),
            MessageKind::Response => out.put_slice(b"{\"responses\":["),
        }
    }

    pub(crate) fn start_changeset(&mut self, id: Option<&str>) -> Result<String> {
        let group = id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        if self.used_groups.contains(&group) {
            return Err(BatchError::DuplicateBoundary(group));
        }
        self.used_groups.push(group.clone());
        self.group = Some(group.clone());
        Ok(group)
    }

    pub(crate) fn end_changeset(&mut self) {
        self.group = None;
    }

    pub(crate) fn start_operation(&mut self, part: OperationPart<'_>) {
        let id = part
            .content_id
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let (method, url) = match part.request {
            Some(request) => (
                Some(request.method.to_string()),
                Some(request.target.to_string()),
            ),
            None => (None, None),
        };
        self.pending = Some(PendingItem { id, method, url });
        self.body.clear();
    }

    pub(crate) fn write_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub(crate) fn finish_operation(&mut self, out: &mut BytesMut, message: &OperationMessage) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let body = if self.body.is_empty() {
            None
        } else {
            Some(encode_body(message.headers().content_type()?, &self.body)?)
        };
        let item = JsonBatchItem {
            id: Some(pending.id),
            atomicity_group: self.group.clone(),
            method: pending.method,
            url: pending.url,
            status: (self.kind == MessageKind::Response).then(|| message.status.as_u16()),
            headers: headers_to_json(message.headers()),
            body,
        };

        if self.items_written > 0 {
            out.put_u8(b',');
        }
        out.put_slice(&serde_json::to_vec(&item)?);
        self.items_written += 1;
        self.body.clear();
        Ok(())
    }

    pub(crate) fn end_batch(&mut self, out: &mut BytesMut) {
        out.put_slice(b"]}");
    }
}
