//! MIME boundary generation and framing primitives.
//!
//! Boundary lines are written as `--<boundary>` and closed with
//! `--<boundary>--`. The CRLF *preceding* a boundary line belongs to the
//! delimiter, so it is only written when a part came before it.

use crate::error::{BatchError, Result};
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

/// Prefix for generated batch boundaries.
pub const BATCH_BOUNDARY_PREFIX: &str = "batch_";
/// Prefix for generated changeset boundaries.
pub const CHANGESET_BOUNDARY_PREFIX: &str = "changeset_";
/// Line terminator used for all framing.
pub const CRLF: &[u8] = b"\r\n";

/// Longest boundary allowed by RFC 2046.
const MAX_BOUNDARY_LEN: usize = 70;

/// Generate a fresh batch boundary (`batch_<uuid>`).
pub fn create_batch_boundary() -> String {
    format!("{}{}", BATCH_BOUNDARY_PREFIX, Uuid::new_v4())
}

/// Generate a fresh changeset boundary (`changeset_<uuid>`).
pub fn create_changeset_boundary() -> String {
    format!("{}{}", CHANGESET_BOUNDARY_PREFIX, Uuid::new_v4())
}

/// Check a boundary against the RFC 2046 character and length rules.
pub fn validate_boundary(boundary: &str) -> Result<()> {
    let valid_char = |c: char| {
        c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c)
    };
    if boundary.is_empty()
        || boundary.len() > MAX_BOUNDARY_LEN
        || boundary.ends_with(' ')
        || !boundary.chars().all(valid_char)
    {
        return Err(BatchError::malformed(format!(
            "invalid multipart boundary '{boundary}'"
        )));
    }
    Ok(())
}

/// `multipart/mixed; boundary=<boundary>` content type value.
pub fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/mixed; boundary={boundary}")
}

/// Write a line followed by CRLF.
pub(crate) fn write_line(out: &mut BytesMut, line: &str) {
    out.put_slice(line.as_bytes());
    out.put_slice(CRLF);
}

/// Write `name: value` followed by CRLF.
pub(crate) fn write_header(out: &mut BytesMut, name: &str, value: &str) {
    out.reserve(name.len() + value.len() + 4);
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(CRLF);
}

/// Write a part's start boundary line.
pub(crate) fn write_start_boundary(out: &mut BytesMut, boundary: &str, first_boundary: bool) {
    if !first_boundary {
        out.put_slice(CRLF);
    }
    out.put_slice(b"--");
    write_line(out, boundary);
}

/// Write the closing boundary of a multipart body.
///
/// When no start boundary was ever written (an empty changeset) the leading
/// CRLF is omitted as well.
pub(crate) fn write_end_boundary(out: &mut BytesMut, boundary: &str, missing_start_boundary: bool) {
    if !missing_start_boundary {
        out.put_slice(CRLF);
    }
    out.put_slice(b"--");
    out.put_slice(boundary.as_bytes());
    out.put_slice(b"--");
}

/// Header block opening a changeset inside the batch part.
pub(crate) fn write_changeset_preamble(out: &mut BytesMut, changeset_boundary: &str) {
    write_header(out, "Content-Type", &multipart_content_type(changeset_boundary));
    out.put_slice(CRLF);
}

/// MIME part headers preceding an embedded HTTP message.
pub(crate) fn write_operation_preamble(out: &mut BytesMut, content_id: Option<&str>) {
    write_header(out, "Content-Type", "application/http");
    write_header(out, "Content-Transfer-Encoding", "binary");
    if let Some(content_id) = content_id {
        write_header(out, "Content-ID", content_id);
    }
    out.put_slice(CRLF);
}
