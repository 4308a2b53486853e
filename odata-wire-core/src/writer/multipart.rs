//! `multipart/mixed` framing for the batch writer.

use super::OperationPart;
use crate::boundary::{
    CRLF, create_changeset_boundary, validate_boundary, write_changeset_preamble,
    write_end_boundary, write_header, write_line, write_operation_preamble, write_start_boundary,
};
use crate::error::{BatchError, Result};
use crate::headers::HOST;
use crate::message::{MessageKind, OperationMessage};
use bytes::{BufMut, BytesMut};

pub(crate) struct MultipartFraming {
    kind: MessageKind,
    batch_boundary: String,
    changeset_boundary: Option<String>,
    used_boundaries: Vec<String>,
    batch_start_written: bool,
    changeset_start_written: bool,
}

impl MultipartFraming {
    pub(crate) fn new(batch_boundary: String, kind: MessageKind) -> Self {
        Self {
            kind,
            batch_boundary,
            changeset_boundary: None,
            used_boundaries: Vec::new(),
            batch_start_written: false,
            changeset_start_written: false,
        }
    }

    fn write_batch_start_boundary(&mut self, out: &mut BytesMut) {
        write_start_boundary(out, &self.batch_boundary, !self.batch_start_written);
        self.batch_start_written = true;
    }

    pub(crate) fn start_changeset(&mut self, out: &mut BytesMut, id: Option<&str>) -> Result<String> {
        let boundary = match id {
            Some(id) => {
                validate_boundary(id)?;
                id.to_string()
            }
            None => create_changeset_boundary(),
        };
        if boundary == self.batch_boundary || self.used_boundaries.contains(&boundary) {
            return Err(BatchError::DuplicateBoundary(boundary));
        }

        self.write_batch_start_boundary(out);
        write_changeset_preamble(out, &boundary);
        self.used_boundaries.push(boundary.clone());
        self.changeset_boundary = Some(boundary.clone());
        self.changeset_start_written = false;
        Ok(boundary)
    }

    pub(crate) fn end_changeset(&mut self, out: &mut BytesMut) {
        if let Some(boundary) = self.changeset_boundary.take() {
            // An empty changeset is framed by its end boundary alone.
            write_end_boundary(out, &boundary, !self.changeset_start_written);
        }
    }

    pub(crate) fn start_operation(&mut self, out: &mut BytesMut, part: OperationPart<'_>) {
        match &self.changeset_boundary {
            Some(boundary) => {
                write_start_boundary(out, boundary, !self.changeset_start_written);
                self.changeset_start_written = true;
            }
            None => {
                write_start_boundary(out, &self.batch_boundary, !self.batch_start_written);
                self.batch_start_written = true;
            }
        }

        write_operation_preamble(out, part.content_id);
        if let Some(request) = part.request {
            write_line(out, &format!("{} {} HTTP/1.1", request.method, request.target));
            if let Some(host) = request.host {
                write_header(out, HOST, host);
            }
        }
    }

    /// Status line (responses), headers in insertion order, blank line.
    pub(crate) fn write_headers(&mut self, out: &mut BytesMut, message: &OperationMessage) {
        if self.kind == MessageKind::Response {
            let status = message.status;
            write_line(
                out,
                &format!(
                    "HTTP/1.1 {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or_default()
                ),
            );
        }
        for (name, value) in message.headers().iter() {
            write_header(out, name, value);
        }
        out.put_slice(CRLF);
    }

    pub(crate) fn end_batch(&mut self, out: &mut BytesMut) {
        write_end_boundary(out, &self.batch_boundary, !self.batch_start_written);
        // Trailing line break expected by older batch consumers.
        out.put_slice(CRLF);
    }
}
