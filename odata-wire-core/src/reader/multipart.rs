//! `multipart/mixed` batch parser.
//!
//! The parser is a resumable sequence of phases. Each phase consumes what
//! it can from the buffered input; when it runs dry the phase is stored and
//! picked up again after the driver refilled the buffer.

use super::stream::{BatchReaderStream, BoundaryKind, BoundaryMatch, Step};
use super::{BodyCursor, PendingOperation, ReaderContext, ReaderState, StartLine};
use crate::boundary::validate_boundary;
use crate::error::{BatchError, Result};
use crate::headers::{CONTENT_TRANSFER_ENCODING, OperationHeaders};
use crate::message::MessageKind;
use http::{Method, StatusCode};
use mime::Mime;
use std::mem;

enum Phase {
    /// Between items; the next advance decides where to start.
    Idle,
    /// Drop what is left of the current operation body.
    SkipBody,
    /// Look for the next boundary line.
    SeekBoundary,
    /// MIME headers of a part.
    PartHeaders(OperationHeaders),
    /// Request or status line of an embedded HTTP message.
    StartLine { content_id: Option<String> },
    /// Headers of an embedded HTTP message.
    OperationHeaders {
        content_id: Option<String>,
        line: StartLine,
        headers: OperationHeaders,
    },
}

pub(crate) struct MultipartParser {
    pub(crate) stream: BatchReaderStream,
    phase: Phase,
    used_boundaries: Vec<String>,
}

impl MultipartParser {
    pub(crate) fn new(stream: BatchReaderStream) -> Self {
        Self {
            stream,
            phase: Phase::Idle,
            used_boundaries: Vec::new(),
        }
    }

    /// Parse up to the next item and update `ctx` accordingly.
    pub(crate) fn advance(&mut self, ctx: &mut ReaderContext) -> Result<Step<()>> {
        loop {
            let next = match mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Idle => self.entry_phase(ctx),
                Phase::SkipBody => match self.skip_body(ctx)? {
                    Step::NeedMore => {
                        self.phase = Phase::SkipBody;
                        return Ok(Step::NeedMore);
                    }
                    Step::Ready(()) => Phase::SeekBoundary,
                },
                Phase::SeekBoundary => match self.stream.next_boundary()? {
                    Step::NeedMore => {
                        self.phase = Phase::SeekBoundary;
                        return Ok(Step::NeedMore);
                    }
                    Step::Ready(found) => match self.on_boundary(ctx, found)? {
                        Some(next) => next,
                        None => return Ok(Step::Ready(())),
                    },
                },
                Phase::PartHeaders(mut headers) => match self.read_headers(&mut headers)? {
                    Step::NeedMore => {
                        self.phase = Phase::PartHeaders(headers);
                        return Ok(Step::NeedMore);
                    }
                    Step::Ready(()) => match self.on_part_headers(ctx, &headers)? {
                        Some(next) => next,
                        None => return Ok(Step::Ready(())),
                    },
                },
                Phase::StartLine { content_id } => match self.stream.read_text_line()? {
                    Step::NeedMore => {
                        self.phase = Phase::StartLine { content_id };
                        return Ok(Step::NeedMore);
                    }
                    Step::Ready(text) => Phase::OperationHeaders {
                        content_id,
                        line: parse_start_line(ctx, &text)?,
                        headers: OperationHeaders::new(),
                    },
                },
                Phase::OperationHeaders {
                    content_id,
                    line,
                    mut headers,
                } => match self.read_headers(&mut headers)? {
                    Step::NeedMore => {
                        self.phase = Phase::OperationHeaders {
                            content_id,
                            line,
                            headers,
                        };
                        return Ok(Step::NeedMore);
                    }
                    Step::Ready(()) => {
                        enter_operation(ctx, content_id, line, headers)?;
                        return Ok(Step::Ready(()));
                    }
                },
            };
            self.phase = next;
        }
    }

    fn entry_phase(&mut self, ctx: &mut ReaderContext) -> Phase {
        match ctx.state() {
            ReaderState::Operation => Phase::SkipBody,
            ReaderState::ChangesetEnd => {
                ctx.leave_changeset();
                self.stream.set_changeset_boundary(None);
                Phase::SeekBoundary
            }
            _ => Phase::SeekBoundary,
        }
    }

    fn skip_body(&mut self, ctx: &mut ReaderContext) -> Result<Step<()>> {
        match &mut ctx.body {
            BodyCursor::Length { remaining } => self.stream.skip_bytes(remaining),
            BodyCursor::Delimited { exhausted: true, .. } => Ok(Step::Ready(())),
            BodyCursor::Delimited { at_start, .. } => Ok(self.stream.skip_with_delimiter(at_start)),
            BodyCursor::None | BodyCursor::Buffered(_) => Ok(Step::Ready(())),
        }
    }

    fn on_boundary(&mut self, ctx: &mut ReaderContext, found: BoundaryMatch) -> Result<Option<Phase>> {
        let in_changeset = self.stream.changeset_boundary().is_some();
        match (found.kind, found.is_end) {
            (BoundaryKind::Batch, _) if in_changeset => Err(BatchError::malformed(
                "the batch boundary appeared before the end boundary of the open changeset",
            )),
            (BoundaryKind::Batch, true) => {
                ctx.set_state(ReaderState::Completed);
                Ok(None)
            }
            (BoundaryKind::Changeset, true) => {
                ctx.set_state(ReaderState::ChangesetEnd);
                Ok(None)
            }
            (_, false) => Ok(Some(Phase::PartHeaders(OperationHeaders::new()))),
        }
    }

    /// Header lines up to the blank line that ends them.
    fn read_headers(&mut self, headers: &mut OperationHeaders) -> Result<Step<()>> {
        loop {
            let line = match self.stream.read_text_line()? {
                Step::NeedMore => return Ok(Step::NeedMore),
                Step::Ready(line) => line,
            };
            if line.is_empty() {
                return Ok(Step::Ready(()));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| BatchError::malformed(format!("invalid header line '{line}'")))?;
            headers.add(name.trim(), value.trim())?;
        }
    }

    fn on_part_headers(&mut self, ctx: &mut ReaderContext, headers: &OperationHeaders) -> Result<Option<Phase>> {
        let content_type = headers
            .content_type()?
            .ok_or_else(|| BatchError::malformed("batch part without a Content-Type header"))?;
        let mime: Mime = content_type
            .trim()
            .parse()
            .map_err(|_| BatchError::UnsupportedContentType(content_type.to_string()))?;

        if mime.type_() == mime::MULTIPART && mime.subtype().as_str() == "mixed" {
            if self.stream.changeset_boundary().is_some() {
                return Err(BatchError::malformed("changesets cannot be nested"));
            }
            let boundary = mime
                .get_param(mime::BOUNDARY)
                .map(|b| b.as_str().trim_matches('"').to_string())
                .ok_or_else(|| BatchError::malformed("changeset part without a boundary parameter"))?;
            validate_boundary(&boundary)?;
            if boundary == self.stream.batch_boundary() || self.used_boundaries.contains(&boundary) {
                return Err(BatchError::DuplicateBoundary(boundary));
            }
            self.used_boundaries.push(boundary.clone());
            self.stream.set_changeset_boundary(Some(boundary.clone()));
            ctx.enter_changeset(boundary)?;
            return Ok(None);
        }

        if mime.essence_str() != "application/http" {
            return Err(BatchError::UnsupportedContentType(content_type.to_string()));
        }
        match headers.get(CONTENT_TRANSFER_ENCODING)? {
            Some(encoding) if encoding.trim().eq_ignore_ascii_case("binary") => {}
            other => {
                return Err(BatchError::malformed(format!(
                    "operation parts require 'Content-Transfer-Encoding: binary', found {other:?}"
                )));
            }
        }
        ctx.count_operation()?;
        Ok(Some(Phase::StartLine {
            content_id: headers.content_id()?.map(str::to_string),
        }))
    }
}

fn parse_start_line(ctx: &ReaderContext, text: &str) -> Result<StartLine> {
    match ctx.kind() {
        MessageKind::Request => {
            let parts: Vec<&str> = text.split_whitespace().collect();
            let [method, url, version] = parts.as_slice() else {
                return Err(BatchError::malformed(format!("invalid request line '{text}'")));
            };
            if *version != "HTTP/1.1" {
                return Err(BatchError::malformed(format!(
                    "unsupported HTTP version '{version}' in request line"
                )));
            }
            let method = Method::from_bytes(method.as_bytes())
                .map_err(|_| BatchError::malformed(format!("invalid HTTP method '{method}'")))?;
            ctx.validate_method(&method)?;
            Ok(StartLine::Request {
                method,
                raw_url: url.to_string(),
            })
        }
        MessageKind::Response => {
            let mut parts = text.splitn(3, ' ');
            if parts.next() != Some("HTTP/1.1") {
                return Err(BatchError::malformed(format!("invalid response line '{text}'")));
            }
            let status = parts
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| BatchError::malformed(format!("invalid status code in '{text}'")))?;
            Ok(StartLine::Response { status })
        }
    }
}

fn enter_operation(
    ctx: &mut ReaderContext,
    content_id: Option<String>,
    line: StartLine,
    headers: OperationHeaders,
) -> Result<()> {
    let content_id = match content_id {
        Some(id) => Some(id),
        None => headers.content_id()?.map(str::to_string),
    };
    let body = match headers.content_length()? {
        Some(remaining) => BodyCursor::Length { remaining },
        None => BodyCursor::Delimited {
            at_start: true,
            exhausted: false,
        },
    };
    ctx.enter_operation(
        PendingOperation {
            line,
            headers,
            content_id,
        },
        body,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BatchBuffer;
    use crate::config::BatchSettings;

    fn parser(payload: &str) -> MultipartParser {
        MultipartParser::new(BatchReaderStream::new(
            BatchBuffer::from_bytes(payload.as_bytes()),
            "b1".to_string(),
        ))
    }

    fn states(kind: MessageKind, payload: &str) -> Result<Vec<ReaderState>> {
        let mut parser = parser(payload);
        let mut ctx = ReaderContext::new(kind, BatchSettings::default());
        let mut seen = Vec::new();
        while ctx.state() != ReaderState::Completed {
            match parser.advance(&mut ctx)? {
                Step::Ready(()) => seen.push(ctx.state()),
                Step::NeedMore => panic!("complete payload never needs more input"),
            }
        }
        Ok(seen)
    }

    fn part(start_line: &str, headers: &str, body: &str) -> String {
        format!(
            "Content-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\n\
             {start_line}\r\n{headers}\r\n{body}"
        )
    }

    #[test]
    fn test_changeset_sequence() {
        let payload = format!(
            "preamble\r\n--b1\r\nContent-Type: multipart/mixed; boundary=c1\r\n\r\n\
             --c1\r\n{}\r\n--c1\r\n{}\r\n--c1--\r\n--b1\r\n{}\r\n--b1--\r\n",
            part("POST http://host/A HTTP/1.1", "Content-ID: 1\r\n", "{}"),
            part("DELETE $1 HTTP/1.1", "", ""),
            part("GET http://host/B HTTP/1.1", "", ""),
        );
        assert_eq!(
            states(MessageKind::Request, &payload).unwrap(),
            vec![
                ReaderState::ChangesetStart,
                ReaderState::Operation,
                ReaderState::Operation,
                ReaderState::ChangesetEnd,
                ReaderState::Operation,
                ReaderState::Completed,
            ]
        );
    }

    #[test]
    fn test_empty_changeset_and_empty_batch() {
        let payload = "--b1\r\nContent-Type: multipart/mixed; boundary=c1\r\n\r\n--c1--\r\n--b1--\r\n";
        assert_eq!(
            states(MessageKind::Request, payload).unwrap(),
            vec![
                ReaderState::ChangesetStart,
                ReaderState::ChangesetEnd,
                ReaderState::Completed,
            ]
        );
        assert_eq!(
            states(MessageKind::Request, "--b1--\r\n").unwrap(),
            vec![ReaderState::Completed]
        );
    }

    #[test]
    fn test_nested_changeset_is_rejected() {
        let payload = "--b1\r\nContent-Type: multipart/mixed; boundary=c1\r\n\r\n\
                       --c1\r\nContent-Type: multipart/mixed; boundary=c2\r\n\r\n--c2--\r\n--c1--\r\n--b1--\r\n";
        assert!(matches!(
            states(MessageKind::Request, payload),
            Err(BatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_changeset_reusing_batch_boundary() {
        let payload = "--b1\r\nContent-Type: multipart/mixed; boundary=b1\r\n\r\n--b1--\r\n";
        assert!(matches!(
            states(MessageKind::Request, payload),
            Err(BatchError::DuplicateBoundary(_))
        ));
    }

    #[test]
    fn test_batch_boundary_inside_changeset() {
        let payload = format!(
            "--b1\r\nContent-Type: multipart/mixed; boundary=c1\r\n\r\n--c1\r\n{}\r\n--b1--\r\n",
            part("POST http://host/A HTTP/1.1", "", ""),
        );
        assert!(matches!(
            states(MessageKind::Request, &payload),
            Err(BatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_get_inside_changeset() {
        let payload = format!(
            "--b1\r\nContent-Type: multipart/mixed; boundary=c1\r\n\r\n--c1\r\n{}\r\n--c1--\r\n--b1--\r\n",
            part("GET http://host/A HTTP/1.1", "", ""),
        );
        assert!(matches!(
            states(MessageKind::Request, &payload),
            Err(BatchError::InvalidChangesetMethod(_))
        ));
    }

    #[test]
    fn test_operation_requires_binary_encoding() {
        let payload = "--b1\r\nContent-Type: application/http\r\n\r\nGET http://host/A HTTP/1.1\r\n\r\n\r\n--b1--\r\n";
        assert!(matches!(
            states(MessageKind::Request, payload),
            Err(BatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_request_lines() {
        for line in ["GET http://host/A", "GET http://host/A HTTP/1.0", "GET a b HTTP/1.1"] {
            let payload = format!("--b1\r\n{}\r\n--b1--\r\n", part(line, "", ""));
            assert!(
                matches!(states(MessageKind::Request, &payload), Err(BatchError::Malformed(_))),
                "{line}"
            );
        }
    }

    #[test]
    fn test_duplicate_operation_header() {
        let payload = format!(
            "--b1\r\n{}\r\n--b1--\r\n",
            part("GET http://host/A HTTP/1.1", "Accept: a\r\nAccept: b\r\n", ""),
        );
        assert!(matches!(
            states(MessageKind::Request, &payload),
            Err(BatchError::DuplicateHeader(_))
        ));
    }

    #[test]
    fn test_unread_length_body_is_skipped() {
        let payload = format!(
            "--b1\r\n{}\r\n--b1\r\n{}\r\n--b1--\r\n",
            part("HTTP/1.1 200 OK", "Content-Length: 5\r\n", "hello world"),
            part("HTTP/1.1 404 Not Found", "", ""),
        );
        let mut parser = parser(&payload);
        let mut ctx = ReaderContext::new(MessageKind::Response, BatchSettings::default());

        assert_eq!(parser.advance(&mut ctx).unwrap(), Step::Ready(()));
        assert!(matches!(ctx.body, BodyCursor::Length { remaining: 5 }));
        assert_eq!(parser.advance(&mut ctx).unwrap(), Step::Ready(()));
        match &ctx.pending {
            Some(PendingOperation {
                line: StartLine::Response { status },
                ..
            }) => assert_eq!(*status, StatusCode::NOT_FOUND),
            other => panic!("unexpected pending operation {other:?}"),
        }
    }
}
