//! Line and body scanning over the buffered multipart payload.
//!
//! Everything here works on whatever is currently buffered and answers
//! [`Step::NeedMore`] when a decision needs bytes that have not arrived yet.
//! At end of input `NeedMore` is never returned.

use crate::buffer::BatchBuffer;
use crate::error::{BatchError, Result};

/// Outcome of a step that may need more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step<T> {
    Ready(T),
    NeedMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundaryKind {
    Batch,
    Changeset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoundaryMatch {
    pub(crate) kind: BoundaryKind,
    pub(crate) is_end: bool,
}

/// How far a buffered body extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// The body ends at this offset, where the boundary delimiter starts.
    Found(usize),
    /// This many bytes are body for sure; the rest needs more input.
    Partial(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMatch {
    Match,
    NoMatch,
    Incomplete,
}

fn is_blank(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

pub(crate) struct BatchReaderStream {
    pub(crate) buffer: BatchBuffer,
    batch_boundary: String,
    changeset_boundary: Option<String>,
}

impl BatchReaderStream {
    pub(crate) fn new(buffer: BatchBuffer, batch_boundary: String) -> Self {
        Self {
            buffer,
            batch_boundary,
            changeset_boundary: None,
        }
    }

    pub(crate) fn batch_boundary(&self) -> &str {
        &self.batch_boundary
    }

    pub(crate) fn changeset_boundary(&self) -> Option<&str> {
        self.changeset_boundary.as_deref()
    }

    pub(crate) fn set_changeset_boundary(&mut self, boundary: Option<String>) {
        self.changeset_boundary = boundary;
    }

    /// Boundaries a delimiter line may carry, innermost first.
    fn boundaries(&self) -> impl Iterator<Item = (BoundaryKind, &str)> {
        self.changeset_boundary
            .as_deref()
            .map(|b| (BoundaryKind::Changeset, b))
            .into_iter()
            .chain(std::iter::once((BoundaryKind::Batch, self.batch_boundary.as_str())))
    }

    /// Check if `line` is a boundary line of the batch or the open changeset.
    ///
    /// Trailing whitespace after the boundary is ignored.
    pub(crate) fn match_boundary(&self, line: &[u8]) -> Option<BoundaryMatch> {
        let rest = line.trim_ascii_end().strip_prefix(b"--")?;
        self.boundaries().find_map(|(kind, boundary)| {
            let after = rest.strip_prefix(boundary.as_bytes())?;
            match after {
                b"" => Some(BoundaryMatch { kind, is_end: false }),
                b"--" => Some(BoundaryMatch { kind, is_end: true }),
                _ => None,
            }
        })
    }

    /// Next line without its line break (LF or CRLF).
    ///
    /// At end of input the unterminated remainder counts as a line; nothing
    /// left at all is a malformed payload.
    pub(crate) fn read_line(&mut self) -> Result<Step<Vec<u8>>> {
        let available = self.buffer.available();
        let (line_len, consumed) = match available.iter().position(|&b| b == b'\n') {
            Some(lf) => (lf, lf + 1),
            None if self.buffer.is_eof() => {
                if available.is_empty() {
                    return Err(BatchError::malformed("unexpected end of the batch payload"));
                }
                (available.len(), available.len())
            }
            None => return Ok(Step::NeedMore),
        };
        let mut line = &available[..line_len];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let line = line.to_vec();
        self.buffer.consume(consumed);
        Ok(Step::Ready(line))
    }

    /// Next line as UTF-8 text.
    pub(crate) fn read_text_line(&mut self) -> Result<Step<String>> {
        match self.read_line()? {
            Step::NeedMore => Ok(Step::NeedMore),
            Step::Ready(line) => String::from_utf8(line)
                .map(Step::Ready)
                .map_err(|_| BatchError::malformed("batch payload line is not valid UTF-8")),
        }
    }

    /// Skip lines up to and including the next boundary line.
    pub(crate) fn next_boundary(&mut self) -> Result<Step<BoundaryMatch>> {
        loop {
            match self.read_line()? {
                Step::NeedMore => return Ok(Step::NeedMore),
                Step::Ready(line) => {
                    if let Some(found) = self.match_boundary(&line) {
                        return Ok(Step::Ready(found));
                    }
                }
            }
        }
    }

    /// Copy up to `remaining` body bytes into `dst`.
    pub(crate) fn read_with_length(&mut self, dst: &mut [u8], remaining: &mut u64) -> Result<Step<usize>> {
        if *remaining == 0 || dst.is_empty() {
            return Ok(Step::Ready(0));
        }
        let available = self.buffer.available();
        let count = available
            .len()
            .min(dst.len())
            .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
        if count == 0 {
            return self.truncated();
        }
        dst[..count].copy_from_slice(&available[..count]);
        self.buffer.consume(count);
        *remaining -= count as u64;
        Ok(Step::Ready(count))
    }

    /// Drop up to `remaining` body bytes.
    pub(crate) fn skip_bytes(&mut self, remaining: &mut u64) -> Result<Step<()>> {
        while *remaining > 0 {
            let available = self.buffer.available().len();
            let count = available.min(usize::try_from(*remaining).unwrap_or(usize::MAX));
            if count == 0 {
                return self.truncated();
            }
            self.buffer.consume(count);
            *remaining -= count as u64;
        }
        Ok(Step::Ready(()))
    }

    fn truncated<T>(&self) -> Result<Step<T>> {
        if self.buffer.is_eof() {
            return Err(BatchError::malformed(
                "the batch payload ended inside an operation body",
            ));
        }
        Ok(Step::NeedMore)
    }

    /// Whether `bytes` start with a complete boundary line.
    fn boundary_line_at(&self, bytes: &[u8], eof: bool) -> LineMatch {
        let mut incomplete = false;
        for (_, boundary) in self.boundaries() {
            let mut delimiter = Vec::with_capacity(boundary.len() + 2);
            delimiter.extend_from_slice(b"--");
            delimiter.extend_from_slice(boundary.as_bytes());

            if bytes.len() < delimiter.len() {
                incomplete |= !eof && delimiter.starts_with(bytes);
                continue;
            }
            if !bytes.starts_with(&delimiter) {
                continue;
            }
            let mut rest = &bytes[delimiter.len()..];
            if rest == b"-" && !eof {
                incomplete = true;
                continue;
            }
            if rest.starts_with(b"--") {
                rest = &rest[2..];
            }
            let end = rest.iter().position(|&b| !is_blank(b)).unwrap_or(rest.len());
            match rest.get(end) {
                Some(b'\r' | b'\n') => return LineMatch::Match,
                Some(_) => {}
                None if eof => return LineMatch::Match,
                None => incomplete = true,
            }
        }
        if incomplete {
            LineMatch::Incomplete
        } else {
            LineMatch::NoMatch
        }
    }

    /// Find where the buffered body ends.
    ///
    /// A body ends at the line break preceding a boundary line; that line
    /// break belongs to the delimiter. `at_start` allows a boundary right at
    /// the start of an empty body.
    fn scan_body(&self, at_start: bool) -> Scan {
        let data = self.buffer.available();
        let eof = self.buffer.is_eof();

        let candidates = data
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == b'\n')
            .map(|(lf, _)| {
                let start = if lf > 0 && data[lf - 1] == b'\r' { lf - 1 } else { lf };
                (start, lf + 1)
            });
        let first = at_start.then_some((0, 0));

        for (start, line) in first.into_iter().chain(candidates) {
            match self.boundary_line_at(&data[line..], eof) {
                LineMatch::Match => return Scan::Found(start),
                LineMatch::Incomplete => return Scan::Partial(start),
                LineMatch::NoMatch => {}
            }
        }

        if eof {
            Scan::Found(data.len())
        } else if data.last() == Some(&b'\r') {
            Scan::Partial(data.len() - 1)
        } else {
            Scan::Partial(data.len())
        }
    }

    /// Copy body bytes up to the next boundary delimiter into `dst`.
    ///
    /// Returns the number of bytes copied and whether the delimiter was
    /// reached.
    pub(crate) fn read_with_delimiter(&mut self, dst: &mut [u8], at_start: &mut bool) -> Step<(usize, bool)> {
        let (body_len, found) = match self.scan_body(*at_start) {
            Scan::Found(end) => (end, true),
            Scan::Partial(safe) => (safe, false),
        };
        if body_len == 0 {
            return if found {
                Step::Ready((0, true))
            } else {
                Step::NeedMore
            };
        }
        let count = body_len.min(dst.len());
        dst[..count].copy_from_slice(&self.buffer.available()[..count]);
        self.buffer.consume(count);
        if count > 0 {
            *at_start = false;
        }
        Step::Ready((count, found && count == body_len))
    }

    /// Drop body bytes up to the next boundary delimiter.
    pub(crate) fn skip_with_delimiter(&mut self, at_start: &mut bool) -> Step<()> {
        loop {
            let (body_len, found) = match self.scan_body(*at_start) {
                Scan::Found(end) => (end, true),
                Scan::Partial(safe) => (safe, false),
            };
            if body_len > 0 {
                self.buffer.consume(body_len);
                *at_start = false;
            }
            if found {
                return Step::Ready(());
            }
            if body_len == 0 {
                return Step::NeedMore;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(bytes: &[u8]) -> BatchReaderStream {
        BatchReaderStream::new(BatchBuffer::from_bytes(bytes), "b1".to_string())
    }

    fn read_all_delimited(stream: &mut BatchReaderStream, chunk: usize) -> Vec<u8> {
        let mut body = Vec::new();
        let mut at_start = true;
        let mut dst = vec![0; chunk];
        loop {
            match stream.read_with_delimiter(&mut dst, &mut at_start) {
                Step::Ready((count, reached)) => {
                    body.extend_from_slice(&dst[..count]);
                    if reached {
                        return body;
                    }
                }
                Step::NeedMore => panic!("complete input never needs more"),
            }
        }
    }

    #[test]
    fn test_match_boundary() {
        let mut stream = stream(b"");
        stream.set_changeset_boundary(Some("c1".into()));

        let start = stream.match_boundary(b"--b1").unwrap();
        assert_eq!(start.kind, BoundaryKind::Batch);
        assert!(!start.is_end);

        let end = stream.match_boundary(b"--c1--  ").unwrap();
        assert_eq!(end.kind, BoundaryKind::Changeset);
        assert!(end.is_end);

        assert!(stream.match_boundary(b"--b10").is_none());
        assert!(stream.match_boundary(b"b1").is_none());
    }

    #[test]
    fn test_read_line_handles_lf_and_crlf() {
        let mut stream = stream(b"one\r\ntwo\nthree");
        assert_eq!(stream.read_line().unwrap(), Step::Ready(b"one".to_vec()));
        assert_eq!(stream.read_line().unwrap(), Step::Ready(b"two".to_vec()));
        assert_eq!(stream.read_line().unwrap(), Step::Ready(b"three".to_vec()));
        assert!(stream.read_line().is_err());
    }

    #[test]
    fn test_read_line_needs_more_without_eof() {
        let mut stream = BatchReaderStream::new(BatchBuffer::new(1024), "b1".into());
        assert_eq!(stream.read_line().unwrap(), Step::NeedMore);
    }

    #[test]
    fn test_delimited_body_stops_before_crlf() {
        let mut stream = stream(b"hello\r\nworld\r\n--b1\r\nnext");
        assert_eq!(read_all_delimited(&mut stream, 4), b"hello\r\nworld");
        assert_eq!(stream.read_line().unwrap(), Step::Ready(Vec::new()));
        assert_eq!(stream.read_line().unwrap(), Step::Ready(b"--b1".to_vec()));
    }

    #[test]
    fn test_delimited_body_ignores_boundary_prefixes() {
        let mut stream = stream(b"a\r\n--b10\r\nb --b1\r\n--b1--\r\n");
        assert_eq!(read_all_delimited(&mut stream, 64), b"a\r\n--b10\r\nb --b1");
    }

    #[test]
    fn test_empty_delimited_body() {
        let mut stream = stream(b"--b1--\r\n");
        assert_eq!(read_all_delimited(&mut stream, 8), b"");
    }

    #[test]
    fn test_partial_boundary_needs_more() {
        let mut stream = BatchReaderStream::new(BatchBuffer::new(1024), "b1".into());
        let mut input: &[u8] = b"body\r\n--b";
        stream.buffer.fill_from(&mut input).unwrap();

        let mut dst = [0u8; 16];
        let mut at_start = true;
        assert_eq!(
            stream.read_with_delimiter(&mut dst, &mut at_start),
            Step::Ready((4, false))
        );
        assert_eq!(&dst[..4], b"body");
        assert_eq!(stream.read_with_delimiter(&mut dst, &mut at_start), Step::NeedMore);
    }

    #[test]
    fn test_length_body_and_truncation() {
        let mut stream = stream(b"hello world");
        let mut dst = [0u8; 16];
        let mut remaining = 5;
        assert_eq!(
            stream.read_with_length(&mut dst, &mut remaining).unwrap(),
            Step::Ready(5)
        );
        assert_eq!(&dst[..5], b"hello");
        assert_eq!(
            stream.read_with_length(&mut dst, &mut remaining).unwrap(),
            Step::Ready(0)
        );

        let mut remaining = 100;
        assert!(stream.skip_bytes(&mut remaining).is_err());
    }

    #[test]
    fn test_skip_with_delimiter() {
        let mut stream = stream(b"\x00\xff binary\r\n--b1\r\n");
        let mut at_start = true;
        assert_eq!(stream.skip_with_delimiter(&mut at_start), Step::Ready(()));
        assert_eq!(stream.read_line().unwrap(), Step::Ready(Vec::new()));
    }
}
