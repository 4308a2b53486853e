//! JSON batch parser.
//!
//! A JSON batch is one document, so it is buffered to the end before the
//! first item is reported. Items are then replayed one by one; a run of
//! consecutive items sharing an `atomicityGroup` forms a changeset.

use super::stream::Step;
use super::{BodyCursor, PendingOperation, ReaderContext, ReaderState, StartLine};
use crate::buffer::BatchBuffer;
use crate::error::{BatchError, Result};
use crate::message::MessageKind;
use crate::writer::json::{JsonBatchDocument, JsonBatchItem, decode_body, headers_from_json};
use http::{Method, StatusCode};
use std::collections::VecDeque;

pub(crate) struct JsonReplay {
    pub(crate) buffer: BatchBuffer,
    items: Option<VecDeque<JsonBatchItem>>,
    used_groups: Vec<String>,
}

impl JsonReplay {
    pub(crate) fn new(buffer: BatchBuffer) -> Self {
        Self {
            buffer,
            items: None,
            used_groups: Vec::new(),
        }
    }

    /// Parse the buffered document once the whole payload has arrived.
    fn load(&mut self, kind: MessageKind) -> Result<Step<()>> {
        if self.items.is_some() {
            return Ok(Step::Ready(()));
        }
        if !self.buffer.is_eof() {
            return Ok(Step::NeedMore);
        }

        let document: JsonBatchDocument = serde_json::from_slice(self.buffer.available())?;
        let len = self.buffer.available().len();
        self.buffer.consume(len);

        let items = match kind {
            MessageKind::Request => document.requests,
            MessageKind::Response => document.responses,
        };
        let items = items.ok_or_else(|| {
            BatchError::malformed(format!(
                "JSON batch has no '{}' array",
                match kind {
                    MessageKind::Request => "requests",
                    MessageKind::Response => "responses",
                }
            ))
        })?;
        self.items = Some(items.into());
        Ok(Step::Ready(()))
    }

    pub(crate) fn advance(&mut self, ctx: &mut ReaderContext) -> Result<Step<()>> {
        if let Step::NeedMore = self.load(ctx.kind())? {
            return Ok(Step::NeedMore);
        }
        if ctx.state() == ReaderState::ChangesetEnd {
            ctx.leave_changeset();
        }

        let Some(items) = self.items.as_mut() else {
            return Ok(Step::NeedMore);
        };
        let current = ctx.group().map(str::to_string);
        let next = items.front().map(|item| item.atomicity_group.clone());
        match (current, next) {
            (None, None) => ctx.set_state(ReaderState::Completed),
            (Some(_), None) => ctx.set_state(ReaderState::ChangesetEnd),
            (Some(current), Some(next)) if next.as_deref() != Some(current.as_str()) => {
                ctx.set_state(ReaderState::ChangesetEnd)
            }
            (None, Some(Some(group))) => {
                if self.used_groups.contains(&group) {
                    return Err(BatchError::malformed(format!(
                        "items of atomicity group '{group}' are not adjacent"
                    )));
                }
                self.used_groups.push(group.clone());
                ctx.enter_changeset(group)?;
            }
            _ => {
                if let Some(item) = items.pop_front() {
                    replay_item(ctx, item)?;
                }
            }
        }
        Ok(Step::Ready(()))
    }
}

fn replay_item(ctx: &mut ReaderContext, item: JsonBatchItem) -> Result<()> {
    ctx.count_operation()?;
    let line = match ctx.kind() {
        MessageKind::Request => {
            let method = item
                .method
                .as_deref()
                .ok_or_else(|| BatchError::malformed("JSON batch request without a method"))?;
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| BatchError::malformed(format!("invalid HTTP method '{method}'")))?;
            ctx.validate_method(&method)?;
            let raw_url = item
                .url
                .ok_or_else(|| BatchError::malformed("JSON batch request without a url"))?;
            StartLine::Request { method, raw_url }
        }
        MessageKind::Response => {
            let status = item
                .status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| BatchError::malformed("JSON batch response without a valid status"))?;
            StartLine::Response { status }
        }
    };

    let headers = headers_from_json(&item.headers)?;
    let body = match &item.body {
        Some(body) => BodyCursor::Buffered(decode_body(headers.content_type()?, body)?),
        None => BodyCursor::None,
    };
    ctx.enter_operation(
        PendingOperation {
            line,
            headers,
            content_id: item.id,
        },
        body,
    );
    Ok(())
}
