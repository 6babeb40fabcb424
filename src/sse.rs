//! Server-sent event decoding.
//!
//! Servers stream responses as `data: <json>` lines terminated by a line
//! that is exactly `data: [DONE]`. Blank lines are keep-alives, anything
//! else is protocol noise and is ignored; a payload that fails to parse as
//! JSON is skipped with a warning rather than aborting the stream. Decoding
//! is forward-only and single-pass: restarting means issuing a new request.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use std::io::BufRead;
use std::pin::Pin;

use crate::error::DispatchError;

/// The payload marking a clean end of stream.
pub const DONE_MARKER: &str = "[DONE]";

const DATA_PREFIX: &str = "data: ";

/// What one decoded `data` payload means to the consumer.
#[derive(Debug)]
pub(crate) enum Frame {
    Event(serde_json::Value),
    Done,
    Skip,
}

/// Interpret one SSE `data` payload: the termination sentinel ends the
/// stream, valid JSON is an event, everything else is skipped.
pub(crate) fn interpret_data(data: &str) -> Frame {
    let data = data.trim();
    if data.is_empty() {
        return Frame::Skip;
    }
    if data == DONE_MARKER {
        return Frame::Done;
    }
    match serde_json::from_str(data) {
        Ok(value) => Frame::Event(value),
        Err(err) => {
            tracing::warn!(error = %err, "skipping malformed stream fragment");
            Frame::Skip
        }
    }
}

/// Interpret one raw protocol line (blocking path). Lines without the
/// `data: ` prefix are comments or unknown fields and are ignored.
pub(crate) fn interpret_line(line: &str) -> Frame {
    if line.trim().is_empty() {
        return Frame::Skip;
    }
    if line.trim() == "data: [DONE]" {
        return Frame::Done;
    }
    match line.strip_prefix(DATA_PREFIX) {
        Some(payload) => interpret_data(payload),
        None => Frame::Skip,
    }
}

pub(crate) type JsonEventStream =
    Pin<Box<dyn Stream<Item = Result<serde_json::Value, DispatchError>> + Send>>;

/// Turn a raw byte stream into a lazy sequence of decoded JSON events,
/// ending cleanly at the termination sentinel.
pub(crate) fn decode_event_stream<S, E>(bytes: S) -> JsonEventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let out = async_stream::stream! {
        let mut events = std::pin::pin!(bytes.eventsource());
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => match interpret_data(&event.data) {
                    Frame::Event(value) => yield Ok(value),
                    Frame::Done => return,
                    Frame::Skip => continue,
                },
                Err(err) => {
                    yield Err(DispatchError::Stream(err.to_string()));
                    return;
                }
            }
        }
    };
    Box::pin(out)
}

/// Blocking counterpart of [`decode_event_stream`], reading protocol lines
/// from any `BufRead` source.
pub(crate) struct JsonEventIter<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> JsonEventIter<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for JsonEventIter<R> {
    type Item = Result<serde_json::Value, DispatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => match interpret_line(&line) {
                    Frame::Event(value) => return Some(Ok(value)),
                    Frame::Done => {
                        self.done = true;
                        return None;
                    }
                    Frame::Skip => continue,
                },
                Err(err) => {
                    self.done = true;
                    return Some(Err(DispatchError::Stream(err.to_string())));
                }
            }
        }
    }
}
