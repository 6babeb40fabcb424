//! Blocking dispatch.
//!
//! Every terminal method on [`Requestor`](crate::requestor::Requestor) has a
//! `_blocking` counterpart here, sharing the prepared request, header
//! construction, error classification, and aggregation with the async path.
//! Only the transport and the suspension points differ: blocking calls run
//! on `reqwest::blocking` and sleep with `std::thread::sleep`.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::aggregate::{ChatAggregator, CompletionsAggregator, DeltaAggregate};
use crate::error::DispatchError;
use crate::hooks::{CallHooks, CallOutcome, HookState};
use crate::requestor::{Bin, Chat, Completions, Dict, Payload, RequestSpec, Requestor};
use crate::sse::JsonEventIter;
use crate::types::{ChatResponse, CompletionsResponse};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(300);

/// Default read size for blocking byte streams.
const DEFAULT_CHUNK_SIZE: usize = 1024;

impl RequestSpec {
    fn apply_blocking(
        &self,
        client: &reqwest::blocking::Client,
    ) -> Result<reqwest::blocking::RequestBuilder, DispatchError> {
        let mut builder = client
            .request(self.method.clone(), &self.url)
            .headers(self.headers()?);
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        match &self.payload {
            Payload::None => {}
            Payload::Json(body) => builder = builder.json(body),
            Payload::Multipart { fields, files } => {
                let mut form = reqwest::blocking::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key.clone(), crate::requestor::form_text(value));
                }
                for file in files {
                    form = form.part(
                        file.field.clone(),
                        reqwest::blocking::multipart::Part::bytes(file.bytes.clone())
                            .file_name(file.filename.clone()),
                    );
                }
                builder = builder.multipart(form);
            }
        }
        Ok(builder)
    }
}

impl<K> Requestor<K> {
    fn blocking_client(&self) -> Result<&reqwest::blocking::Client, DispatchError> {
        self.blocking_client
            .as_ref()
            .ok_or_else(|| DispatchError::configuration("sync client is not set"))
    }

    fn send_blocking(&self) -> Result<reqwest::blocking::Response, DispatchError> {
        let client = self.blocking_client()?;
        self.spec.log_request();
        let response = self.spec.apply_blocking(client)?.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DispatchError::api_error(
                status.as_u16(),
                self.spec.url.clone(),
                &body,
            ));
        }
        Ok(response)
    }

    fn fetch_json_blocking_inner(&mut self) -> Result<Value, DispatchError> {
        self.spec.set_stream(false);
        let response = self.send_blocking()?;
        let poll_url = if self.spec.azure_poll {
            response
                .headers()
                .get("operation-location")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        } else {
            None
        };
        match poll_url {
            Some(url) => self.poll_blocking(&url),
            None => Ok(response.json::<Value>()?),
        }
    }

    fn poll_blocking(&self, poll_url: &str) -> Result<Value, DispatchError> {
        let client = self.blocking_client()?;
        let deadline = Instant::now() + self.spec.timeout.unwrap_or(DEFAULT_POLL_DEADLINE);
        loop {
            let response = client
                .get(poll_url)
                .header("api-key", self.spec.resolved.api_key.as_str())
                .send()?;
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(DispatchError::api_error(status.as_u16(), poll_url, &body));
            }
            let value: Value = response.json()?;
            match value.get("status").and_then(|s| s.as_str()) {
                Some("succeeded") => {
                    return Ok(value.get("result").cloned().unwrap_or(value));
                }
                Some("failed") | Some("canceled") => {
                    return Err(DispatchError::api_error(
                        status.as_u16(),
                        poll_url,
                        &value.to_string(),
                    ));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::Timeout(
                    "image operation did not finish before the deadline".into(),
                ));
            }
            std::thread::sleep(Duration::from_secs(
                retry_after.unwrap_or(DEFAULT_POLL_INTERVAL.as_secs()),
            ));
        }
    }

    fn run_json_blocking<T: DeserializeOwned>(&mut self) -> Result<T, DispatchError> {
        let state = self.prepare_hooks();
        let result = match self.fetch_json_blocking_inner() {
            Ok(value) => match serde_json::from_value::<T>(value.clone()) {
                Ok(typed) => Ok((value, typed)),
                Err(err) => Err(DispatchError::Parse(format!(
                    "unexpected response shape: {err}"
                ))),
            },
            Err(err) => Err(err),
        };
        match result {
            Ok((value, typed)) => {
                self.fire_response(CallOutcome::Json(&value), state.as_ref());
                Ok(typed)
            }
            Err(err) => {
                self.fire_exception(&err, state.as_ref());
                Err(err)
            }
        }
    }

    fn run_stream_blocking<A: DeltaAggregate>(&mut self) -> Result<EventIter<A>, DispatchError> {
        self.spec.set_stream(true);
        let state = self.prepare_hooks();
        match self.send_blocking() {
            Ok(response) => Ok(EventIter::new(
                JsonEventIter::new(BufReader::new(response)),
                self.hooks.clone(),
                state,
            )),
            Err(err) => {
                self.fire_exception(&err, state.as_ref());
                Err(err)
            }
        }
    }

    /// Blocking counterpart of [`fetch_raw`](Requestor::fetch_raw).
    pub fn fetch_raw_blocking(&mut self) -> Result<reqwest::blocking::Response, DispatchError> {
        let state = self.prepare_hooks();
        if self.spec.stream_requested() {
            let err = DispatchError::configuration(
                "cannot return the raw response for a streaming call",
            );
            self.fire_exception(&err, state.as_ref());
            return Err(err);
        }
        match self.send_blocking() {
            Ok(response) => {
                self.fire_response(
                    CallOutcome::Raw {
                        status: response.status().as_u16(),
                    },
                    state.as_ref(),
                );
                Ok(response)
            }
            Err(err) => {
                self.fire_exception(&err, state.as_ref());
                Err(err)
            }
        }
    }
}

impl Requestor<Chat> {
    pub fn fetch_blocking(&mut self) -> Result<ChatResponse, DispatchError> {
        self.run_json_blocking()
    }

    pub fn stream_blocking(&mut self) -> Result<ChatIter, DispatchError> {
        self.run_stream_blocking()
    }
}

impl Requestor<Completions> {
    pub fn fetch_blocking(&mut self) -> Result<CompletionsResponse, DispatchError> {
        self.run_json_blocking()
    }

    pub fn stream_blocking(&mut self) -> Result<CompletionsIter, DispatchError> {
        self.run_stream_blocking()
    }
}

impl Requestor<Dict> {
    pub fn fetch_blocking(&mut self) -> Result<Value, DispatchError> {
        self.run_json_blocking()
    }
}

impl Requestor<Bin> {
    pub fn fetch_blocking(&mut self) -> Result<Bytes, DispatchError> {
        self.spec.set_stream(false);
        let state = self.prepare_hooks();
        let result = match self.send_blocking() {
            Ok(response) => response.bytes().map_err(DispatchError::from),
            Err(err) => Err(err),
        };
        match result {
            Ok(bytes) => {
                self.fire_response(CallOutcome::Binary(&bytes), state.as_ref());
                Ok(bytes)
            }
            Err(err) => {
                self.fire_exception(&err, state.as_ref());
                Err(err)
            }
        }
    }

    pub fn stream_blocking(&mut self) -> Result<ByteIter, DispatchError> {
        self.spec.set_stream(true);
        let state = self.prepare_hooks();
        match self.send_blocking() {
            Ok(response) => Ok(ByteIter {
                inner: Some(response),
                chunk_size: DEFAULT_CHUNK_SIZE,
                total: 0,
                hooks: self.hooks.clone(),
                state,
            }),
            Err(err) => {
                self.fire_exception(&err, state.as_ref());
                Err(err)
            }
        }
    }
}

pub type ChatIter = EventIter<ChatAggregator>;
pub type CompletionsIter = EventIter<CompletionsAggregator>;

/// Blocking counterpart of [`EventStream`](crate::requestor::EventStream):
/// an iterator of decoded chunks folding every chunk into an aggregate, with
/// the same exactly-once finalize contract.
pub struct EventIter<A: DeltaAggregate, R = BufReader<reqwest::blocking::Response>> {
    inner: Option<JsonEventIter<R>>,
    aggregator: Option<A>,
    output: Option<A::Output>,
    hooks: Option<Arc<dyn CallHooks>>,
    state: Option<HookState>,
}

impl<A: DeltaAggregate, R: BufRead> EventIter<A, R> {
    pub(crate) fn new(
        inner: JsonEventIter<R>,
        hooks: Option<Arc<dyn CallHooks>>,
        state: Option<HookState>,
    ) -> Self {
        Self {
            inner: Some(inner),
            aggregator: Some(A::default()),
            output: None,
            hooks,
            state,
        }
    }

    fn finalize(&mut self) {
        self.inner = None;
        if let Some(aggregator) = self.aggregator.take() {
            let output = aggregator.finish();
            if let Some(hooks) = self.hooks.take() {
                hooks.on_response(A::outcome(&output), self.state.as_ref());
            }
            self.output = Some(output);
        }
    }

    fn fail(&mut self, error: &DispatchError) {
        self.inner = None;
        self.aggregator = None;
        if let Some(hooks) = self.hooks.take() {
            hooks.on_exception(error, self.state.as_ref());
        }
    }

    /// Stop consuming and finalize with whatever has arrived so far.
    pub fn close(&mut self) {
        if self.aggregator.is_some() {
            self.finalize();
        } else {
            self.inner = None;
        }
    }

    /// The folded result, available once the iterator has ended or been
    /// closed.
    pub fn aggregate(&self) -> Option<&A::Output> {
        self.output.as_ref()
    }

    pub fn into_aggregate(mut self) -> Option<A::Output> {
        self.output.take()
    }

    /// Drain the remaining chunks and return the folded result.
    pub fn finish(mut self) -> Result<A::Output, DispatchError> {
        for item in &mut self {
            item?;
        }
        self.output
            .take()
            .ok_or_else(|| DispatchError::Stream("stream ended without a result".into()))
    }
}

impl<A: DeltaAggregate, R: BufRead> Iterator for EventIter<A, R> {
    type Item = Result<A::Chunk, DispatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let inner = self.inner.as_mut()?;
            match inner.next() {
                None => {
                    self.finalize();
                    return None;
                }
                Some(Ok(value)) => match serde_json::from_value::<A::Chunk>(value) {
                    Ok(chunk) => {
                        if let Some(aggregator) = &mut self.aggregator {
                            aggregator.push(&chunk);
                        }
                        return Some(Ok(chunk));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping unrecognized stream event");
                        continue;
                    }
                },
                Some(Err(err)) => {
                    self.fail(&err);
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Blocking byte stream read in fixed-size chunks.
pub struct ByteIter {
    inner: Option<reqwest::blocking::Response>,
    chunk_size: usize,
    total: usize,
    hooks: Option<Arc<dyn CallHooks>>,
    state: Option<HookState>,
}

impl ByteIter {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn finalize(&mut self) {
        self.inner = None;
        if let Some(hooks) = self.hooks.take() {
            hooks.on_response(
                CallOutcome::ByteStream {
                    total_bytes: self.total,
                },
                self.state.as_ref(),
            );
        }
    }

    /// Stop consuming and drop the connection.
    pub fn close(&mut self) {
        if self.inner.is_some() {
            self.finalize();
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }
}

impl Iterator for ByteIter {
    type Item = Result<Bytes, DispatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.inner.as_mut()?;
        let mut buf = vec![0u8; self.chunk_size];
        match reader.read(&mut buf) {
            Ok(0) => {
                self.finalize();
                None
            }
            Ok(n) => {
                buf.truncate(n);
                self.total += n;
                Some(Ok(Bytes::from(buf)))
            }
            Err(err) => {
                let err = DispatchError::Stream(err.to_string());
                self.inner = None;
                if let Some(hooks) = self.hooks.take() {
                    hooks.on_exception(&err, self.state.as_ref());
                }
                Some(Err(err))
            }
        }
    }
}
