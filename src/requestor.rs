//! Request dispatch.
//!
//! A [`Requestor`] is a fully prepared call: credentials resolved, route
//! built, body assembled. Nothing touches the network until one of the
//! terminal methods runs. The marker type parameter fixes what the response
//! is folded into; [`ChatRequestor`] and [`CompletionsRequestor`] support
//! streaming with delta aggregation, [`DictRequestor`] returns parsed JSON,
//! and [`BinRequestor`] returns or streams raw bytes.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::aggregate::{ChatAggregator, CompletionsAggregator, DeltaAggregate};
use crate::credentials::ResolvedCall;
use crate::error::DispatchError;
use crate::hooks::{CallHooks, CallOutcome, HookState};
use crate::sse::{JsonEventStream, decode_event_stream};
use crate::types::{ChatResponse, CompletionsResponse};

/// Interval between poll probes when the server does not send `Retry-After`.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Overall budget for an asynchronous image operation when no per-call
/// timeout is set.
const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(300);

/// One form-data file attachment.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl FilePart {
    pub fn new(
        field: impl Into<String>,
        filename: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            field: field.into(),
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    None,
    Json(serde_json::Map<String, Value>),
    Multipart {
        fields: serde_json::Map<String, Value>,
        files: Vec<FilePart>,
    },
}

/// Everything needed to issue one HTTP request, transport-agnostic.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    pub(crate) method: reqwest::Method,
    pub(crate) url: String,
    pub(crate) resolved: ResolvedCall,
    pub(crate) payload: Payload,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) azure_poll: bool,
}

impl RequestSpec {
    pub(crate) fn new(method: reqwest::Method, url: String, resolved: ResolvedCall) -> Self {
        Self {
            method,
            url,
            resolved,
            payload: Payload::None,
            query: Vec::new(),
            timeout: None,
            azure_poll: false,
        }
    }

    /// Force the stream flag on or off, wherever it lives for this request
    /// shape: the JSON body or form fields for POSTs, the query string
    /// otherwise.
    pub(crate) fn set_stream(&mut self, on: bool) {
        match &mut self.payload {
            Payload::Json(body) => {
                if on {
                    body.insert("stream".into(), Value::Bool(true));
                } else {
                    body.remove("stream");
                }
            }
            Payload::Multipart { fields, .. } => {
                if on {
                    fields.insert("stream".into(), Value::Bool(true));
                } else {
                    fields.remove("stream");
                }
            }
            Payload::None => {
                self.query.retain(|(k, _)| k != "stream");
                if on {
                    self.query.push(("stream".into(), "true".into()));
                }
            }
        }
    }

    pub(crate) fn stream_requested(&self) -> bool {
        let flag = match &self.payload {
            Payload::Json(body) => body.get("stream"),
            Payload::Multipart { fields, .. } => fields.get("stream"),
            Payload::None => {
                return self.query.iter().any(|(k, v)| k == "stream" && v == "true");
            }
        };
        matches!(flag, Some(Value::Bool(true)))
    }

    pub(crate) fn headers(&self) -> Result<HeaderMap, DispatchError> {
        let mut headers = HeaderMap::new();
        if self.resolved.api_type.is_azure() {
            headers.insert("api-key", header_value(&self.resolved.api_key)?);
        } else {
            headers.insert(
                AUTHORIZATION,
                header_value(&format!("Bearer {}", self.resolved.api_key))?,
            );
        }
        if let Some(org) = &self.resolved.organization {
            headers.insert("OpenAI-Organization", header_value(org)?);
        }
        if let Some(dest) = &self.resolved.dest_url {
            headers.insert("Destination-URL", header_value(dest)?);
        }
        Ok(headers)
    }

    fn apply_async(&self, client: &reqwest::Client) -> Result<reqwest::RequestBuilder, DispatchError> {
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
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key.clone(), form_text(value));
                }
                for file in files {
                    form = form.part(
                        file.field.clone(),
                        reqwest::multipart::Part::bytes(file.bytes.clone())
                            .file_name(file.filename.clone()),
                    );
                }
                builder = builder.multipart(form);
            }
        }
        Ok(builder)
    }

    pub(crate) fn log_request(&self) {
        tracing::debug!(
            url = %self.url,
            method = %self.method,
            api_type = %self.resolved.api_type,
            api_key = %mask_key(&self.resolved.api_key),
            timeout = ?self.timeout,
            "dispatching API request"
        );
    }
}

/// Multipart form values travel as text; JSON scalars are rendered without
/// quoting, everything else verbatim.
pub(crate) fn form_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn header_value(text: &str) -> Result<HeaderValue, DispatchError> {
    HeaderValue::from_str(text)
        .map_err(|_| DispatchError::configuration("header value contains invalid characters"))
}

/// First eight characters visible, the rest starred out. Keys too short to
/// have a safe prefix are starred out entirely.
pub(crate) fn mask_key(key: &str) -> String {
    let len = key.chars().count();
    if len <= 8 {
        return "*".repeat(len);
    }
    let shown: String = key.chars().take(8).collect();
    format!("{shown}{}", "*".repeat(len - 8))
}

/// Marker for chat-completion calls.
pub struct Chat;
/// Marker for text-completion calls.
pub struct Completions;
/// Marker for calls that return plain JSON.
pub struct Dict;
/// Marker for calls that return raw bytes.
pub struct Bin;

pub type ChatRequestor = Requestor<Chat>;
pub type CompletionsRequestor = Requestor<Completions>;
pub type DictRequestor = Requestor<Dict>;
pub type BinRequestor = Requestor<Bin>;

/// A prepared call awaiting dispatch.
pub struct Requestor<K> {
    pub(crate) spec: RequestSpec,
    pub(crate) async_client: Option<reqwest::Client>,
    pub(crate) blocking_client: Option<reqwest::blocking::Client>,
    pub(crate) hooks: Option<Arc<dyn CallHooks>>,
    pub(crate) _kind: PhantomData<K>,
}

impl<K> std::fmt::Debug for Requestor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requestor")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<K> Requestor<K> {
    pub(crate) fn new(
        spec: RequestSpec,
        async_client: Option<reqwest::Client>,
        blocking_client: Option<reqwest::blocking::Client>,
        hooks: Option<Arc<dyn CallHooks>>,
    ) -> Self {
        Self {
            spec,
            async_client,
            blocking_client,
            hooks,
            _kind: PhantomData,
        }
    }

    /// The fully built request URL, before query parameters.
    pub fn url(&self) -> &str {
        &self.spec.url
    }

    fn async_client(&self) -> Result<&reqwest::Client, DispatchError> {
        self.async_client
            .as_ref()
            .ok_or_else(|| DispatchError::configuration("async client is not set"))
    }

    pub(crate) fn prepare_hooks(&self) -> Option<HookState> {
        self.hooks.as_ref().and_then(|h| h.on_prepare())
    }

    pub(crate) fn fire_response(&self, outcome: CallOutcome<'_>, state: Option<&HookState>) {
        if let Some(hooks) = &self.hooks {
            hooks.on_response(outcome, state);
        }
    }

    pub(crate) fn fire_exception(&self, error: &DispatchError, state: Option<&HookState>) {
        if let Some(hooks) = &self.hooks {
            hooks.on_exception(error, state);
        }
    }

    /// Send the request and fail on a non-2xx status, extracting the error
    /// message from the response body.
    async fn send_async(&self) -> Result<reqwest::Response, DispatchError> {
        let client = self.async_client()?;
        self.spec.log_request();
        let response = self.spec.apply_async(client)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::api_error(
                status.as_u16(),
                self.spec.url.clone(),
                &body,
            ));
        }
        Ok(response)
    }

    async fn fetch_json_inner(&mut self) -> Result<Value, DispatchError> {
        self.spec.set_stream(false);
        let response = self.send_async().await?;
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
            Some(url) => self.poll_async(&url).await,
            None => Ok(response.json::<Value>().await?),
        }
    }

    /// Probe an Azure `operation-location` URL until the operation settles,
    /// honoring `Retry-After` between probes.
    async fn poll_async(&self, poll_url: &str) -> Result<Value, DispatchError> {
        let client = self.async_client()?;
        let deadline = Instant::now() + self.spec.timeout.unwrap_or(DEFAULT_POLL_DEADLINE);
        loop {
            let response = client
                .get(poll_url)
                .header("api-key", header_value(&self.spec.resolved.api_key)?)
                .send()
                .await?;
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DispatchError::api_error(status.as_u16(), poll_url, &body));
            }
            let value: Value = response.json().await?;
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
            tokio::time::sleep(Duration::from_secs(retry_after.unwrap_or(
                DEFAULT_POLL_INTERVAL.as_secs(),
            )))
            .await;
        }
    }

    async fn run_json<T: DeserializeOwned>(&mut self) -> Result<T, DispatchError> {
        let state = self.prepare_hooks();
        let result = match self.fetch_json_inner().await {
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

    async fn run_stream<A: DeltaAggregate>(&mut self) -> Result<EventStream<A>, DispatchError> {
        self.spec.set_stream(true);
        let state = self.prepare_hooks();
        match self.send_async().await {
            Ok(response) => Ok(EventStream::new(
                decode_event_stream(response.bytes_stream()),
                self.hooks.clone(),
                state,
            )),
            Err(err) => {
                self.fire_exception(&err, state.as_ref());
                Err(err)
            }
        }
    }

    /// Issue the request and hand back the transport response untouched.
    /// Incompatible with stream mode; the conflict fails before any I/O.
    pub async fn fetch_raw(&mut self) -> Result<reqwest::Response, DispatchError> {
        let state = self.prepare_hooks();
        if self.spec.stream_requested() {
            let err = DispatchError::configuration(
                "cannot return the raw response for a streaming call",
            );
            self.fire_exception(&err, state.as_ref());
            return Err(err);
        }
        match self.send_async().await {
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
    pub async fn fetch(&mut self) -> Result<ChatResponse, DispatchError> {
        self.run_json().await
    }

    pub async fn stream(&mut self) -> Result<ChatStream, DispatchError> {
        self.run_stream().await
    }
}

impl Requestor<Completions> {
    pub async fn fetch(&mut self) -> Result<CompletionsResponse, DispatchError> {
        self.run_json().await
    }

    pub async fn stream(&mut self) -> Result<CompletionsStream, DispatchError> {
        self.run_stream().await
    }
}

impl Requestor<Dict> {
    pub async fn fetch(&mut self) -> Result<Value, DispatchError> {
        self.run_json().await
    }
}

impl Requestor<Bin> {
    pub async fn fetch(&mut self) -> Result<Bytes, DispatchError> {
        self.spec.set_stream(false);
        let state = self.prepare_hooks();
        let result = match self.send_async().await {
            Ok(response) => response.bytes().await.map_err(DispatchError::from),
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

    pub async fn stream(&mut self) -> Result<ByteStream, DispatchError> {
        self.spec.set_stream(true);
        let state = self.prepare_hooks();
        match self.send_async().await {
            Ok(response) => Ok(ByteStream {
                inner: Some(Box::pin(response.bytes_stream())),
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

pub type ChatStream = EventStream<ChatAggregator>;
pub type CompletionsStream = EventStream<CompletionsAggregator>;

/// A lazy stream of decoded chunks with an aggregator folding every chunk
/// back together as it passes through.
///
/// The response hook fires exactly once, when the stream is fully consumed
/// or explicitly closed; a transport error fires the exception hook instead
/// and no further items are produced.
pub struct EventStream<A: DeltaAggregate> {
    inner: Option<JsonEventStream>,
    aggregator: Option<A>,
    output: Option<A::Output>,
    hooks: Option<Arc<dyn CallHooks>>,
    state: Option<HookState>,
}

impl<A: DeltaAggregate> EventStream<A> {
    pub(crate) fn new(
        inner: JsonEventStream,
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

    /// Stop consuming and finalize with whatever has arrived so far. The
    /// connection is dropped; the response hook fires with the partial
    /// aggregate.
    pub fn close(&mut self) {
        if self.aggregator.is_some() {
            self.finalize();
        } else {
            self.inner = None;
        }
    }

    /// The folded result, available once the stream has ended or been closed.
    pub fn aggregate(&self) -> Option<&A::Output> {
        self.output.as_ref()
    }

    pub fn into_aggregate(mut self) -> Option<A::Output> {
        self.output.take()
    }

    /// Drain the remaining chunks and return the folded result.
    pub async fn finish(mut self) -> Result<A::Output, DispatchError> {
        while let Some(item) = self.next().await {
            item?;
        }
        self.output
            .take()
            .ok_or_else(|| DispatchError::Stream("stream ended without a result".into()))
    }
}

impl<A: DeltaAggregate> Stream for EventStream<A> {
    type Item = Result<A::Chunk, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.finalize();
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(value))) => match serde_json::from_value::<A::Chunk>(value) {
                    Ok(chunk) => {
                        if let Some(aggregator) = &mut this.aggregator {
                            aggregator.push(&chunk);
                        }
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping unrecognized stream event");
                        continue;
                    }
                },
                Poll::Ready(Some(Err(err))) => {
                    this.fail(&err);
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

/// A lazy stream of raw byte chunks. The response hook fires with the total
/// byte count once the stream is drained or closed.
pub struct ByteStream {
    inner: Option<Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>>,
    total: usize,
    hooks: Option<Arc<dyn CallHooks>>,
    state: Option<HookState>,
}

impl ByteStream {
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

    /// Bytes seen so far.
    pub fn total_bytes(&self) -> usize {
        self.total
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(chunk))) => {
                this.total += chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let err = DispatchError::from(err);
                this.inner = None;
                if let Some(hooks) = this.hooks.take() {
                    hooks.on_exception(&err, this.state.as_ref());
                }
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ApiType;
    use crate::types::ChatChunk;
    use futures_util::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn resolved(api_type: ApiType) -> ResolvedCall {
        ResolvedCall {
            api_key: "sk-0123456789abcdef".into(),
            organization: None,
            api_base: "https://api.openai.com/v1".into(),
            api_type,
            api_version: None,
            model_engine_map: HashMap::new(),
            dest_url: None,
        }
    }

    fn spec(api_type: ApiType) -> RequestSpec {
        RequestSpec::new(
            reqwest::Method::POST,
            "https://api.openai.com/v1/chat/completions".into(),
            resolved(api_type),
        )
    }

    #[test]
    fn key_is_masked_after_eight_characters() {
        assert_eq!(mask_key("sk-0123456789"), "sk-01234*****");
    }

    #[test]
    fn short_keys_are_fully_masked() {
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key("12345678"), "********");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn bearer_header_for_openai_api_key_header_for_azure() {
        let open = spec(ApiType::OpenAi).headers().expect("headers");
        assert!(
            open.get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .expect("auth")
                .starts_with("Bearer sk-")
        );
        assert!(open.get("api-key").is_none());

        let azure = spec(ApiType::Azure).headers().expect("headers");
        assert!(azure.get("api-key").is_some());
        assert!(azure.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn organization_and_dest_url_headers_only_when_present() {
        let mut s = spec(ApiType::OpenAi);
        assert!(s.headers().expect("headers").get("OpenAI-Organization").is_none());
        s.resolved.organization = Some("org-1".into());
        s.resolved.dest_url = Some("https://audit.example".into());
        let headers = s.headers().expect("headers");
        assert_eq!(
            headers.get("OpenAI-Organization").and_then(|v| v.to_str().ok()),
            Some("org-1")
        );
        assert_eq!(
            headers.get("Destination-URL").and_then(|v| v.to_str().ok()),
            Some("https://audit.example")
        );
    }

    #[test]
    fn stream_flag_lands_in_the_body_for_json_posts() {
        let mut s = spec(ApiType::OpenAi);
        s.payload = Payload::Json(serde_json::Map::new());
        s.set_stream(true);
        assert!(s.stream_requested());
        s.set_stream(false);
        assert!(!s.stream_requested());
    }

    #[test]
    fn stream_flag_lands_in_the_query_for_bodyless_requests() {
        let mut s = spec(ApiType::OpenAi);
        s.method = reqwest::Method::GET;
        s.set_stream(true);
        assert!(s.query.iter().any(|(k, v)| k == "stream" && v == "true"));
        s.set_stream(true);
        // setting twice must not duplicate the parameter
        assert_eq!(s.query.iter().filter(|(k, _)| k == "stream").count(), 1);
    }

    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl CallHooks for Recording {
        fn on_prepare(&self) -> Option<HookState> {
            self.events.lock().unwrap().push("prepare".into());
            Some(Box::new(()))
        }

        fn on_response(&self, outcome: CallOutcome<'_>, _state: Option<&HookState>) {
            let label = match outcome {
                CallOutcome::ChatStream(agg) => {
                    format!("response:{}", agg.content.as_deref().unwrap_or(""))
                }
                _ => "response".into(),
            };
            self.events.lock().unwrap().push(label);
        }

        fn on_exception(&self, _error: &DispatchError, _state: Option<&HookState>) {
            self.events.lock().unwrap().push("exception".into());
        }
    }

    fn chunk_events(payloads: &[&str]) -> JsonEventStream {
        let items: Vec<Result<Value, DispatchError>> = payloads
            .iter()
            .map(|p| Ok(serde_json::from_str(p).expect("json")))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn event_stream_finalizes_once_on_full_consumption() {
        let hooks = Recording::new();
        let events = chunk_events(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
        ]);
        let mut stream: ChatStream =
            EventStream::new(events, Some(hooks.clone() as Arc<dyn CallHooks>), None);
        let mut count = 0;
        while let Some(item) = stream.next().await {
            item.expect("chunk");
            count += 1;
        }
        assert_eq!(count, 2);
        let aggregate = stream.aggregate().expect("aggregate");
        assert_eq!(aggregate.content.as_deref(), Some("Hello"));
        assert_eq!(hooks.seen(), vec!["response:Hello"]);
        // draining an exhausted stream never re-fires the hook
        assert!(stream.next().await.is_none());
        assert_eq!(hooks.seen().len(), 1);
    }

    #[tokio::test]
    async fn closing_early_finalizes_with_the_partial_aggregate() {
        let hooks = Recording::new();
        let events = chunk_events(&[
            r#"{"choices":[{"index":0,"delta":{"content":"partial"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":" rest"}}]}"#,
        ]);
        let mut stream: ChatStream =
            EventStream::new(events, Some(hooks.clone() as Arc<dyn CallHooks>), None);
        let first: ChatChunk = stream.next().await.expect("item").expect("chunk");
        assert_eq!(
            first.choices[0].delta.content.as_deref(),
            Some("partial")
        );
        stream.close();
        assert_eq!(hooks.seen(), vec!["response:partial"]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn transport_error_fires_the_exception_hook_instead() {
        let hooks = Recording::new();
        let items: Vec<Result<Value, DispatchError>> = vec![
            Ok(serde_json::json!({"choices":[{"index":0,"delta":{"content":"x"}}]})),
            Err(DispatchError::Stream("connection reset".into())),
        ];
        let mut stream: ChatStream = EventStream::new(
            Box::pin(stream::iter(items)),
            Some(hooks.clone() as Arc<dyn CallHooks>),
            None,
        );
        assert!(stream.next().await.expect("item").is_ok());
        assert!(stream.next().await.expect("item").is_err());
        assert_eq!(hooks.seen(), vec!["exception"]);
        // closing after a failure must not fire the response hook
        stream.close();
        assert_eq!(hooks.seen(), vec!["exception"]);
    }

    #[tokio::test]
    async fn finish_drains_and_returns_the_aggregate() {
        let events = chunk_events(&[
            r#"{"choices":[{"index":0,"delta":{"content":"a"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"b"},"finish_reason":"stop"}]}"#,
            r#"{"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#,
        ]);
        let stream: ChatStream = EventStream::new(events, None, None);
        let aggregate = stream.finish().await.expect("aggregate");
        assert_eq!(aggregate.content.as_deref(), Some("ab"));
        assert_eq!(aggregate.finish_reason.as_deref(), Some("stop"));
        assert_eq!(aggregate.usage.expect("usage").total_tokens, Some(3));
    }

    #[tokio::test]
    async fn raw_conflicts_with_stream_before_any_io() {
        let mut s = spec(ApiType::OpenAi);
        s.payload = Payload::Json(serde_json::Map::new());
        s.set_stream(true);
        let mut requestor: DictRequestor = Requestor::new(s, None, None, None);
        let err = requestor.fetch_raw().await.expect_err("conflict");
        assert!(err.is_configuration());
    }
}
