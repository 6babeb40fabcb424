//! Client facade.
//!
//! [`OpenAiClient`] owns the transports, the client-level defaults, the
//! optional endpoint pool, and the hook set. Each operation method resolves
//! credentials once, builds the route, and returns a typed
//! [`Requestor`](crate::requestor::Requestor); nothing touches the network
//! until a terminal method runs on that requestor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use crate::credentials::{
    ApiType, CallOptions, ClientConfig, EnvSource, ResolvedCall, join_url, request_path,
    resolve_call, resolve_engine,
};
use crate::endpoint::{Endpoint, EndpointPool};
use crate::error::DispatchError;
use crate::hooks::CallHooks;
use crate::requestor::{
    Bin, Chat, Completions, Dict, FilePart, Payload, RequestSpec, Requestor, form_text,
};
use crate::types::ChatMessage;

/// Azure api-versions where image generation is an asynchronous submit
/// operation polled through `operation-location`. Later versions route
/// through deployments like every other operation.
const AZURE_IMAGE_SUBMIT_VERSIONS: [&str; 5] = [
    "2023-06-01-preview",
    "2023-07-01-preview",
    "2023-08-01-preview",
    "2023-09-01-preview",
    "2023-10-01-preview",
];

/// Which transports the client constructs.
///
/// Modes that include the blocking transport (`Sync` and the default
/// `Both`) construct a `reqwest::blocking::Client`, which panics when
/// created inside an async runtime. Code running under tokio must build
/// with [`ClientMode::Async`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientMode {
    Sync,
    Async,
    #[default]
    Both,
}

/// Entry point for all API operations.
pub struct OpenAiClient {
    config: ClientConfig,
    env: EnvSource,
    pool: Option<Arc<EndpointPool>>,
    hooks: Option<Arc<dyn CallHooks>>,
    async_client: Option<reqwest::Client>,
    blocking_client: Option<reqwest::blocking::Client>,
    default_timeout: Option<Duration>,
}

impl OpenAiClient {
    /// A client with both transports and all defaults from the environment.
    ///
    /// Constructing both transports includes a blocking client, which must
    /// not be created inside an async runtime; from async code, use
    /// `builder().mode(ClientMode::Async)` instead.
    pub fn new() -> Result<Self, DispatchError> {
        Self::builder().build()
    }

    pub fn builder() -> OpenAiClientBuilder {
        OpenAiClientBuilder::default()
    }

    pub fn endpoint_pool(&self) -> Option<&Arc<EndpointPool>> {
        self.pool.as_ref()
    }

    fn resolve(&self, opts: &CallOptions) -> Result<ResolvedCall, DispatchError> {
        resolve_call(opts, &self.config, self.pool.as_deref(), &self.env)
    }

    fn build_requestor<K>(
        &self,
        resolved: ResolvedCall,
        method: Method,
        path: String,
        payload: Payload,
        query: Vec<(String, String)>,
        timeout: Option<Duration>,
        azure_poll: bool,
    ) -> Result<Requestor<K>, DispatchError> {
        if path.is_empty() {
            return Err(DispatchError::configuration("request route is empty"));
        }
        let url = join_url(&resolved.api_base, &[&path]);
        let mut spec = RequestSpec::new(method, url, resolved);
        spec.payload = payload;
        spec.query = query;
        spec.timeout = timeout.or(self.default_timeout);
        spec.azure_poll = azure_poll;
        Ok(Requestor::new(
            spec,
            self.async_client.clone(),
            self.blocking_client.clone(),
            self.hooks.clone(),
        ))
    }

    /// A POST routed through deployment resolution: on Azure the engine is
    /// taken from the explicit deployment or the `model` body parameter via
    /// the alias map.
    fn routed_post<K>(
        &self,
        route: &str,
        mut opts: CallOptions,
        keep_model: bool,
        files: Vec<FilePart>,
    ) -> Result<Requestor<K>, DispatchError> {
        let resolved = self.resolve(&opts)?;
        let mut body = std::mem::take(&mut opts.extra);
        let engine = resolve_engine(&resolved, opts.deployment.as_deref(), &mut body, keep_model);
        let path = request_path(route, &resolved, engine.as_deref())?;
        let payload = if files.is_empty() {
            Payload::Json(body)
        } else {
            Payload::Multipart {
                fields: body,
                files,
            }
        };
        self.build_requestor(resolved, Method::POST, path, payload, Vec::new(), opts.timeout, false)
    }

    /// An operation on a fixed route, bypassing deployment routing. Extra
    /// parameters become the JSON body for POSTs and query parameters
    /// otherwise.
    fn plain<K>(
        &self,
        method: Method,
        route: String,
        mut opts: CallOptions,
        files: Vec<FilePart>,
    ) -> Result<Requestor<K>, DispatchError> {
        let resolved = self.resolve(&opts)?;
        let body = std::mem::take(&mut opts.extra);
        let mut query = Vec::new();
        let payload = if !files.is_empty() {
            Payload::Multipart {
                fields: body,
                files,
            }
        } else if method == Method::POST {
            Payload::Json(body)
        } else {
            query = body.into_iter().map(|(k, v)| (k, form_text(&v))).collect();
            Payload::None
        };
        self.build_requestor(resolved, method, route, payload, query, opts.timeout, false)
    }

    pub fn chat(
        &self,
        messages: Vec<ChatMessage>,
        mut opts: CallOptions,
    ) -> Result<Requestor<Chat>, DispatchError> {
        let messages =
            serde_json::to_value(&messages).map_err(|e| DispatchError::Parse(e.to_string()))?;
        opts.extra.insert("messages".into(), messages);
        self.routed_post("/chat/completions", opts, false, Vec::new())
    }

    pub fn completions(
        &self,
        prompt: impl Into<Value>,
        mut opts: CallOptions,
    ) -> Result<Requestor<Completions>, DispatchError> {
        opts.extra.insert("prompt".into(), prompt.into());
        self.routed_post("/completions", opts, false, Vec::new())
    }

    pub fn embeddings(
        &self,
        input: impl Into<Value>,
        mut opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        opts.extra.insert("input".into(), input.into());
        self.routed_post("/embeddings", opts, false, Vec::new())
    }

    /// On Azure this lists deployments rather than models; the route follows
    /// the api type.
    pub fn models_list(&self, opts: CallOptions) -> Result<Requestor<Dict>, DispatchError> {
        let resolved = self.resolve(&opts)?;
        let path = request_path("/models", &resolved, opts.deployment.as_deref())?;
        self.build_requestor(
            resolved,
            Method::GET,
            path,
            Payload::None,
            Vec::new(),
            opts.timeout,
            false,
        )
    }

    pub fn models_retrieve(
        &self,
        model: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(Method::GET, format!("/models/{model}"), opts, Vec::new())
    }

    pub fn moderations(
        &self,
        input: impl Into<Value>,
        mut opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        opts.extra.insert("input".into(), input.into());
        self.plain(Method::POST, "/moderations".into(), opts, Vec::new())
    }

    /// On Azure with the preview DALL-E 2 api-versions the operation is an
    /// asynchronous submit whose result is polled through the
    /// `operation-location` header; everywhere else it is a plain routed
    /// POST.
    pub fn images_generations(
        &self,
        mut opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        let resolved = self.resolve(&opts)?;
        if resolved.api_type.is_azure() {
            let version = resolved.api_version.clone().ok_or_else(|| {
                DispatchError::configuration("api_version is required for Azure OpenAI API")
            })?;
            if AZURE_IMAGE_SUBMIT_VERSIONS.contains(&version.as_str()) {
                let body = std::mem::take(&mut opts.extra);
                let path = format!("/openai/images/generations:submit?api-version={version}");
                return self.build_requestor(
                    resolved,
                    Method::POST,
                    path,
                    Payload::Json(body),
                    Vec::new(),
                    opts.timeout,
                    true,
                );
            }
        }
        let mut body = std::mem::take(&mut opts.extra);
        let engine = resolve_engine(&resolved, opts.deployment.as_deref(), &mut body, false);
        let path = request_path("/images/generations", &resolved, engine.as_deref())?;
        self.build_requestor(
            resolved,
            Method::POST,
            path,
            Payload::Json(body),
            Vec::new(),
            opts.timeout,
            false,
        )
    }

    pub fn images_edits(
        &self,
        mut image: FilePart,
        mask: Option<FilePart>,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        image.field = "image".into();
        let mut files = vec![image];
        if let Some(mut mask) = mask {
            mask.field = "mask".into();
            files.push(mask);
        }
        self.plain(Method::POST, "/images/edits".into(), opts, files)
    }

    pub fn images_variations(
        &self,
        mut image: FilePart,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        image.field = "image".into();
        self.plain(Method::POST, "/images/variations".into(), opts, vec![image])
    }

    /// Speech synthesis returns raw audio bytes. The `model` parameter both
    /// picks the Azure deployment and stays in the body.
    pub fn audio_speech(&self, opts: CallOptions) -> Result<Requestor<Bin>, DispatchError> {
        self.routed_post("/audio/speech", opts, true, Vec::new())
    }

    pub fn audio_transcriptions(
        &self,
        mut file: FilePart,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        file.field = "file".into();
        self.routed_post("/audio/transcriptions", opts, false, vec![file])
    }

    pub fn audio_translations(
        &self,
        mut file: FilePart,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        file.field = "file".into();
        self.plain(Method::POST, "/audio/translations".into(), opts, vec![file])
    }

    pub fn files_list(&self, opts: CallOptions) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(Method::GET, "/files".into(), opts, Vec::new())
    }

    pub fn files_upload(
        &self,
        mut file: FilePart,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        file.field = "file".into();
        self.plain(Method::POST, "/files".into(), opts, vec![file])
    }

    pub fn files_delete(
        &self,
        file_id: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(Method::DELETE, format!("/files/{file_id}"), opts, Vec::new())
    }

    pub fn files_retrieve(
        &self,
        file_id: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(Method::GET, format!("/files/{file_id}"), opts, Vec::new())
    }

    pub fn files_retrieve_content(
        &self,
        file_id: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Bin>, DispatchError> {
        self.plain(
            Method::GET,
            format!("/files/{file_id}/content"),
            opts,
            Vec::new(),
        )
    }

    pub fn edits(
        &self,
        instruction: impl Into<Value>,
        mut opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        opts.extra.insert("instruction".into(), instruction.into());
        self.plain(Method::POST, "/edits".into(), opts, Vec::new())
    }

    pub fn finetunes_create(
        &self,
        training_file: &str,
        mut opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        opts.extra
            .insert("training_file".into(), Value::String(training_file.into()));
        self.plain(Method::POST, "/fine-tunes".into(), opts, Vec::new())
    }

    pub fn finetunes_list(&self, opts: CallOptions) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(Method::GET, "/fine-tunes".into(), opts, Vec::new())
    }

    pub fn finetunes_retrieve(
        &self,
        fine_tune_id: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(
            Method::GET,
            format!("/fine-tunes/{fine_tune_id}"),
            opts,
            Vec::new(),
        )
    }

    pub fn finetunes_cancel(
        &self,
        fine_tune_id: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(
            Method::POST,
            format!("/fine-tunes/{fine_tune_id}/cancel"),
            opts,
            Vec::new(),
        )
    }

    pub fn finetunes_list_events(
        &self,
        fine_tune_id: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(
            Method::GET,
            format!("/fine-tunes/{fine_tune_id}/events"),
            opts,
            Vec::new(),
        )
    }

    pub fn finetunes_delete_model(
        &self,
        model: &str,
        opts: CallOptions,
    ) -> Result<Requestor<Dict>, DispatchError> {
        self.plain(Method::DELETE, format!("/models/{model}"), opts, Vec::new())
    }
}

#[derive(Default)]
pub struct OpenAiClientBuilder {
    mode: ClientMode,
    config: ClientConfig,
    env: Option<EnvSource>,
    pool: Option<Arc<EndpointPool>>,
    hooks: Option<Arc<dyn CallHooks>>,
    default_timeout: Option<Duration>,
}

impl OpenAiClientBuilder {
    pub fn mode(mut self, mode: ClientMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.config.organization = Some(org.into());
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = Some(base.into());
        self
    }

    pub fn api_type(mut self, api_type: ApiType) -> Self {
        self.config.api_type = Some(api_type);
        self
    }

    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api_version = Some(version.into());
        self
    }

    pub fn model_engine_map(mut self, map: HashMap<String, String>) -> Self {
        self.config.model_engine_map = Some(map);
        self
    }

    pub fn endpoint_pool(mut self, pool: Arc<EndpointPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Shorthand for building a pool from a list of endpoints.
    pub fn endpoints(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.pool = Some(Arc::new(EndpointPool::from_endpoints(endpoints)));
        self
    }

    pub fn hooks(mut self, hooks: impl CallHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Replace the environment lookup, mainly for tests.
    pub fn env_source(mut self, env: EnvSource) -> Self {
        self.env = Some(env);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<OpenAiClient, DispatchError> {
        let async_client = match self.mode {
            ClientMode::Async | ClientMode::Both => Some(
                reqwest::Client::builder()
                    .build()
                    .map_err(|e| DispatchError::configuration(e.to_string()))?,
            ),
            ClientMode::Sync => None,
        };
        let blocking_client = match self.mode {
            ClientMode::Sync | ClientMode::Both => Some(
                reqwest::blocking::Client::builder()
                    .build()
                    .map_err(|e| DispatchError::configuration(e.to_string()))?,
            ),
            ClientMode::Async => None,
        };
        Ok(OpenAiClient {
            config: self.config,
            env: self.env.unwrap_or_default(),
            pool: self.pool,
            hooks: self.hooks,
            async_client,
            blocking_client,
            default_timeout: self.default_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn openai_client() -> OpenAiClient {
        OpenAiClient::builder()
            .mode(ClientMode::Async)
            .api_key("sk-test")
            .env_source(EnvSource::empty())
            .build()
            .expect("client")
    }

    fn azure_client() -> OpenAiClient {
        OpenAiClient::builder()
            .mode(ClientMode::Async)
            .api_key("azure-key")
            .api_base("https://res.openai.azure.com")
            .api_type(ApiType::Azure)
            .api_version("2024-02-01")
            .model_engine_map(HashMap::from([(
                "gpt-4".to_string(),
                "gpt4-deploy".to_string(),
            )]))
            .env_source(EnvSource::empty())
            .build()
            .expect("client")
    }

    #[test]
    fn chat_routes_to_the_default_base() {
        let client = openai_client();
        let requestor = client
            .chat(
                vec![ChatMessage::user("hi")],
                CallOptions::new().model("gpt-4"),
            )
            .expect("requestor");
        assert_eq!(
            requestor.url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn azure_chat_routes_through_the_mapped_deployment() {
        let client = azure_client();
        let requestor = client
            .chat(
                vec![ChatMessage::user("hi")],
                CallOptions::new().model("gpt-4"),
            )
            .expect("requestor");
        assert_eq!(
            requestor.url(),
            "https://res.openai.azure.com/openai/deployments/gpt4-deploy/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn azure_models_list_enumerates_deployments() {
        let client = azure_client();
        let requestor = client.models_list(CallOptions::new()).expect("requestor");
        assert_eq!(
            requestor.url(),
            "https://res.openai.azure.com/openai/deployments?api-version=2024-02-01"
        );
    }

    #[test]
    fn preview_azure_image_generation_uses_the_submit_route() {
        let client = OpenAiClient::builder()
            .mode(ClientMode::Async)
            .api_key("azure-key")
            .api_base("https://res.openai.azure.com")
            .api_type(ApiType::Azure)
            .api_version("2023-06-01-preview")
            .env_source(EnvSource::empty())
            .build()
            .expect("client");
        let requestor = client
            .images_generations(CallOptions::new().param("prompt", "a cat".into()))
            .expect("requestor");
        assert_eq!(
            requestor.url(),
            "https://res.openai.azure.com/openai/images/generations:submit?api-version=2023-06-01-preview"
        );
        assert!(requestor.spec.azure_poll);
    }

    #[test]
    fn current_azure_image_generation_routes_through_deployments() {
        let client = azure_client();
        let requestor = client
            .images_generations(CallOptions::new().model("dall-e-3"))
            .expect("requestor");
        assert_eq!(
            requestor.url(),
            "https://res.openai.azure.com/openai/deployments/dall-e-3/images/generations?api-version=2024-02-01"
        );
        assert!(!requestor.spec.azure_poll);
    }

    #[test]
    fn audio_speech_keeps_model_in_the_body() {
        let client = azure_client();
        let requestor = client
            .audio_speech(CallOptions::new().model("tts-1"))
            .expect("requestor");
        assert_eq!(
            requestor.url(),
            "https://res.openai.azure.com/openai/deployments/tts-1/audio/speech?api-version=2024-02-01"
        );
        match &requestor.spec.payload {
            Payload::Json(body) => {
                assert_eq!(body.get("model").and_then(|v| v.as_str()), Some("tts-1"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn get_extras_become_query_parameters() {
        let client = openai_client();
        let requestor = client
            .files_list(CallOptions::new().param("limit", 5.into()))
            .expect("requestor");
        assert_eq!(requestor.url(), "https://api.openai.com/v1/files");
        assert_eq!(
            requestor.spec.query,
            vec![("limit".to_string(), "5".to_string())]
        );
    }

    #[test]
    fn both_transports_build_outside_async_contexts() {
        // default mode; no runtime on this thread
        let client = OpenAiClient::builder()
            .api_key("sk-test")
            .env_source(EnvSource::empty())
            .build()
            .expect("client");
        assert!(client.async_client.is_some());
        assert!(client.blocking_client.is_some());
    }

    #[test]
    fn edits_posts_the_instruction_to_a_fixed_route() {
        let client = openai_client();
        let requestor = client
            .edits("fix the spelling", CallOptions::new().model("text-davinci-edit-001"))
            .expect("requestor");
        assert_eq!(requestor.url(), "https://api.openai.com/v1/edits");
        match &requestor.spec.payload {
            Payload::Json(body) => {
                assert_eq!(
                    body.get("instruction").and_then(|v| v.as_str()),
                    Some("fix the spelling")
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn finetunes_operations_hit_their_routes() {
        let client = openai_client();
        let create = client
            .finetunes_create("file-1", CallOptions::new())
            .expect("requestor");
        assert_eq!(create.url(), "https://api.openai.com/v1/fine-tunes");
        match &create.spec.payload {
            Payload::Json(body) => {
                assert_eq!(
                    body.get("training_file").and_then(|v| v.as_str()),
                    Some("file-1")
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let cancel = client
            .finetunes_cancel("ft-1", CallOptions::new())
            .expect("requestor");
        assert_eq!(cancel.url(), "https://api.openai.com/v1/fine-tunes/ft-1/cancel");
        assert_eq!(cancel.spec.method, Method::POST);

        let events = client
            .finetunes_list_events("ft-1", CallOptions::new())
            .expect("requestor");
        assert_eq!(
            events.url(),
            "https://api.openai.com/v1/fine-tunes/ft-1/events"
        );

        let delete = client
            .finetunes_delete_model("curie:ft-org", CallOptions::new())
            .expect("requestor");
        assert_eq!(delete.url(), "https://api.openai.com/v1/models/curie:ft-org");
        assert_eq!(delete.spec.method, Method::DELETE);
    }

    #[test]
    fn missing_key_fails_at_preparation_time() {
        let client = OpenAiClient::builder()
            .mode(ClientMode::Async)
            .env_source(EnvSource::empty())
            .build()
            .expect("client");
        let err = client
            .models_list(CallOptions::new())
            .expect_err("no credentials");
        assert!(err.is_configuration());
    }

    #[test]
    fn per_call_endpoint_overrides_client_defaults() {
        let client = openai_client();
        let endpoint = Endpoint::builder()
            .api_key("sk-other")
            .api_base("https://proxy.example/v1")
            .build();
        let requestor = client
            .models_list(CallOptions::new().endpoint(endpoint))
            .expect("requestor");
        assert_eq!(requestor.url(), "https://proxy.example/v1/models");
        assert_eq!(requestor.spec.resolved.api_key, "sk-other");
    }

    #[test]
    fn client_pool_rotates_across_calls() {
        let client = OpenAiClient::builder()
            .mode(ClientMode::Async)
            .endpoints(vec![
                Endpoint::builder().api_key("sk-a").build(),
                Endpoint::builder().api_key("sk-b").build(),
            ])
            .env_source(EnvSource::empty())
            .build()
            .expect("client");
        let first = client.models_list(CallOptions::new()).expect("requestor");
        let second = client.models_list(CallOptions::new()).expect("requestor");
        let third = client.models_list(CallOptions::new()).expect("requestor");
        assert_eq!(first.spec.resolved.api_key, "sk-a");
        assert_eq!(second.spec.resolved.api_key, "sk-b");
        assert_eq!(third.spec.resolved.api_key, "sk-a");
    }
}
