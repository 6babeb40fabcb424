//! Credential resolution and route construction.
//!
//! Every call resolves its effective credentials through a fixed precedence
//! chain, field by field: an explicitly supplied [`Endpoint`] wins, then one
//! rotation step from an [`EndpointPool`], then per-call overrides, then the
//! client defaults, then environment variables, then built-in defaults. The
//! pool is consumed exactly once per call whenever one is configured, even
//! when a higher-precedence source overrides every resolved field.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, EndpointPool};
use crate::error::DispatchError;

/// Default base URL when nothing else supplies one.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Backend routing scheme: direct bearer-token access or an Azure deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    #[serde(rename = "openai")]
    OpenAi,
    Azure,
    AzureAd,
}

impl ApiType {
    /// Azure variants route through named deployments and authenticate with
    /// the `api-key` header instead of a bearer token.
    pub fn is_azure(self) -> bool {
        matches!(self, Self::Azure | Self::AzureAd)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::AzureAd => "azure_ad",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "azure_ad" | "azuread" => Ok(Self::AzureAd),
            other => Err(DispatchError::configuration(format!(
                "unknown api type: {other:?}"
            ))),
        }
    }
}

/// Where environment lookups come from. Injectable so the resolution chain
/// can be tested without touching process state.
pub struct EnvSource {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvSource {
    /// Read from the actual process environment.
    pub fn process() -> Self {
        Self {
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// An environment that defines nothing.
    pub fn empty() -> Self {
        Self {
            lookup: Box::new(|_| None),
        }
    }

    pub fn from_fn(f: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(f),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::process()
    }
}

/// Client-level defaults, resolved once at construction and never mutated.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub api_base: Option<String>,
    pub api_type: Option<ApiType>,
    pub api_version: Option<String>,
    pub model_engine_map: Option<HashMap<String, String>>,
}

/// Per-call overrides and request parameters.
///
/// `extra` carries the JSON body parameters of the operation (`model`,
/// `temperature`, ...); everything else overrides credential resolution for
/// this call only.
#[derive(Default, Clone)]
pub struct CallOptions {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub api_base: Option<String>,
    pub api_type: Option<ApiType>,
    pub api_version: Option<String>,
    pub model_engine_map: Option<HashMap<String, String>>,
    /// Explicit deployment id (Azure) or engine name; bypasses the alias map.
    pub deployment: Option<String>,
    pub dest_url: Option<String>,
    /// Highest-precedence credential source for this call.
    pub endpoint: Option<Endpoint>,
    /// Pool consulted for this call instead of the client's pool.
    pub endpoint_pool: Option<Arc<EndpointPool>>,
    pub timeout: Option<Duration>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.extra
            .insert("model".into(), serde_json::Value::String(model.into()));
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn endpoint_pool(mut self, pool: Arc<EndpointPool>) -> Self {
        self.endpoint_pool = Some(pool);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Insert one extra JSON body parameter.
    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// The effective credentials of one call. Created fresh per dispatch and
/// discarded when the call completes.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub api_key: String,
    pub organization: Option<String>,
    pub api_base: String,
    pub api_type: ApiType,
    pub api_version: Option<String>,
    pub model_engine_map: HashMap<String, String>,
    pub dest_url: Option<String>,
}

/// Run the precedence chain for one call.
///
/// `pool` is the client-level pool; a per-call pool in `opts` replaces it.
/// Whichever pool applies is rotated exactly once, before any override is
/// considered, so rotation progress is never undone.
pub fn resolve_call(
    opts: &CallOptions,
    defaults: &ClientConfig,
    pool: Option<&EndpointPool>,
    env: &EnvSource,
) -> Result<ResolvedCall, DispatchError> {
    let rotated = match (opts.endpoint_pool.as_deref(), pool) {
        (Some(per_call), _) => Some(per_call.next_endpoint()?),
        (None, Some(shared)) => Some(shared.next_endpoint()?),
        (None, None) => None,
    };
    let explicit = opts.endpoint.as_ref();

    let pick = |from_endpoint: fn(&Endpoint) -> Option<String>,
                from_opts: Option<&String>,
                from_defaults: Option<&String>|
     -> Option<String> {
        explicit
            .and_then(from_endpoint)
            .or_else(|| rotated.as_ref().and_then(from_endpoint))
            .or_else(|| from_opts.cloned())
            .or_else(|| from_defaults.cloned())
    };

    let api_key = pick(
        |ep| ep.api_key.clone(),
        opts.api_key.as_ref(),
        defaults.api_key.as_ref(),
    )
    .or_else(|| env.get("OPENAI_API_KEY"))
    .ok_or_else(|| DispatchError::configuration("API key is not set"))?;

    let organization = pick(
        |ep| ep.organization.clone(),
        opts.organization.as_ref(),
        defaults.organization.as_ref(),
    )
    .or_else(|| env.get("OPENAI_ORGANIZATION"))
    .or_else(|| env.get("OPENAI_ORG_ID"));

    let api_base = pick(
        |ep| ep.api_base.clone(),
        opts.api_base.as_ref(),
        defaults.api_base.as_ref(),
    )
    .or_else(|| env.get("OPENAI_API_BASE"))
    .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

    let api_type = explicit
        .and_then(|ep| ep.api_type)
        .or_else(|| rotated.as_ref().and_then(|ep| ep.api_type))
        .or(opts.api_type)
        .or(defaults.api_type)
        .map(Ok)
        .or_else(|| env.get("OPENAI_API_TYPE").map(|s| s.parse()))
        .transpose()?
        .unwrap_or(ApiType::OpenAi);

    let api_version = pick(
        |ep| ep.api_version.clone(),
        opts.api_version.as_ref(),
        defaults.api_version.as_ref(),
    )
    .or_else(|| env.get("OPENAI_API_VERSION"));

    let model_engine_map = explicit
        .map(|ep| ep.model_engine_map.clone())
        .filter(|m| !m.is_empty())
        .or_else(|| {
            rotated
                .as_ref()
                .map(|ep| ep.model_engine_map.clone())
                .filter(|m| !m.is_empty())
        })
        .or_else(|| opts.model_engine_map.clone())
        .or_else(|| defaults.model_engine_map.clone())
        .or_else(|| {
            // a malformed env map is ignored, not fatal
            env.get("MODEL_ENGINE_MAP")
                .and_then(|json| serde_json::from_str(&json).ok())
        })
        .unwrap_or_default();

    let dest_url = explicit
        .and_then(|ep| ep.dest_url.clone())
        .or_else(|| rotated.as_ref().and_then(|ep| ep.dest_url.clone()))
        .or_else(|| opts.dest_url.clone());

    Ok(ResolvedCall {
        api_key,
        organization,
        api_base,
        api_type,
        api_version,
        model_engine_map,
        dest_url,
    })
}

/// Resolve the deployment id (engine) for an Azure-routed call.
///
/// An explicit deployment wins. Otherwise the `model` body parameter is
/// consulted through the alias map, falling back to the model name verbatim;
/// the `model` key is consumed from the body unless `keep_model` is set
/// (some operations need both). Non-Azure calls only ever use an explicit
/// deployment.
pub fn resolve_engine(
    resolved: &ResolvedCall,
    explicit: Option<&str>,
    body: &mut serde_json::Map<String, serde_json::Value>,
    keep_model: bool,
) -> Option<String> {
    if let Some(engine) = explicit {
        return Some(engine.to_string());
    }
    if !resolved.api_type.is_azure() {
        return None;
    }
    let model = if keep_model {
        body.get("model")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    } else {
        match body.remove("model") {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => {
                body.insert("model".into(), other);
                None
            }
            None => None,
        }
    };
    model.map(|m| {
        resolved
            .model_engine_map
            .get(&m)
            .cloned()
            .unwrap_or(m)
    })
}

/// Build the route suffix for an operation, applying deployment routing.
pub fn request_path(
    path: &str,
    resolved: &ResolvedCall,
    engine: Option<&str>,
) -> Result<String, DispatchError> {
    if resolved.api_type.is_azure() {
        let version = resolved.api_version.as_deref().ok_or_else(|| {
            DispatchError::configuration("api_version is required for Azure OpenAI API")
        })?;
        match engine {
            Some(engine) => Ok(format!(
                "/openai/deployments/{}{}?api-version={}",
                urlencoding::encode(engine),
                path,
                version
            )),
            None => Ok(format!("/openai/deployments?api-version={version}")),
        }
    } else {
        match engine {
            Some(engine) => Ok(format!("/engines/{}{}", urlencoding::encode(engine), path)),
            None => Ok(path.to_string()),
        }
    }
}

/// Join a base URL and route suffixes without doubling slashes.
pub fn join_url(base: &str, parts: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in parts {
        url.push('/');
        url.push_str(part.trim_start_matches('/'));
    }
    url
}
