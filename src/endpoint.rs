//! Endpoints and round-robin rotation.
//!
//! An [`Endpoint`] bundles the credentials and routing configuration for one
//! backend deployment. An [`EndpointPool`] holds an ordered list of endpoints
//! and hands them out cyclically; the rotation cursor is the only piece of
//! state in this crate that is mutated under concurrency, so the lock covers
//! exactly the read-increment-wrap step and nothing else.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::credentials::ApiType;
use crate::error::DispatchError;

/// A named bundle of credentials and routing configuration.
///
/// Immutable once built; callers receive clones, never shared references
/// into the pool.
#[derive(Clone, Default)]
pub struct Endpoint {
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub api_base: Option<String>,
    pub api_type: Option<ApiType>,
    pub api_version: Option<String>,
    pub model_engine_map: HashMap<String, String>,
    pub dest_url: Option<String>,
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }
}

impl fmt::Debug for Endpoint {
    // never reveal the key
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Endpoint");
        if let Some(name) = &self.name {
            d.field("name", name);
        }
        if self.api_key.is_some() {
            d.field("api_key", &"*");
        }
        if let Some(org) = &self.organization {
            d.field("organization", org);
        }
        if let Some(base) = &self.api_base {
            d.field("api_base", base);
        }
        if let Some(t) = &self.api_type {
            d.field("api_type", t);
        }
        if let Some(v) = &self.api_version {
            d.field("api_version", v);
        }
        if !self.model_engine_map.is_empty() {
            d.field("model_engine_map", &self.model_engine_map);
        }
        if let Some(dest) = &self.dest_url {
            d.field("dest_url", dest);
        }
        d.finish()
    }
}

#[derive(Default)]
pub struct EndpointBuilder {
    endpoint: Endpoint,
}

impl EndpointBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.endpoint.name = Some(name.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.endpoint.api_key = Some(key.into());
        self
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.endpoint.organization = Some(org.into());
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.endpoint.api_base = Some(base.into());
        self
    }

    pub fn api_type(mut self, api_type: ApiType) -> Self {
        self.endpoint.api_type = Some(api_type);
        self
    }

    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.endpoint.api_version = Some(version.into());
        self
    }

    pub fn model_engine_map(mut self, map: HashMap<String, String>) -> Self {
        self.endpoint.model_engine_map = map;
        self
    }

    pub fn map_model(mut self, model: impl Into<String>, engine: impl Into<String>) -> Self {
        self.endpoint
            .model_engine_map
            .insert(model.into(), engine.into());
        self
    }

    pub fn dest_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint.dest_url = Some(url.into());
        self
    }

    pub fn build(self) -> Endpoint {
        self.endpoint
    }
}

/// An ordered collection of endpoints with a round-robin cursor.
///
/// `next_endpoint` visits every endpoint in insertion order before wrapping.
pub struct EndpointPool {
    endpoints: Mutex<PoolState>,
}

struct PoolState {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(PoolState {
                endpoints: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: Mutex::new(PoolState {
                endpoints: endpoints.into_iter().collect(),
                cursor: 0,
            }),
        }
    }

    /// Return the endpoint under the cursor and advance it, wrapping after
    /// the last index. Errors when the pool is empty.
    pub fn next_endpoint(&self) -> Result<Endpoint, DispatchError> {
        let mut state = self.lock();
        if state.endpoints.is_empty() {
            return Err(DispatchError::configuration("no endpoint available"));
        }
        let endpoint = state.endpoints[state.cursor].clone();
        if state.cursor == state.endpoints.len() - 1 {
            state.cursor = 0;
        } else {
            state.cursor += 1;
        }
        Ok(endpoint)
    }

    pub fn push(&self, endpoint: Endpoint) {
        self.lock().endpoints.push(endpoint);
    }

    pub fn insert(&self, index: usize, endpoint: Endpoint) {
        let mut state = self.lock();
        state.endpoints.insert(index, endpoint);
    }

    pub fn remove(&self, index: usize) -> Endpoint {
        let mut state = self.lock();
        if index < state.cursor {
            state.cursor -= 1;
        }
        let removed = state.endpoints.remove(index);
        if state.cursor >= state.endpoints.len() {
            state.cursor = 0;
        }
        removed
    }

    pub fn replace(&self, index: usize, endpoint: Endpoint) {
        self.lock().endpoints[index] = endpoint;
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.endpoints.clear();
        state.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Endpoint> {
        self.lock().endpoints.get(index).cloned()
    }

    /// Snapshot of the current endpoints, in order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock().endpoints.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // a poisoned cursor lock cannot corrupt anything beyond the cursor
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Endpoint> for EndpointPool {
    fn from_iter<T: IntoIterator<Item = Endpoint>>(iter: T) -> Self {
        Self::from_endpoints(iter)
    }
}
