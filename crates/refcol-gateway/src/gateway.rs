//! ReflectionGateway - Aggregates multiple reflection backends
//!
//! The gateway answers each reflection request by consulting its backends
//! in ascending name order. Symbol lookups go only to the backend whose
//! name prefixes the symbol, when one exists. A wildcard service listing
//! is merged across every backend that answers; any other request takes
//! the first successful answer.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use refcol_core::reflection::{
    self, ServerReflectionRequest, ServerReflectionResponse, ServiceResponse, NOT_FOUND,
    REFLECTION_SERVICE_NAME, REFLECTION_V1_SERVICE_NAME,
};
use refcol_core::{routing, BackendResult, ReflectionBackend};
use refcol_proxy::{Connector, ConnectorOptions};
use tracing::{debug, error, info, trace};

use crate::cache::ResponseCache;

/// Settings for building a gateway from configuration
#[derive(Debug, Clone, Default)]
pub struct GatewayOptions {
    /// Remember answers per request for the life of the process
    pub enable_cache: bool,
    /// Upper bound on cached requests, `None` for unbounded
    pub cache_max_entries: Option<usize>,
    /// Connection settings for every backend
    pub connector: ConnectorOptions,
}

/// Gateway that federates multiple reflection backends
///
/// The backend map and ignore set are fixed once the gateway is shared;
/// resolution is read-only apart from the cache and safe to run from many
/// sessions at once.
pub struct ReflectionGateway {
    /// Registered backends by name, iterated in ascending order
    backends: BTreeMap<String, Arc<dyn ReflectionBackend>>,
    /// Service names never reported in a merged listing
    ignores: HashSet<String>,
    cache: Option<ResponseCache>,
}

impl ReflectionGateway {
    /// Create an empty gateway that hides `ignores` from merged listings.
    ///
    /// The reflection service itself is always hidden.
    pub fn new<I, S>(ignores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ignores: HashSet<String> = ignores.into_iter().map(Into::into).collect();
        ignores.insert(REFLECTION_SERVICE_NAME.to_string());
        ignores.insert(REFLECTION_V1_SERVICE_NAME.to_string());

        Self {
            backends: BTreeMap::new(),
            ignores,
            cache: None,
        }
    }

    /// Enable response caching
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Connect to every `name -> address` pair and build a gateway over them.
    ///
    /// Backends on the same `host:port` share one connection. Any malformed
    /// address or failed connection aborts the whole build.
    pub async fn connect(
        services: &BTreeMap<String, String>,
        ignores: &[String],
        options: GatewayOptions,
    ) -> BackendResult<Self> {
        let mut gateway = Self::new(ignores.iter().cloned());
        if options.enable_cache {
            gateway = gateway.with_cache(ResponseCache::new(options.cache_max_entries));
        }

        let mut connector = Connector::new(options.connector);
        for (name, address) in services {
            let backend = connector.connect(name, address).await?;
            gateway.register_backend(name, Arc::new(backend));
        }

        info!(
            backends = gateway.backends.len(),
            connections = connector.connection_count(),
            cache = gateway.cache.is_some(),
            "Reflection gateway ready"
        );
        Ok(gateway)
    }

    /// Register a backend under `name`, returning any backend it replaces
    pub fn register_backend(
        &mut self,
        name: &str,
        backend: Arc<dyn ReflectionBackend>,
    ) -> Option<Arc<dyn ReflectionBackend>> {
        info!(backend = %name, target = %backend.describe(), "Registering backend with gateway");
        self.backends.insert(name.to_string(), backend)
    }

    /// Get a backend by name
    pub fn get_backend(&self, name: &str) -> Option<&Arc<dyn ReflectionBackend>> {
        self.backends.get(name)
    }

    /// All registered backend names in ascending order
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Hidden service names in ascending order
    pub fn ignores(&self) -> Vec<String> {
        let mut ignores: Vec<String> = self.ignores.iter().cloned().collect();
        ignores.sort();
        ignores
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Backends to consult for `request`, in consultation order.
    ///
    /// A symbol lookup is narrowed to the backends whose name prefixes the
    /// symbol; when none does, every backend is a candidate.
    pub fn candidates(
        &self,
        request: &ServerReflectionRequest,
    ) -> Vec<(&str, &Arc<dyn ReflectionBackend>)> {
        if let Some(symbol) = reflection::requested_symbol(request) {
            let owners = routing::symbol_owners(self.backends.keys().map(String::as_str), symbol);
            if !owners.is_empty() {
                return owners
                    .into_iter()
                    .filter_map(|name| self.backends.get_key_value(name))
                    .map(|(name, backend)| (name.as_str(), backend))
                    .collect();
            }
        }

        self.backends
            .iter()
            .map(|(name, backend)| (name.as_str(), backend))
            .collect()
    }

    /// Produce the answer for one client request.
    ///
    /// Returns `None` when no backend answered successfully. Backend failures
    /// are logged and skipped, never surfaced to the caller.
    pub async fn resolve(
        &self,
        request: &ServerReflectionRequest,
    ) -> Option<ServerReflectionResponse> {
        let Some(cache) = &self.cache else {
            return self.aggregate(request).await;
        };

        let key = reflection::cache_key(request);
        if let Some(outcome) = cache.get(&key) {
            trace!(request = ?request.message_request, "Served from cache");
            return outcome;
        }

        let outcome = self.aggregate(request).await;
        cache.insert(key, outcome.clone());
        outcome
    }

    async fn aggregate(
        &self,
        request: &ServerReflectionRequest,
    ) -> Option<ServerReflectionResponse> {
        let wildcard = reflection::is_wildcard_list(request);
        let mut merged = ServiceMerge::default();

        for (name, backend) in self.candidates(request) {
            let response = match backend.exchange(request).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    debug!(backend = %name, "Backend closed the stream without answering");
                    continue;
                }
                Err(e) => {
                    error!(
                        backend = %name,
                        request = ?request.message_request,
                        error = %e,
                        "Backend request failed"
                    );
                    continue;
                }
            };

            if let Some(err) = reflection::error_of(&response) {
                if err.error_code != NOT_FOUND {
                    error!(
                        backend = %name,
                        request = ?request.message_request,
                        code = err.error_code,
                        message = %err.error_message,
                        "Backend returned an error response"
                    );
                }
                continue;
            }

            if !wildcard {
                debug!(backend = %name, "Backend answered");
                return Some(response);
            }

            merged.extend(reflection::listed_services(&response), &self.ignores);
        }

        merged.into_response(request)
    }
}

/// Accumulator for a wildcard listing across backends
#[derive(Default)]
struct ServiceMerge {
    answered: bool,
    seen: HashSet<String>,
    services: Vec<ServiceResponse>,
}

impl ServiceMerge {
    fn extend(&mut self, services: &[ServiceResponse], ignores: &HashSet<String>) {
        self.answered = true;
        for service in services {
            if ignores.contains(&service.name) {
                continue;
            }
            if self.seen.insert(service.name.clone()) {
                self.services.push(service.clone());
            }
        }
    }

    fn into_response(mut self, request: &ServerReflectionRequest) -> Option<ServerReflectionResponse> {
        if !self.answered {
            return None;
        }
        // Sort for deterministic output regardless of backend answers
        self.services.sort_by(|a, b| a.name.cmp(&b.name));
        Some(reflection::list_services_response(request, self.services))
    }
}
