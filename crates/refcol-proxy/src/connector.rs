//! Connector - builds backend channels, sharing physical connections.
//!
//! One `tonic` channel is opened per distinct `(host:port, secure)` pair and
//! held for the life of the process. Logical backends on the same endpoint
//! reuse it, each with its own path prefix.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use refcol_core::{BackendError, BackendResult, TargetDescriptor};
use rustls::ClientConfig;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::prefix::PathPrefix;
use crate::proxy::ReflectionProxyBackend;
use crate::tls;

/// Connection settings shared by every backend
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Bound on establishing a physical connection
    pub connect_timeout: Duration,
    /// Bound on a single backend exchange, `None` for no bound
    pub call_timeout: Option<Duration>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Factory for `ReflectionProxyBackend`s with a connection pool
pub struct Connector {
    options: ConnectorOptions,
    channels: HashMap<(String, bool), Channel>,
    tls_config: Option<Arc<ClientConfig>>,
}

impl Connector {
    /// Create a connector with no open connections
    pub fn new(options: ConnectorOptions) -> Self {
        Self {
            options,
            channels: HashMap::new(),
            tls_config: None,
        }
    }

    /// Number of physical connections opened so far
    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }

    /// Parse `address` and produce a backend registered as `name`.
    ///
    /// Fails if the address is malformed or the connection cannot be
    /// established within the connect timeout.
    pub async fn connect(
        &mut self,
        name: &str,
        address: &str,
    ) -> BackendResult<ReflectionProxyBackend> {
        let target = TargetDescriptor::parse(address)?;
        let channel = self.channel(&target).await?;

        info!(
            backend = %name,
            target = %target,
            secure = target.secure,
            prefixed = target.has_path_prefix(),
            prefix = %target.api_path_prefix,
            "Reflection backend connected"
        );

        let channel = PathPrefix::new(channel, target.api_path_prefix.as_str());
        Ok(ReflectionProxyBackend::new(
            name,
            target,
            channel,
            self.options.call_timeout,
        ))
    }

    /// Pooled channel for the physical endpoint of `target`
    async fn channel(&mut self, target: &TargetDescriptor) -> BackendResult<Channel> {
        let key = target.connection_key();
        if let Some(channel) = self.channels.get(&key) {
            debug!(target = %target, "Reusing existing connection");
            return Ok(channel.clone());
        }

        let channel = self.open(target).await?;
        self.channels.insert(key, channel.clone());
        Ok(channel)
    }

    async fn open(&mut self, target: &TargetDescriptor) -> BackendResult<Channel> {
        let authority = target.authority();
        let endpoint = Endpoint::from_shared(format!("http://{}", authority))
            .map_err(|e| BackendError::InvalidAddress {
                address: target.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.options.connect_timeout);

        let connect_err = |e: tonic::transport::Error| BackendError::Connect {
            target: authority.clone(),
            reason: error_chain(&e),
        };

        if !target.secure {
            return endpoint.connect().await.map_err(connect_err);
        }

        let config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                let config = tls::insecure_client_config()?;
                self.tls_config = Some(config.clone());
                config
            }
        };
        let server_name = tls::server_name(target.server_name())?;
        let dial_authority = authority.clone();

        let connector = tower::service_fn(move |_uri: http::Uri| {
            tls::connect_tls(config.clone(), dial_authority.clone(), server_name.clone())
        });

        endpoint
            .connect_with_connector(connector)
            .await
            .map_err(connect_err)
    }
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
