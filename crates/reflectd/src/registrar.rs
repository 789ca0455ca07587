//! Wires the reflection gateway into the main endpoint

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use refcol_gateway::{GatewayOptions, ReflectionGateway, ReflectionService};
use refcol_server::{CloseHook, Lifetime, RoutesBuilder, ServiceRegistrar};
use tower::BoxError;
use tracing::info;

use crate::config::GatewayConfig;
use crate::status::GatewaySlot;

/// Connects every configured backend and registers the reflection service
pub struct GatewayRegistrar {
    services: BTreeMap<String, String>,
    ignores: Vec<String>,
    options: GatewayOptions,
    slot: GatewaySlot,
}

impl GatewayRegistrar {
    pub fn new(config: &GatewayConfig, slot: GatewaySlot) -> Self {
        Self {
            services: config.services.clone(),
            ignores: config.ignores.clone(),
            options: config.gateway_options(),
            slot,
        }
    }
}

#[async_trait]
impl ServiceRegistrar for GatewayRegistrar {
    async fn register(
        &self,
        lifetime: &Lifetime,
        routes: &mut RoutesBuilder,
    ) -> Result<Option<CloseHook>, BoxError> {
        let gateway =
            ReflectionGateway::connect(&self.services, &self.ignores, self.options.clone()).await?;
        let gateway = Arc::new(gateway);
        let _ = self.slot.set(gateway.clone());

        routes.add_service(ReflectionService::new(gateway, lifetime.clone()).into_server());

        let backends = self.services.len();
        Ok(Some(Box::new(move || {
            info!(backends, "Reflection service closed");
        })))
    }
}
