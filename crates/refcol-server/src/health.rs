//! Health reporting for the gateway identity.
//!
//! One service name, `grpc.health.v1.<name>`, is reported through the
//! standard health protocol. It starts as not serving, flips to serving once
//! the main endpoint is up and back to not serving on shutdown.

use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::debug;

/// Handle for flipping the reported status of the gateway
#[derive(Clone)]
pub struct HealthState {
    reporter: HealthReporter,
    service: String,
}

impl HealthState {
    pub fn new(reporter: HealthReporter, name: &str) -> Self {
        Self {
            reporter,
            service: Self::service_name(name),
        }
    }

    /// Health service name reported for a gateway called `name`
    pub fn service_name(name: &str) -> String {
        format!("grpc.health.v1.{}", name)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn set_serving(&self) {
        self.set(ServingStatus::Serving).await;
    }

    pub async fn set_not_serving(&self) {
        self.set(ServingStatus::NotServing).await;
    }

    async fn set(&self, status: ServingStatus) {
        debug!(service = %self.service, status = ?status, "Health status changed");
        self.reporter
            .set_service_status(&self.service, status)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_is_namespaced() {
        assert_eq!(
            HealthState::service_name("reflection"),
            "grpc.health.v1.reflection"
        );
    }

    #[tokio::test]
    async fn state_uses_derived_name() {
        let (reporter, _service) = tonic_health::server::health_reporter();
        let health = HealthState::new(reporter, "gw");
        assert_eq!(health.service(), "grpc.health.v1.gw");
        health.set_not_serving().await;
        health.set_serving().await;
    }
}
