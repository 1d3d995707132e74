//! Bounded readiness polling.
//!
//! Provisioned services take a while to come up: the load balancer has to be
//! assigned and the nginx pods have to pass their readiness probes. This module
//! polls with a fixed attempt budget and a fixed sleep between attempts.

use crate::cluster::KubeCluster;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::Api;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

/// Readiness errors.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("{description} not satisfied after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        description: String,
        attempts: u32,
        last_error: String,
    },
}

/// Fixed-interval retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_retries: u32,
    /// Sleep between consecutive attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Budget for a freshly provisioned service: 12 attempts, 5s apart.
    pub const SERVICE_READY: RetryPolicy = RetryPolicy {
        max_retries: 12,
        interval: Duration::from_secs(5),
    };

    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn total_wait(&self) -> Duration {
        self.interval * self.max_retries.saturating_sub(1)
    }
}

/// Call `op` until it succeeds or the policy's attempts run out.
///
/// Sleeps `policy.interval` between attempts, never after the last one. The
/// error from the final attempt is kept in the returned error.
pub async fn retry_with_policy<F, Fut, T>(
    description: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, ReadinessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=policy.max_retries {
        match op().await {
            Ok(value) => {
                debug!(description, attempt, "Condition satisfied");
                return Ok(value);
            }
            Err(e) => {
                info!(
                    description,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "Condition not yet satisfied"
                );
                last_error = e;
            }
        }

        if attempt < policy.max_retries {
            sleep(policy.interval).await;
        }
    }

    Err(ReadinessError::RetriesExhausted {
        description: description.to_string(),
        attempts: policy.max_retries,
        last_error,
    })
}

/// Waits for a service to accept traffic.
#[async_trait]
pub trait ReadinessWaiter: Send + Sync {
    async fn wait_until_available(
        &self,
        name: &str,
        max_retries: u32,
        interval: Duration,
    ) -> Result<(), ReadinessError>;
}

/// Check the service object itself.
///
/// Only `LoadBalancer` services need anything beyond existing: they must have
/// at least one ingress point assigned.
pub fn service_availability(service: &Service) -> Result<(), String> {
    let service_type = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP");

    if service_type != "LoadBalancer" {
        return Ok(());
    }

    let has_ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty());

    if has_ingress {
        Ok(())
    } else {
        Err("load balancer has no ingress yet".to_string())
    }
}

/// Check that at least one ready pod backs the service.
pub fn endpoints_availability(endpoints: &Endpoints) -> Result<(), String> {
    let ready = endpoints
        .subsets
        .iter()
        .flatten()
        .filter_map(|subset| subset.addresses.as_ref())
        .map(Vec::len)
        .sum::<usize>();

    if ready > 0 {
        Ok(())
    } else {
        Err("service has no ready endpoints".to_string())
    }
}

impl KubeCluster {
    async fn check_service_available(&self, name: &str) -> Result<(), String> {
        let service = self
            .services()
            .get_opt(name)
            .await
            .map_err(|e| format!("service lookup failed: {}", e))?
            .ok_or_else(|| format!("service '{}' not found", name))?;

        service_availability(&service)?;

        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
        let endpoints = endpoints
            .get_opt(name)
            .await
            .map_err(|e| format!("endpoints lookup failed: {}", e))?
            .ok_or_else(|| format!("endpoints for '{}' not found", name))?;

        endpoints_availability(&endpoints)
    }
}

#[async_trait]
impl ReadinessWaiter for KubeCluster {
    async fn wait_until_available(
        &self,
        name: &str,
        max_retries: u32,
        interval: Duration,
    ) -> Result<(), ReadinessError> {
        let description = format!("service {}/{} available", self.namespace, name);

        retry_with_policy(
            &description,
            RetryPolicy::new(max_retries, interval),
            || self.check_service_available(name),
        )
        .await?;

        info!(namespace = %self.namespace, service = %name, "Service is available");
        Ok(())
    }
}
