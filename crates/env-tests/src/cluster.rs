//! Cluster connection and service lookup.
//!
//! This module provides the `KubeCluster` type, the Kubernetes-backed
//! implementation of the cluster-facing collaborators used by the check
//! (lookup here; readiness in [`crate::readiness`]; port-forwarding in
//! [`crate::tunnel`]).

use crate::config::KubeOptions;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{Api, DeleteParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Cluster connection errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to load kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("Kubernetes API request failed: {0}")]
    Api(#[from] kube::Error),
}

/// Outcome of the existence check that starts every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// The service exists; provisioning is skipped.
    AlreadyProvisioned,
    /// The service is absent; the infrastructure must be applied.
    NeedsProvisioning,
}

impl ProvisionState {
    /// Decide from the result of a service lookup.
    pub fn from_lookup(service: Option<&Service>) -> Self {
        match service {
            Some(_) => ProvisionState::AlreadyProvisioned,
            None => ProvisionState::NeedsProvisioning,
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::AlreadyProvisioned => write!(f, "already-provisioned"),
            ProvisionState::NeedsProvisioning => write!(f, "needs-provisioning"),
        }
    }
}

/// Existence queries and namespace cleanup.
#[async_trait]
pub trait ClusterQuery: Send + Sync {
    /// Look up a service in the target namespace.
    ///
    /// An absent service is `NeedsProvisioning`; any other failure is an error.
    async fn service_state(&self, name: &str) -> Result<ProvisionState, ClusterError>;

    /// Delete a namespace. A namespace that does not exist counts as deleted.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;
}

/// Connection to the cluster selected by [`KubeOptions`].
#[derive(Clone)]
pub struct KubeCluster {
    pub(crate) client: Client,
    pub(crate) namespace: String,
}

impl KubeCluster {
    /// Connect using the kubeconfig and context named in `options`.
    ///
    /// With neither a path nor a context the client is inferred the same way
    /// kubectl does (in-cluster config, then `KUBECONFIG`, then `~/.kube/config`).
    pub async fn connect(options: &KubeOptions) -> Result<Self, ClusterError> {
        install_crypto_provider();

        let kube_config_options = KubeConfigOptions {
            context: options.context.clone(),
            ..Default::default()
        };

        let config = match (&options.config_path, &options.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Kubeconfig(format!("{}: {}", path.display(), e))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &kube_config_options)
                    .await
                    .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?
            }
            (None, Some(_)) => kube::Config::from_kubeconfig(&kube_config_options)
                .await
                .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?,
            (None, None) => kube::Config::infer()
                .await
                .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?,
        };

        let client = Client::try_from(config)?;

        debug!(
            namespace = %options.namespace,
            context = ?options.context,
            "Connected to Kubernetes API"
        );

        Ok(Self::new(client, options.namespace.clone()))
    }

    /// Wrap an existing client.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Namespace all namespaced operations target.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterQuery for KubeCluster {
    async fn service_state(&self, name: &str) -> Result<ProvisionState, ClusterError> {
        let service = self.services().get_opt(name).await?;
        let state = ProvisionState::from_lookup(service.as_ref());

        debug!(
            namespace = %self.namespace,
            service = %name,
            state = %state,
            "Service lookup complete"
        );

        Ok(state)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %name, "Namespace deletion requested");
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!(namespace = %name, "Namespace already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Select ring for rustls before the first TLS connection.
///
/// Installing twice returns an error that is safe to ignore.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_missing_service_needs_provisioning() {
        assert_eq!(
            ProvisionState::from_lookup(None),
            ProvisionState::NeedsProvisioning
        );
    }

    #[test]
    fn test_present_service_is_provisioned() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("nginx-highway-service".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            ProvisionState::from_lookup(Some(&service)),
            ProvisionState::AlreadyProvisioned
        );
    }

    #[test]
    fn test_provision_state_display() {
        assert_eq!(
            ProvisionState::AlreadyProvisioned.to_string(),
            "already-provisioned"
        );
        assert_eq!(
            ProvisionState::NeedsProvisioning.to_string(),
            "needs-provisioning"
        );
    }
}
