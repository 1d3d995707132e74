//! The nginx service availability check.
//!
//! One run: look the service up; if it is missing, apply the Terraform
//! definition (registering teardown first) and wait for the service; then
//! tunnel to it and probe it. Teardown registered during the run is executed
//! after the probe whether or not anything failed or panicked, newest first.
//! Runs configured as serial wait for every other run in the process.

use crate::cleanup::{CleanupFailure, CleanupStack};
use crate::cluster::{ClusterError, ClusterQuery, KubeCluster, ProvisionState};
use crate::config::{Concurrency, RunConfig, SERVICE_PORT};
use crate::probe::{
    status_and_body_contains, HttpProbe, ProbeError, ProbeOptions, ProbeResponse, ReqwestProbe,
};
use crate::provision::{ProvisionError, ProvisionRunner, Terraform};
use crate::readiness::{ReadinessError, ReadinessWaiter, RetryPolicy};
use crate::tunnel::{PortTunnel, ResourceType, TunnelClient, TunnelError};
use futures::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Status the probe must observe.
const EXPECTED_STATUS: u16 = 200;

/// Parallel runs share this gate; a serial run holds it exclusively.
static RUN_GATE: RwLock<()> = RwLock::const_new(());

/// Check errors. Every variant fails the run.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Cluster query failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Service never became ready: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("Tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Summary of a passing run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: ProvisionState,
    pub endpoint: String,
    pub status: u16,
    pub concurrency: Concurrency,
    /// Teardown steps that failed after the probe passed.
    pub cleanup_failures: Vec<CleanupFailure>,
}

/// Ensures the configured service is reachable and serving the expected page.
pub struct ServiceAvailabilityCheck {
    config: RunConfig,
    cluster: Arc<dyn ClusterQuery>,
    provisioner: Arc<dyn ProvisionRunner>,
    readiness: Arc<dyn ReadinessWaiter>,
    tunnels: Arc<dyn TunnelClient>,
    probe: Arc<dyn HttpProbe>,
}

impl ServiceAvailabilityCheck {
    pub fn new(
        config: RunConfig,
        cluster: Arc<dyn ClusterQuery>,
        provisioner: Arc<dyn ProvisionRunner>,
        readiness: Arc<dyn ReadinessWaiter>,
        tunnels: Arc<dyn TunnelClient>,
        probe: Arc<dyn HttpProbe>,
    ) -> Self {
        Self {
            config,
            cluster,
            provisioner,
            readiness,
            tunnels,
            probe,
        }
    }

    /// Wire the check to the real cluster, Terraform and HTTP.
    pub async fn connect(config: RunConfig) -> Result<Self, CheckError> {
        let cluster = Arc::new(KubeCluster::connect(&config.kube).await?);
        let terraform = Arc::new(Terraform::new(config.terraform.clone()));

        Ok(Self::new(
            config,
            cluster.clone(),
            terraform,
            cluster.clone(),
            cluster,
            Arc::new(ReqwestProbe::new()),
        ))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute one run.
    pub async fn run(&self) -> Result<RunReport, CheckError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "service_check",
            %run_id,
            namespace = %self.config.kube.namespace,
            service = %self.config.service_name,
            concurrency = ?self.config.concurrency,
        );

        async move {
            // Held for the whole run, teardown included.
            let _shared;
            let _exclusive;
            match self.config.concurrency {
                Concurrency::Parallel => _shared = RUN_GATE.read().await,
                Concurrency::Serial => {
                    debug!("Waiting for exclusive run slot");
                    _exclusive = RUN_GATE.write().await;
                }
            }

            let mut cleanup = CleanupStack::new();
            let outcome = AssertUnwindSafe(self.run_body(run_id, &mut cleanup))
                .catch_unwind()
                .await;

            let cleanup_failures = cleanup.run_all().await;
            if !cleanup_failures.is_empty() {
                warn!(
                    failed = cleanup_failures.len(),
                    "Teardown finished with failures"
                );
            }

            let result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    warn!("Service check panicked; teardown has run");
                    panic::resume_unwind(payload)
                }
            };

            match result {
                Ok(mut report) => {
                    report.cleanup_failures = cleanup_failures;
                    info!(endpoint = %report.endpoint, "Service check passed");
                    Ok(report)
                }
                Err(e) => {
                    warn!(error = %e, "Service check failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_body(
        &self,
        run_id: Uuid,
        cleanup: &mut CleanupStack,
    ) -> Result<RunReport, CheckError> {
        let service_name = &self.config.service_name;
        let state = self.cluster.service_state(service_name).await?;

        match state {
            ProvisionState::AlreadyProvisioned => {
                info!("Infrastructure already exists. Skipping apply and running health checks");
            }
            ProvisionState::NeedsProvisioning => {
                info!("Infrastructure not found. Running terraform apply");
                self.register_teardown(cleanup);

                self.provisioner.init_and_apply().await?;
                self.readiness
                    .wait_until_available(
                        service_name,
                        RetryPolicy::SERVICE_READY.max_retries,
                        RetryPolicy::SERVICE_READY.interval,
                    )
                    .await?;
            }
        }

        let mut tunnel = self
            .tunnels
            .open(ResourceType::Service, service_name, 0, SERVICE_PORT);
        let probed = self.probe_through(tunnel.as_mut()).await;
        tunnel.close();
        let (endpoint, response) = probed?;

        Ok(RunReport {
            run_id,
            state,
            endpoint,
            status: response.status,
            concurrency: self.config.concurrency,
            cleanup_failures: Vec::new(),
        })
    }

    /// Namespace deletion first, so it runs after destroy.
    fn register_teardown(&self, cleanup: &mut CleanupStack) {
        let cluster = self.cluster.clone();
        let aux_namespace = self.config.aux_namespace.clone();
        cleanup.defer(format!("delete namespace {}", aux_namespace), move || {
            async move {
                cluster
                    .delete_namespace(&aux_namespace)
                    .await
                    .map_err(|e| e.to_string())
            }
            .boxed()
        });

        let provisioner = self.provisioner.clone();
        cleanup.defer("terraform destroy", move || {
            async move { provisioner.destroy().await.map_err(|e| e.to_string()) }.boxed()
        });
    }

    async fn probe_through(
        &self,
        tunnel: &mut dyn PortTunnel,
    ) -> Result<(String, ProbeResponse), CheckError> {
        tunnel.forward_port().await?;
        let endpoint = tunnel.endpoint()?;
        let url = format!("http://{}", endpoint);

        let validator =
            status_and_body_contains(EXPECTED_STATUS, self.config.expected_body.clone());
        let options = ProbeOptions {
            timeout: self.config.probe_timeout,
        };

        let response = self
            .probe
            .get_with_validation(&url, &options, &validator)
            .await?;

        Ok((endpoint, response))
    }
}

