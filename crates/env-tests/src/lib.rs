//! Highway Environment Test Suite
//!
//! This crate verifies that the nginx service deployed into the `highway`
//! namespace by the Terraform definition under `terraform/` is reachable and
//! serving the expected page.
//!
//! The check is a single linear procedure ([`check::ServiceAvailabilityCheck`]):
//! look the service up, provision the infrastructure if it is missing, wait for
//! the service to become available, open a local port-forward to it and probe it
//! over HTTP. Every collaborator sits behind a trait so the procedure can be run
//! against the real cluster or against in-memory fakes.
//!
//! # Features
//!
//! - `live`: Run the check against the cluster selected by the current kubeconfig
//! - `all`: Enable all test categories
//!
//! # Prerequisites (live check)
//!
//! 1. A kubeconfig pointing at the target cluster (`KUBECONFIG`, or
//!    `KUBECONFIG_PATH` / `KUBE_CONTEXT` to override)
//! 2. `terraform` in PATH (or `TERRAFORM_BINARY`) when the service is not yet deployed
//!
//! # Usage
//!
//! ```bash
//! # Procedure and probe tests against fakes (no cluster needed)
//! cargo test -p highway-env-tests
//!
//! # Live check, provisioning if needed
//! cargo test -p highway-env-tests --features live
//! ```

#![cfg_attr(
    not(test),
    deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

pub mod check;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod logging;
pub mod probe;
pub mod provision;
pub mod readiness;
pub mod tunnel;

pub use check::{CheckError, RunReport, ServiceAvailabilityCheck};
pub use cluster::{ClusterError, ClusterQuery, KubeCluster, ProvisionState};
pub use config::{Concurrency, ConfigError, KubeOptions, RunConfig, TerraformOptions};
pub use probe::{HttpProbe, ProbeError, ProbeOptions, ReqwestProbe};
pub use provision::{ProvisionError, ProvisionRunner, Terraform};
pub use readiness::{ReadinessError, ReadinessWaiter, RetryPolicy};
pub use tunnel::{PortTunnel, ResourceType, TunnelClient, TunnelError};
