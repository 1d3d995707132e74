//! Run configuration.
//!
//! Configuration is loaded from environment variables with defaults that match
//! the deployed highway stack. The Terraform definition directory and the
//! readiness budget are constants and cannot be overridden.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Namespace the nginx service is deployed into.
pub const DEFAULT_NAMESPACE: &str = "highway";

/// Name of the nginx service under test.
pub const DEFAULT_SERVICE_NAME: &str = "nginx-highway-service";

/// Substring the nginx welcome page must contain.
pub const DEFAULT_EXPECTED_BODY: &str = "<h1>Welcome to nginx!</h1>";

/// Namespace created by the GitOps control plane that Terraform installs.
/// Terraform does not remove it on destroy, so the check deletes it.
pub const DEFAULT_AUX_NAMESPACE: &str = "argocd";

/// Default HTTP probe timeout in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 10;

/// Port the service listens on inside the cluster.
pub const SERVICE_PORT: u16 = 80;

/// Relative location of the Terraform definition, from this crate's manifest.
pub const TERRAFORM_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../terraform");

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid probe timeout configuration: {0}")]
    InvalidProbeTimeout(String),

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Whether the check may run alongside other independent checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Safe to run concurrently with other test functions.
    Parallel,
    /// Must run alone.
    Serial,
}

/// Options for reaching the Kubernetes API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeOptions {
    /// Kubeconfig context; `None` uses the current context.
    pub context: Option<String>,
    /// Explicit kubeconfig path; `None` uses the default lookup.
    pub config_path: Option<PathBuf>,
    /// Namespace all namespaced operations target.
    pub namespace: String,
}

impl KubeOptions {
    /// Options for the current context and default kubeconfig.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            context: None,
            config_path: None,
            namespace: namespace.into(),
        }
    }
}

/// Options for running Terraform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerraformOptions {
    /// Directory containing the Terraform definition.
    pub terraform_dir: PathBuf,
    /// Terraform binary name or path.
    pub binary: String,
    /// Pass `-no-color` to every command.
    pub no_color: bool,
    /// `-var` assignments for apply and destroy.
    pub vars: Vec<(String, String)>,
    /// Extra environment for the Terraform process.
    pub env: Vec<(String, String)>,
}

impl TerraformOptions {
    /// Options for the fixed highway Terraform definition.
    pub fn highway(binary: impl Into<String>) -> Self {
        Self {
            terraform_dir: PathBuf::from(TERRAFORM_DIR),
            binary: binary.into(),
            no_color: true,
            vars: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// Configuration for one service availability run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Kubernetes access options.
    pub kube: KubeOptions,

    /// Service to look up, wait for and probe.
    pub service_name: String,

    /// Substring the response body must contain.
    pub expected_body: String,

    /// Namespace deleted on teardown after provisioning.
    pub aux_namespace: String,

    /// Terraform options (directory is always [`TERRAFORM_DIR`]).
    pub terraform: TerraformOptions,

    /// HTTP probe timeout.
    pub probe_timeout: Duration,

    /// Runner concurrency marker.
    pub concurrency: Concurrency,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kube: KubeOptions::new(DEFAULT_NAMESPACE),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            expected_body: DEFAULT_EXPECTED_BODY.to_string(),
            aux_namespace: DEFAULT_AUX_NAMESPACE.to_string(),
            terraform: TerraformOptions::highway("terraform"),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECONDS),
            concurrency: Concurrency::Parallel,
        }
    }
}

impl RunConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let namespace = vars
            .get("HIGHWAY_NAMESPACE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let service_name = vars
            .get("HIGHWAY_SERVICE_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        let expected_body = vars
            .get("HIGHWAY_EXPECTED_BODY")
            .cloned()
            .unwrap_or_else(|| DEFAULT_EXPECTED_BODY.to_string());

        let aux_namespace = vars
            .get("HIGHWAY_AUX_NAMESPACE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_AUX_NAMESPACE.to_string());

        let binary = vars
            .get("TERRAFORM_BINARY")
            .cloned()
            .unwrap_or_else(|| "terraform".to_string());

        // Parse probe timeout with validation
        let probe_timeout = if let Some(value_str) = vars.get("HIGHWAY_PROBE_TIMEOUT_SECONDS") {
            let value: u64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidProbeTimeout(format!(
                    "HIGHWAY_PROBE_TIMEOUT_SECONDS must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidProbeTimeout(
                    "HIGHWAY_PROBE_TIMEOUT_SECONDS must be greater than 0".to_string(),
                ));
            }

            Duration::from_secs(value)
        } else {
            Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECONDS)
        };

        let concurrency = match vars.get("HIGHWAY_SERIAL").map(|v| v.trim()) {
            None | Some("") | Some("0") | Some("false") => Concurrency::Parallel,
            Some("1") | Some("true") => Concurrency::Serial,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "HIGHWAY_SERIAL".to_string(),
                    message: format!("expected 1/true/0/false, got '{}'", other),
                })
            }
        };

        Ok(Self {
            kube: KubeOptions {
                context: non_empty(vars.get("KUBE_CONTEXT")),
                config_path: non_empty(vars.get("KUBECONFIG_PATH")).map(PathBuf::from),
                namespace,
            },
            service_name,
            expected_body,
            aux_namespace,
            terraform: TerraformOptions::highway(binary),
            probe_timeout,
            concurrency,
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_empty_env() {
        let config = RunConfig::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.kube.namespace, "highway");
        assert_eq!(config.kube.context, None);
        assert_eq!(config.kube.config_path, None);
        assert_eq!(config.service_name, "nginx-highway-service");
        assert_eq!(config.expected_body, "<h1>Welcome to nginx!</h1>");
        assert_eq!(config.aux_namespace, "argocd");
        assert_eq!(config.terraform.binary, "terraform");
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert_eq!(config.concurrency, Concurrency::Parallel);
    }

    #[test]
    fn test_overrides() {
        let config = RunConfig::from_vars(&vars(&[
            ("HIGHWAY_NAMESPACE", "staging"),
            ("HIGHWAY_SERVICE_NAME", "web"),
            ("KUBE_CONTEXT", "kind-highway"),
            ("KUBECONFIG_PATH", "/tmp/kubeconfig"),
            ("TERRAFORM_BINARY", "/usr/local/bin/tofu"),
            ("HIGHWAY_PROBE_TIMEOUT_SECONDS", "3"),
            ("HIGHWAY_SERIAL", "true"),
        ]))
        .expect("overrides should load");

        assert_eq!(config.kube.namespace, "staging");
        assert_eq!(config.service_name, "web");
        assert_eq!(config.kube.context.as_deref(), Some("kind-highway"));
        assert_eq!(
            config.kube.config_path,
            Some(PathBuf::from("/tmp/kubeconfig"))
        );
        assert_eq!(config.terraform.binary, "/usr/local/bin/tofu");
        assert_eq!(config.probe_timeout, Duration::from_secs(3));
        assert_eq!(config.concurrency, Concurrency::Serial);
    }

    #[test]
    fn test_empty_context_is_ignored() {
        let config =
            RunConfig::from_vars(&vars(&[("KUBE_CONTEXT", "  ")])).expect("should load");
        assert_eq!(config.kube.context, None);
    }

    #[test]
    fn test_terraform_dir_is_fixed() {
        let config = RunConfig::from_vars(&vars(&[("TERRAFORM_DIR", "/somewhere/else")]))
            .expect("should load");

        assert_eq!(config.terraform.terraform_dir, PathBuf::from(TERRAFORM_DIR));
        assert!(TERRAFORM_DIR.ends_with("/../../terraform"));
    }

    #[test]
    fn test_zero_probe_timeout_rejected() {
        let result = RunConfig::from_vars(&vars(&[("HIGHWAY_PROBE_TIMEOUT_SECONDS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidProbeTimeout(_))));
    }

    #[test]
    fn test_non_numeric_probe_timeout_rejected() {
        let result = RunConfig::from_vars(&vars(&[("HIGHWAY_PROBE_TIMEOUT_SECONDS", "soon")]));
        let err = result.expect_err("should reject non-numeric timeout");
        assert!(err.to_string().contains("valid positive integer"));
    }

    #[test]
    fn test_invalid_serial_flag_rejected() {
        let result = RunConfig::from_vars(&vars(&[("HIGHWAY_SERIAL", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
