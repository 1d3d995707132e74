//! Terraform provisioning.
//!
//! `Terraform` shells out to the Terraform CLI in the fixed definition
//! directory. Every command runs non-interactively; a non-zero exit is an error
//! carrying the (colour-stripped, truncated) stderr.

use crate::config::TerraformOptions;
use async_trait::async_trait;
use regex::Regex;
use std::process::Output;
use std::sync::LazyLock;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Maximum length of stderr kept in error messages.
const MAX_STDERR_LEN: usize = 2048;

/// ANSI colour escape sequences.
static ANSI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap()
});

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Applies and tears down the infrastructure definition.
#[async_trait]
pub trait ProvisionRunner: Send + Sync {
    /// Initialise the working directory and apply the definition.
    async fn init_and_apply(&self) -> Result<(), ProvisionError>;

    /// Destroy everything the definition manages.
    async fn destroy(&self) -> Result<(), ProvisionError>;
}

/// Terraform CLI runner.
#[derive(Debug, Clone)]
pub struct Terraform {
    options: TerraformOptions,
}

impl Terraform {
    pub fn new(options: TerraformOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TerraformOptions {
        &self.options
    }

    /// Arguments for `terraform init`.
    pub fn init_args(&self) -> Vec<String> {
        let mut args = vec![
            "init".to_string(),
            "-input=false".to_string(),
            "-upgrade=false".to_string(),
        ];
        if self.options.no_color {
            args.push("-no-color".to_string());
        }
        args
    }

    /// Arguments for `terraform apply`.
    pub fn apply_args(&self) -> Vec<String> {
        self.mutating_args("apply")
    }

    /// Arguments for `terraform destroy`.
    pub fn destroy_args(&self) -> Vec<String> {
        self.mutating_args("destroy")
    }

    fn mutating_args(&self, subcommand: &str) -> Vec<String> {
        let mut args = vec![
            subcommand.to_string(),
            "-input=false".to_string(),
            "-auto-approve".to_string(),
            "-lock=false".to_string(),
        ];
        if self.options.no_color {
            args.push("-no-color".to_string());
        }
        for (key, value) in &self.options.vars {
            args.push("-var".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<(), ProvisionError> {
        let command = format!("{} {}", self.options.binary, args.join(" "));

        info!(
            dir = %self.options.terraform_dir.display(),
            command = %command,
            "Running terraform"
        );

        let output = Command::new(&self.options.binary)
            .args(&args)
            .current_dir(&self.options.terraform_dir)
            .env("TF_IN_AUTOMATION", "1")
            .envs(self.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;

        check_output(&command, &output)
    }
}

#[async_trait]
impl ProvisionRunner for Terraform {
    async fn init_and_apply(&self) -> Result<(), ProvisionError> {
        self.run(self.init_args()).await?;
        self.run(self.apply_args()).await
    }

    async fn destroy(&self) -> Result<(), ProvisionError> {
        self.run(self.destroy_args()).await
    }
}

fn check_output(command: &str, output: &Output) -> Result<(), ProvisionError> {
    let stdout = strip_ansi(&String::from_utf8_lossy(&output.stdout));
    debug!(command = %command, stdout = %stdout, "terraform output");

    if output.status.success() {
        return Ok(());
    }

    Err(ProvisionError::CommandFailed {
        command: command.to_string(),
        status: output.status.to_string(),
        stderr: truncate(&strip_ansi(&String::from_utf8_lossy(&output.stderr))),
    })
}

fn strip_ansi(text: &str) -> String {
    ANSI_PATTERN.replace_all(text, "").into_owned()
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= MAX_STDERR_LEN {
        return trimmed.to_string();
    }

    let mut end = MAX_STDERR_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", trimmed.get(..end).unwrap_or_default())
}
