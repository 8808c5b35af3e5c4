//! [`CloudBackend`] over the `gcloud compute instances` CLI.

use super::{CloudBackend, InstanceAddresses, InstanceRequest};
use crate::config::CloudConfig;
use crate::error::ProvisionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;

/// Creates instances with the launcher's SSH key installed.
#[derive(Debug, Clone)]
pub struct GcloudBackend {
    config: CloudConfig,
    /// `login:public-key` entry for the `ssh-keys` metadata item.
    ssh_key_entry: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceDescription {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

/// Addresses from `gcloud compute instances describe --format=json`.
fn parse_addresses(json: &[u8]) -> Result<InstanceAddresses, String> {
    let description: InstanceDescription =
        serde_json::from_slice(json).map_err(|e| format!("unreadable description: {}", e))?;
    let interface = description
        .network_interfaces
        .into_iter()
        .next()
        .ok_or_else(|| "no network interface".to_string())?;
    let internal = interface
        .network_ip
        .ok_or_else(|| "no internal address yet".to_string())?;
    let external = interface
        .access_configs
        .into_iter()
        .find_map(|config| config.nat_ip)
        .ok_or_else(|| "no external address yet".to_string())?;
    Ok(InstanceAddresses { internal, external })
}

impl GcloudBackend {
    /// Create a backend installing `public_key` for `login` on every instance.
    pub fn new(config: CloudConfig, login: &str, public_key: &str) -> Self {
        Self {
            config,
            ssh_key_entry: format!("{}:{}", login, public_key.trim()),
        }
    }

    fn scope_args(&self) -> Vec<String> {
        vec![
            format!("--project={}", self.config.project),
            format!("--zone={}", self.config.zone),
        ]
    }

    fn create_args(&self, request: &InstanceRequest) -> Vec<String> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            request.name.clone(),
        ];
        args.extend(self.scope_args());
        args.extend([
            format!("--machine-type={}", self.config.machine_type),
            format!("--image={}", self.config.source_image),
            format!("--boot-disk-size={}GB", self.config.disk_size_gb),
            "--network-tier=STANDARD".to_string(),
            // `^|^` switches the list delimiter so commas in the key survive.
            format!("--metadata=^|^ssh-keys={}", self.ssh_key_entry),
            format!(
                "--labels=kvas-task={},kvas-role={}",
                request.task_id, request.role
            ),
            "--format=json".to_string(),
            "--quiet".to_string(),
        ]);
        if let Some(account) = &self.config.service_account {
            args.push(format!("--service-account={}", account));
            args.push("--scopes=cloud-platform".to_string());
        }
        args
    }

    async fn gcloud(
        &self,
        operation: &'static str,
        instance: &str,
        args: Vec<String>,
    ) -> Result<Vec<u8>, ProvisionError> {
        let backend_error = |reason: String| ProvisionError::Backend {
            operation,
            instance: instance.to_string(),
            reason,
        };

        let output = Command::new("gcloud")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| backend_error(format!("failed to run gcloud: {}", e)))?;

        if !output.status.success() {
            return Err(backend_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl CloudBackend for GcloudBackend {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<(), ProvisionError> {
        tracing::debug!(instance = %request.name, task_id = %request.task_id, "creating instance");
        self.gcloud("create", &request.name, self.create_args(request))
            .await
            .map(|_| ())
    }

    async fn describe_instance(&self, name: &str) -> Result<InstanceAddresses, ProvisionError> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "describe".to_string(),
            name.to_string(),
        ];
        args.extend(self.scope_args());
        args.push("--format=json".to_string());

        let json = self.gcloud("describe", name, args).await?;
        parse_addresses(&json).map_err(|reason| ProvisionError::Backend {
            operation: "describe",
            instance: name.to_string(),
            reason,
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ProvisionError> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "delete".to_string(),
            name.to_string(),
        ];
        args.extend(self.scope_args());
        args.push("--quiet".to_string());
        self.gcloud("delete", name, args).await.map(|_| ())
    }
}
