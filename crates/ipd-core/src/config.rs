use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level ipd configuration loaded from TOML.
///
/// Shared by the `ipd` scheduler binary and the `metaserver` binary; each
/// reads the sections it needs.
#[derive(Debug, Clone, Deserialize)]
pub struct IpdConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub metadata: MetadataSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub hypervisors: Vec<HypervisorEndpoint>,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSettings {
    /// Tracing filter directive (e.g. `ipd=debug,warn`). `RUST_LOG`
    /// still takes precedence at startup.
    pub filter: Option<String>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Directory holding descriptor templates and the manager SSH key.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Listen address for the admin JSON API.
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    /// Capacity of the pending-build queue.
    #[serde(default = "default_build_queue_depth")]
    pub build_queue_depth: usize,
    /// Max time to wait for a guest to phone home (seconds).
    #[serde(default = "default_phone_home_timeout")]
    pub phone_home_timeout_secs: u64,
    /// Max time to wait for the SSH transport to come up (seconds).
    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,
    /// Guest user the build steps run as.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

/// State store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Redis connection URL.
    #[serde(default = "default_store_url")]
    pub url: String,
}

/// Metadata service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSettings {
    /// Listen port for the metadata HTTP service. The CLI `-p` flag
    /// overrides this.
    #[serde(default = "default_metadata_port")]
    pub port: u16,
}

/// Transport the libvirt remote protocol runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorTransport {
    Tcp,
    Tls,
}

/// A hypervisor the scheduler can place builds on.
///
/// Created at startup from configuration, never mutated; identity is `key`.
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorEndpoint {
    pub key: String,
    pub address: String,
    #[serde(default = "default_hypervisor_port")]
    pub port: u16,
    #[serde(default = "default_hypervisor_driver")]
    pub driver: String,
    #[serde(default = "default_hypervisor_mode")]
    pub mode: String,
    #[serde(default = "default_hypervisor_transport")]
    pub transport: HypervisorTransport,
}

impl HypervisorEndpoint {
    /// The libvirt remote URI for this endpoint, e.g.
    /// `qemu+tcp://hv1.example.net:16509/system`.
    pub fn uri(&self) -> String {
        let transport = match self.transport {
            HypervisorTransport::Tcp => "tcp",
            HypervisorTransport::Tls => "tls",
        };
        format!(
            "{}+{}://{}:{}/{}",
            self.driver, transport, self.address, self.port, self.mode
        )
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from("workdir")
}
fn default_admin_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_build_queue_depth() -> usize {
    64
}
fn default_phone_home_timeout() -> u64 {
    300
}
fn default_ssh_connect_timeout() -> u64 {
    30
}
fn default_ssh_user() -> String {
    "ubuntu".to_string()
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_metadata_port() -> u16 {
    80
}
fn default_hypervisor_port() -> u16 {
    16509
}
fn default_hypervisor_driver() -> String {
    "qemu".to_string()
}
fn default_hypervisor_mode() -> String {
    "system".to_string()
}
fn default_hypervisor_transport() -> HypervisorTransport {
    HypervisorTransport::Tcp
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            listen: default_admin_listen(),
            build_queue_depth: default_build_queue_depth(),
            phone_home_timeout_secs: default_phone_home_timeout(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout(),
            ssh_user: default_ssh_user(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            port: default_metadata_port(),
        }
    }
}

impl SchedulerSettings {
    /// Path to the manager SSH private key under the workdir.
    pub fn manager_key_path(&self) -> PathBuf {
        self.workdir.join("ipd-test-key.rsa")
    }

    /// Path to the storage pool descriptor template.
    pub fn pool_template_path(&self) -> PathBuf {
        self.workdir.join("base-vm").join("pool.xml")
    }

    /// Path to the domain descriptor template for a base image.
    pub fn domain_template_path(&self, base_domain: &str) -> PathBuf {
        self.workdir
            .join("domains")
            .join(format!("{}.xml", base_domain))
    }

    /// Path to the volume descriptor template for a base image.
    pub fn volume_template_path(&self, base_domain: &str) -> PathBuf {
        self.workdir
            .join("volumes")
            .join(format!("{}.xml", base_domain))
    }

    /// Per-project working directory for the repository poller.
    pub fn poller_workdir(&self, project_key: &str) -> PathBuf {
        self.workdir.join("poller").join(project_key)
    }
}

impl IpdConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hypervisors.is_empty() {
            anyhow::bail!("Config must have at least one [[hypervisors]] entry");
        }

        let mut seen = std::collections::HashSet::new();
        for hv in &self.hypervisors {
            if hv.key.is_empty() {
                anyhow::bail!("Hypervisor key must not be empty");
            }
            if !seen.insert(hv.key.as_str()) {
                anyhow::bail!("Duplicate hypervisor key {:?} in config", hv.key);
            }
        }
        Ok(())
    }
}
