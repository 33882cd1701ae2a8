use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Build lifecycle status. Transitions are monotonic:
/// waiting -> running -> (done | failed). Terminal records are never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Waiting,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => bail!("Unknown build status {:?}", other),
        }
    }
}

/// A scheduled build, persisted as the hash `build:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: u64,
    pub status: BuildStatus,
    pub project_key: String,
    pub commit_id: String,
    /// Serialized buildspec YAML as fetched at scheduling time.
    pub buildspec: String,
    pub created_at: String,
}

impl BuildRecord {
    /// Hash fields for persistence. The id is carried by the key, not the
    /// hash.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("status".to_string(), self.status.to_string()),
            ("project_key".to_string(), self.project_key.clone()),
            ("commit_id".to_string(), self.commit_id.clone()),
            ("buildspec".to_string(), self.buildspec.clone()),
            ("created_at".to_string(), self.created_at.clone()),
        ]
    }

    /// Rebuild a record from a stored hash.
    pub fn from_fields(id: u64, fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> Result<String> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Build {} is missing field {:?}", id, name))
        };
        Ok(Self {
            id,
            status: get("status")?.parse()?,
            project_key: get("project_key")?,
            commit_id: get("commit_id")?,
            buildspec: get("buildspec")?,
            created_at: fields.get("created_at").cloned().unwrap_or_default(),
        })
    }
}

/// Per-instance rendezvous record, persisted as `instancedata:<uuid>`.
///
/// Written in two phases: the lifecycle driver writes the scheduler-side
/// facts at domain creation; the metadata server writes the guest-side
/// facts when the instance phones home. `status == "running"` implies the
/// guest fields are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub hypervisor: String,
    pub mac_address: String,
    pub vncport: String,
    pub vncpasswd: String,
    pub hostname: Option<String>,
    pub status: Option<String>,
    pub ip_address: Option<String>,
    /// Host keys reported by the guest, keyed by algorithm suffix
    /// (`pub_key_rsa` -> `rsa`).
    pub public_keys: HashMap<String, String>,
}

/// Field-name prefix under which guests report host public keys.
pub const PUB_KEY_PREFIX: &str = "pub_key_";

impl InstanceRecord {
    /// The phase-1 fields written by the lifecycle driver.
    pub fn phase1_fields(&self) -> Vec<(String, String)> {
        vec![
            ("hypervisor".to_string(), self.hypervisor.clone()),
            ("mac_address".to_string(), self.mac_address.clone()),
            ("vncport".to_string(), self.vncport.clone()),
            ("vncpasswd".to_string(), self.vncpasswd.clone()),
        ]
    }

    /// Rebuild a record from a stored hash.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let mut record = Self {
            hypervisor: fields.get("hypervisor").cloned().unwrap_or_default(),
            mac_address: fields.get("mac_address").cloned().unwrap_or_default(),
            vncport: fields.get("vncport").cloned().unwrap_or_default(),
            vncpasswd: fields.get("vncpasswd").cloned().unwrap_or_default(),
            hostname: fields.get("hostname").cloned(),
            status: fields.get("status").cloned(),
            ip_address: fields.get("ip_address").cloned(),
            public_keys: HashMap::new(),
        };
        for (name, value) in fields {
            if let Some(algorithm) = name.strip_prefix(PUB_KEY_PREFIX) {
                record
                    .public_keys
                    .insert(algorithm.to_string(), value.clone());
            }
        }
        record
    }

    /// Whether the guest has phoned home.
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }

    /// The host key to pin for the SSH connection: RSA when reported,
    /// otherwise any reported key.
    pub fn host_key(&self) -> Option<&str> {
        self.public_keys
            .get("rsa")
            .or_else(|| self.public_keys.values().next())
            .map(String::as_str)
    }
}
