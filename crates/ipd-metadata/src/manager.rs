//! Instance identity resolution and rendezvous record access.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use ipd_core::config::HypervisorEndpoint;
use ipd_core::sshkey::KEY_NAME;
use ipd_core::userdata;
use ipd_hypervisor::{Connector, HypervisorError};
use ipd_store::{Store, StoreError, keys};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unknown hypervisor: {0}")]
    UnknownHypervisor(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The metadata document assembled for one instance.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    pub uuid: Uuid,
    pub name: String,
    pub hostname: String,
    /// Key name -> OpenSSH public key.
    pub public_keys: Vec<(String, String)>,
}

/// Resolves instance identity against the owning hypervisor and reads and
/// writes rendezvous records. Holds the scheduler's public key, which
/// guests bake into `authorized_keys` on first boot.
pub struct MetadataManager {
    hypervisors: HashMap<String, HypervisorEndpoint>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn Store>,
    public_key: String,
}

impl MetadataManager {
    pub fn new(
        hypervisors: Vec<HypervisorEndpoint>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn Store>,
        public_key: String,
    ) -> Self {
        Self {
            hypervisors: hypervisors
                .into_iter()
                .map(|h| (h.key.clone(), h))
                .collect(),
            connector,
            store,
            public_key,
        }
    }

    /// Look up a domain on the named hypervisor; one connection per
    /// request, closed on every path.
    async fn domain_name(&self, hypervisor: &str, uuid: Uuid) -> Result<String, MetadataError> {
        let endpoint = self
            .hypervisors
            .get(hypervisor)
            .ok_or_else(|| MetadataError::UnknownHypervisor(hypervisor.to_string()))?;

        let conn = self.connector.connect(&endpoint.uri()).await?;
        let result = conn.domain_lookup_by_uuid(uuid).await;
        if let Err(e) = conn.close().await {
            warn!(hypervisor, error = %e, "Failed to close hypervisor connection");
        }
        Ok(result?.name)
    }

    /// The metadata document for an instance: identity from the
    /// hypervisor, the manager's public key for `authorized_keys`.
    pub async fn metadata_for(
        &self,
        hypervisor: &str,
        uuid: Uuid,
    ) -> Result<InstanceMetadata, MetadataError> {
        let name = self.domain_name(hypervisor, uuid).await?;
        Ok(InstanceMetadata {
            uuid,
            hostname: name.clone(),
            name,
            public_keys: vec![(KEY_NAME.to_string(), self.public_key.clone())],
        })
    }

    /// The cloud-config user-data for an instance.
    pub async fn userdata_for(&self, hypervisor: &str, uuid: Uuid) -> Result<String, MetadataError> {
        let name = self.domain_name(hypervisor, uuid).await?;
        Ok(userdata::render(&name))
    }

    /// The raw rendezvous record, as stored.
    pub async fn instancedata_for(
        &self,
        uuid: &str,
    ) -> Result<HashMap<String, String>, MetadataError> {
        Ok(self.store.hgetall(&keys::instancedata(uuid)).await?)
    }

    /// Record a phone-home: all guest-side fields land in one write, so
    /// readers observe the status flip together with the address and
    /// host keys.
    pub async fn record_phone_home(
        &self,
        uuid: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), MetadataError> {
        self.store
            .hmset(&keys::instancedata(uuid), &fields)
            .await?;
        Ok(())
    }
}
