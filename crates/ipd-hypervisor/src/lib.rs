// ipd-hypervisor: typed facade over the libvirt remote protocol.
//
// The scheduler and the metadata service consume hypervisors through the
// narrow `Hypervisor`/`Connector` traits below; the wire protocol lives
// entirely inside the libvirt backend. Tests substitute the in-memory
// fake.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod descriptor;
pub mod fake;
pub mod libvirt;

pub use libvirt::LibvirtConnector;

/// Hypervisor operation failure.
///
/// `Remote` is the hypervisor answering with an error and is recoverable:
/// a failed lookup falls back to a create path. `Transport` and `Timeout`
/// abort the build.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("hypervisor transport error: {0}")]
    Transport(String),
    #[error("hypervisor error: {0}")]
    Remote(String),
    #[error("timed out reaching hypervisor")]
    Timeout,
}

/// Handle to a storage pool on the connected hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRef {
    pub name: String,
}

/// Handle to a storage volume within a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    pub pool: String,
    pub name: String,
}

/// Handle to a domain on the connected hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRef {
    pub uuid: Uuid,
    pub name: String,
}

/// One open hypervisor connection.
///
/// Lifecycle callers open a connection per build, do their work, and
/// close; connection open/auth/feature negotiation happens inside
/// [`Connector::connect`].
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn storage_pool_lookup_by_name(&self, name: &str) -> Result<PoolRef, HypervisorError>;
    async fn storage_pool_create_xml(&self, xml: &str) -> Result<PoolRef, HypervisorError>;

    async fn storage_vol_lookup_by_name(
        &self,
        pool: &PoolRef,
        name: &str,
    ) -> Result<VolumeRef, HypervisorError>;
    async fn storage_vol_create_xml(
        &self,
        pool: &PoolRef,
        xml: &str,
    ) -> Result<VolumeRef, HypervisorError>;
    async fn storage_vol_delete(&self, vol: &VolumeRef) -> Result<(), HypervisorError>;

    async fn domain_lookup_by_name(&self, name: &str) -> Result<DomainRef, HypervisorError>;
    async fn domain_lookup_by_uuid(&self, uuid: Uuid) -> Result<DomainRef, HypervisorError>;
    async fn domain_create_xml(&self, xml: &str) -> Result<DomainRef, HypervisorError>;
    async fn domain_get_xml_desc(&self, dom: &DomainRef) -> Result<String, HypervisorError>;
    async fn domain_destroy(&self, dom: &DomainRef) -> Result<(), HypervisorError>;
    async fn domain_undefine(&self, dom: &DomainRef) -> Result<(), HypervisorError>;
    async fn list_all_domains(&self) -> Result<Vec<DomainRef>, HypervisorError>;

    /// Close the connection. Every open connection is closed on all exit
    /// paths by its owner.
    async fn close(&self) -> Result<(), HypervisorError>;
}

/// Opens hypervisor connections from configured endpoint parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Hypervisor>, HypervisorError>;
}
