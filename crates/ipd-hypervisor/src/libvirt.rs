//! Libvirt backend for the hypervisor facade.
//!
//! Speaks the libvirt remote protocol through the `virt` crate; the
//! connector opens one connection per use against a remote URI such as
//! `qemu+tcp://hv1.example.net:16509/system`. The `virt` calls are
//! synchronous, so every operation runs on the blocking thread pool and
//! never stalls the async executor. Errors returned by the hypervisor
//! after the connection is up surface as [`HypervisorError::Remote`],
//! which callers may recover from (negative lookups fall back to create
//! paths).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;

use crate::{Connector, DomainRef, Hypervisor, HypervisorError, PoolRef, VolumeRef};

fn remote(e: virt::error::Error) -> HypervisorError {
    HypervisorError::Remote(e.to_string())
}

fn domain_ref(dom: &Domain) -> Result<DomainRef, HypervisorError> {
    let uuid = dom.get_uuid_string().map_err(remote)?;
    let name = dom.get_name().map_err(remote)?;
    let uuid = Uuid::parse_str(&uuid)
        .map_err(|e| HypervisorError::Remote(format!("bad domain uuid: {}", e)))?;
    Ok(DomainRef { uuid, name })
}

/// Opens libvirt connections with a bounded connect wait.
pub struct LibvirtConnector {
    connect_timeout: Duration,
}

impl LibvirtConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for LibvirtConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Hypervisor>, HypervisorError> {
        debug!(uri, "Connecting to hypervisor");
        let target = uri.to_string();
        let conn = tokio::time::timeout(
            self.connect_timeout,
            tokio::task::spawn_blocking(move || Connect::open(Some(&target))),
        )
        .await
        .map_err(|_| HypervisorError::Timeout)?
        .map_err(|e| HypervisorError::Transport(e.to_string()))?
        .map_err(|e| HypervisorError::Transport(e.to_string()))?;

        info!(uri, "Hypervisor connection established");
        Ok(Box::new(LibvirtConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

/// One open libvirt connection.
struct LibvirtConnection {
    conn: Arc<Mutex<Connect>>,
}

impl LibvirtConnection {
    /// Run one RPC sequence against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, HypervisorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connect) -> Result<T, HypervisorError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| HypervisorError::Transport(e.to_string()))?
    }
}

#[async_trait]
impl Hypervisor for LibvirtConnection {
    async fn storage_pool_lookup_by_name(&self, name: &str) -> Result<PoolRef, HypervisorError> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let pool = StoragePool::lookup_by_name(conn, &name).map_err(remote)?;
            Ok(PoolRef {
                name: pool.get_name().map_err(remote)?,
            })
        })
        .await
    }

    async fn storage_pool_create_xml(&self, xml: &str) -> Result<PoolRef, HypervisorError> {
        let xml = xml.to_string();
        let pool = self
            .blocking(move |conn| {
                let pool = StoragePool::create_xml(conn, &xml, 0).map_err(remote)?;
                Ok(PoolRef {
                    name: pool.get_name().map_err(remote)?,
                })
            })
            .await?;
        info!(pool = %pool.name, "Storage pool created");
        Ok(pool)
    }

    async fn storage_vol_lookup_by_name(
        &self,
        pool: &PoolRef,
        name: &str,
    ) -> Result<VolumeRef, HypervisorError> {
        let pool = pool.name.clone();
        let name = name.to_string();
        self.blocking(move |conn| {
            let pool_handle = StoragePool::lookup_by_name(conn, &pool).map_err(remote)?;
            let vol = StorageVol::lookup_by_name(&pool_handle, &name).map_err(remote)?;
            Ok(VolumeRef {
                name: vol.get_name().map_err(remote)?,
                pool,
            })
        })
        .await
    }

    async fn storage_vol_create_xml(
        &self,
        pool: &PoolRef,
        xml: &str,
    ) -> Result<VolumeRef, HypervisorError> {
        let pool = pool.name.clone();
        let xml = xml.to_string();
        let vol = self
            .blocking(move |conn| {
                let pool_handle = StoragePool::lookup_by_name(conn, &pool).map_err(remote)?;
                let vol = StorageVol::create_xml(&pool_handle, &xml, 0).map_err(remote)?;
                Ok(VolumeRef {
                    name: vol.get_name().map_err(remote)?,
                    pool,
                })
            })
            .await?;
        info!(pool = %vol.pool, volume = %vol.name, "Storage volume created");
        Ok(vol)
    }

    async fn storage_vol_delete(&self, vol: &VolumeRef) -> Result<(), HypervisorError> {
        let pool = vol.pool.clone();
        let name = vol.name.clone();
        self.blocking(move |conn| {
            let pool_handle = StoragePool::lookup_by_name(conn, &pool).map_err(remote)?;
            let handle = StorageVol::lookup_by_name(&pool_handle, &name).map_err(remote)?;
            handle.delete(0).map_err(remote)?;
            Ok(())
        })
        .await?;
        info!(pool = %vol.pool, volume = %vol.name, "Storage volume deleted");
        Ok(())
    }

    async fn domain_lookup_by_name(&self, name: &str) -> Result<DomainRef, HypervisorError> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let dom = Domain::lookup_by_name(conn, &name).map_err(remote)?;
            domain_ref(&dom)
        })
        .await
    }

    async fn domain_lookup_by_uuid(&self, uuid: Uuid) -> Result<DomainRef, HypervisorError> {
        self.blocking(move |conn| {
            let dom =
                Domain::lookup_by_uuid_string(conn, &uuid.to_string()).map_err(remote)?;
            domain_ref(&dom)
        })
        .await
    }

    async fn domain_create_xml(&self, xml: &str) -> Result<DomainRef, HypervisorError> {
        let xml = xml.to_string();
        let dom = self
            .blocking(move |conn| {
                let dom = Domain::create_xml(conn, &xml, 0).map_err(remote)?;
                domain_ref(&dom)
            })
            .await?;
        info!(domain = %dom.name, uuid = %dom.uuid, "Domain created");
        Ok(dom)
    }

    async fn domain_get_xml_desc(&self, dom: &DomainRef) -> Result<String, HypervisorError> {
        let uuid = dom.uuid;
        self.blocking(move |conn| {
            let handle =
                Domain::lookup_by_uuid_string(conn, &uuid.to_string()).map_err(remote)?;
            handle.get_xml_desc(0).map_err(remote)
        })
        .await
    }

    async fn domain_destroy(&self, dom: &DomainRef) -> Result<(), HypervisorError> {
        let uuid = dom.uuid;
        self.blocking(move |conn| {
            let handle =
                Domain::lookup_by_uuid_string(conn, &uuid.to_string()).map_err(remote)?;
            handle.destroy().map_err(remote)?;
            Ok(())
        })
        .await?;
        info!(domain = %dom.name, "Domain destroyed");
        Ok(())
    }

    async fn domain_undefine(&self, dom: &DomainRef) -> Result<(), HypervisorError> {
        let uuid = dom.uuid;
        self.blocking(move |conn| {
            let handle =
                Domain::lookup_by_uuid_string(conn, &uuid.to_string()).map_err(remote)?;
            handle.undefine().map_err(remote)?;
            Ok(())
        })
        .await?;
        info!(domain = %dom.name, "Domain undefined");
        Ok(())
    }

    async fn list_all_domains(&self) -> Result<Vec<DomainRef>, HypervisorError> {
        self.blocking(|conn| {
            let domains = conn
                .list_all_domains(
                    virt::sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE
                        | virt::sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE,
                )
                .map_err(remote)?;
            domains.iter().map(domain_ref).collect()
        })
        .await
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        self.blocking(|conn| {
            conn.close()
                .map_err(|e| HypervisorError::Transport(e.to_string()))?;
            Ok(())
        })
        .await?;
        debug!("Hypervisor connection closed");
        Ok(())
    }
}
