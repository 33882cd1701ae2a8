//! In-memory hypervisor fake.
//!
//! Implements the same connection contract as the libvirt backend over
//! process-local state, with an operation log the test suites assert on.
//! Domains created through the fake get scripted (or random) UUIDs, a
//! fixed MAC address, and a fixed VNC port, so descriptor extraction
//! works on the synthesized XML exactly as it does against libvirt.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::descriptor;
use crate::{Connector, DomainRef, Hypervisor, HypervisorError, PoolRef, VolumeRef};

#[derive(Debug, Clone)]
struct FakeDomain {
    dom: DomainRef,
    xml: String,
}

#[derive(Default)]
struct FakeState {
    ops: Vec<String>,
    pools: Vec<String>,
    volumes: Vec<VolumeRef>,
    domains: Vec<FakeDomain>,
    scripted_uuids: VecDeque<Uuid>,
    connects: usize,
    closes: usize,
}

/// Shared fake hypervisor state. Clone the connector freely; all handles
/// observe the same state.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
    /// MAC address synthesized into created domains.
    pub mac_address: String,
    /// VNC port synthesized into created domains.
    pub vnc_port: String,
    /// When set, `connect` fails with a transport error.
    pub refuse_connections: bool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            mac_address: "52:54:00:aa:bb:cc".to_string(),
            vnc_port: "5900".to_string(),
            refuse_connections: false,
        }
    }

    /// Queue a UUID for the next created domain.
    pub fn script_uuid(&self, uuid: Uuid) {
        self.state.lock().unwrap().scripted_uuids.push_back(uuid);
    }

    /// Pre-seed an existing domain so metadata lookups resolve it.
    pub fn seed_domain(&self, uuid: Uuid, name: &str) {
        let mut state = self.state.lock().unwrap();
        let xml = synthesize_domain_xml(name, uuid, &self.mac_address, &self.vnc_port);
        state.domains.push(FakeDomain {
            dom: DomainRef {
                uuid,
                name: name.to_string(),
            },
            xml,
        });
    }

    /// Pre-seed an existing storage pool.
    pub fn seed_pool(&self, name: &str) {
        self.state.lock().unwrap().pools.push(name.to_string());
    }

    /// The operations performed so far, oldest first.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Number of connections opened.
    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Number of connections closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Domains currently defined.
    pub fn domains(&self) -> Vec<DomainRef> {
        self.state
            .lock()
            .unwrap()
            .domains
            .iter()
            .map(|d| d.dom.clone())
            .collect()
    }

    /// Volumes currently defined.
    pub fn volumes(&self) -> Vec<VolumeRef> {
        self.state.lock().unwrap().volumes.clone()
    }
}

fn synthesize_domain_xml(name: &str, uuid: Uuid, mac: &str, vnc_port: &str) -> String {
    format!(
        "<domain type='kvm'>\n  <name>{}</name>\n  <uuid>{}</uuid>\n  <devices>\n    \
         <interface type='bridge'><mac address='{}'/></interface>\n    \
         <graphics type='vnc' port='{}'/>\n  </devices>\n</domain>\n",
        name, uuid, mac, vnc_port
    )
}

struct FakeConnection {
    connector: FakeConnector,
}

impl FakeConnection {
    fn log(&self, op: String) {
        self.connector.state.lock().unwrap().ops.push(op);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Hypervisor>, HypervisorError> {
        if self.refuse_connections {
            return Err(HypervisorError::Transport(format!(
                "connection refused: {}",
                uri
            )));
        }
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        state.ops.push(format!("connect {}", uri));
        drop(state);
        Ok(Box::new(FakeConnection {
            connector: self.clone(),
        }))
    }
}

#[async_trait]
impl Hypervisor for FakeConnection {
    async fn storage_pool_lookup_by_name(&self, name: &str) -> Result<PoolRef, HypervisorError> {
        self.log(format!("storage_pool_lookup_by_name {}", name));
        let state = self.connector.state.lock().unwrap();
        if state.pools.iter().any(|p| p == name) {
            Ok(PoolRef {
                name: name.to_string(),
            })
        } else {
            Err(HypervisorError::Remote(format!(
                "Storage pool not found: {}",
                name
            )))
        }
    }

    async fn storage_pool_create_xml(&self, xml: &str) -> Result<PoolRef, HypervisorError> {
        let name = descriptor::extract_name(xml)
            .map_err(|e| HypervisorError::Remote(e.to_string()))?;
        self.log(format!("storage_pool_create_xml {}", name));
        self.connector.state.lock().unwrap().pools.push(name.clone());
        Ok(PoolRef { name })
    }

    async fn storage_vol_lookup_by_name(
        &self,
        pool: &PoolRef,
        name: &str,
    ) -> Result<VolumeRef, HypervisorError> {
        self.log(format!("storage_vol_lookup_by_name {}/{}", pool.name, name));
        let state = self.connector.state.lock().unwrap();
        state
            .volumes
            .iter()
            .find(|v| v.pool == pool.name && v.name == name)
            .cloned()
            .ok_or_else(|| HypervisorError::Remote(format!("Storage volume not found: {}", name)))
    }

    async fn storage_vol_create_xml(
        &self,
        pool: &PoolRef,
        xml: &str,
    ) -> Result<VolumeRef, HypervisorError> {
        let name = descriptor::extract_name(xml)
            .map_err(|e| HypervisorError::Remote(e.to_string()))?;
        self.log(format!("storage_vol_create_xml {}/{}", pool.name, name));
        let vol = VolumeRef {
            pool: pool.name.clone(),
            name,
        };
        self.connector.state.lock().unwrap().volumes.push(vol.clone());
        Ok(vol)
    }

    async fn storage_vol_delete(&self, vol: &VolumeRef) -> Result<(), HypervisorError> {
        self.log(format!("storage_vol_delete {}/{}", vol.pool, vol.name));
        let mut state = self.connector.state.lock().unwrap();
        let before = state.volumes.len();
        state.volumes.retain(|v| v != vol);
        if state.volumes.len() == before {
            return Err(HypervisorError::Remote(format!(
                "Storage volume not found: {}",
                vol.name
            )));
        }
        Ok(())
    }

    async fn domain_lookup_by_name(&self, name: &str) -> Result<DomainRef, HypervisorError> {
        self.log(format!("domain_lookup_by_name {}", name));
        let state = self.connector.state.lock().unwrap();
        state
            .domains
            .iter()
            .find(|d| d.dom.name == name)
            .map(|d| d.dom.clone())
            .ok_or_else(|| HypervisorError::Remote(format!("Domain not found: {}", name)))
    }

    async fn domain_lookup_by_uuid(&self, uuid: Uuid) -> Result<DomainRef, HypervisorError> {
        self.log(format!("domain_lookup_by_uuid {}", uuid));
        let state = self.connector.state.lock().unwrap();
        state
            .domains
            .iter()
            .find(|d| d.dom.uuid == uuid)
            .map(|d| d.dom.clone())
            .ok_or_else(|| HypervisorError::Remote(format!("Domain not found: {}", uuid)))
    }

    async fn domain_create_xml(&self, xml: &str) -> Result<DomainRef, HypervisorError> {
        let name = descriptor::extract_name(xml)
            .map_err(|e| HypervisorError::Remote(e.to_string()))?;
        self.log(format!("domain_create_xml {}", name));
        let mut state = self.connector.state.lock().unwrap();
        let uuid = state
            .scripted_uuids
            .pop_front()
            .unwrap_or_else(Uuid::new_v4);
        let dom = DomainRef {
            uuid,
            name: name.clone(),
        };
        let xml = synthesize_domain_xml(
            &name,
            uuid,
            &self.connector.mac_address,
            &self.connector.vnc_port,
        );
        state.domains.push(FakeDomain {
            dom: dom.clone(),
            xml,
        });
        Ok(dom)
    }

    async fn domain_get_xml_desc(&self, dom: &DomainRef) -> Result<String, HypervisorError> {
        self.log(format!("domain_get_xml_desc {}", dom.name));
        let state = self.connector.state.lock().unwrap();
        state
            .domains
            .iter()
            .find(|d| d.dom.uuid == dom.uuid)
            .map(|d| d.xml.clone())
            .ok_or_else(|| HypervisorError::Remote(format!("Domain not found: {}", dom.uuid)))
    }

    async fn domain_destroy(&self, dom: &DomainRef) -> Result<(), HypervisorError> {
        self.log(format!("domain_destroy {}", dom.name));
        let mut state = self.connector.state.lock().unwrap();
        let before = state.domains.len();
        state.domains.retain(|d| d.dom.uuid != dom.uuid);
        if state.domains.len() == before {
            return Err(HypervisorError::Remote(format!(
                "Domain not found: {}",
                dom.uuid
            )));
        }
        Ok(())
    }

    async fn domain_undefine(&self, dom: &DomainRef) -> Result<(), HypervisorError> {
        self.log(format!("domain_undefine {}", dom.name));
        Ok(())
    }

    async fn list_all_domains(&self) -> Result<Vec<DomainRef>, HypervisorError> {
        self.log("list_all_domains".to_string());
        Ok(self.connector.domains())
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        let mut state = self.connector.state.lock().unwrap();
        state.closes += 1;
        state.ops.push("close".to_string());
        Ok(())
    }
}
