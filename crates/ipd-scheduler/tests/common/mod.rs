//! Shared test harness: an in-memory store, a fake hypervisor, a fake
//! SSH channel, and a scriptable buildspec fetcher wired into a Builder.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use ipd_core::config::{HypervisorEndpoint, HypervisorTransport, SchedulerSettings};
use ipd_hypervisor::fake::FakeConnector;
use ipd_scheduler::builder::Builder;
use ipd_scheduler::fetch::BuildspecFetcher;
use ipd_scheduler::poller::LogPoller;
use ipd_scheduler::projects::ProjectRegistry;
use ipd_ssh::{CommandChannel, ExecOutput, HostKey, SshConnector, SshError};
use ipd_store::{MemoryStore, Store, keys};

pub const DOMAIN_TEMPLATE: &str = r#"<domain type='kvm'>
  <name>base</name>
  <devices>
    <disk type='volume' device='disk'>
      <source pool='ipd-images' volume='base'/>
    </disk>
    <interface type='bridge'>
      <source bridge='br0'/>
    </interface>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>"#;

pub const VOLUME_TEMPLATE: &str = r#"<volume>
  <name>base</name>
  <capacity unit='G'>10</capacity>
</volume>"#;

pub const POOL_TEMPLATE: &str = "<pool type='dir'><name>ipd-images</name></pool>";

pub const UBUNTU_SPEC: &str = "base_domain: ubuntu\ninstall: [echo install]\nstart: [echo start]\n";

pub const HOST_KEY_LINE: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAATESTKEY root@guest";

#[derive(Default)]
pub struct SshState {
    pub commands: Mutex<Vec<String>>,
    pub connects: Mutex<Vec<(String, String, String)>>,
    pub fail_command: Mutex<Option<String>>,
}

#[derive(Clone, Default)]
pub struct FakeSshConnector {
    pub state: Arc<SshState>,
}

struct FakeChannel {
    state: Arc<SshState>,
}

#[async_trait]
impl SshConnector for FakeSshConnector {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        host_key: &HostKey,
    ) -> Result<Box<dyn CommandChannel>, SshError> {
        self.state.connects.lock().unwrap().push((
            host.to_string(),
            user.to_string(),
            host_key.base64.clone(),
        ));
        Ok(Box::new(FakeChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl CommandChannel for FakeChannel {
    async fn exec_command(&self, command: &str) -> Result<ExecOutput, SshError> {
        self.state.commands.lock().unwrap().push(command.to_string());
        let fail = self.state.fail_command.lock().unwrap().clone();
        if fail.as_deref() == Some(command) {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "command failed".to_string(),
                exit_status: 1,
            });
        }
        Ok(ExecOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_status: 0,
        })
    }

    async fn disconnect(&self) -> Result<(), SshError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    spec: Mutex<Option<String>>,
}

impl FakeFetcher {
    pub fn with_spec(yaml: &str) -> Self {
        Self {
            spec: Mutex::new(Some(yaml.to_string())),
        }
    }

    pub fn set_spec(&self, yaml: &str) {
        *self.spec.lock().unwrap() = Some(yaml.to_string());
    }

    /// Make every subsequent fetch fail.
    pub fn clear_spec(&self) {
        *self.spec.lock().unwrap() = None;
    }
}

#[async_trait]
impl BuildspecFetcher for FakeFetcher {
    async fn fetch(&self, _repo_url: &str, _commit_id: &str) -> Result<String> {
        self.spec
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HTTP 404 for buildspec"))
    }
}

pub fn endpoint(key: &str) -> HypervisorEndpoint {
    HypervisorEndpoint {
        key: key.to_string(),
        address: format!("{}.test", key),
        port: 16509,
        driver: "qemu".to_string(),
        mode: "system".to_string(),
        transport: HypervisorTransport::Tcp,
    }
}

pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub connector: FakeConnector,
    pub ssh: FakeSshConnector,
    pub fetcher: Arc<FakeFetcher>,
    pub registry: Arc<ProjectRegistry>,
    pub builder: Arc<Builder>,
    pub workdir: TempDir,
}

pub async fn env<F>(hypervisor_keys: &[&str], configure: F) -> TestEnv
where
    F: FnOnce(&mut SchedulerSettings),
{
    let workdir = tempfile::tempdir().unwrap();
    let base = workdir.path();
    std::fs::create_dir_all(base.join("domains")).unwrap();
    std::fs::create_dir_all(base.join("volumes")).unwrap();
    std::fs::create_dir_all(base.join("base-vm")).unwrap();
    std::fs::write(base.join("domains/ubuntu.xml"), DOMAIN_TEMPLATE).unwrap();
    std::fs::write(base.join("volumes/ubuntu.xml"), VOLUME_TEMPLATE).unwrap();
    std::fs::write(base.join("base-vm/pool.xml"), POOL_TEMPLATE).unwrap();

    let mut settings = SchedulerSettings::default();
    settings.workdir = base.to_path_buf();
    configure(&mut settings);

    let store = Arc::new(MemoryStore::new());
    let connector = FakeConnector::new();
    let ssh = FakeSshConnector::default();
    let fetcher = Arc::new(FakeFetcher::with_spec(UBUNTU_SPEC));

    let registry = Arc::new(ProjectRegistry::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(LogPoller::new()),
        settings.clone(),
    ));

    let builder = Builder::new(
        Arc::clone(&registry),
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(connector.clone()),
        Arc::new(ssh.clone()),
        Arc::clone(&fetcher) as Arc<dyn BuildspecFetcher>,
        settings,
        hypervisor_keys.iter().map(|k| endpoint(k)).collect(),
    );

    TestEnv {
        store,
        connector,
        ssh,
        fetcher,
        registry,
        builder,
        workdir,
    }
}

/// Poll the store until a hash field appears, panicking after 5 seconds.
pub async fn wait_for_field(store: &MemoryStore, key: &str, field: &str) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = store.hget(key, field).await.unwrap() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}.{}", key, field);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the store until a build reaches the expected status.
pub async fn wait_for_build_status(store: &MemoryStore, build_id: u64, expected: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = store.hget(&keys::build(build_id), "status").await.unwrap();
        if status.as_deref() == Some(expected) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for build {} to reach {:?}, last saw {:?}",
                build_id, expected, status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Simulate a guest phone-home: one atomic write of the guest-side fields.
pub async fn phone_home(store: &MemoryStore, uuid: Uuid, hostname: &str) {
    store
        .hmset(
            &keys::instancedata(&uuid.to_string()),
            &[
                ("hostname".to_string(), hostname.to_string()),
                ("status".to_string(), "running".to_string()),
                ("ip_address".to_string(), "10.0.0.5".to_string()),
                ("pub_key_rsa".to_string(), HOST_KEY_LINE.to_string()),
            ],
        )
        .await
        .unwrap();
}
