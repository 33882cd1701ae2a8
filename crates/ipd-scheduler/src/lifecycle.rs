//! Per-build instance lifecycle.
//!
//! For one `(build, hypervisor)` pair: render the base image's
//! descriptors, provision the storage volume and domain, write the
//! scheduler-side rendezvous record, wait (bounded) for the guest to
//! phone home, open the SSH channel, run the build commands, tear down.
//!
//! Whatever was provisioned is destroyed again on any failure, timeout,
//! or cancellation before the hypervisor slot is released. The
//! hypervisor connection and the SSH session are closed on every exit
//! path.

use std::time::Duration;

use tracing::{debug, info, warn};

use ipd_core::buildspec::Buildspec;
use ipd_core::naming;
use ipd_core::record::{BuildRecord, BuildStatus, InstanceRecord};
use ipd_hypervisor::{DomainRef, Hypervisor, HypervisorError, VolumeRef, descriptor};
use ipd_ssh::{CommandChannel, HostKey};
use ipd_store::keys;

use crate::builder::Builder;
use crate::error::SchedulerError;

/// Storage pool the per-build volumes are cloned into.
const IMAGES_POOL: &str = "ipd-images";

/// Workspace bootstrap run before the buildspec's own commands.
const SETUP_COMMANDS: &[&str] = &["uname -a", "mkdir -p /srv"];

/// What this build has provisioned so far, for teardown on failure.
#[derive(Default)]
struct Provisioned {
    volume: Option<VolumeRef>,
    domain: Option<DomainRef>,
    record_key: Option<String>,
}

pub(crate) async fn run(
    builder: &Builder,
    build_id: u64,
    hv_key: &str,
) -> Result<(), SchedulerError> {
    // Load the build record and its buildspec.
    let fields = builder.store.hgetall(&keys::build(build_id)).await?;
    if fields.is_empty() {
        return Err(SchedulerError::BuildNotFound(build_id));
    }
    let record = BuildRecord::from_fields(build_id, &fields)
        .map_err(|e| SchedulerError::Invalid(e.to_string()))?;
    let spec = Buildspec::parse(&record.buildspec)
        .map_err(|e| SchedulerError::Invalid(e.to_string()))?;

    info!(
        build = build_id,
        hypervisor = hv_key,
        project = %record.project_key,
        commit = %record.commit_id,
        base = %spec.base_domain,
        "Build started"
    );

    // Locate the base image's descriptor templates.
    let domain_path = builder.settings.domain_template_path(&spec.base_domain);
    let volume_path = builder.settings.volume_template_path(&spec.base_domain);
    if !domain_path.exists() || !volume_path.exists() {
        return Err(SchedulerError::DomainNotFound(spec.base_domain.clone()));
    }

    builder
        .store
        .hmset(
            &keys::build(build_id),
            &[("status".to_string(), BuildStatus::Running.to_string())],
        )
        .await?;

    // Render the per-build descriptors.
    let name = naming::instance_name(&record.project_key, build_id);
    let vnc_passwd = naming::generate_password(32);

    let domain_template = std::fs::read_to_string(&domain_path)
        .map_err(|e| SchedulerError::Invalid(format!("{}: {}", domain_path.display(), e)))?;
    let volume_template = std::fs::read_to_string(&volume_path)
        .map_err(|e| SchedulerError::Invalid(format!("{}: {}", volume_path.display(), e)))?;

    let domxml = descriptor::render_domain(&domain_template, &name, &vnc_passwd)
        .map_err(|e| SchedulerError::Invalid(e.to_string()))?;
    let volxml = descriptor::render_volume(&volume_template, &name)
        .map_err(|e| SchedulerError::Invalid(e.to_string()))?;

    // Open the hypervisor connection, scoped so it closes on every path.
    let endpoint = builder
        .hypervisors
        .get(hv_key)
        .ok_or_else(|| SchedulerError::Invalid(format!("unknown hypervisor {}", hv_key)))?;
    let conn = builder.connector.connect(&endpoint.uri()).await?;

    let mut created = Provisioned::default();
    let result = provision_and_build(
        builder, &*conn, build_id, hv_key, &name, &vnc_passwd, &spec, &domxml, &volxml,
        &mut created,
    )
    .await;

    if result.is_err() {
        teardown(builder, &*conn, &created).await;
    }
    if let Err(e) = conn.close().await {
        warn!(build = build_id, error = %e, "Failed to close hypervisor connection");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn provision_and_build(
    builder: &Builder,
    conn: &dyn Hypervisor,
    build_id: u64,
    hv_key: &str,
    name: &str,
    vnc_passwd: &str,
    spec: &Buildspec,
    domxml: &str,
    volxml: &str,
    created: &mut Provisioned,
) -> Result<(), SchedulerError> {
    let mut cancel = builder.cancel_signal();

    // Ensure the image pool exists; a negative lookup falls back to
    // creating it from the pool template.
    let pool = match conn.storage_pool_lookup_by_name(IMAGES_POOL).await {
        Ok(pool) => pool,
        Err(HypervisorError::Remote(reason)) => {
            debug!(build = build_id, reason = %reason, "Image pool missing, creating");
            let template_path = builder.settings.pool_template_path();
            let template = std::fs::read_to_string(&template_path)
                .map_err(|e| SchedulerError::Invalid(format!("{}: {}", template_path.display(), e)))?;
            conn.storage_pool_create_xml(&template).await?
        }
        Err(e) => return Err(e.into()),
    };

    // Clone the base volume and boot the domain.
    created.volume = Some(conn.storage_vol_create_xml(&pool, volxml).await?);
    let dom = conn.domain_create_xml(domxml).await?;
    created.domain = Some(dom.clone());

    // Read back the hypervisor-assigned facts.
    let desc = conn.domain_get_xml_desc(&dom).await?;
    let facts = descriptor::extract_domain_info(&desc)
        .map_err(|e| SchedulerError::Invalid(e.to_string()))?;

    // Phase-1 rendezvous record: everything the metadata service and
    // operators need before the guest reports in.
    let record_key = keys::instancedata(&facts.uuid.to_string());
    let instance = InstanceRecord {
        hypervisor: hv_key.to_string(),
        mac_address: facts.mac_address.clone(),
        vncport: facts.vnc_port.clone(),
        vncpasswd: vnc_passwd.to_string(),
        ..Default::default()
    };
    builder
        .store
        .hmset(&record_key, &instance.phase1_fields())
        .await?;
    created.record_key = Some(record_key.clone());

    info!(
        build = build_id,
        instance = name,
        uuid = %facts.uuid,
        mac = %facts.mac_address,
        vnc_port = %facts.vnc_port,
        "Instance provisioned, waiting for phone-home"
    );

    // Wait for the guest to phone home, polling once per second with a
    // bounded deadline.
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(builder.settings.phone_home_timeout_secs);
    loop {
        if *cancel.borrow() {
            return Err(SchedulerError::Cancelled);
        }
        let status = builder.store.hget(&record_key, "status").await?;
        if status.as_deref() == Some("running") {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SchedulerError::Timeout("guest phone-home"));
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = cancel.changed() => {}
        }
    }

    // Re-read the whole record; the guest-side fields were written in one
    // call with the status flip.
    let fields = builder.store.hgetall(&record_key).await?;
    let instance = InstanceRecord::from_fields(&fields);
    let ip_address = instance.ip_address.clone().ok_or_else(|| {
        SchedulerError::Invalid("phone-home record has no ip_address".to_string())
    })?;
    let host_key_line = instance
        .host_key()
        .ok_or_else(|| SchedulerError::Invalid("phone-home record has no host key".to_string()))?;
    let host_key = HostKey::parse_openssh(host_key_line)?;

    info!(
        build = build_id,
        instance = name,
        ip = %ip_address,
        "Guest phoned home, connecting"
    );

    if *cancel.borrow() {
        return Err(SchedulerError::Cancelled);
    }

    // Run the build over the SSH channel; the transport is torn down on
    // every path.
    let channel = builder
        .ssh
        .connect(&ip_address, &builder.settings.ssh_user, &host_key)
        .await?;
    let run_result = run_commands(&*channel, spec, build_id).await;
    if let Err(e) = channel.disconnect().await {
        warn!(build = build_id, error = %e, "Failed to close ssh transport");
    }
    run_result
}

async fn run_commands(
    channel: &dyn CommandChannel,
    spec: &Buildspec,
    build_id: u64,
) -> Result<(), SchedulerError> {
    for command in SETUP_COMMANDS.iter().copied().chain(spec.commands()) {
        let output = channel.exec_command(command).await?;
        if !output.success() {
            warn!(
                build = build_id,
                command,
                exit = output.exit_status,
                stderr = %output.stderr,
                "Build command failed"
            );
            return Err(SchedulerError::CommandFailed {
                command: command.to_string(),
                exit_status: output.exit_status,
            });
        }
        debug!(build = build_id, command, "Command finished");
    }
    Ok(())
}

/// Best-effort teardown of whatever this build provisioned.
async fn teardown(builder: &Builder, conn: &dyn Hypervisor, created: &Provisioned) {
    if let Some(dom) = &created.domain {
        if let Err(e) = conn.domain_destroy(dom).await {
            warn!(domain = %dom.name, error = %e, "Teardown: destroy failed");
        }
        if let Err(e) = conn.domain_undefine(dom).await {
            debug!(domain = %dom.name, error = %e, "Teardown: undefine failed");
        }
    }
    if let Some(vol) = &created.volume {
        if let Err(e) = conn.storage_vol_delete(vol).await {
            warn!(volume = %vol.name, error = %e, "Teardown: volume delete failed");
        }
    }
    if let Some(key) = &created.record_key {
        if let Err(e) = builder.store.del(key).await {
            warn!(key = %key, error = %e, "Teardown: record delete failed");
        }
    }
}
