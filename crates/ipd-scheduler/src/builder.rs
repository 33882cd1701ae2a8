//! The build scheduler.
//!
//! Admission (`schedule_build`) persists a build record and enqueues it;
//! the pairing loop blocks on the hypervisor slot queue, then on the
//! build queue, and spawns one lifecycle task per pair. The slot queue is
//! pre-loaded with each configured hypervisor key exactly once, and every
//! lifecycle exit path re-enqueues the key, so the number of in-flight
//! builds plus the queue depth always equals the pool size.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ipd_core::buildspec::Buildspec;
use ipd_core::config::{HypervisorEndpoint, SchedulerSettings};
use ipd_core::naming;
use ipd_core::record::{BuildRecord, BuildStatus};
use ipd_hypervisor::Connector;
use ipd_ssh::SshConnector;
use ipd_store::{Store, keys};

use crate::error::SchedulerError;
use crate::fetch::BuildspecFetcher;
use crate::lifecycle;
use crate::projects::ProjectRegistry;

/// Message on the hypervisor slot queue.
enum SlotMessage {
    Free(String),
    Stop,
}

/// Message on the pending-build queue.
enum BuildMessage {
    Build(u64),
    Stop,
}

pub struct Builder {
    pub(crate) registry: Arc<ProjectRegistry>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) ssh: Arc<dyn SshConnector>,
    pub(crate) fetcher: Arc<dyn BuildspecFetcher>,
    pub(crate) settings: SchedulerSettings,
    pub(crate) hypervisors: HashMap<String, HypervisorEndpoint>,

    slots_tx: mpsc::Sender<SlotMessage>,
    builds_tx: mpsc::Sender<BuildMessage>,
    queues: Mutex<Option<(mpsc::Receiver<SlotMessage>, mpsc::Receiver<BuildMessage>)>>,
    stopped_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl Builder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProjectRegistry>,
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        ssh: Arc<dyn SshConnector>,
        fetcher: Arc<dyn BuildspecFetcher>,
        settings: SchedulerSettings,
        hypervisors: Vec<HypervisorEndpoint>,
    ) -> Arc<Self> {
        // One slot per hypervisor, plus room for the shutdown sentinel.
        let (slots_tx, slots_rx) = mpsc::channel(hypervisors.len() + 1);
        for endpoint in &hypervisors {
            // Cannot fail: the channel was sized for exactly this.
            let _ = slots_tx.try_send(SlotMessage::Free(endpoint.key.clone()));
        }

        let (builds_tx, builds_rx) = mpsc::channel(settings.build_queue_depth.max(1) + 1);
        let (stopped_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);

        Arc::new(Self {
            registry,
            store,
            connector,
            ssh,
            fetcher,
            settings,
            hypervisors: hypervisors
                .into_iter()
                .map(|h| (h.key.clone(), h))
                .collect(),
            slots_tx,
            builds_tx,
            queues: Mutex::new(Some((slots_rx, builds_rx))),
            stopped_tx,
            cancel_tx,
        })
    }

    /// Spawn the pairing loop. Idempotent; later calls return a no-op
    /// handle.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let receivers = self.queues.lock().unwrap().take();
        let builder = Arc::clone(self);
        tokio::spawn(async move {
            match receivers {
                Some((slots_rx, builds_rx)) => builder.pairing_loop(slots_rx, builds_rx).await,
                None => warn!("Pairing loop already running"),
            }
        })
    }

    /// Admit a build: look up the project, fetch its buildspec at the
    /// commit, allocate an id, persist the record, enqueue. Returns the
    /// build reference `<project_key>-<id>`.
    ///
    /// A failed fetch never consumes a build id.
    pub async fn schedule_build(
        &self,
        project_key: &str,
        commit_id: &str,
    ) -> Result<String, SchedulerError> {
        let project = self.registry.get(project_key).await?;

        let spec = match self.fetcher.fetch(&project.repo, commit_id).await {
            Ok(yaml) => match Buildspec::parse(&yaml) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(project = project_key, commit = commit_id, error = %e, "Buildspec unparsable");
                    return Err(SchedulerError::BuildspecNotFound {
                        project_key: project_key.to_string(),
                        commit_id: commit_id.to_string(),
                    });
                }
            },
            Err(e) => {
                warn!(project = project_key, commit = commit_id, error = %e, "Buildspec fetch failed");
                return Err(SchedulerError::BuildspecNotFound {
                    project_key: project_key.to_string(),
                    commit_id: commit_id.to_string(),
                });
            }
        };

        let id = self.store.incr(keys::BUILDS_COUNTER).await?;
        let record = BuildRecord {
            id,
            status: BuildStatus::Waiting,
            project_key: project_key.to_string(),
            commit_id: commit_id.to_string(),
            buildspec: spec
                .to_yaml()
                .map_err(|e| SchedulerError::Invalid(e.to_string()))?,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store
            .hmset(&keys::build(id), &record.to_fields())
            .await?;

        self.builds_tx
            .send(BuildMessage::Build(id))
            .await
            .map_err(|_| SchedulerError::Invalid("scheduler is shut down".to_string()))?;

        info!(build = id, project = project_key, commit = commit_id, "Build scheduled");
        Ok(naming::instance_name(project_key, id))
    }

    /// All persisted builds, in id order.
    pub async fn list_builds(&self) -> Result<Vec<BuildRecord>, SchedulerError> {
        let count = self
            .store
            .get(keys::BUILDS_COUNTER)
            .await?
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mut builds = Vec::new();
        for id in 1..=count {
            let fields = self.store.hgetall(&keys::build(id)).await?;
            if fields.is_empty() {
                continue;
            }
            match BuildRecord::from_fields(id, &fields) {
                Ok(record) => builds.push(record),
                Err(e) => warn!(build = id, error = %e, "Skipping unreadable build record"),
            }
        }
        Ok(builds)
    }

    /// Enqueue shutdown sentinels and wait for the pairing loop to exit.
    /// In-flight builds run to completion.
    pub async fn stop_building(&self) {
        info!("Stopping scheduler");
        let _ = self.slots_tx.send(SlotMessage::Stop).await;
        let _ = self.builds_tx.send(BuildMessage::Stop).await;

        let mut stopped = self.stopped_tx.subscribe();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
    }

    /// Signal every in-flight lifecycle to cancel at its next suspension
    /// point. Cancelled builds clean up their instance before releasing
    /// the hypervisor slot.
    pub fn cancel_builds(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    async fn pairing_loop(
        self: Arc<Self>,
        mut slots_rx: mpsc::Receiver<SlotMessage>,
        mut builds_rx: mpsc::Receiver<BuildMessage>,
    ) {
        info!(pool = self.hypervisors.len(), "Pairing loop started");
        loop {
            // Wait for the next free hypervisor.
            let hv_key = match slots_rx.recv().await {
                Some(SlotMessage::Free(key)) => key,
                Some(SlotMessage::Stop) | None => break,
            };

            // Wait for a build.
            let build_id = match builds_rx.recv().await {
                Some(BuildMessage::Build(id)) => id,
                Some(BuildMessage::Stop) | None => break,
            };

            info!(build = build_id, hypervisor = %hv_key, "Build paired with hypervisor");
            let builder = Arc::clone(&self);
            tokio::spawn(async move {
                builder.run_one(build_id, hv_key).await;
            });
        }
        info!("Pairing loop stopped");
        let _ = self.stopped_tx.send(true);
    }

    /// Run one build's lifecycle, record its terminal status, and return
    /// the hypervisor slot to the pool regardless of outcome.
    async fn run_one(&self, build_id: u64, hv_key: String) {
        let result = lifecycle::run(self, build_id, &hv_key).await;
        let status = match &result {
            Ok(()) => {
                info!(build = build_id, "Build finished");
                BuildStatus::Done
            }
            Err(SchedulerError::Cancelled) => {
                warn!(build = build_id, "Build cancelled");
                BuildStatus::Failed
            }
            Err(e) => {
                error!(build = build_id, error = %e, "Build failed");
                BuildStatus::Failed
            }
        };

        if let Err(e) = self
            .store
            .hmset(
                &keys::build(build_id),
                &[("status".to_string(), status.to_string())],
            )
            .await
        {
            error!(build = build_id, error = %e, "Failed to record build status");
        }

        // The slot returns on every exit path. During shutdown the
        // receiver may already be gone; the key is not needed then.
        if self
            .slots_tx
            .send(SlotMessage::Free(hv_key.clone()))
            .await
            .is_err()
        {
            debug!(hypervisor = %hv_key, "Slot released during shutdown");
        }
    }
}
