//! Project registry.
//!
//! Projects map a unique key to a source repository URL. Registration is
//! guarded by the store's set semantics (an `sadd` that does not grow the
//! set means the key is taken) and starts a repository poller;
//! unregistration removes both entries transactionally and stops the
//! poller.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use ipd_core::config::SchedulerSettings;
use ipd_core::naming;
use ipd_store::{Store, keys};

use crate::error::SchedulerError;
use crate::poller::RepoPoller;

/// A registered project.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub repo: String,
}

pub struct ProjectRegistry {
    store: Arc<dyn Store>,
    poller: Arc<dyn RepoPoller>,
    settings: SchedulerSettings,
}

impl ProjectRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        poller: Arc<dyn RepoPoller>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            poller,
            settings,
        }
    }

    /// Register a project. Fails with `ProjectAlreadyExists` when the key
    /// is taken; the stored repository URL is never overwritten.
    pub async fn register(&self, key: &str, repo_url: &str) -> Result<(), SchedulerError> {
        naming::validate_project_key(key).map_err(|e| SchedulerError::Invalid(e.to_string()))?;

        if !self.store.sadd(keys::PROJECTS_SET, key).await? {
            return Err(SchedulerError::ProjectAlreadyExists(key.to_string()));
        }
        self.store.set(&keys::project(key), repo_url).await?;
        info!(key, repo = repo_url, "Project registered");

        self.poller
            .start(key, &self.settings.poller_workdir(key), repo_url);
        Ok(())
    }

    /// Look up a project by key.
    pub async fn get(&self, key: &str) -> Result<Project, SchedulerError> {
        match self.store.get(&keys::project(key)).await? {
            Some(repo) => Ok(Project { repo }),
            None => Err(SchedulerError::ProjectNotFound(key.to_string())),
        }
    }

    /// All registered project keys.
    pub async fn list(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.store.smembers(keys::PROJECTS_SET).await?)
    }

    /// Unregister a project: transactionally drop the URL entry and the
    /// set membership, stop its poller, remove its poller workdir.
    /// Idempotent on a missing key.
    pub async fn unregister(&self, key: &str) -> Result<(), SchedulerError> {
        self.store
            .del_and_srem(&keys::project(key), keys::PROJECTS_SET, key)
            .await?;
        self.poller.stop(key);

        let workdir = self.settings.poller_workdir(key);
        if workdir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workdir) {
                warn!(key, error = %e, "Failed to remove poller workdir");
            }
        }
        info!(key, "Project unregistered");
        Ok(())
    }

    /// Start pollers for every already-registered project.
    pub async fn start_polling(&self) -> Result<(), SchedulerError> {
        let projects = self.list().await?;
        for key in &projects {
            match self.get(key).await {
                Ok(project) => {
                    self.poller
                        .start(key, &self.settings.poller_workdir(key), &project.repo)
                }
                Err(e) => warn!(key, error = %e, "Skipping poller for broken project entry"),
            }
        }
        info!(projects = projects.len(), "Polling started");
        Ok(())
    }

    /// Stop every poller.
    pub fn stop_polling(&self) {
        self.poller.stop_all();
        info!("Polling stopped");
    }
}
