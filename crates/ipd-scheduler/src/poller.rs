//! Repository poller interface.
//!
//! Registration starts a poller per project; unregistration stops it.
//! The poller compares remote refs against a last-seen state and emits
//! [`RefChange`] events. Actual git polling lives outside the scheduler
//! core; builds are triggered through the admin API.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use tracing::info;

/// A remote ref moved between two polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefChange {
    pub repo: String,
    pub branch: String,
    pub new_commit: String,
    pub old_commit: String,
}

/// Per-project repository poller lifecycle.
pub trait RepoPoller: Send + Sync {
    /// Start polling a project's repository, using `workdir` as the local
    /// clone location.
    fn start(&self, project_key: &str, workdir: &Path, repo_url: &str);

    /// Stop polling a project. Idempotent.
    fn stop(&self, project_key: &str);

    /// Stop every running poller.
    fn stop_all(&self);
}

/// Poller implementation that only logs lifecycle and ref updates.
#[derive(Default)]
pub struct LogPoller {
    active: Mutex<HashSet<String>>,
}

impl LogPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a ref update. Called by the polling machinery when a remote
    /// ref moves.
    pub fn on_change(&self, project_key: &str, change: &RefChange) {
        info!(
            key = project_key,
            repo = %change.repo,
            branch = %change.branch,
            new = %change.new_commit,
            old = %change.old_commit,
            "Repository ref moved"
        );
    }
}

impl RepoPoller for LogPoller {
    fn start(&self, project_key: &str, workdir: &Path, repo_url: &str) {
        let mut active = self.active.lock().unwrap();
        if active.insert(project_key.to_string()) {
            info!(
                key = project_key,
                workdir = %workdir.display(),
                repo = repo_url,
                "Polling started"
            );
        }
    }

    fn stop(&self, project_key: &str) {
        let mut active = self.active.lock().unwrap();
        if active.remove(project_key) {
            info!(key = project_key, "Polling stopped");
        }
    }

    fn stop_all(&self) {
        let mut active = self.active.lock().unwrap();
        for key in active.drain() {
            info!(key = %key, "Polling stopped");
        }
    }
}
