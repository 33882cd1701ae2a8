use thiserror::Error;

use ipd_hypervisor::HypervisorError;
use ipd_ssh::SshError;
use ipd_store::StoreError;

/// Failures surfaced by the registry, the scheduler, and the lifecycle
/// driver.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("project does not exist: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectAlreadyExists(String),

    #[error("buildspec not found for {project_key} at {commit_id}")]
    BuildspecNotFound {
        project_key: String,
        commit_id: String,
    },

    #[error("build does not exist: {0}")]
    BuildNotFound(u64),

    #[error("base domain descriptors not found: {0}")]
    DomainNotFound(String),

    #[error("build command {command:?} exited with status {exit_status}")]
    CommandFailed { command: String, exit_status: u32 },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SchedulerError::ProjectNotFound("demo".to_string()).to_string(),
            "project does not exist: demo"
        );
        assert_eq!(
            SchedulerError::Timeout("guest phone-home").to_string(),
            "timed out waiting for guest phone-home"
        );
        let err = SchedulerError::CommandFailed {
            command: "make test".to_string(),
            exit_status: 2,
        };
        assert!(err.to_string().contains("make test"));
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn test_error_conversions() {
        let err: SchedulerError = StoreError::Store("down".to_string()).into();
        assert!(matches!(err, SchedulerError::Store(_)));
        let err: SchedulerError = HypervisorError::Timeout.into();
        assert!(matches!(err, SchedulerError::Hypervisor(_)));
        let err: SchedulerError = SshError::Timeout.into();
        assert!(matches!(err, SchedulerError::Ssh(_)));
    }
}
