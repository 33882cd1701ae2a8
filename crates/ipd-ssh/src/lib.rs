// ipd-ssh: persistent SSH session into a freshly booted guest,
// multiplexing sequential exec requests over one transport.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_ssh2_tokio::ServerCheckMethod;
use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// SSH failure. Authentication failure, host-key mismatch, and transport
/// drops all fail the build the same way; retry policy lives with the
/// caller, not here.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh error: {0}")]
    Ssh(String),
    #[error("timed out establishing ssh transport")]
    Timeout,
}

impl From<async_ssh2_tokio::Error> for SshError {
    fn from(e: async_ssh2_tokio::Error) -> Self {
        SshError::Ssh(e.to_string())
    }
}

/// Output of one executed command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// A guest host key as reported in the phone-home payload: one line in
/// OpenSSH format (`ssh-rsa AAAA... [comment]`). The sole entry of the
/// in-memory known-hosts table for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    pub base64: String,
}

impl HostKey {
    /// Parse an OpenSSH public key line.
    pub fn parse_openssh(line: &str) -> Result<Self, SshError> {
        let mut parts = line.split_whitespace();
        let algorithm = parts
            .next()
            .ok_or_else(|| SshError::Ssh(format!("empty host key line: {:?}", line)))?;
        let base64 = parts
            .next()
            .ok_or_else(|| SshError::Ssh(format!("host key has no key material: {:?}", line)))?;
        if !algorithm.starts_with("ssh-") && !algorithm.starts_with("ecdsa-") {
            return Err(SshError::Ssh(format!(
                "unrecognized host key algorithm: {:?}",
                algorithm
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            base64: base64.to_string(),
        })
    }
}

/// An open command channel into a guest. Commands run sequentially; each
/// opens a channel on the existing transport and collects output until
/// channel close.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn exec_command(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Cleanly tear down the transport, blocking until closed.
    async fn disconnect(&self) -> Result<(), SshError>;
}

/// Opens command channels into guests.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        host_key: &HostKey,
    ) -> Result<Box<dyn CommandChannel>, SshError>;
}

/// Production connector: public-key auth with the scheduler's private
/// key, host-key validation pinned to the phone-home-reported key.
pub struct OpensshConnector {
    private_key_path: PathBuf,
    connect_timeout: Duration,
    port: u16,
}

impl OpensshConnector {
    pub fn new(private_key_path: &Path, connect_timeout: Duration) -> Self {
        Self {
            private_key_path: private_key_path.to_path_buf(),
            connect_timeout,
            port: 22,
        }
    }
}

struct OpensshChannel {
    client: Client,
    host: String,
}

#[async_trait]
impl SshConnector for OpensshConnector {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        host_key: &HostKey,
    ) -> Result<Box<dyn CommandChannel>, SshError> {
        let key_path = self.private_key_path.to_string_lossy().to_string();
        let auth = AuthMethod::with_key_file(&key_path, None);
        let check = ServerCheckMethod::PublicKey(host_key.base64.clone());

        debug!(host, user, "Opening ssh transport");
        let client = tokio::time::timeout(
            self.connect_timeout,
            Client::connect((host.to_string(), self.port), user, auth, check),
        )
        .await
        .map_err(|_| SshError::Timeout)??;

        info!(host, user, "Ssh transport established");
        Ok(Box::new(OpensshChannel {
            client,
            host: host.to_string(),
        }))
    }
}

#[async_trait]
impl CommandChannel for OpensshChannel {
    async fn exec_command(&self, command: &str) -> Result<ExecOutput, SshError> {
        debug!(host = %self.host, command, "Executing command");
        let result = self.client.execute(command).await?;
        Ok(ExecOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_status: result.exit_status,
        })
    }

    async fn disconnect(&self) -> Result<(), SshError> {
        debug!(host = %self.host, "Closing ssh transport");
        self.client.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openssh_host_key() {
        let key = HostKey::parse_openssh("ssh-rsa AAAAB3NzaC1yc2E root@demo-1").unwrap();
        assert_eq!(key.algorithm, "ssh-rsa");
        assert_eq!(key.base64, "AAAAB3NzaC1yc2E");
    }

    #[test]
    fn test_parse_openssh_without_comment() {
        let key = HostKey::parse_openssh("ssh-ed25519 AAAAC3Nz").unwrap();
        assert_eq!(key.algorithm, "ssh-ed25519");
        assert_eq!(key.base64, "AAAAC3Nz");
    }

    #[test]
    fn test_parse_openssh_ecdsa() {
        let key =
            HostKey::parse_openssh("ecdsa-sha2-nistp256 AAAAE2VjZHNh host").unwrap();
        assert_eq!(key.algorithm, "ecdsa-sha2-nistp256");
    }

    #[test]
    fn test_parse_openssh_rejects_garbage() {
        assert!(HostKey::parse_openssh("").is_err());
        assert!(HostKey::parse_openssh("ssh-rsa").is_err());
        assert!(HostKey::parse_openssh("banana AAAA").is_err());
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            stdout: "Linux".to_string(),
            stderr: String::new(),
            exit_status: 0,
        };
        let failed = ExecOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_status: 2,
        };
        assert!(ok.success());
        assert!(!failed.success());
    }
}
