use anyhow::{Result, bail};
use rand::Rng;

/// Characters a generated VNC password is drawn from: ASCII letters,
/// digits, and punctuation.
const PASSWORD_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789\
      !\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Validate a project key: alphanumeric plus hyphens/underscores, 1-63 chars.
pub fn validate_project_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 63 {
        bail!("Project key must be 1-63 characters, got {}", key.len());
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "Project key must be alphanumeric plus hyphens/underscores: {:?}",
            key
        );
    }
    Ok(())
}

/// Instance name for a build: `<project_key>-<build_id>`. Doubles as the
/// build reference returned to API callers.
pub fn instance_name(project_key: &str, build_id: u64) -> String {
    format!("{}-{}", project_key, build_id)
}

/// Generate a random password of `length` characters.
pub fn generate_password(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| PASSWORD_CHARS[rng.gen_range(0..PASSWORD_CHARS.len())] as char)
        .collect()
}
