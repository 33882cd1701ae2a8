use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name of the build specification at the root of a project repository.
pub const BUILDSPEC_FILE: &str = "Buildspec";

/// A project's build specification.
///
/// `base_domain` names a pre-seeded domain/volume descriptor pair on the
/// scheduler host. The command lists are opaque to the scheduler; they are
/// executed in order over the SSH channel, `install` before `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buildspec {
    pub base_domain: String,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub start: Vec<String>,
}

impl Buildspec {
    /// Parse a buildspec from its YAML source.
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).with_context(|| "Failed to parse buildspec YAML")
    }

    /// Serialize back to YAML for persistence in the build record.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).with_context(|| "Failed to serialize buildspec")
    }

    /// All build commands in execution order.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.install
            .iter()
            .chain(self.start.iter())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let spec = Buildspec::parse("base_domain: ubuntu\n").unwrap();
        assert_eq!(spec.base_domain, "ubuntu");
        assert!(spec.install.is_empty());
        assert!(spec.start.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let yaml = r#"
base_domain: ubuntu
install:
  - apt-get update
  - apt-get install -y build-essential
start:
  - make test
"#;
        let spec = Buildspec::parse(yaml).unwrap();
        assert_eq!(spec.base_domain, "ubuntu");
        assert_eq!(spec.install.len(), 2);
        assert_eq!(spec.start, vec!["make test"]);
    }

    #[test]
    fn test_parse_missing_base_domain() {
        assert!(Buildspec::parse("install:\n  - make\n").is_err());
    }

    #[test]
    fn test_commands_order() {
        let yaml = "base_domain: ubuntu\ninstall: [a, b]\nstart: [c]\n";
        let spec = Buildspec::parse(yaml).unwrap();
        let commands: Vec<&str> = spec.commands().collect();
        assert_eq!(commands, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = "base_domain: centos\ninstall: [yum install -y git]\n";
        let spec = Buildspec::parse(yaml).unwrap();
        let parsed = Buildspec::parse(&spec.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed.base_domain, "centos");
        assert_eq!(parsed.install, vec!["yum install -y git"]);
    }
}
