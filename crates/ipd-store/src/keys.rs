//! Key layout of the persisted state.

/// Set of registered project keys.
pub const PROJECTS_SET: &str = "projects";

/// Integer counter allocating build ids.
pub const BUILDS_COUNTER: &str = "builds";

/// String key holding a project's repository URL.
pub fn project(key: &str) -> String {
    format!("project:{}", key)
}

/// Hash key holding a build record.
pub fn build(id: u64) -> String {
    format!("build:{}", id)
}

/// Hash key holding an instance rendezvous record, by domain UUID.
pub fn instancedata(uuid: &str) -> String {
    format!("instancedata:{}", uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(project("demo"), "project:demo");
        assert_eq!(build(42), "build:42");
        assert_eq!(
            instancedata("8e21b02c-1e9f-4efc-9d5c-2f5e0f0a9a31"),
            "instancedata:8e21b02c-1e9f-4efc-9d5c-2f5e0f0a9a31"
        );
    }
}
