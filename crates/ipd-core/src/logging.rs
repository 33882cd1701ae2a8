//! Logging setup for the ipd daemons.
//!
//! Both binaries are long-running services, so output is always
//! structured JSON. The filter is resolved once at startup: the
//! `RUST_LOG` environment variable wins, then the config file's
//! `[log] filter`, then the built-in default.

use tracing_subscriber::EnvFilter;

/// Directive used when neither `RUST_LOG` nor the config names one.
const DEFAULT_FILTER: &str = "ipd=info,warn";

/// Resolve the effective filter directive from the environment and the
/// configured override.
fn effective_filter(env: Option<&str>, config: Option<&str>) -> String {
    if let Some(directive) = env {
        if !directive.is_empty() {
            return directive.to_string();
        }
    }
    config.unwrap_or(DEFAULT_FILTER).to_string()
}

/// Initialize the global subscriber. Call once at daemon startup, after
/// the config is loaded.
pub fn init(config_filter: Option<&str>) {
    let env = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::new(effective_filter(env.as_deref(), config_filter));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_nothing_set() {
        assert_eq!(effective_filter(None, None), DEFAULT_FILTER);
    }

    #[test]
    fn test_config_filter_beats_default() {
        assert_eq!(
            effective_filter(None, Some("ipd=debug,warn")),
            "ipd=debug,warn"
        );
    }

    #[test]
    fn test_env_beats_config() {
        assert_eq!(
            effective_filter(Some("trace"), Some("ipd=debug")),
            "trace"
        );
    }

    #[test]
    fn test_empty_env_falls_through() {
        assert_eq!(effective_filter(Some(""), Some("ipd=debug")), "ipd=debug");
        assert_eq!(effective_filter(Some(""), None), DEFAULT_FILTER);
    }
}
