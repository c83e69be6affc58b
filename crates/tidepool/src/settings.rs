//! Process-wide sandbox settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::{ResourceLimits, duration_secs};
use crate::session::{Runtime, SessionConfig};

/// Prefix of process environment variables forwarded into new sandboxes.
pub const DEFAULT_ENV_PREFIX: &str = "TIDEPOOL_CODE_";

/// Settings shared by every session a manager creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Runtime used when an agent does not pick one.
    pub default_runtime: Runtime,
    /// Image used when an agent does not pick one; overrides `default_runtime`.
    pub default_image: Option<String>,
    /// Whether sandboxes may reach the network unless an agent says otherwise.
    pub allow_network: bool,
    /// Sessions unused for this long are reaped.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// How often the reaper runs. Zero disables it.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Process environment variables with this prefix are forwarded, prefix stripped.
    pub env_prefix: String,
    /// Limits for new sessions.
    pub limits: ResourceLimits,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_runtime: Runtime::default(),
            default_image: None,
            allow_network: false,
            idle_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            limits: ResourceLimits::default(),
        }
    }
}

impl SandboxSettings {
    /// Session configuration built from these settings and the current
    /// process environment.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            runtime: self.default_runtime,
            image: self.default_image.clone(),
            allow_network: self.allow_network,
            env: forwarded_env(&self.env_prefix, std::env::vars()),
            limits: self.limits.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Select the variables carrying `prefix` and strip it.
///
/// An empty prefix forwards nothing.
pub fn forwarded_env(
    prefix: &str,
    vars: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    if prefix.is_empty() {
        return BTreeMap::new();
    }
    vars.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.idle_timeout, Duration::from_secs(1800));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(300));
        assert_eq!(settings.env_prefix, "TIDEPOOL_CODE_");
        assert!(!settings.allow_network);
    }

    #[test]
    fn test_partial_deserialization() {
        let settings: SandboxSettings = serde_json::from_str(
            r#"{"default_runtime": "node", "idle_timeout": 60, "limits": {"timeout": 5}}"#,
        )
        .unwrap();
        assert_eq!(settings.default_runtime, Runtime::Node);
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.limits.timeout, Duration::from_secs(5));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_forwarded_env() {
        let vars = vec![
            ("TIDEPOOL_CODE_API_KEY".to_string(), "secret".to_string()),
            ("TIDEPOOL_CODE_".to_string(), "empty name".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let env = forwarded_env("TIDEPOOL_CODE_", vars.clone());
        assert_eq!(env.len(), 1);
        assert_eq!(env["API_KEY"], "secret");

        assert!(forwarded_env("", vars).is_empty());
    }

    #[test]
    fn test_session_config_uses_defaults() {
        let settings = SandboxSettings {
            default_image: Some("alpine:3".into()),
            allow_network: true,
            ..SandboxSettings::default()
        };
        let config = settings.session_config();
        assert_eq!(config.resolved_image(), "alpine:3");
        assert!(config.allow_network);
        assert_eq!(config.workdir, "/work");
    }
}
