use crate::errors::{Error, Result};
use crate::policy::duration_ms;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

/// Client-wide settings: credentials, pool sizing and the per-node circuit
/// breaker. Loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPolicy {
    /// User name for servers with security enabled.
    pub user: Option<String>,
    /// Clear-text password; hashed before it ever leaves the client.
    pub password: Option<String>,
    /// Idle connections kept per node.
    pub max_conns_per_node: usize,
    /// Idle connections older than this are closed at acquire time.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Socket deadline while establishing and authenticating a connection.
    #[serde(with = "duration_ms")]
    pub login_timeout: Duration,
    /// Length of the circuit-breaker error window.
    #[serde(with = "duration_ms")]
    pub error_rate_window: Duration,
    /// Errors within the window that trip a node into backoff; 0 disables
    /// the breaker.
    pub max_error_rate: u32,
}

impl Default for ClientPolicy {
    fn default() -> ClientPolicy {
        ClientPolicy {
            user: None,
            password: None,
            max_conns_per_node: 256,
            idle_timeout: Duration::from_secs(55),
            login_timeout: Duration::from_secs(5),
            error_rate_window: Duration::from_secs(1),
            max_error_rate: 100,
        }
    }
}

impl ClientPolicy {
    pub fn from_toml(config: &str) -> Result<ClientPolicy> {
        serdeconv::from_toml_str(config)
            .map_err(|err| Error::invalid_argument(format!("bad client config: {}", err)))
    }

    #[inline]
    pub fn requires_authentication(&self) -> bool {
        self.user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_defaults_and_overrides() {
        let policy = ClientPolicy::from_toml(
            r#"
user = "admin"
password = "hunter2"
max_conns_per_node = 8
idle_timeout = 10000
"#,
        )
        .unwrap();

        assert_eq!(policy.user.as_deref(), Some("admin"));
        assert_eq!(policy.max_conns_per_node, 8);
        assert_eq!(policy.idle_timeout, Duration::from_secs(10));
        // Untouched fields keep their defaults.
        assert_eq!(policy.max_error_rate, 100);
        assert!(policy.requires_authentication());
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(ClientPolicy::from_toml("max_conns_per_node = \"many\"").is_err());
    }
}
