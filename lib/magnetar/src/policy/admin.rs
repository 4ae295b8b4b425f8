use crate::policy::duration_ms;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

/// Options for user and role management commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminPolicy {
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for AdminPolicy {
    fn default() -> AdminPolicy {
        AdminPolicy {
            timeout: Duration::from_secs(1),
        }
    }
}
