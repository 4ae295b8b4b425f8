use crate::policy::{duration_ms, Replica};
use crate::txn::Txn;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Options shared by every command. A zero duration means "no limit" for
/// both timeout fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasePolicy {
    /// Per-attempt socket deadline. Shrunk to the remaining total budget
    /// before each attempt.
    #[serde(with = "duration_ms")]
    pub socket_timeout: Duration,
    /// Budget for the whole command including retries and sleeps.
    #[serde(with = "duration_ms")]
    pub total_timeout: Duration,
    /// How long a timed-out connection may keep draining before being
    /// closed. Recorded for diagnostics.
    #[serde(with = "duration_ms")]
    pub timeout_delay: Duration,
    /// Attempts beyond the first.
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub sleep_between_retries: Duration,
    pub replica: Replica,
    /// Wrap requests above the compression threshold in the zlib envelope.
    pub compress: bool,
    /// Pre-encoded filter expression attached as a field, if any.
    #[serde(skip)]
    pub filter_exp: Option<Vec<u8>>,
    /// Treat a filtered-out response as an error rather than an absent
    /// record.
    pub fail_on_filtered_out: bool,
    /// Multi-record transaction this command participates in.
    #[serde(skip)]
    pub txn: Option<Arc<Txn>>,
}

impl Default for BasePolicy {
    fn default() -> BasePolicy {
        BasePolicy {
            socket_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(1),
            timeout_delay: Duration::from_secs(0),
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(1),
            replica: Replica::Sequence,
            compress: false,
            filter_exp: None,
            fail_on_filtered_out: false,
            txn: None,
        }
    }
}

impl BasePolicy {
    /// Socket deadline for the first attempt, folding in the total budget.
    pub fn initial_socket_timeout(&self) -> Duration {
        let zero = Duration::from_secs(0);
        match (self.socket_timeout > zero, self.total_timeout > zero) {
            (true, true) => self.socket_timeout.min(self.total_timeout),
            (true, false) => self.socket_timeout,
            (false, true) => self.total_timeout,
            (false, false) => zero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_timeout_clamped_to_total() {
        let mut policy = BasePolicy::default();
        policy.socket_timeout = Duration::from_secs(30);
        policy.total_timeout = Duration::from_secs(1);
        assert_eq!(policy.initial_socket_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_total_keeps_socket_deadline() {
        let mut policy = BasePolicy::default();
        policy.socket_timeout = Duration::from_secs(5);
        policy.total_timeout = Duration::from_secs(0);
        assert_eq!(policy.initial_socket_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_both_zero_means_infinite() {
        let mut policy = BasePolicy::default();
        policy.socket_timeout = Duration::from_secs(0);
        policy.total_timeout = Duration::from_secs(0);
        assert_eq!(policy.initial_socket_timeout(), Duration::from_secs(0));
    }
}
