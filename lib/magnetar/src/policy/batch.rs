use crate::policy::BasePolicy;
use serde_derive::{Deserialize, Serialize};

/// Options for batch commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    #[serde(flatten)]
    pub base: BasePolicy,
    /// Worker cap for the per-node fan-out. 1 runs every group on the
    /// calling thread.
    pub max_concurrent_threads: usize,
    /// Allow the server to process batch sub-transactions inline on the
    /// service threads.
    pub allow_inline: bool,
    /// Permit reads from prole replicas.
    pub allow_prole_reads: bool,
    /// Send the set name with each batch entry. Required by servers doing
    /// set-level filtering.
    pub send_set_name: bool,
    /// Ask the server to respond for every key even when filtered out.
    pub respond_all_keys: bool,
}

impl Default for BatchPolicy {
    fn default() -> BatchPolicy {
        BatchPolicy {
            base: BasePolicy::default(),
            max_concurrent_threads: 1,
            allow_inline: true,
            allow_prole_reads: false,
            send_set_name: false,
            respond_all_keys: true,
        }
    }
}
