use crate::policy::BasePolicy;
use serde_derive::{Deserialize, Serialize};

/// Options for full-namespace scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    #[serde(flatten)]
    pub base: BasePolicy,
    /// Number of nodes scanned concurrently; 1 scans node by node.
    pub concurrent_nodes: usize,
    /// Stop after roughly this many records across all nodes; 0 is
    /// unlimited.
    pub max_records: u64,
    /// Server-side throttle; 0 is unthrottled.
    pub records_per_second: u32,
    /// Fetch bin data, not just digests and metadata.
    pub include_bin_data: bool,
}

impl Default for ScanPolicy {
    fn default() -> ScanPolicy {
        let mut base = BasePolicy::default();
        // Scans stream indefinitely by default; only the socket guards them.
        base.total_timeout = std::time::Duration::from_secs(0);
        base.max_retries = 0;
        ScanPolicy {
            base,
            concurrent_nodes: 0,
            max_records: 0,
            records_per_second: 0,
            include_bin_data: true,
        }
    }
}
