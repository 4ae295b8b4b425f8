mod admin;
mod base;
mod batch;
mod client;
mod scan;
mod write;

pub use self::admin::AdminPolicy;
pub use self::base::BasePolicy;
pub use self::batch::BatchPolicy;
pub use self::client::ClientPolicy;
pub use self::scan::ScanPolicy;
pub use self::write::WritePolicy;

use serde_derive::{Deserialize, Serialize};

/// Read policies are the base policy unadorned.
pub type ReadPolicy = BasePolicy;

/// Which replica of a partition an attempt addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Replica {
    /// Always the partition master.
    Master,
    /// Walk master then replicas in sequence order, advancing on retry.
    Sequence,
    /// Any replica, round-robin from a per-command starting point.
    Any,
}

/// Consistency guarantee the server applies before acknowledging a write.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommitLevel {
    All,
    Master,
}

/// How an expected generation constrains a write.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum GenerationPolicy {
    None,
    ExpectEqual,
    ExpectGreater,
}

/// How a write behaves when the record does or does not already exist.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum RecordExistsAction {
    Update,
    UpdateOnly,
    Replace,
    ReplaceOnly,
    CreateOnly,
}

/// Record time-to-live carried on writes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Expiration {
    /// Live this many seconds from the write.
    Seconds(u32),
    /// Use the namespace default TTL.
    NamespaceDefault,
    /// Never expire.
    Never,
    /// Leave the current TTL untouched.
    DontUpdate,
}

impl Expiration {
    #[inline]
    pub fn as_u32(self) -> u32 {
        match self {
            Expiration::Seconds(secs) => secs,
            Expiration::NamespaceDefault => 0,
            Expiration::Never => 0xFFFF_FFFF,
            Expiration::DontUpdate => 0xFFFF_FFFE,
        }
    }
}

/// Serde adaptor storing `Duration` fields as integral milliseconds, which
/// is how the config files spell timeouts.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_encoding() {
        assert_eq!(Expiration::Seconds(300).as_u32(), 300);
        assert_eq!(Expiration::NamespaceDefault.as_u32(), 0);
        assert_eq!(Expiration::Never.as_u32(), 0xFFFF_FFFF);
        assert_eq!(Expiration::DontUpdate.as_u32(), 0xFFFF_FFFE);
    }
}
