use crate::key::Key;
use crate::policy::{BasePolicy, Replica};

/// Number of hash buckets per namespace.
pub const N_PARTITIONS: usize = 4096;

/// Routing state of one command: the partition owning the key plus the
/// replica walk position, advanced across retries.
#[derive(Debug, Clone)]
pub struct Partition {
    pub namespace: String,
    pub partition_id: usize,
    replica: Replica,
    sequence: usize,
}

impl Partition {
    /// Partition id is the first 12 bits of the digest, little-endian.
    #[inline]
    pub fn partition_id(digest: &[u8; 20]) -> usize {
        (digest[0] as usize | (digest[1] as usize & 0x0F) << 8) & 0xFFF
    }

    pub fn new_read(policy: &BasePolicy, key: &Key) -> Partition {
        Partition {
            namespace: key.namespace.clone(),
            partition_id: Partition::partition_id(&key.digest),
            replica: policy.replica,
            sequence: 0,
        }
    }

    /// Writes always address the partition master.
    pub fn new_write(_policy: &BasePolicy, key: &Key) -> Partition {
        Partition {
            namespace: key.namespace.clone(),
            partition_id: Partition::partition_id(&key.digest),
            replica: Replica::Master,
            sequence: 0,
        }
    }

    #[inline]
    pub fn replica(&self) -> Replica {
        self.replica
    }

    #[inline]
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Advance to the next replica unless the failure was a pure timeout,
    /// in which case the same replica deserves another shot.
    #[inline]
    pub fn prepare_retry_read(&mut self, timed_out: bool) {
        if !timed_out {
            self.sequence += 1;
        }
    }

    #[inline]
    pub fn prepare_retry_write(&mut self, timed_out: bool) {
        if !timed_out {
            self.sequence += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_id_uses_low_twelve_bits() {
        let mut digest = [0u8; 20];
        digest[0] = 0xAB;
        digest[1] = 0xFC; // only the low nibble participates
        assert_eq!(Partition::partition_id(&digest), 0xCAB);

        digest[1] = 0x0C;
        assert_eq!(Partition::partition_id(&digest), 0xCAB);
    }

    #[test]
    fn test_partition_id_bounded() {
        let mut digest = [0xFFu8; 20];
        assert!(Partition::partition_id(&digest) < N_PARTITIONS);
        digest[0] = 0;
        digest[1] = 0;
        assert_eq!(Partition::partition_id(&digest), 0);
    }

    #[test]
    fn test_retry_advances_sequence_except_on_timeout() {
        let policy = BasePolicy::default();
        let key = Key::new("ns", "set", "k").unwrap();
        let mut partition = Partition::new_read(&policy, &key);

        assert_eq!(partition.sequence(), 0);
        partition.prepare_retry_read(true);
        assert_eq!(partition.sequence(), 0);
        partition.prepare_retry_read(false);
        assert_eq!(partition.sequence(), 1);
        partition.prepare_retry_read(false);
        assert_eq!(partition.sequence(), 2);
    }

    #[test]
    fn test_writes_route_to_master() {
        let mut policy = BasePolicy::default();
        policy.replica = Replica::Any;
        let key = Key::new("ns", "set", "k").unwrap();
        let partition = Partition::new_write(&policy, &key);
        assert_eq!(partition.replica(), Replica::Master);
    }
}
