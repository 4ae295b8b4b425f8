//! Batch fan-out: group input keys by owning node, run one command per
//! group (bounded by the policy's worker cap) and reassemble results
//! positionally.

pub mod batch_direct_command;
pub mod batch_executor;
pub mod batch_index_command;

pub(crate) use self::batch_executor::{execute_batch, BatchRequest};

use crate::cluster::{Cluster, Node, Partition};
use crate::errors::Result;
use crate::key::Key;
use crate::policy::{BasePolicy, Replica};
use crate::record::Record;
use crate::result_code::ResultCode;
use hashbrown::HashMap;
use std::sync::Arc;

/// Input positions a batch entry answers for. Duplicate keys in the input
/// collapse to one wire entry fanned back out over every position.
#[derive(Debug, Clone)]
pub enum Offsets {
    Single(u32),
    Multi(Vec<u32>),
}

impl Offsets {
    fn push(&mut self, offset: u32) {
        match self {
            Offsets::Single(first) => *self = Offsets::Multi(vec![*first, offset]),
            Offsets::Multi(all) => all.push(offset),
        }
    }

    #[inline]
    pub fn first(&self) -> u32 {
        match self {
            Offsets::Single(first) => *first,
            Offsets::Multi(all) => all[0],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        let slice: &[u32] = match self {
            Offsets::Single(first) => std::slice::from_ref(first),
            Offsets::Multi(all) => all,
        };
        slice.iter().copied()
    }
}

/// One deduplicated wire entry of a per-node batch command.
#[derive(Debug, Clone)]
pub(crate) struct BatchEntry {
    pub key: Key,
    /// Expected record version, present on transaction verify entries.
    pub version: Option<u64>,
    pub offsets: Offsets,
}

/// All entries routed to one node.
pub(crate) struct BatchGroup {
    pub node: Arc<Node>,
    pub entries: Vec<BatchEntry>,
}

/// Positional outcome of one batch input slot.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub key: Key,
    pub record: Option<Record>,
    /// None until a response (or definitive absence) arrived for the slot.
    pub result_code: Option<ResultCode>,
    pub in_doubt: bool,
}

impl BatchRecord {
    pub(crate) fn pending(key: Key) -> BatchRecord {
        BatchRecord {
            key,
            record: None,
            result_code: None,
            in_doubt: false,
        }
    }
}

/// Group keys by their owning node, deduplicating identical digests into
/// one entry carrying every input offset. Input order is preserved within
/// each group.
pub(crate) fn group_by_node(
    cluster: &Cluster,
    items: &[(Key, Option<u64>)],
    policy: &BasePolicy,
) -> Result<Vec<BatchGroup>> {
    let mut groups: Vec<BatchGroup> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut entry_index: Vec<HashMap<[u8; 20], usize>> = Vec::new();

    for (offset, (key, version)) in items.iter().enumerate() {
        let partition = Partition::new_read(policy, key);
        let node = cluster.node_for(&partition)?;

        let group = match group_index.get(node.name()) {
            Some(index) => *index,
            None => {
                group_index.insert(node.name().to_string(), groups.len());
                groups.push(BatchGroup {
                    node,
                    entries: Vec::new(),
                });
                entry_index.push(HashMap::new());
                groups.len() - 1
            }
        };

        match entry_index[group].get(&key.digest) {
            Some(entry) => groups[group].entries[*entry].offsets.push(offset as u32),
            None => {
                entry_index[group].insert(key.digest, groups[group].entries.len());
                groups[group].entries.push(BatchEntry {
                    key: key.clone(),
                    version: *version,
                    offsets: Offsets::Single(offset as u32),
                });
            }
        }
    }

    Ok(groups)
}

/// Split one group's entries per namespace for the legacy dialect, which
/// permits a single namespace per frame.
pub(crate) fn split_by_namespace(entries: &[BatchEntry]) -> Vec<(String, Vec<BatchEntry>)> {
    let mut splits: Vec<(String, Vec<BatchEntry>)> = Vec::new();
    for entry in entries {
        match splits.iter_mut().find(|(ns, _)| *ns == entry.key.namespace) {
            Some((_, bucket)) => bucket.push(entry.clone()),
            None => splits.push((entry.key.namespace.clone(), vec![entry.clone()])),
        }
    }
    splits
}

/// Replica class used for batch sub-ordinate routing.
pub(crate) fn batch_replica(policy: &BasePolicy, allow_prole_reads: bool) -> Replica {
    if allow_prole_reads {
        policy.replica
    } else {
        Replica::Master
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeFeatures;
    use crate::net::Host;
    use crate::policy::ClientPolicy;

    fn cluster_with(n: usize) -> Arc<Cluster> {
        let cluster = Cluster::new(ClientPolicy::default(), None);
        for i in 0..n {
            let node = Node::new(
                format!("n{}", i),
                Host::new("127.0.0.1", 3000 + i as u16),
                NodeFeatures::default(),
                &ClientPolicy::default(),
                None,
            )
            .unwrap();
            cluster.add_node(Arc::new(node));
        }
        Arc::new(cluster)
    }

    #[test]
    fn test_duplicate_keys_share_one_entry() {
        let cluster = cluster_with(1);
        let k1 = Key::new("ns", "set", "k1").unwrap();
        let k2 = Key::new("ns", "set", "k2").unwrap();
        let items = vec![
            (k1.clone(), None),
            (k1.clone(), None),
            (k2.clone(), None),
        ];

        let groups = group_by_node(&cluster, &items, &BasePolicy::default()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].entries.len(), 2);

        let offsets: Vec<u32> = groups[0].entries[0].offsets.iter().collect();
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(groups[0].entries[1].offsets.first(), 2);
    }

    #[test]
    fn test_grouping_covers_every_offset_once() {
        let cluster = cluster_with(3);
        let items: Vec<(Key, Option<u64>)> = (0..64)
            .map(|i| (Key::new("ns", "set", i as i64).unwrap(), None))
            .collect();

        let groups = group_by_node(&cluster, &items, &BasePolicy::default()).unwrap();
        let mut seen: Vec<u32> = groups
            .iter()
            .flat_map(|g| g.entries.iter().flat_map(|e| e.offsets.iter()))
            .collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..64).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_split_by_namespace() {
        let entries = vec![
            BatchEntry {
                key: Key::new("a", "s", 1i64).unwrap(),
                version: None,
                offsets: Offsets::Single(0),
            },
            BatchEntry {
                key: Key::new("b", "s", 2i64).unwrap(),
                version: None,
                offsets: Offsets::Single(1),
            },
            BatchEntry {
                key: Key::new("a", "s", 3i64).unwrap(),
                version: None,
                offsets: Offsets::Single(2),
            },
        ];
        let splits = split_by_namespace(&entries);
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[0].0, "a");
        assert_eq!(splits[0].1.len(), 2);
        assert_eq!(splits[1].0, "b");
    }
}
