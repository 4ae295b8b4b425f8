pub mod node;
pub mod partition;

pub use self::node::{Node, NodeFeatures};
pub use self::partition::{Partition, N_PARTITIONS};

use crate::errors::{Error, ErrorKind, Result};
use crate::net::Host;
use crate::policy::{ClientPolicy, Replica};
use flint::logging;
use hashbrown::HashMap;
use std::sync::{Arc, RwLock};

/// Per-namespace replica tables: `tables[ns][replica][partition]` names the
/// owning node. Built by the (external) tender; readers see one immutable
/// snapshot per command attempt.
#[derive(Debug, Default)]
pub struct PartitionMap {
    tables: HashMap<String, Vec<Vec<Option<Arc<Node>>>>>,
}

impl PartitionMap {
    pub fn new() -> PartitionMap {
        PartitionMap {
            tables: HashMap::new(),
        }
    }

    /// Record ownership of one partition for a replica row, growing the
    /// table as needed.
    pub fn set_owner(
        &mut self,
        namespace: &str,
        replica_index: usize,
        partition_id: usize,
        node: Arc<Node>,
    ) {
        let rows = self
            .tables
            .entry(namespace.to_string())
            .or_insert_with(Vec::new);
        while rows.len() <= replica_index {
            rows.push(vec![None; N_PARTITIONS]);
        }
        rows[replica_index][partition_id] = Some(node);
    }

    fn lookup(&self, namespace: &str, replica_index: usize, partition_id: usize) -> Option<Arc<Node>> {
        let rows = self.tables.get(namespace)?;
        if rows.is_empty() {
            return None;
        }
        // Walk rows starting at the requested replica so a hole falls back
        // to the next copy instead of failing the command.
        for probe in 0..rows.len() {
            let row = &rows[(replica_index + probe) % rows.len()];
            if let Some(node) = &row[partition_id] {
                return Some(node.clone());
            }
        }
        None
    }

    fn replica_rows(&self, namespace: &str) -> usize {
        self.tables.get(namespace).map_or(0, |rows| rows.len())
    }
}

/// Static registry of nodes plus the partition map snapshot. Topology
/// discovery and tending live outside the command core; they feed this
/// through `add_node` and `set_partition_map`.
pub struct Cluster {
    client_policy: ClientPolicy,
    nodes: RwLock<Vec<Arc<Node>>>,
    map: RwLock<Arc<PartitionMap>>,
    log: logging::Logger,
}

impl Cluster {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        client_policy: ClientPolicy,
        log: L,
    ) -> Cluster {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };
        Cluster {
            client_policy,
            nodes: RwLock::new(Vec::new()),
            map: RwLock::new(Arc::new(PartitionMap::new())),
            log,
        }
    }

    /// Seed a cluster with one node per host. Without a tender the
    /// partition map stays empty and routing falls back to round-robin over
    /// the seeds.
    pub fn seed<'a, L: Into<Option<&'a logging::Logger>>>(
        client_policy: ClientPolicy,
        hosts: &[Host],
        log: L,
    ) -> Result<Arc<Cluster>> {
        if hosts.is_empty() {
            return Err(Error::invalid_argument("no seed hosts"));
        }
        let cluster = Cluster::new(client_policy, log);
        for (index, host) in hosts.iter().enumerate() {
            let node = Node::new(
                format!("seed-{}", index),
                host.clone(),
                NodeFeatures::default(),
                &cluster.client_policy,
                &cluster.log,
            )?;
            cluster.add_node(Arc::new(node));
        }
        Ok(Arc::new(cluster))
    }

    pub fn add_node(&self, node: Arc<Node>) {
        logging::info!(self.log, "node registered";
            "context" => "cluster", "node" => node.name(), "host" => %node.host());
        self.nodes.write().expect("cluster poisoned").push(node);
    }

    /// Swap in a freshly computed partition map (tender interface).
    pub fn set_partition_map(&self, map: PartitionMap) {
        *self.map.write().expect("cluster poisoned") = Arc::new(map);
    }

    #[inline]
    pub fn partition_map(&self) -> Arc<PartitionMap> {
        self.map.read().expect("cluster poisoned").clone()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().expect("cluster poisoned").clone()
    }

    #[inline]
    pub fn client_policy(&self) -> &ClientPolicy {
        &self.client_policy
    }

    /// Resolve the node a command attempt should address, honoring the
    /// partition's replica class and walk position.
    pub fn node_for(&self, partition: &Partition) -> Result<Arc<Node>> {
        let map = self.partition_map();

        let replica_index = match partition.replica() {
            Replica::Master => 0,
            Replica::Sequence | Replica::Any => {
                let rows = map.replica_rows(&partition.namespace).max(1);
                partition.sequence() % rows
            }
        };

        if let Some(node) = map.lookup(&partition.namespace, replica_index, partition.partition_id) {
            return Ok(node);
        }

        // No map for the namespace yet: spread partitions over the seeds.
        let nodes = self.nodes.read().expect("cluster poisoned");
        if nodes.is_empty() {
            return Err(Error::new(ErrorKind::InvalidNode));
        }
        let index = (partition.partition_id + partition.sequence()) % nodes.len();
        Ok(nodes[index].clone())
    }
}
