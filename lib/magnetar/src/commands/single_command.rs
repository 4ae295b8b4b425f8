use crate::cluster::{Cluster, Node, Partition};
use crate::errors::Result;
use crate::key::Key;
use crate::policy::BasePolicy;
use std::sync::Arc;

/// Shared plumbing of every single-key command: the key, its partition and
/// the replica walk across retries.
pub struct SingleCommand<'a> {
    pub cluster: Arc<Cluster>,
    pub key: &'a Key,
    partition: Partition,
    is_write: bool,
}

impl<'a> SingleCommand<'a> {
    pub fn new_read(cluster: Arc<Cluster>, key: &'a Key, policy: &BasePolicy) -> SingleCommand<'a> {
        SingleCommand {
            partition: Partition::new_read(policy, key),
            cluster,
            key,
            is_write: false,
        }
    }

    pub fn new_write(cluster: Arc<Cluster>, key: &'a Key, policy: &BasePolicy) -> SingleCommand<'a> {
        SingleCommand {
            partition: Partition::new_write(policy, key),
            cluster,
            key,
            is_write: true,
        }
    }

    #[inline]
    pub fn get_node(&self) -> Result<Arc<Node>> {
        self.cluster.node_for(&self.partition)
    }

    #[inline]
    pub fn prepare_retry(&mut self, timed_out: bool) {
        if self.is_write {
            self.partition.prepare_retry_write(timed_out);
        } else {
            self.partition.prepare_retry_read(timed_out);
        }
    }
}
