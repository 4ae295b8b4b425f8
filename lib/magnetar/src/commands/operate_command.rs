use crate::bin::Bins;
use crate::cluster::{Cluster, Node};
use crate::commands::{self, Command, LatencyType, ReadCommand, SingleCommand};
use crate::errors::Result;
use crate::key::Key;
use crate::net::Connection;
use crate::operations::Operation;
use crate::policy::WritePolicy;
use std::sync::Arc;

/// Arbitrary mixed read/write operation list against one record. Routing
/// and retry semantics follow the write path when any operation writes;
/// response parsing is shared with the read command.
pub struct OperateCommand<'a> {
    read: ReadCommand<'a>,
    policy: &'a WritePolicy,
    operations: &'a [Operation],
    has_write: bool,
}

impl<'a> OperateCommand<'a> {
    pub fn new(
        policy: &'a WritePolicy,
        cluster: Arc<Cluster>,
        key: &'a Key,
        operations: &'a [Operation],
    ) -> OperateCommand<'a> {
        let has_write = operations.iter().any(Operation::is_write);
        let single = if has_write {
            SingleCommand::new_write(cluster, key, &policy.base)
        } else {
            SingleCommand::new_read(cluster, key, &policy.base)
        };
        OperateCommand {
            read: ReadCommand::for_single(&policy.base, single, Bins::All),
            policy,
            operations,
            has_write,
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        commands::execute(self)
    }

    pub fn take_record(&mut self) -> Option<crate::record::Record> {
        self.read.record.take()
    }
}

impl<'a> Command for OperateCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer
            .set_operate(self.policy, self.read.single.key, self.operations)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.read.single.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        self.read.parse_result(conn)
    }

    fn prepare_retry(&mut self, timed_out: bool) -> bool {
        self.read.single.prepare_retry(timed_out);
        true
    }

    fn is_write(&self) -> bool {
        self.has_write
    }

    fn latency_type(&self) -> LatencyType {
        if self.has_write {
            LatencyType::Write
        } else {
            LatencyType::Read
        }
    }

    fn on_in_doubt(&mut self) {
        if self.has_write {
            if let Some(txn) = &self.policy.base.txn {
                txn.set_in_doubt();
            }
        }
    }
}
