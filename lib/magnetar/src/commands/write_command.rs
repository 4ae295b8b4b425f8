use crate::bin::Bin;
use crate::cluster::{Cluster, Node};
use crate::commands::{self, Command, LatencyType, SingleCommand};
use crate::errors::{Error, Result};
use crate::key::Key;
use crate::net::Connection;
use crate::operations::OperationType;
use crate::policy::WritePolicy;
use crate::result_code::ResultCode;
use std::sync::Arc;

pub struct WriteCommand<'a> {
    single: SingleCommand<'a>,
    policy: &'a WritePolicy,
    bins: &'a [Bin],
    op_type: OperationType,
}

impl<'a> WriteCommand<'a> {
    pub fn new(
        policy: &'a WritePolicy,
        cluster: Arc<Cluster>,
        key: &'a Key,
        bins: &'a [Bin],
        op_type: OperationType,
    ) -> WriteCommand<'a> {
        WriteCommand {
            single: SingleCommand::new_write(cluster, key, &policy.base),
            policy,
            bins,
            op_type,
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        commands::execute(self)
    }
}

impl<'a> Command for WriteCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer
            .set_write(self.policy, self.op_type, self.single.key, self.bins)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.single.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        conn.read_record_message()?;
        match ResultCode::from(conn.buffer.read_u8_at(5)) {
            ResultCode::Ok => Ok(()),
            ResultCode::FilteredOut if !self.policy.base.fail_on_filtered_out => Ok(()),
            rc => Err(Error::server(rc)),
        }
    }

    fn prepare_retry(&mut self, timed_out: bool) -> bool {
        self.single.prepare_retry(timed_out);
        true
    }

    fn is_write(&self) -> bool {
        true
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Write
    }

    fn on_in_doubt(&mut self) {
        if let Some(txn) = &self.policy.base.txn {
            txn.set_in_doubt();
        }
    }
}
