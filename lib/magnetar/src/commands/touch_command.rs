use crate::cluster::{Cluster, Node};
use crate::commands::{self, Command, LatencyType, SingleCommand};
use crate::errors::{Error, Result};
use crate::key::Key;
use crate::net::Connection;
use crate::policy::WritePolicy;
use crate::result_code::ResultCode;
use std::sync::Arc;

pub struct TouchCommand<'a> {
    single: SingleCommand<'a>,
    policy: &'a WritePolicy,
    /// Tolerate a missing record instead of failing the command.
    tolerate_not_found: bool,
    /// Whether the record was present and touched.
    pub touched: bool,
}

impl<'a> TouchCommand<'a> {
    pub fn new(
        policy: &'a WritePolicy,
        cluster: Arc<Cluster>,
        key: &'a Key,
        tolerate_not_found: bool,
    ) -> TouchCommand<'a> {
        TouchCommand {
            single: SingleCommand::new_write(cluster, key, &policy.base),
            policy,
            tolerate_not_found,
            touched: false,
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        commands::execute(self)
    }
}

impl<'a> Command for TouchCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer.set_touch(self.policy, self.single.key)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.single.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        conn.read_record_message()?;
        match ResultCode::from(conn.buffer.read_u8_at(5)) {
            ResultCode::Ok => {
                self.touched = true;
                Ok(())
            }
            ResultCode::KeyNotFoundError if self.tolerate_not_found => {
                self.touched = false;
                Ok(())
            }
            ResultCode::FilteredOut if !self.policy.base.fail_on_filtered_out => {
                self.touched = false;
                Ok(())
            }
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
