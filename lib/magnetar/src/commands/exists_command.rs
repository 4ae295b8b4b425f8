use crate::cluster::{Cluster, Node};
use crate::commands::{self, Command, LatencyType, SingleCommand};
use crate::errors::{Error, Result};
use crate::key::Key;
use crate::net::Connection;
use crate::policy::ReadPolicy;
use crate::result_code::ResultCode;
use std::sync::Arc;

pub struct ExistsCommand<'a> {
    single: SingleCommand<'a>,
    policy: &'a ReadPolicy,
    pub exists: bool,
}

impl<'a> ExistsCommand<'a> {
    pub fn new(policy: &'a ReadPolicy, cluster: Arc<Cluster>, key: &'a Key) -> ExistsCommand<'a> {
        ExistsCommand {
            single: SingleCommand::new_read(cluster, key, policy),
            policy,
            exists: false,
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        commands::execute(self)
    }
}

impl<'a> Command for ExistsCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        self.policy
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer.set_exists(self.policy, self.single.key)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.single.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        conn.read_record_message()?;
        match ResultCode::from(conn.buffer.read_u8_at(5)) {
            ResultCode::Ok => {
                self.exists = true;
                Ok(())
            }
            ResultCode::KeyNotFoundError => {
                self.exists = false;
                Ok(())
            }
            ResultCode::FilteredOut if !self.policy.fail_on_filtered_out => {
                self.exists = false;
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
        false
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Read
    }
}
