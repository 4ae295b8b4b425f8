use crate::bin::Bins;
use crate::cluster::{Cluster, Node};
use crate::commands::{self, Command, LatencyType, ReadCommand, SingleCommand};
use crate::errors::Result;
use crate::key::Key;
use crate::net::Connection;
use crate::policy::WritePolicy;
use crate::value::Value;
use std::sync::Arc;

/// Server-side UDF invocation against one record. UDFs may write, so the
/// command routes and classifies as a write; the result record carries the
/// function's return value under the SUCCESS bin.
pub struct ExecuteUdfCommand<'a> {
    read: ReadCommand<'a>,
    policy: &'a WritePolicy,
    package: &'a str,
    function: &'a str,
    args: &'a [Value],
}

impl<'a> ExecuteUdfCommand<'a> {
    pub fn new(
        policy: &'a WritePolicy,
        cluster: Arc<Cluster>,
        key: &'a Key,
        package: &'a str,
        function: &'a str,
        args: &'a [Value],
    ) -> ExecuteUdfCommand<'a> {
        let single = SingleCommand::new_write(cluster, key, &policy.base);
        ExecuteUdfCommand {
            read: ReadCommand::for_single(&policy.base, single, Bins::All),
            policy,
            package,
            function,
            args,
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        commands::execute(self)
    }

    pub fn take_record(&mut self) -> Option<crate::record::Record> {
        self.read.record.take()
    }
}

impl<'a> Command for ExecuteUdfCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer.set_udf(
            self.policy,
            self.read.single.key,
            self.package,
            self.function,
            self.args,
        )
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
