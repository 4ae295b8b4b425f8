//! Transaction monitor upkeep: the server-side record that remembers which
//! digests a transaction touches, written before the first write of each
//! key, marked at commit and deleted at close.

use crate::bin::Bin;
use crate::cluster::{Cluster, Node};
use crate::commands::delete_command::DeleteCommand;
use crate::commands::operate_command::OperateCommand;
use crate::commands::write_command::WriteCommand;
use crate::commands::{self, Command, LatencyType};
use crate::errors::Result;
use crate::key::Key;
use crate::net::Connection;
use crate::operations::{self, lists, Operation, OperationType};
use crate::policy::WritePolicy;
use crate::result_code::ResultCode;
use crate::txn::Txn;
use crate::value::Value;
use std::sync::Arc;

/// Bin carrying the transaction id.
const BIN_ID: &str = "id";
/// Ordered list bin of participating digests.
const BIN_DIGESTS: &str = "keyds";
/// Marker bin recording the roll-forward decision.
const BIN_FORWARD: &str = "fwd";

fn txn_policy(txn: &Arc<Txn>) -> WritePolicy {
    let mut policy = WritePolicy::default();
    policy.base.txn = Some(txn.clone());
    policy
}

/// Register `keys` with the monitor before their first write. The first
/// call creates the monitor (id bin plus digest list); later calls only
/// append digests. Duplicates are absorbed server-side by the list flags.
pub(crate) fn add_keys(cluster: &Arc<Cluster>, txn: &Arc<Txn>, keys: &[&Key]) -> Result<()> {
    let pending: Vec<&Key> = keys
        .iter()
        .copied()
        .filter(|key| !txn.writes_contain(key))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    txn.ensure_open()?;
    for key in &pending {
        txn.note_namespace(&key.namespace)?;
    }
    let monitor_key = txn.monitor_key()?;

    let mut ops: Vec<Operation> = Vec::with_capacity(2);
    if !txn.monitor_might_exist() {
        ops.push(operations::put(Bin::new(BIN_ID, txn.id() as i64)));
    }
    let digests: Vec<Value> = pending
        .iter()
        .map(|key| Value::Blob(key.digest.to_vec()))
        .collect();
    ops.push(lists::append_items(
        BIN_DIGESTS,
        digests,
        lists::ListOrder::Ordered,
        lists::write_flags::ADD_UNIQUE | lists::write_flags::NO_FAIL | lists::write_flags::PARTIAL,
    ));

    let policy = txn_policy(txn);
    let mut command = TxnAddKeysCommand {
        inner: OperateCommand::new(&policy, cluster.clone(), &monitor_key, &ops),
        txn: txn.clone(),
    };
    match commands::execute(&mut command) {
        Ok(()) => {
            txn.set_monitor_exists();
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Record the commit decision on the monitor. A repeat of a previous
/// attempt answers MRT_COMMITTED or BIN_EXISTS, both idempotent successes.
pub(crate) fn mark_roll_forward(cluster: &Arc<Cluster>, txn: &Arc<Txn>) -> Result<()> {
    let monitor_key = txn.monitor_key()?;
    let policy = txn_policy(txn);
    let bins = [Bin::new(BIN_FORWARD, true)];

    let mut command = MarkRollForwardCommand {
        inner: WriteCommand::new(&policy, cluster.clone(), &monitor_key, &bins, OperationType::Write),
    };
    match commands::execute(&mut command) {
        Ok(()) => Ok(()),
        Err(err)
            if err.result_code() == Some(ResultCode::MrtCommitted)
                || err.result_code() == Some(ResultCode::BinExistsError) =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Delete the monitor record. An already-absent monitor is success.
pub(crate) fn close_monitor(cluster: &Arc<Cluster>, txn: &Arc<Txn>) -> Result<()> {
    let monitor_key = txn.monitor_key()?;
    let mut policy = txn_policy(txn);
    policy.durable_delete = false;

    let mut command = CloseMonitorCommand {
        inner: DeleteCommand::new(&policy, cluster.clone(), &monitor_key),
    };
    commands::execute(&mut command)
}

/// Operate wrapper whose in-doubt outcome marks the monitor as possibly
/// existing, so abort still attempts a close.
struct TxnAddKeysCommand<'a> {
    inner: OperateCommand<'a>,
    txn: Arc<Txn>,
}

impl<'a> Command for TxnAddKeysCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        self.inner.policy()
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        self.inner.write_buffer(conn)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.inner.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        self.inner.parse_result(conn)
    }

    fn prepare_retry(&mut self, timed_out: bool) -> bool {
        self.inner.prepare_retry(timed_out)
    }

    fn is_write(&self) -> bool {
        true
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Write
    }

    fn on_in_doubt(&mut self) {
        self.txn.set_monitor_in_doubt();
    }
}

/// The commit decision itself already drove the txn state; an in-doubt
/// mark is deliberately a no-op.
struct MarkRollForwardCommand<'a> {
    inner: WriteCommand<'a>,
}

impl<'a> Command for MarkRollForwardCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        self.inner.policy()
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        self.inner.write_buffer(conn)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.inner.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        self.inner.parse_result(conn)
    }

    fn prepare_retry(&mut self, timed_out: bool) -> bool {
        self.inner.prepare_retry(timed_out)
    }

    fn is_write(&self) -> bool {
        true
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Write
    }

    fn on_in_doubt(&mut self) {}
}

struct CloseMonitorCommand<'a> {
    inner: DeleteCommand<'a>,
}

impl<'a> Command for CloseMonitorCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        self.inner.policy()
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        self.inner.write_buffer(conn)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.inner.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        self.inner.parse_result(conn)
    }

    fn prepare_retry(&mut self, timed_out: bool) -> bool {
        self.inner.prepare_retry(timed_out)
    }

    fn is_write(&self) -> bool {
        true
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Write
    }

    fn on_in_doubt(&mut self) {}
}
