use crate::batch::{execute_batch, BatchRecord, BatchRequest};
use crate::bin::{Bin, Bins};
use crate::cluster::{Cluster, Node};
use crate::commands::delete_command::DeleteCommand;
use crate::commands::execute_udf_command::ExecuteUdfCommand;
use crate::commands::exists_command::ExistsCommand;
use crate::commands::operate_command::OperateCommand;
use crate::commands::scan_command::ScanCommand;
use crate::commands::touch_command::TouchCommand;
use crate::commands::write_command::WriteCommand;
use crate::commands::{admin_command, info_command, CancelToken, ReadCommand};
use crate::errors::{Error, ErrorKind, Result};
use crate::key::Key;
use crate::net::{Connection, Host};
use crate::operations::{Operation, OperationType};
use crate::policy::{
    AdminPolicy, BatchPolicy, ClientPolicy, ReadPolicy, ScanPolicy, WritePolicy,
};
use crate::record::Record;
use crate::recordset::Recordset;
use crate::result_code::ResultCode;
use crate::txn::{monitor, AbortStatus, CommitStatus, Txn, TxnRoll};
use crate::user::{AdminUser, Privilege, Role};
use crate::value::Value;
use flint::logging;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

/// Languages a registered UDF module can be written in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UdfLang {
    Lua,
}

impl UdfLang {
    fn as_str(self) -> &'static str {
        match self {
            UdfLang::Lua => "LUA",
        }
    }
}

/// Handle to one cluster. Thread-safe; share one instance per cluster.
pub struct Client {
    cluster: Arc<Cluster>,
    log: logging::Logger,
}

impl Client {
    /// Seed a client from a host list. Topology refresh is the tender's
    /// job; until one installs a partition map, routing round-robins the
    /// seeds.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        policy: ClientPolicy,
        hosts: &[Host],
        log: L,
    ) -> Result<Client> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };
        let cluster = Cluster::seed(policy, hosts, &log)?;
        Ok(Client { cluster, log })
    }

    /// Wrap an externally maintained cluster.
    pub fn with_cluster(cluster: Arc<Cluster>) -> Client {
        Client {
            cluster,
            log: logging::null(),
        }
    }

    #[inline]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    //
    // Single-key operations
    //

    /// Read a record; `None` when the key does not exist (or was filtered
    /// out under a tolerant policy).
    pub fn get(&self, policy: &ReadPolicy, key: &Key, bins: Bins) -> Result<Option<Record>> {
        self.check_txn(policy)?;
        let mut command = ReadCommand::new(policy, self.cluster.clone(), key, bins);
        command.execute()?;
        Ok(command.record.take())
    }

    /// Read generation and expiration without bin data.
    pub fn get_header(&self, policy: &ReadPolicy, key: &Key) -> Result<Option<Record>> {
        self.get(policy, key, Bins::None)
    }

    pub fn exists(&self, policy: &ReadPolicy, key: &Key) -> Result<bool> {
        self.check_txn(policy)?;
        let mut command = ExistsCommand::new(policy, self.cluster.clone(), key);
        command.execute()?;
        Ok(command.exists)
    }

    pub fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write_op(policy, key, bins, OperationType::Write)
    }

    pub fn append(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write_op(policy, key, bins, OperationType::Append)
    }

    pub fn prepend(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write_op(policy, key, bins, OperationType::Prepend)
    }

    /// Arithmetic add on integer bins.
    pub fn add(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write_op(policy, key, bins, OperationType::Incr)
    }

    fn write_op(
        &self,
        policy: &WritePolicy,
        key: &Key,
        bins: &[Bin],
        op_type: OperationType,
    ) -> Result<()> {
        self.prepare_txn_write(policy, key)?;
        let mut command = WriteCommand::new(policy, self.cluster.clone(), key, bins, op_type);
        command.execute()?;
        self.record_txn_write(policy, key)
    }

    /// Delete a record; returns whether it existed.
    pub fn delete(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        self.prepare_txn_write(policy, key)?;
        let mut command = DeleteCommand::new(policy, self.cluster.clone(), key);
        command.execute()?;
        self.record_txn_write(policy, key)?;
        Ok(command.existed)
    }

    /// Reset the record's TTL. Fails on a missing record.
    pub fn touch(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        self.prepare_txn_write(policy, key)?;
        let mut command = TouchCommand::new(policy, self.cluster.clone(), key, false);
        command.execute()?;
        self.record_txn_write(policy, key)
    }

    /// Run an operation list against one record; bins touched by multiple
    /// operations come back as ordered value lists.
    pub fn operate(
        &self,
        policy: &WritePolicy,
        key: &Key,
        operations: &[Operation],
    ) -> Result<Option<Record>> {
        let has_write = operations.iter().any(Operation::is_write);
        if has_write {
            self.prepare_txn_write(policy, key)?;
        } else {
            self.check_txn(&policy.base)?;
        }
        let mut command = OperateCommand::new(policy, self.cluster.clone(), key, operations);
        command.execute()?;
        if has_write {
            self.record_txn_write(policy, key)?;
        }
        Ok(command.take_record())
    }

    /// Invoke a registered UDF on one record.
    pub fn execute_udf(
        &self,
        policy: &WritePolicy,
        key: &Key,
        package: &str,
        function: &str,
        args: &[Value],
    ) -> Result<Option<Record>> {
        self.prepare_txn_write(policy, key)?;
        let mut command =
            ExecuteUdfCommand::new(policy, self.cluster.clone(), key, package, function, args);
        command.execute()?;
        self.record_txn_write(policy, key)?;
        Ok(command.take_record())
    }

    fn check_txn(&self, policy: &crate::policy::BasePolicy) -> Result<()> {
        if let Some(txn) = &policy.txn {
            txn.ensure_open()?;
        }
        Ok(())
    }

    /// Before a transactional write: make sure the monitor record covers
    /// the key.
    fn prepare_txn_write(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        if let Some(txn) = &policy.base.txn {
            txn.ensure_open()?;
            monitor::add_keys(&self.cluster, txn, &[key])?;
        }
        Ok(())
    }

    /// After a successful transactional write: remember the key for roll.
    fn record_txn_write(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        if let Some(txn) = &policy.base.txn {
            txn.on_write(key.clone())?;
        }
        Ok(())
    }

    //
    // Batch operations
    //

    /// Read many records; result slot i answers for input key i regardless
    /// of node placement, duplicates included.
    pub fn batch_get(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
        bins: Bins,
    ) -> Result<Vec<Option<Record>>> {
        let records = self.batch_read_records(policy, keys, bins, false)?;
        Ok(records.into_iter().map(|slot| slot.record).collect())
    }

    /// Read many record headers (no bin data).
    pub fn batch_get_header(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
    ) -> Result<Vec<Option<Record>>> {
        let records = self.batch_read_records(policy, keys, Bins::None, true)?;
        Ok(records.into_iter().map(|slot| slot.record).collect())
    }

    /// Existence check for many keys.
    pub fn batch_exists(&self, policy: &BatchPolicy, keys: &[Key]) -> Result<Vec<bool>> {
        let records = self.batch_read_records(policy, keys, Bins::None, true)?;
        Ok(records
            .into_iter()
            .map(|slot| slot.result_code == Some(ResultCode::Ok))
            .collect())
    }

    /// Full per-slot outcomes for a batch read.
    pub fn batch_read_records(
        &self,
        policy: &BatchPolicy,
        keys: &[Key],
        bins: Bins,
        header_only: bool,
    ) -> Result<Vec<BatchRecord>> {
        let items: Vec<(Key, Option<u64>)> =
            keys.iter().map(|key| (key.clone(), None)).collect();
        let (records, error) = execute_batch(
            &self.cluster,
            policy,
            items,
            BatchRequest::Read { bins, header_only },
            &CancelToken::new(),
        );
        match error {
            Some(err) => Err(err),
            None => Ok(records),
        }
    }

    //
    // Scan
    //

    /// Stream every record of a namespace/set. Rows arrive per node in
    /// server-send order; drop the recordset or call `close` to stop early.
    pub fn scan(
        &self,
        policy: &ScanPolicy,
        namespace: &str,
        set_name: &str,
        bins: Bins,
    ) -> Result<Arc<Recordset>> {
        let nodes = self.cluster.nodes();
        if nodes.is_empty() {
            return Err(Error::new(ErrorKind::InvalidNode));
        }

        let task_id: u64 = rand::thread_rng().gen();
        let recordset = Arc::new(Recordset::new(nodes.len(), policy.max_records, task_id));

        let workers = if policy.concurrent_nodes == 0 {
            nodes.len()
        } else {
            policy.concurrent_nodes.min(nodes.len())
        };
        let queue: Arc<Mutex<VecDeque<Arc<Node>>>> =
            Arc::new(Mutex::new(nodes.into_iter().collect()));

        for _ in 0..workers {
            let queue = queue.clone();
            let recordset = recordset.clone();
            let policy = policy.clone();
            let namespace = namespace.to_string();
            let set_name = set_name.to_string();
            let bins = bins.clone();
            let log = self.log.new(logging::o!("task" => task_id));

            thread::spawn(move || loop {
                let node = queue.lock().expect("scan queue poisoned").pop_front();
                let node = match node {
                    Some(node) => node,
                    None => break,
                };
                if !recordset.is_active() {
                    recordset.signal_end();
                    continue;
                }

                let mut command = ScanCommand::new(
                    node,
                    policy.clone(),
                    namespace.clone(),
                    set_name.clone(),
                    bins.clone(),
                    recordset.clone(),
                );
                if let Err(err) = command.execute(&CancelToken::new()) {
                    if !matches!(err.kind, ErrorKind::Terminated) {
                        logging::warn!(log, "scan node failed";
                            "context" => "scan", "error" => %err);
                        recordset.push(Err(err));
                    }
                }
                recordset.signal_end();
            });
        }

        Ok(recordset)
    }

    //
    // UDF management
    //

    /// Register a UDF module under `server_path` via the info protocol.
    pub fn register_udf(
        &self,
        policy: &AdminPolicy,
        code: &[u8],
        server_path: &str,
        language: UdfLang,
    ) -> Result<()> {
        let content = flint::encoding::base64::encode(code);
        let request = format!(
            "udf-put:filename={};content={};content-len={};udf-type={};",
            server_path,
            content,
            content.len(),
            language.as_str()
        );
        self.with_admin_connection(policy, |conn| {
            let response = info_command::request_one(conn, &request)?;
            info_command::check_error(&response)?;
            Ok(())
        })
    }

    pub fn remove_udf(&self, policy: &AdminPolicy, server_path: &str) -> Result<()> {
        let request = format!("udf-remove:filename={};", server_path);
        self.with_admin_connection(policy, |conn| {
            let response = info_command::request_one(conn, &request)?;
            info_command::check_error(&response)?;
            Ok(())
        })
    }

    //
    // Transactions
    //

    /// Verify, commit and roll forward a transaction.
    pub fn commit_txn(
        &self,
        txn: &Arc<Txn>,
        verify_policy: &BatchPolicy,
        roll_policy: &BatchPolicy,
    ) -> Result<CommitStatus> {
        TxnRoll::new(self.cluster.clone()).commit(txn, verify_policy, roll_policy)
    }

    /// Abort a transaction, rolling back any writes.
    pub fn abort_txn(&self, txn: &Arc<Txn>, roll_policy: &BatchPolicy) -> Result<AbortStatus> {
        TxnRoll::new(self.cluster.clone()).abort(txn, roll_policy)
    }

    //
    // User administration
    //

    pub fn create_user(
        &self,
        policy: &AdminPolicy,
        user: &str,
        password: &str,
        roles: &[String],
    ) -> Result<()> {
        self.with_admin_connection(policy, |conn| {
            admin_command::create_user(conn, user, password, roles)
        })
    }

    pub fn drop_user(&self, policy: &AdminPolicy, user: &str) -> Result<()> {
        self.with_admin_connection(policy, |conn| admin_command::drop_user(conn, user))
    }

    pub fn set_password(&self, policy: &AdminPolicy, user: &str, password: &str) -> Result<()> {
        self.with_admin_connection(policy, |conn| {
            admin_command::set_password(conn, user, password)
        })
    }

    pub fn change_password(
        &self,
        policy: &AdminPolicy,
        user: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        self.with_admin_connection(policy, |conn| {
            admin_command::change_password(conn, user, old_password, new_password)
        })
    }

    pub fn grant_roles(&self, policy: &AdminPolicy, user: &str, roles: &[String]) -> Result<()> {
        self.with_admin_connection(policy, |conn| admin_command::grant_roles(conn, user, roles))
    }

    pub fn revoke_roles(&self, policy: &AdminPolicy, user: &str, roles: &[String]) -> Result<()> {
        self.with_admin_connection(policy, |conn| admin_command::revoke_roles(conn, user, roles))
    }

    pub fn replace_roles(&self, policy: &AdminPolicy, user: &str, roles: &[String]) -> Result<()> {
        self.with_admin_connection(policy, |conn| {
            admin_command::replace_roles(conn, user, roles)
        })
    }

    pub fn create_role(
        &self,
        policy: &AdminPolicy,
        role: &str,
        privileges: &[Privilege],
    ) -> Result<()> {
        self.with_admin_connection(policy, |conn| {
            admin_command::create_role(conn, role, privileges)
        })
    }

    pub fn query_users(&self, policy: &AdminPolicy) -> Result<Vec<AdminUser>> {
        self.with_admin_connection(policy, admin_command::query_users)
    }

    pub fn query_roles(&self, policy: &AdminPolicy) -> Result<Vec<Role>> {
        self.with_admin_connection(policy, admin_command::query_roles)
    }

    /// Run an admin exchange on any node, with pool custody mirroring the
    /// command engine: clean streams go back, tainted ones are closed.
    fn with_admin_connection<T, F>(&self, policy: &AdminPolicy, body: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let nodes = self.cluster.nodes();
        let node = nodes
            .first()
            .ok_or_else(|| Error::new(ErrorKind::InvalidNode))?;
        let mut conn = node.get_connection(policy.timeout)?;
        match body(&mut conn) {
            Ok(value) => {
                node.return_connection(conn);
                Ok(value)
            }
            Err(err) => {
                if err.keep_connection() {
                    node.return_connection(conn);
                } else {
                    node.close_connection(conn);
                    node.record_error();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testutil::*;
    use byteorder::WriteBytesExt;

    #[test]
    fn test_create_user_round_trip() {
        let server = MockServer::start(vec![Script::Reply(admin_status_response(0))]);
        let client = Client::with_cluster(mock_cluster(&server));

        client
            .create_user(
                &AdminPolicy::default(),
                "alice",
                "hunter2",
                &["ops".to_string()],
            )
            .unwrap();

        let request = server.request(0);
        assert_eq!(request[1], 2); // admin proto type
        assert_eq!(request[10], 1); // CREATE_USER
        assert_eq!(request[11], 3); // user, password, roles
    }

    #[test]
    fn test_admin_error_surfaces_result_code() {
        let server = MockServer::start(vec![Script::Reply(admin_status_response(61))]);
        let client = Client::with_cluster(mock_cluster(&server));
        let err = client
            .create_user(&AdminPolicy::default(), "alice", "pw", &[])
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::UserExists));
    }

    #[test]
    fn test_query_users_streams_until_end() {
        // One user record followed by the QUERY_END marker.
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 2]); // status ok, two fields
        body.write_u32::<byteorder::BigEndian>("alice".len() as u32 + 1).unwrap();
        body.write_u8(0).unwrap(); // USER field
        body.extend_from_slice(b"alice");
        body.write_u32::<byteorder::BigEndian>(1 + 1 + 3 + 1).unwrap();
        body.write_u8(10).unwrap(); // ROLES field
        body.write_u8(1).unwrap(); // one role
        body.write_u8(3).unwrap();
        body.extend_from_slice(b"ops");
        body.extend_from_slice(&[0, 50, 0, 0]); // QUERY_END record

        let server = MockServer::start(vec![Script::Reply(admin_frame(body))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let users = client.query_users(&AdminPolicy::default()).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "alice");
        assert_eq!(users[0].roles, vec!["ops".to_string()]);
    }

    #[test]
    fn test_register_udf_sends_base64_content() {
        let code = b"function hello() return 1 end";
        let server = MockServer::start(vec![Script::Reply(info_response("udf-put\tok\n"))]);
        let client = Client::with_cluster(mock_cluster(&server));

        client
            .register_udf(&AdminPolicy::default(), code, "hello.lua", UdfLang::Lua)
            .unwrap();

        let request = server.request(0);
        let text = String::from_utf8(request[8..].to_vec()).unwrap();
        assert!(text.starts_with("udf-put:filename=hello.lua;content="));
        assert!(text.contains(&flint::encoding::base64::encode(&code[..])));
        assert!(text.contains("udf-type=LUA"));
    }

    #[test]
    fn test_register_udf_error_response() {
        let server = MockServer::start(vec![Script::Reply(info_response(
            "error=compile failed at line 3\n",
        ))]);
        let client = Client::with_cluster(mock_cluster(&server));
        let err = client
            .register_udf(&AdminPolicy::default(), b"x", "bad.lua", UdfLang::Lua)
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Udf(_)));
    }

    #[test]
    fn test_scan_streams_records() {
        let d1 = [1u8; 20];
        let d2 = [2u8; 20];
        let server = MockServer::start(vec![Script::Reply(stream_response(vec![
            scan_row("ns1", "set1", &d1, &[("v", Value::Int(1))]),
            scan_row("ns1", "set1", &d2, &[("v", Value::Int(2))]),
        ]))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let recordset = client
            .scan(&ScanPolicy::default(), "ns1", "set1", Bins::All)
            .unwrap();

        let mut values = Vec::new();
        for record in &*recordset {
            let record = record.unwrap();
            values.push(record.bins.get("v").cloned().unwrap());
            let key = record.key.as_ref().unwrap();
            assert_eq!(key.namespace, "ns1");
        }
        values.sort_by_key(|value| match value {
            Value::Int(v) => *v,
            _ => 0,
        });
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
    }
}
