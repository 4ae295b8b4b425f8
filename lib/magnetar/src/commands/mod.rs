//! Command execution: one trait per wire operation family plus the shared
//! retry engine. The engine owns deadline arithmetic, connection custody,
//! error classification and the in-doubt verdict; commands own buffer
//! construction and response parsing.

pub mod admin_command;
pub mod buffer;
pub mod delete_command;
pub mod execute_udf_command;
pub mod exists_command;
pub mod field_type;
pub mod info_command;
pub mod operate_command;
pub mod read_command;
pub mod scan_command;
pub mod single_command;
pub mod stream_command;
pub mod touch_command;
pub mod write_command;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::read_command::ReadCommand;
pub use self::single_command::SingleCommand;

use crate::cluster::Node;
use crate::errors::{Error, ErrorKind, PolicySnapshot, Result};
use crate::net::Connection;
use crate::policy::BasePolicy;
use crate::result_code::ResultCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Latency category a command's successful attempts are recorded under.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LatencyType {
    Read = 0,
    Write = 1,
    Batch = 2,
    Scan = 3,
    Query = 4,
}

/// Cooperative cancellation handle. Observed before every attempt and every
/// sleep; cancellation surfaces as its own error kind, never as a timeout.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One wire operation driven by the retry engine.
pub trait Command {
    fn policy(&self) -> &BasePolicy;

    /// Build the request into the connection buffer. Must be idempotent;
    /// it runs once per attempt.
    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()>;

    /// Pick the node for the current attempt.
    fn get_node(&mut self) -> Result<Arc<Node>>;

    /// Read and decode the response, leaving the stream clean on success.
    fn parse_result(&mut self, conn: &mut Connection) -> Result<()>;

    /// Advance routing state for the next attempt. Returning false vetoes
    /// the retry and surfaces the current failure.
    fn prepare_retry(&mut self, timed_out: bool) -> bool;

    /// Multi-node commands may complete a retry by re-fanning out over a
    /// freshly computed node set; returning true ends the command.
    fn retry_batch(&mut self, _cancel: &CancelToken) -> Result<bool> {
        Ok(false)
    }

    fn is_write(&self) -> bool;

    fn latency_type(&self) -> LatencyType;

    /// Invoked once when the final error is classified in-doubt.
    fn on_in_doubt(&mut self) {}
}

/// Blocking entry point.
pub fn execute(cmd: &mut dyn Command) -> Result<()> {
    execute_cancellable(cmd, &CancelToken::new())
}

/// Cooperative entry point sharing the same state machine; the token is
/// polled at every suspension point.
pub fn execute_cancellable(cmd: &mut dyn Command, cancel: &CancelToken) -> Result<()> {
    let zero = Duration::from_secs(0);
    let (total_timeout, initial_socket_timeout, max_retries, sleep_between_retries) = {
        let policy = cmd.policy();
        (
            policy.total_timeout,
            policy.initial_socket_timeout(),
            policy.max_retries,
            policy.sleep_between_retries,
        )
    };
    let snapshot = PolicySnapshot {
        socket_timeout: initial_socket_timeout,
        total_timeout,
        max_retries,
    };
    let total_deadline = if total_timeout > zero {
        Some(Instant::now() + total_timeout)
    } else {
        None
    };

    let mut socket_timeout = initial_socket_timeout;
    let mut iteration: u32 = 1;
    let mut command_sent: u32 = 0;
    let mut last_node: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(finalize(
                cmd,
                Error::new(ErrorKind::Cancelled),
                iteration,
                command_sent,
                last_node,
                snapshot,
            ));
        }

        let err = match run_attempt(cmd, socket_timeout, &mut command_sent, &mut last_node) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.retryable() || iteration > max_retries {
            return Err(finalize(cmd, err, iteration, command_sent, last_node, snapshot));
        }

        match cmd.retry_batch(cancel) {
            Ok(true) => return Ok(()),
            Ok(false) => (),
            Err(hook_err) => {
                return Err(finalize(
                    cmd,
                    hook_err,
                    iteration,
                    command_sent,
                    last_node,
                    snapshot,
                ))
            }
        }

        // Client-side socket deadlines already drained their budget; they
        // retry without sleeping.
        let client_timeout = err.client_timeout();
        let sleep = if client_timeout {
            zero
        } else {
            sleep_between_retries
        };

        if let Some(deadline) = total_deadline {
            if Instant::now() + sleep >= deadline {
                let surfaced = match err.kind {
                    ErrorKind::Timeout { .. } | ErrorKind::Server(ResultCode::Timeout) => err,
                    _ => Error::new(ErrorKind::Timeout { client: true }),
                };
                return Err(finalize(
                    cmd,
                    surfaced,
                    iteration,
                    command_sent,
                    last_node,
                    snapshot,
                ));
            }
        }

        if sleep > zero {
            thread::sleep(sleep);
        }

        if !cmd.prepare_retry(client_timeout) {
            return Err(finalize(cmd, err, iteration, command_sent, last_node, snapshot));
        }
        iteration += 1;

        if let Some(deadline) = total_deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == zero {
                return Err(finalize(
                    cmd,
                    Error::new(ErrorKind::Timeout { client: true }),
                    iteration,
                    command_sent,
                    last_node,
                    snapshot,
                ));
            }
            if socket_timeout == zero || socket_timeout > remaining {
                socket_timeout = remaining;
            }
        }
    }
}

fn run_attempt(
    cmd: &mut dyn Command,
    socket_timeout: Duration,
    command_sent: &mut u32,
    last_node: &mut Option<String>,
) -> Result<()> {
    let node = cmd.get_node()?;
    *last_node = Some(node.name().to_string());

    let mut conn = node.get_connection(socket_timeout)?;

    if let Err(err) = cmd.write_buffer(&mut conn) {
        // Build failures happen before any bytes move; the stream is clean.
        node.return_connection(conn);
        return Err(err);
    }

    let started = Instant::now();
    if let Err(err) = conn.flush() {
        node.close_connection(conn);
        node.record_error();
        return Err(err);
    }
    *command_sent += 1;

    match cmd.parse_result(&mut conn) {
        Ok(()) => {
            node.return_connection(conn);
            node.record_latency(cmd.latency_type(), started.elapsed());
            Ok(())
        }
        Err(err) => {
            match err.kind {
                ErrorKind::Server(ResultCode::Timeout) => {
                    node.record_timeout();
                    node.return_connection(conn);
                }
                ErrorKind::Server(ResultCode::DeviceOverload) => {
                    node.record_error();
                    node.return_connection(conn);
                }
                _ if err.keep_connection() => node.return_connection(conn),
                ErrorKind::Timeout { client: true } => {
                    node.record_timeout();
                    node.close_connection(conn);
                }
                _ => {
                    node.record_error();
                    node.close_connection(conn);
                }
            }
            Err(err)
        }
    }
}

fn finalize(
    cmd: &mut dyn Command,
    mut err: Error,
    iteration: u32,
    command_sent: u32,
    node: Option<String>,
    snapshot: PolicySnapshot,
) -> Error {
    err.iteration = iteration;
    if err.node.is_none() {
        err.node = node;
    }
    err.policy = snapshot;
    err.in_doubt = cmd.is_write() && command_sent > 0 && !err.definitely_not_applied();
    if err.in_doubt {
        cmd.on_in_doubt();
    }
    err
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::bin::{Bin, Bins};
    use crate::client::Client;
    use crate::cluster::{Cluster, Node, NodeFeatures, PartitionMap, N_PARTITIONS};
    use crate::key::Key;
    use crate::policy::{ClientPolicy, GenerationPolicy, ReadPolicy, WritePolicy};
    use crate::value::Value;
    use byteorder::{BigEndian, ByteOrder};

    // Read of an existing key: exact outbound header, parsed record.
    #[test]
    fn test_read_existing_key() {
        let server = MockServer::start(vec![Script::Reply(single_response(
            0,
            4,
            1_700_000_000,
            &[("age", Value::Int(30))],
        ))]);
        let cluster = mock_cluster(&server);
        let client = Client::with_cluster(cluster);

        let key = Key::new("ns1", "set1", "alice").unwrap();
        let record = client
            .get(&ReadPolicy::default(), &key, Bins::All)
            .unwrap()
            .unwrap();

        assert_eq!(record.generation, 4);
        assert_eq!(record.expiration, 1_700_000_000);
        assert_eq!(record.bins.get("age"), Some(&Value::Int(30)));

        let request = server.request(0);
        assert_eq!(request[0], 2); // proto version
        assert_eq!(request[1], 3); // AS_MSG
        let announced = BigEndian::read_u64(&request[..8]) & 0x0000_FFFF_FFFF_FFFF;
        assert_eq!(announced as usize, request.len() - 8);
        assert_eq!(request[9] & super::buffer::INFO1_READ, super::buffer::INFO1_READ);
    }

    #[test]
    fn test_read_missing_key_is_none() {
        let server = MockServer::start(vec![Script::Reply(single_response(2, 0, 0, &[]))]);
        let client = Client::with_cluster(mock_cluster(&server));
        let key = Key::new("ns1", "set1", "ghost").unwrap();
        let record = client.get(&ReadPolicy::default(), &key, Bins::All).unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn test_read_compressed_response() {
        let plain = single_response(0, 9, 0, &[("n", Value::from("zipped"))]);
        let server = MockServer::start(vec![Script::Reply(compressed(plain))]);
        let client = Client::with_cluster(mock_cluster(&server));
        let key = Key::new("ns1", "set1", "z").unwrap();
        let record = client
            .get(&ReadPolicy::default(), &key, Bins::All)
            .unwrap()
            .unwrap();
        assert_eq!(record.generation, 9);
        assert_eq!(record.bins.get("n"), Some(&Value::from("zipped")));
    }

    // Write with generation mismatch: surfaced at once, not in doubt.
    #[test]
    fn test_write_generation_mismatch() {
        let server = MockServer::start(vec![Script::Reply(single_response(3, 0, 0, &[]))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let mut policy = WritePolicy::default();
        policy.generation_policy = GenerationPolicy::ExpectEqual;
        policy.generation = 7;
        let key = Key::new("ns1", "set1", "k").unwrap();

        let err = client
            .put(&policy, &key, &[Bin::new("a", 1i64)])
            .unwrap_err();
        assert_eq!(err.result_code(), Some(crate::ResultCode::GenerationError));
        assert!(!err.in_doubt);
        assert_eq!(err.iteration, 1);
        assert_eq!(server.request_count(), 1);
    }

    // Device overload on the first replica, success on the second.
    #[test]
    fn test_retry_on_device_overload_moves_replica() {
        let server_a = MockServer::start(vec![Script::Reply(single_response(18, 0, 0, &[]))]);
        let server_b =
            MockServer::start(vec![Script::Reply(single_response(0, 1, 0, &[("v", Value::Int(1))]))]);

        let cluster = Cluster::new(ClientPolicy::default(), None);
        let node_a = std::sync::Arc::new(
            Node::new(
                "a".to_string(),
                server_a.host.clone(),
                NodeFeatures::default(),
                &ClientPolicy::default(),
                None,
            )
            .unwrap(),
        );
        let node_b = std::sync::Arc::new(
            Node::new(
                "b".to_string(),
                server_b.host.clone(),
                NodeFeatures::default(),
                &ClientPolicy::default(),
                None,
            )
            .unwrap(),
        );
        cluster.add_node(node_a.clone());
        cluster.add_node(node_b.clone());

        let mut map = PartitionMap::new();
        for pid in 0..N_PARTITIONS {
            map.set_owner("ns1", 0, pid, node_a.clone());
            map.set_owner("ns1", 1, pid, node_b.clone());
        }
        cluster.set_partition_map(map);

        let client = Client::with_cluster(std::sync::Arc::new(cluster));
        let key = Key::new("ns1", "set1", "k").unwrap();
        let record = client
            .get(&ReadPolicy::default(), &key, Bins::All)
            .unwrap()
            .unwrap();

        assert_eq!(record.bins.get("v"), Some(&Value::Int(1)));
        assert_eq!(server_a.request_count(), 1);
        assert_eq!(server_b.request_count(), 1);
        assert_eq!(node_a.error_count(), 1);
        assert_eq!(node_b.error_count(), 0);
    }

    #[test]
    fn test_total_deadline_surfaces_client_timeout() {
        let server = MockServer::start(vec![
            Script::Hold,
            Script::Hold,
            Script::Hold,
            Script::Hold,
        ]);
        let client = Client::with_cluster(mock_cluster(&server));

        let mut policy = ReadPolicy::default();
        policy.socket_timeout = std::time::Duration::from_millis(40);
        policy.total_timeout = std::time::Duration::from_millis(100);
        policy.max_retries = 10;
        let key = Key::new("ns1", "set1", "slow").unwrap();

        let started = std::time::Instant::now();
        let err = client.get(&policy, &key, Bins::All).unwrap_err();
        assert!(err.client_timeout(), "got {:?}", err.kind);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_cancellation_prevents_io() {
        let server = MockServer::start(vec![]);
        let cluster = mock_cluster(&server);
        let policy = ReadPolicy::default();
        let key = Key::new("ns1", "set1", "k").unwrap();
        let mut command = ReadCommand::new(&policy, cluster, &key, Bins::All);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = super::execute_cancellable(&mut command, &cancel).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Cancelled));
        assert_eq!(server.request_count(), 0);
    }

    #[test]
    fn test_server_error_not_retried() {
        let server = MockServer::start(vec![Script::Reply(single_response(4, 0, 0, &[]))]);
        let client = Client::with_cluster(mock_cluster(&server));
        let key = Key::new("ns1", "set1", "k").unwrap();
        let err = client
            .get(&ReadPolicy::default(), &key, Bins::All)
            .unwrap_err();
        assert_eq!(err.result_code(), Some(crate::ResultCode::ParameterError));
        assert_eq!(server.request_count(), 1);
    }

    // Multiple operations on one bin collapse into an ordered list.
    #[test]
    fn test_multi_value_bin_collapse() {
        let server = MockServer::start(vec![Script::Reply(single_response(
            0,
            1,
            0,
            &[
                ("counter", Value::Int(10)),
                ("counter", Value::Int(20)),
                ("other", Value::from("x")),
            ],
        ))]);
        let client = Client::with_cluster(mock_cluster(&server));
        let key = Key::new("ns1", "set1", "multi").unwrap();
        let record = client
            .get(&ReadPolicy::default(), &key, Bins::All)
            .unwrap()
            .unwrap();

        assert_eq!(
            record.bins.get("counter"),
            Some(&Value::List(vec![Value::Int(10), Value::Int(20)]))
        );
        assert_eq!(record.bins.get("other"), Some(&Value::from("x")));
    }
}
