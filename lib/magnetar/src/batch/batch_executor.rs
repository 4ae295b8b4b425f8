use crate::batch::batch_direct_command::BatchDirectCommand;
use crate::batch::batch_index_command::BatchIndexCommand;
use crate::batch::{batch_replica, group_by_node, split_by_namespace, BatchRecord};
use crate::bin::Bins;
use crate::cluster::Cluster;
use crate::commands::CancelToken;
use crate::errors::{Error, Result};
use crate::key::Key;
use crate::policy::BatchPolicy;
use crate::txn::Txn;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

/// What each batch entry asks the server to do.
#[derive(Clone)]
pub(crate) enum BatchRequest {
    Read { bins: Bins, header_only: bool },
    /// Check every entry's recorded version (transaction verify).
    Verify,
    /// Apply the transaction roll intent to every entry.
    Roll { txn: Arc<Txn>, attr: u8 },
}

enum BatchAnyCommand {
    Index(BatchIndexCommand),
    Direct(BatchDirectCommand),
}

impl BatchAnyCommand {
    fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        match self {
            BatchAnyCommand::Index(cmd) => cmd.run(cancel),
            BatchAnyCommand::Direct(cmd) => cmd.run(cancel),
        }
    }
}

/// Fan a batch out over its owning nodes and collect positional results.
/// The result vector always has one slot per input item, in input order;
/// the optional error is the first worker failure (remaining workers are
/// stopped as soon as it happens).
pub(crate) fn execute_batch(
    cluster: &Arc<Cluster>,
    policy: &BatchPolicy,
    items: Vec<(Key, Option<u64>)>,
    request: BatchRequest,
    cancel: &CancelToken,
) -> (Vec<BatchRecord>, Option<Error>) {
    if items.is_empty() {
        return (Vec::new(), None);
    }

    let results: Vec<BatchRecord> = items
        .iter()
        .map(|(key, _)| BatchRecord::pending(key.clone()))
        .collect();
    let results = Arc::new(Mutex::new(results));

    // Sub-ordinate reads go to proles only when the policy allows it.
    let mut route_policy = policy.base.clone();
    route_policy.replica = batch_replica(&policy.base, policy.allow_prole_reads);
    let groups = match group_by_node(cluster, &items, &route_policy) {
        Ok(groups) => groups,
        Err(err) => return (unwrap_results(results), Some(err)),
    };

    // Workers observe this token so the first failure stops the rest; the
    // caller's token feeds into it.
    let stop = CancelToken::new();

    let mut commands: Vec<BatchAnyCommand> = Vec::new();
    for group in groups {
        if group.node.supports_batch_index() {
            commands.push(BatchAnyCommand::Index(BatchIndexCommand::new(
                cluster.clone(),
                policy.clone(),
                group.node,
                group.entries,
                request.clone(),
                results.clone(),
                stop.clone(),
            )));
        } else {
            match &request {
                BatchRequest::Read { bins, header_only } => {
                    for (namespace, entries) in split_by_namespace(&group.entries) {
                        commands.push(BatchAnyCommand::Direct(BatchDirectCommand::new(
                            policy.clone(),
                            group.node.clone(),
                            namespace,
                            entries,
                            bins.clone(),
                            *header_only,
                            results.clone(),
                            stop.clone(),
                        )));
                    }
                }
                _ => {
                    let err = Error::invalid_argument(format!(
                        "node {} does not support transaction batches",
                        group.node.name()
                    ));
                    return (unwrap_results(results), Some(err));
                }
            }
        }
    }

    let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    if policy.max_concurrent_threads == 1 || commands.len() == 1 {
        // Sequential on the caller.
        for command in commands.iter_mut() {
            if cancel.is_cancelled() || stop.is_cancelled() {
                break;
            }
            if let Err(err) = command.run(cancel) {
                *first_error.lock().expect("latch poisoned") = Some(err);
                break;
            }
        }
    } else {
        let worker_cap = if policy.max_concurrent_threads == 0 {
            commands.len()
        } else {
            policy.max_concurrent_threads.min(commands.len())
        };

        let queue: Arc<Mutex<VecDeque<BatchAnyCommand>>> =
            Arc::new(Mutex::new(commands.into_iter().collect()));
        let mut workers = Vec::with_capacity(worker_cap);

        for _ in 0..worker_cap {
            let queue = queue.clone();
            let stop = stop.clone();
            let cancel = cancel.clone();
            let first_error = first_error.clone();

            workers.push(thread::spawn(move || loop {
                if cancel.is_cancelled() {
                    stop.cancel();
                }
                if stop.is_cancelled() {
                    break;
                }
                let command = queue.lock().expect("queue poisoned").pop_front();
                let mut command = match command {
                    Some(command) => command,
                    None => break,
                };
                if let Err(err) = command.run(&stop) {
                    let mut latch = first_error.lock().expect("latch poisoned");
                    if latch.is_none() {
                        *latch = Some(err);
                    }
                    // First error wins and stops the other workers.
                    stop.cancel();
                    break;
                }
            }));
        }

        for worker in workers {
            let _ = worker.join();
        }
    }

    let error = first_error.lock().expect("latch poisoned").take();
    (unwrap_results(results), error)
}

fn unwrap_results(results: Arc<Mutex<Vec<BatchRecord>>>) -> Vec<BatchRecord> {
    match Arc::try_unwrap(results) {
        Ok(mutex) => mutex.into_inner().expect("batch results poisoned"),
        Err(shared) => shared.lock().expect("batch results poisoned").clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::commands::buffer::MSG_TOTAL_HEADER_SIZE;
    use crate::commands::testutil::*;
    use crate::policy::BatchPolicy;
    use crate::value::Value;
    use byteorder::{BigEndian, ByteOrder};

    #[test]
    fn test_empty_batch_does_no_io() {
        let server = MockServer::start(vec![]);
        let client = Client::with_cluster(mock_cluster(&server));
        let result = client
            .batch_exists(&BatchPolicy::default(), &[])
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(server.request_count(), 0);
    }

    // Duplicate keys share one wire entry; every input position answers.
    #[test]
    fn test_batch_exists_with_duplicate_key() {
        let k1 = Key::new("ns1", "set1", "k1").unwrap();
        let k2 = Key::new("ns1", "set1", "k2").unwrap();

        let server = MockServer::start(vec![Script::Reply(stream_response(vec![
            batch_row(0, &k1.digest, &[]),
            batch_row(2, &k2.digest, &[]),
        ]))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let keys = vec![k1.clone(), k1.clone(), k2.clone()];
        let exists = client.batch_exists(&BatchPolicy::default(), &keys).unwrap();
        assert_eq!(exists, vec![true, true, true]);

        // One frame, two entries: the duplicate was folded. The count sits
        // right behind the batch field header, which follows the 30-byte
        // request header.
        assert_eq!(server.request_count(), 1);
        let request = server.request(0);
        let entry_count = BigEndian::read_u32(&request[MSG_TOTAL_HEADER_SIZE + 5..]);
        assert_eq!(entry_count, 2);
    }

    #[test]
    fn test_batch_get_missing_and_present() {
        let k1 = Key::new("ns1", "set1", "hit").unwrap();
        let k2 = Key::new("ns1", "set1", "miss").unwrap();

        let server = MockServer::start(vec![Script::Reply(stream_response(vec![batch_row(
            0,
            &k1.digest,
            &[("v", Value::Int(5))],
        )]))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let records = client
            .batch_read_records(
                &BatchPolicy::default(),
                &[k1.clone(), k2.clone()],
                crate::Bins::All,
                false,
            )
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].result_code, Some(crate::ResultCode::Ok));
        assert_eq!(
            records[0].record.as_ref().unwrap().bins.get("v"),
            Some(&Value::Int(5))
        );
        // The absent slot stayed pending in the index dialect: the server
        // never mentioned it and no error was raised.
        assert!(records[1].record.is_none());
        assert_eq!(records[0].key.digest, k1.digest);
        assert_eq!(records[1].key.digest, k2.digest);
    }

    // Old servers take the per-namespace digest-array dialect.
    #[test]
    fn test_batch_direct_dialect_marks_absent_keys() {
        let k1 = Key::new("ns1", "set1", "one").unwrap();
        let k2 = Key::new("ns1", "set1", "two").unwrap();

        let server = MockServer::start(vec![Script::Reply(stream_response(vec![batch_row(
            0,
            &k1.digest,
            &[("v", Value::Int(9))],
        )]))]);
        let cluster = mock_cluster_with(
            &server,
            crate::cluster::NodeFeatures { batch_index: false },
        );
        let client = Client::with_cluster(cluster);

        let records = client
            .batch_read_records(
                &BatchPolicy::default(),
                &[k1.clone(), k2.clone()],
                crate::Bins::All,
                false,
            )
            .unwrap();

        assert_eq!(records[0].result_code, Some(crate::ResultCode::Ok));
        assert_eq!(
            records[1].result_code,
            Some(crate::ResultCode::KeyNotFoundError)
        );
    }

    #[test]
    fn test_batch_stream_error_surfaces() {
        let k1 = Key::new("ns1", "set1", "bad").unwrap();
        let server = MockServer::start(vec![Script::Reply(error_row_response(4))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let err = client
            .batch_exists(&BatchPolicy::default(), &[k1])
            .unwrap_err();
        assert_eq!(err.result_code(), Some(crate::ResultCode::ParameterError));
    }
}
