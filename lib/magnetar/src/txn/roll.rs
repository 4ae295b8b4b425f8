//! Commit and abort orchestration:
//! verify → mark-roll-forward → roll-forward → close, with the abort
//! variant rolling back instead. Failures after the commit point degrade
//! to partial statuses rather than errors; failures before it unwind with
//! a composite error carrying both record arrays.

use crate::batch::{execute_batch, BatchRecord, BatchRequest};
use crate::cluster::Cluster;
use crate::commands::buffer::{INFO4_MRT_ROLL_BACK, INFO4_MRT_ROLL_FORWARD};
use crate::commands::CancelToken;
use crate::errors::{CommitFailure, Error, ErrorKind, Result};
use crate::policy::BatchPolicy;
use crate::result_code::ResultCode;
use crate::txn::{monitor, AbortStatus, CommitStage, CommitStatus, Txn, TxnState};
use std::sync::Arc;

/// Drives transactions to their terminal state.
pub struct TxnRoll {
    cluster: Arc<Cluster>,
}

impl TxnRoll {
    pub fn new(cluster: Arc<Cluster>) -> TxnRoll {
        TxnRoll { cluster }
    }

    /// Commit: verify every recorded read against its version, record the
    /// roll-forward decision on the monitor, apply the writes, close the
    /// monitor. A verify failure aborts the transaction (roll-back plus
    /// close) and surfaces a composite error.
    pub fn commit(
        &self,
        txn: &Arc<Txn>,
        verify_policy: &BatchPolicy,
        roll_policy: &BatchPolicy,
    ) -> Result<CommitStatus> {
        txn.ensure_open()?;

        let reads = txn.reads_snapshot();
        let (verify_records, verify_error) = if reads.is_empty() {
            (Vec::new(), None)
        } else {
            let items = reads
                .into_iter()
                .map(|(key, version)| (key, Some(version)))
                .collect();
            execute_batch(
                &self.cluster,
                verify_policy,
                items,
                BatchRequest::Verify,
                &CancelToken::new(),
            )
        };

        if let Some(cause) = verify_error {
            let (roll_records, mut secondary) =
                self.roll(txn, roll_policy, INFO4_MRT_ROLL_BACK);
            if secondary.is_none() && txn.monitor_might_exist() {
                secondary = monitor::close_monitor(&self.cluster, txn).err();
            }
            txn.transition(TxnState::Aborted);
            return Err(Error::new(ErrorKind::Commit(Box::new(CommitFailure {
                stage: CommitStage::Verify,
                verify_records,
                roll_records,
                cause,
                secondary,
            }))));
        }
        txn.transition(TxnState::Verified);

        let writes = txn.writes_snapshot();
        if writes.is_empty() && !txn.monitor_might_exist() {
            // Read-only transaction with nothing to roll or clean up.
            txn.transition(TxnState::Committed);
            return Ok(CommitStatus::Ok);
        }

        if let Err(cause) = monitor::mark_roll_forward(&self.cluster, txn) {
            if cause.result_code() == Some(ResultCode::MrtAborted) {
                // Another actor already aborted the txn; the outcome is
                // definitive, not in doubt.
                txn.clear_in_doubt();
                txn.transition(TxnState::Aborted);
            }
            return Err(Error::new(ErrorKind::Commit(Box::new(CommitFailure {
                stage: CommitStage::MarkRollForward,
                verify_records,
                roll_records: Vec::new(),
                cause,
                secondary: None,
            }))));
        }
        txn.transition(TxnState::Committed);

        let (_, roll_error) = self.roll(txn, roll_policy, INFO4_MRT_ROLL_FORWARD);
        if roll_error.is_some() {
            // The commit stands; the server finishes the roll on its own.
            return Ok(CommitStatus::RollForwardAbandoned);
        }

        if txn.monitor_might_exist() && monitor::close_monitor(&self.cluster, txn).is_err() {
            return Ok(CommitStatus::CloseAbandoned);
        }
        Ok(CommitStatus::Ok)
    }

    /// Abort: mark the txn aborted, roll back its writes, close the
    /// monitor if one may exist.
    pub fn abort(&self, txn: &Arc<Txn>, roll_policy: &BatchPolicy) -> Result<AbortStatus> {
        match txn.state() {
            TxnState::Open | TxnState::Verified => (),
            state => {
                return Err(Error::invalid_argument(format!(
                    "transaction {} is {:?}",
                    txn.id(),
                    state
                )))
            }
        }
        txn.transition(TxnState::Aborted);

        let (_, roll_error) = self.roll(txn, roll_policy, INFO4_MRT_ROLL_BACK);
        if roll_error.is_some() {
            return Ok(AbortStatus::RollBackAbandoned);
        }

        if txn.monitor_might_exist() && monitor::close_monitor(&self.cluster, txn).is_err() {
            return Ok(AbortStatus::CloseAbandoned);
        }
        Ok(AbortStatus::Ok)
    }

    fn roll(
        &self,
        txn: &Arc<Txn>,
        policy: &BatchPolicy,
        attr: u8,
    ) -> (Vec<BatchRecord>, Option<Error>) {
        let writes = txn.writes_snapshot();
        if writes.is_empty() {
            return (Vec::new(), None);
        }
        let items = writes.into_iter().map(|key| (key, None)).collect();
        execute_batch(
            &self.cluster,
            policy,
            items,
            BatchRequest::Roll {
                txn: txn.clone(),
                attr,
            },
            &CancelToken::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin::Bin;
    use crate::client::Client;
    use crate::commands::testutil::*;
    use crate::key::Key;
    use crate::policy::WritePolicy;
    use crate::result_code::ResultCode;
    use crate::txn::TxnState;

    // Happy path: monitor upkeep, write, verify, mark, roll forward, close.
    #[test]
    fn test_commit_happy_path() {
        let txn = Arc::new(Txn::with_id(99));
        let ka = Key::new("ns1", "set1", "ra").unwrap();
        let kb = Key::new("ns1", "set1", "rb").unwrap();
        let kw = Key::new("ns1", "set1", "w").unwrap();
        txn.on_read(ka, 11).unwrap();
        txn.on_read(kb, 12).unwrap();

        let deadline_le = vec![0x04, 0x03, 0x02, 0x01];
        let server = MockServer::start(vec![
            // TxnAddKeys operate on the monitor, answering the deadline.
            Script::Reply(single_response_with_fields(0, 1, 0, &[(6, deadline_le)], &[])),
            // The user write itself.
            Script::Reply(single_response(0, 1, 0, &[])),
            // Verify both reads.
            Script::Reply(stream_response(vec![batch_row(0, &[1; 20], &[]), batch_row(1, &[2; 20], &[])])),
            // Mark roll forward on the monitor.
            Script::Reply(single_response(0, 2, 0, &[])),
            // Roll the write forward.
            Script::Reply(stream_response(vec![batch_row(0, &[3; 20], &[])])),
            // Close the monitor.
            Script::Reply(single_response(0, 0, 0, &[])),
        ]);
        let cluster = mock_cluster(&server);
        let client = Client::with_cluster(cluster);

        let mut write_policy = WritePolicy::default();
        write_policy.base.txn = Some(txn.clone());
        client
            .put(&write_policy, &kw, &[Bin::new("a", 1i64)])
            .unwrap();
        assert!(txn.monitor_exists());
        assert_eq!(txn.deadline(), 0x0102_0304);
        assert!(txn.writes_contain(&kw));

        let status = client
            .commit_txn(&txn, &BatchPolicy::default(), &BatchPolicy::default())
            .unwrap();

        assert_eq!(status, CommitStatus::Ok);
        assert_eq!(txn.state(), TxnState::Committed);
        assert!(!txn.in_doubt());
        assert_eq!(server.request_count(), 6);
    }

    // A version mismatch fails verification and aborts the transaction.
    #[test]
    fn test_commit_verify_failure_aborts() {
        let txn = Arc::new(Txn::with_id(7));
        let key = Key::new("ns1", "set1", "stale").unwrap();
        txn.on_read(key, 5).unwrap();

        let server = MockServer::start(vec![Script::Reply(error_row_response(124))]);
        let client = Client::with_cluster(mock_cluster(&server));

        let err = client
            .commit_txn(&txn, &BatchPolicy::default(), &BatchPolicy::default())
            .unwrap_err();

        match &err.kind {
            crate::errors::ErrorKind::Commit(failure) => {
                assert_eq!(failure.stage, CommitStage::Verify);
                assert_eq!(
                    failure.cause.result_code(),
                    Some(ResultCode::MrtVersionMismatch)
                );
                assert!(failure.secondary.is_none());
            }
            other => panic!("expected commit error, got {:?}", other),
        }
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn test_abort_rolls_back_and_closes() {
        let txn = Arc::new(Txn::with_id(8));
        let kw = Key::new("ns1", "set1", "w").unwrap();
        txn.on_write(kw).unwrap();
        txn.set_monitor_exists();

        let server = MockServer::start(vec![
            // Roll back the write.
            Script::Reply(stream_response(vec![batch_row(0, &[1; 20], &[])])),
            // Close the monitor.
            Script::Reply(single_response(0, 0, 0, &[])),
        ]);
        let client = Client::with_cluster(mock_cluster(&server));

        let status = client.abort_txn(&txn, &BatchPolicy::default()).unwrap();
        assert_eq!(status, AbortStatus::Ok);
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(server.request_count(), 2);
    }

    #[test]
    fn test_commit_after_terminal_state_fails() {
        let txn = Arc::new(Txn::with_id(9));
        txn.transition(TxnState::Aborted);

        let server = MockServer::start(vec![]);
        let client = Client::with_cluster(mock_cluster(&server));
        let err = client
            .commit_txn(&txn, &BatchPolicy::default(), &BatchPolicy::default())
            .unwrap_err();
        assert!(matches!(
            err.kind,
            crate::errors::ErrorKind::InvalidArgument(_)
        ));
        assert_eq!(server.request_count(), 0);
    }

    // Mark answered with "already aborted": definitive, not in doubt.
    #[test]
    fn test_commit_mark_already_aborted() {
        let txn = Arc::new(Txn::with_id(10));
        let kw = Key::new("ns1", "set1", "w").unwrap();
        txn.on_write(kw).unwrap();
        txn.set_monitor_exists();

        let server = MockServer::start(vec![
            // Mark roll forward rejected: txn was aborted elsewhere.
            Script::Reply(single_response(122, 0, 0, &[])),
        ]);
        let client = Client::with_cluster(mock_cluster(&server));

        let err = client
            .commit_txn(&txn, &BatchPolicy::default(), &BatchPolicy::default())
            .unwrap_err();
        match &err.kind {
            crate::errors::ErrorKind::Commit(failure) => {
                assert_eq!(failure.stage, CommitStage::MarkRollForward);
                assert_eq!(failure.cause.result_code(), Some(ResultCode::MrtAborted));
            }
            other => panic!("expected commit error, got {:?}", other),
        }
        assert_eq!(txn.state(), TxnState::Aborted);
        assert!(!txn.in_doubt());
    }
}
