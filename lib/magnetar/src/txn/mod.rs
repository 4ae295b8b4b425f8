//! Multi-record transactions: client-side bookkeeping of the reads and
//! writes participating in a transaction, plus the commit/abort
//! orchestrator in [`roll`].

pub mod monitor;
pub mod roll;

pub use self::roll::TxnRoll;

use crate::errors::{Error, Result};
use crate::key::Key;
use hashbrown::HashMap;
use indexmap::IndexSet;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

/// Transaction lifecycle. Monotone: `Open → Verified → Committed`, with
/// `Aborted` reachable from the two non-terminal states only.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TxnState {
    Open = 0,
    Verified = 1,
    Committed = 2,
    Aborted = 3,
}

/// Final outcome of a commit that got past verification.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommitStatus {
    Ok,
    /// The roll-forward pass failed; the server will finish the roll on its
    /// own authority. Not retried by the client.
    RollForwardAbandoned,
    /// The monitor record could not be deleted.
    CloseAbandoned,
}

/// Final outcome of an abort.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AbortStatus {
    Ok,
    RollBackAbandoned,
    CloseAbandoned,
}

/// Stage at which a commit or abort failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommitStage {
    Verify,
    MarkRollForward,
    RollForward,
    RollBack,
    Close,
}

/// One multi-record transaction. Created by the caller, tagged into
/// policies, driven to a terminal state by [`TxnRoll`]. The collections are
/// append-only until the state turns terminal; a txn is owned by one
/// logical caller at a time.
pub struct Txn {
    id: u64,
    state: AtomicU8,
    deadline: AtomicU32,
    in_doubt: AtomicBool,
    monitor_exists: AtomicBool,
    monitor_in_doubt: AtomicBool,
    namespace: Mutex<Option<String>>,
    reads: Mutex<HashMap<Key, u64>>,
    writes: Mutex<IndexSet<Key>>,
}

impl Txn {
    /// Set name of the server-side monitor record.
    pub const MONITOR_SET: &'static str = "<ERO~MRT";

    pub fn new() -> Txn {
        let mut rng = rand::thread_rng();
        let mut id: u64 = 0;
        while id == 0 {
            id = rng.gen();
        }
        Txn::with_id(id)
    }

    pub fn with_id(id: u64) -> Txn {
        Txn {
            id,
            state: AtomicU8::new(TxnState::Open as u8),
            deadline: AtomicU32::new(0),
            in_doubt: AtomicBool::new(false),
            monitor_exists: AtomicBool::new(false),
            monitor_in_doubt: AtomicBool::new(false),
            namespace: Mutex::new(None),
            reads: Mutex::new(HashMap::new()),
            writes: Mutex::new(IndexSet::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxnState {
        match self.state.load(Ordering::Acquire) {
            0 => TxnState::Open,
            1 => TxnState::Verified,
            2 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    /// Attempt a state transition, enforcing monotonicity. Returns false
    /// when the transition is not legal from the current state.
    pub(crate) fn transition(&self, to: TxnState) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let legal = matches!(
                (current, to),
                (0, TxnState::Verified)
                    | (1, TxnState::Committed)
                    | (0, TxnState::Aborted)
                    | (1, TxnState::Aborted)
            );
            if !legal {
                return false;
            }
            if self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Fails unless the txn can still accept operations.
    pub fn ensure_open(&self) -> Result<()> {
        match self.state() {
            TxnState::Open => Ok(()),
            state => Err(Error::invalid_argument(format!(
                "transaction {} is {:?}",
                self.id, state
            ))),
        }
    }

    #[inline]
    pub fn deadline(&self) -> u32 {
        self.deadline.load(Ordering::Relaxed)
    }

    /// Store the server-assigned deadline, reflected back on every
    /// subsequent command of this txn.
    #[inline]
    pub fn set_deadline(&self, deadline: u32) {
        self.deadline.store(deadline, Ordering::Relaxed);
    }

    #[inline]
    pub fn in_doubt(&self) -> bool {
        self.in_doubt.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_in_doubt(&self) {
        self.in_doubt.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_in_doubt(&self) {
        self.in_doubt.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn monitor_exists(&self) -> bool {
        self.monitor_exists.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_monitor_exists(&self) {
        self.monitor_exists.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_monitor_in_doubt(&self) {
        self.monitor_in_doubt.store(true, Ordering::Relaxed);
    }

    /// The monitor must be closed whenever it exists or might exist.
    #[inline]
    pub fn monitor_might_exist(&self) -> bool {
        self.monitor_exists.load(Ordering::Relaxed)
            || self.monitor_in_doubt.load(Ordering::Relaxed)
    }

    fn check_namespace(&self, namespace: &str) -> Result<()> {
        let mut guard = self.namespace.lock().expect("txn poisoned");
        match guard.as_deref() {
            None => {
                *guard = Some(namespace.to_string());
                Ok(())
            }
            Some(existing) if existing == namespace => Ok(()),
            Some(existing) => Err(Error::invalid_argument(format!(
                "transaction spans namespaces {} and {}",
                existing, namespace
            ))),
        }
    }

    #[inline]
    pub fn namespace(&self) -> Option<String> {
        self.namespace.lock().expect("txn poisoned").clone()
    }

    /// Bind the txn to a namespace ahead of the first recorded key, so the
    /// monitor key can be derived before any write succeeds.
    #[inline]
    pub(crate) fn note_namespace(&self, namespace: &str) -> Result<()> {
        self.check_namespace(namespace)
    }

    /// Record the version a read observed.
    pub fn on_read(&self, key: Key, version: u64) -> Result<()> {
        self.ensure_open()?;
        self.check_namespace(&key.namespace)?;
        self.reads.lock().expect("txn poisoned").insert(key, version);
        Ok(())
    }

    /// Record a key as written after the server accepted the write.
    pub fn on_write(&self, key: Key) -> Result<()> {
        self.check_namespace(&key.namespace)?;
        self.writes.lock().expect("txn poisoned").insert(key);
        Ok(())
    }

    #[inline]
    pub fn writes_contain(&self, key: &Key) -> bool {
        self.writes.lock().expect("txn poisoned").contains(key)
    }

    pub fn reads_snapshot(&self) -> Vec<(Key, u64)> {
        self.reads
            .lock()
            .expect("txn poisoned")
            .iter()
            .map(|(key, version)| (key.clone(), *version))
            .collect()
    }

    pub fn writes_snapshot(&self) -> Vec<Key> {
        self.writes
            .lock()
            .expect("txn poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Key of the server-side monitor record remembering the digests this
    /// txn touches. Requires at least one recorded key.
    pub fn monitor_key(&self) -> Result<Key> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::invalid_argument("transaction has no participating keys"))?;
        Key::new(namespace, Txn::MONITOR_SET, self.id as i64)
    }
}

impl Default for Txn {
    fn default() -> Txn {
        Txn::new()
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("in_doubt", &self.in_doubt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_monotone() {
        let txn = Txn::with_id(1);
        assert_eq!(txn.state(), TxnState::Open);
        assert!(txn.transition(TxnState::Verified));
        assert!(txn.transition(TxnState::Committed));
        // Terminal states never move.
        assert!(!txn.transition(TxnState::Aborted));
        assert!(!txn.transition(TxnState::Verified));
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn test_abort_from_open_and_verified_only() {
        let txn = Txn::with_id(2);
        assert!(txn.transition(TxnState::Aborted));
        assert!(!txn.transition(TxnState::Verified));
        assert_eq!(txn.state(), TxnState::Aborted);

        let txn = Txn::with_id(3);
        assert!(txn.transition(TxnState::Verified));
        assert!(txn.transition(TxnState::Aborted));
        assert_eq!(txn.state(), TxnState::Aborted);
    }

    #[test]
    fn test_terminal_txn_rejects_operations() {
        let txn = Txn::with_id(4);
        txn.transition(TxnState::Aborted);
        let key = Key::new("ns", "set", "k").unwrap();
        assert!(txn.on_read(key, 1).is_err());
    }

    #[test]
    fn test_single_namespace_enforced() {
        let txn = Txn::with_id(5);
        let a = Key::new("ns1", "set", "a").unwrap();
        let b = Key::new("ns2", "set", "b").unwrap();
        assert!(txn.on_read(a, 1).is_ok());
        assert!(txn.on_read(b, 2).is_err());
    }

    #[test]
    fn test_monitor_key_shares_namespace() {
        let txn = Txn::with_id(6);
        let key = Key::new("ns1", "set", "a").unwrap();
        txn.on_write(key).unwrap();
        let monitor = txn.monitor_key().unwrap();
        assert_eq!(monitor.namespace, "ns1");
        assert_eq!(monitor.set_name, Txn::MONITOR_SET);
        assert!(txn.writes_contain(&txn.writes_snapshot()[0]));
    }

    #[test]
    fn test_duplicate_reads_keep_latest_version() {
        let txn = Txn::with_id(7);
        let key = Key::new("ns", "set", "a").unwrap();
        txn.on_read(key.clone(), 1).unwrap();
        txn.on_read(key, 2).unwrap();
        let reads = txn.reads_snapshot();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].1, 2);
    }
}
