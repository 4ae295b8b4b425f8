use crate::batch::{BatchEntry, BatchRecord};
use crate::bin::Bins;
use crate::cluster::Node;
use crate::commands::stream_command::{parse_row, Row};
use crate::commands::{self, CancelToken, Command, LatencyType};
use crate::errors::{Error, ErrorKind, Result};
use crate::net::Connection;
use crate::policy::BatchPolicy;
use crate::record::Record;
use crate::result_code::ResultCode;
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Legacy batch dialect: one frame per (node, namespace), keys shipped as a
/// digest array. Responses carry no index, so rows are matched back by
/// digest; keys the server stays silent about are reported not-found when
/// the stream completes.
pub(crate) struct BatchDirectCommand {
    policy: BatchPolicy,
    node: Arc<Node>,
    namespace: String,
    entries: Vec<BatchEntry>,
    bins: Bins,
    header_only: bool,
    results: Arc<Mutex<Vec<BatchRecord>>>,
    digest_lookup: HashMap<[u8; 20], usize>,
    seen: HashSet<usize>,
    cancel: CancelToken,
}

impl BatchDirectCommand {
    pub fn new(
        policy: BatchPolicy,
        node: Arc<Node>,
        namespace: String,
        entries: Vec<BatchEntry>,
        bins: Bins,
        header_only: bool,
        results: Arc<Mutex<Vec<BatchRecord>>>,
        cancel: CancelToken,
    ) -> BatchDirectCommand {
        let digest_lookup = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.key.digest, index))
            .collect();
        BatchDirectCommand {
            policy,
            node,
            namespace,
            entries,
            bins,
            header_only,
            results,
            digest_lookup,
            seen: HashSet::new(),
            cancel,
        }
    }

    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        commands::execute_cancellable(self, cancel)
    }

    fn assign(&mut self, entry_index: usize, record: Option<Record>, result_code: ResultCode) {
        let entry = &self.entries[entry_index];
        let mut results = self.results.lock().expect("batch results poisoned");
        for offset in entry.offsets.iter() {
            let slot = &mut results[offset as usize];
            slot.key = entry.key.clone();
            slot.record = record.clone();
            slot.result_code = Some(result_code);
        }
        self.seen.insert(entry_index);
    }

    fn parse_frame(&mut self, conn: &mut Connection, size: usize) -> Result<bool> {
        while conn.buffer.data_offset < size {
            if self.cancel.is_cancelled() {
                return Err(Error::new(ErrorKind::Terminated));
            }
            match parse_row(&mut conn.buffer)? {
                Row::Record(_, record) => {
                    let digest = match &record.key {
                        Some(key) => key.digest,
                        None => return Err(Error::parse("batch row without digest")),
                    };
                    match self.digest_lookup.get(&digest).copied() {
                        Some(entry_index) => {
                            self.assign(entry_index, Some(record), ResultCode::Ok)
                        }
                        None => return Err(Error::parse("batch row for unknown digest")),
                    }
                }
                Row::NotFound(_) | Row::PartitionDone => (),
                Row::End => {
                    self.finish_absent();
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Entries the stream never mentioned do not exist on the server.
    fn finish_absent(&mut self) {
        let absent: Vec<usize> = (0..self.entries.len())
            .filter(|index| !self.seen.contains(index))
            .collect();
        for entry_index in absent {
            self.assign(entry_index, None, ResultCode::KeyNotFoundError);
        }
    }
}

impl Command for BatchDirectCommand {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        self.seen.clear();
        let digests: Vec<[u8; 20]> = self.entries.iter().map(|entry| entry.key.digest).collect();
        conn.buffer.set_batch_direct_read(
            &self.policy,
            &self.namespace,
            &digests,
            &self.bins,
            self.header_only,
        )
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        Ok(self.node.clone())
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        loop {
            let size = conn.read_message()?;
            if self.parse_frame(conn, size)? {
                return Ok(());
            }
        }
    }

    fn prepare_retry(&mut self, _timed_out: bool) -> bool {
        true
    }

    fn is_write(&self) -> bool {
        false
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Batch
    }
}
