use crate::batch::batch_executor::BatchRequest;
use crate::batch::{batch_replica, group_by_node, BatchEntry, BatchRecord};
use crate::cluster::{Cluster, Node};
use crate::commands::stream_command::{parse_row, Row};
use crate::commands::{self, CancelToken, Command, LatencyType};
use crate::errors::{Error, ErrorKind, Result};
use crate::net::Connection;
use crate::policy::BatchPolicy;
use crate::record::Record;
use crate::result_code::ResultCode;
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

/// Batch-index dialect: one frame multiplexes every key routed to this
/// node; responses come back tagged with the entry's first input offset.
pub(crate) struct BatchIndexCommand {
    cluster: Arc<Cluster>,
    policy: BatchPolicy,
    node: Arc<Node>,
    entries: Vec<BatchEntry>,
    request: BatchRequest,
    results: Arc<Mutex<Vec<BatchRecord>>>,
    offset_lookup: HashMap<u32, usize>,
    cancel: CancelToken,
}

impl BatchIndexCommand {
    pub fn new(
        cluster: Arc<Cluster>,
        policy: BatchPolicy,
        node: Arc<Node>,
        entries: Vec<BatchEntry>,
        request: BatchRequest,
        results: Arc<Mutex<Vec<BatchRecord>>>,
        cancel: CancelToken,
    ) -> BatchIndexCommand {
        let offset_lookup = BatchIndexCommand::build_lookup(&entries);
        BatchIndexCommand {
            cluster,
            policy,
            node,
            entries,
            request,
            results,
            offset_lookup,
            cancel,
        }
    }

    fn build_lookup(entries: &[BatchEntry]) -> HashMap<u32, usize> {
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.offsets.first(), index))
            .collect()
    }

    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        commands::execute_cancellable(self, cancel)
    }

    fn assign(
        &self,
        batch_index: u32,
        record: Option<Record>,
        result_code: ResultCode,
    ) -> Result<()> {
        let entry_index = self
            .offset_lookup
            .get(&batch_index)
            .copied()
            .ok_or_else(|| Error::parse(format!("unknown batch index {}", batch_index)))?;
        let entry = &self.entries[entry_index];

        let mut results = self.results.lock().expect("batch results poisoned");
        for offset in entry.offsets.iter() {
            let slot = &mut results[offset as usize];
            slot.key = entry.key.clone();
            slot.record = record.clone();
            slot.result_code = Some(result_code);
        }
        Ok(())
    }

    fn parse_frame(&mut self, conn: &mut Connection, size: usize) -> Result<bool> {
        while conn.buffer.data_offset < size {
            if self.cancel.is_cancelled() {
                return Err(Error::new(ErrorKind::Terminated));
            }
            match parse_row(&mut conn.buffer)? {
                Row::Record(batch_index, record) => {
                    self.assign(batch_index, Some(record), ResultCode::Ok)?
                }
                Row::NotFound(batch_index) => {
                    self.assign(batch_index, None, ResultCode::KeyNotFoundError)?
                }
                Row::PartitionDone => (),
                Row::End => return Ok(true),
            }
        }
        Ok(false)
    }
}

impl Command for BatchIndexCommand {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        match &self.request {
            BatchRequest::Read { bins, header_only } => {
                let view: Vec<(u32, &crate::key::Key)> = self
                    .entries
                    .iter()
                    .map(|entry| (entry.offsets.first(), &entry.key))
                    .collect();
                conn.buffer
                    .set_batch_index_read(&self.policy, &view, bins, *header_only)
            }
            BatchRequest::Verify => {
                let view: Vec<(u32, &crate::key::Key, u64)> = self
                    .entries
                    .iter()
                    .map(|entry| {
                        (
                            entry.offsets.first(),
                            &entry.key,
                            entry.version.unwrap_or(0),
                        )
                    })
                    .collect();
                conn.buffer.set_txn_verify(&self.policy, &view)
            }
            BatchRequest::Roll { txn, attr } => {
                let view: Vec<(u32, &crate::key::Key)> = self
                    .entries
                    .iter()
                    .map(|entry| (entry.offsets.first(), &entry.key))
                    .collect();
                conn.buffer.set_txn_roll(&self.policy, &view, txn, *attr)
            }
        }
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

    /// Re-shard this group against the current partition map. When the keys
    /// now land on several nodes (or a different one), run the sub-groups
    /// inline and report the command complete.
    fn retry_batch(&mut self, cancel: &CancelToken) -> Result<bool> {
        let items: Vec<(crate::key::Key, Option<u64>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.version))
            .collect();
        let mut route_policy = self.policy.base.clone();
        route_policy.replica = batch_replica(&self.policy.base, self.policy.allow_prole_reads);
        let groups = group_by_node(&self.cluster, &items, &route_policy)?;

        if groups.len() == 1 && groups[0].node.name() == self.node.name() {
            return Ok(false);
        }

        // Regrouped positions index into `items`, which mirrors `entries`;
        // remap to the original input offsets before running.
        for group in groups {
            let entries: Vec<BatchEntry> = group
                .entries
                .iter()
                .flat_map(|entry| {
                    entry.offsets.iter().map(|item_index| {
                        self.entries[item_index as usize].clone()
                    })
                })
                .collect();
            let mut sub = BatchIndexCommand::new(
                self.cluster.clone(),
                self.policy.clone(),
                group.node,
                entries,
                self.request.clone(),
                self.results.clone(),
                self.cancel.clone(),
            );
            sub.run(cancel)?;
        }
        Ok(true)
    }

    fn is_write(&self) -> bool {
        matches!(self.request, BatchRequest::Roll { .. })
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Batch
    }

    fn on_in_doubt(&mut self) {
        if let BatchRequest::Roll { txn, .. } = &self.request {
            txn.set_in_doubt();
        }
        let mut results = self.results.lock().expect("batch results poisoned");
        for entry in &self.entries {
            for offset in entry.offsets.iter() {
                results[offset as usize].in_doubt = true;
            }
        }
    }
}
