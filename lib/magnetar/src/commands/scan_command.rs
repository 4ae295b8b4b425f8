use crate::bin::Bins;
use crate::cluster::Node;
use crate::commands::stream_command::{parse_row, Row};
use crate::commands::{self, CancelToken, Command, LatencyType};
use crate::errors::{Error, ErrorKind, Result};
use crate::net::Connection;
use crate::policy::ScanPolicy;
use crate::recordset::Recordset;
use std::sync::Arc;

/// Full scan of one node: a single request followed by an arbitrary number
/// of record frames pushed into the shared recordset.
pub struct ScanCommand {
    node: Arc<Node>,
    policy: ScanPolicy,
    namespace: String,
    set_name: String,
    bins: Bins,
    recordset: Arc<Recordset>,
}

impl ScanCommand {
    pub fn new(
        node: Arc<Node>,
        policy: ScanPolicy,
        namespace: String,
        set_name: String,
        bins: Bins,
        recordset: Arc<Recordset>,
    ) -> ScanCommand {
        ScanCommand {
            node,
            policy,
            namespace,
            set_name,
            bins,
            recordset,
        }
    }

    pub fn execute(&mut self, cancel: &CancelToken) -> Result<()> {
        commands::execute_cancellable(self, cancel)
    }

    /// Parse one frame of rows. Ok(true) when the end marker was seen.
    fn parse_frame(&self, conn: &mut Connection, size: usize) -> Result<bool> {
        while conn.buffer.data_offset < size {
            if !self.recordset.is_active() {
                return Err(Error::new(ErrorKind::Terminated));
            }
            match parse_row(&mut conn.buffer)? {
                Row::Record(_, record) => {
                    if !self.recordset.push(Ok(record)) {
                        return Err(Error::new(ErrorKind::Terminated));
                    }
                }
                Row::NotFound(_) | Row::PartitionDone => (),
                Row::End => return Ok(true),
            }
        }
        Ok(false)
    }
}

impl Command for ScanCommand {
    fn policy(&self) -> &crate::policy::BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer.set_scan(
            &self.policy,
            &self.namespace,
            &self.set_name,
            &self.bins,
            self.recordset.task_id(),
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
        // A scan restarted mid-stream would duplicate rows; surface instead.
        false
    }

    fn is_write(&self) -> bool {
        false
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Scan
    }
}
