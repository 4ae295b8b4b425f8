use crate::bin::Bins;
use crate::cluster::{Cluster, Node};
use crate::commands::field_type::FieldType;
use crate::commands::{self, Command, LatencyType, SingleCommand};
use crate::errors::{Error, ErrorKind, Result};
use crate::key::Key;
use crate::net::Connection;
use crate::policy::ReadPolicy;
use crate::record::Record;
use crate::result_code::ResultCode;
use crate::value::{bytes_to_particle, Value};
use hashbrown::hash_map::Entry::{Occupied, Vacant};
use hashbrown::HashMap;
use std::sync::Arc;

pub struct ReadCommand<'a> {
    pub(crate) single: SingleCommand<'a>,
    policy: &'a ReadPolicy,
    bins: Bins,
    pub record: Option<Record>,
}

impl<'a> ReadCommand<'a> {
    pub fn new(
        policy: &'a ReadPolicy,
        cluster: Arc<Cluster>,
        key: &'a Key,
        bins: Bins,
    ) -> ReadCommand<'a> {
        ReadCommand {
            single: SingleCommand::new_read(cluster, key, policy),
            policy,
            bins,
            record: None,
        }
    }

    /// Used by operate-style commands that route as writes but parse like
    /// reads.
    pub(crate) fn for_single(
        policy: &'a ReadPolicy,
        single: SingleCommand<'a>,
        bins: Bins,
    ) -> ReadCommand<'a> {
        ReadCommand {
            single,
            policy,
            bins,
            record: None,
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        commands::execute(self)
    }

    /// Walk the response fields, surfacing the record version and any
    /// server-assigned deadline to the transaction when this command runs
    /// inside one.
    fn parse_fields(&mut self, conn: &mut Connection, field_count: usize) -> Result<()> {
        let mut version: Option<u64> = None;
        let mut deadline: Option<u32> = None;

        for _ in 0..field_count {
            let field_len = conn.buffer.read_u32() as usize;
            if field_len < 1 || field_len > conn.buffer.remaining() {
                return Err(Error::parse(format!("invalid field length {}", field_len)));
            }
            let field_type = conn.buffer.read_u8();
            if field_type == FieldType::RecordVersion as u8 && field_len == 9 {
                version = Some(conn.buffer.read_u64());
            } else if field_type == FieldType::MrtDeadline as u8 && field_len == 5 {
                deadline = Some(conn.buffer.read_u32_le());
            } else {
                conn.buffer.skip(field_len - 1);
            }
        }

        if let Some(txn) = &self.policy.txn {
            if let Some(version) = version {
                txn.on_read(self.single.key.clone(), version)?;
            }
            if let Some(deadline) = deadline {
                txn.set_deadline(deadline);
            }
        }
        Ok(())
    }

    pub(crate) fn parse_record(
        &mut self,
        conn: &mut Connection,
        op_count: usize,
        field_count: usize,
        generation: u32,
        expiration: u32,
    ) -> Result<Record> {
        self.parse_fields(conn, field_count)?;

        let mut bins: HashMap<String, Value> = HashMap::with_capacity(op_count);
        for _ in 0..op_count {
            let op_size = conn.buffer.read_u32() as usize;
            conn.buffer.skip(1);
            let particle_type = conn.buffer.read_u8();
            conn.buffer.skip(1);
            let name_size = conn.buffer.read_u8() as usize;
            let name = conn.buffer.read_str(name_size)?;

            let particle_size = op_size
                .checked_sub(4 + name_size)
                .filter(|size| *size <= conn.buffer.remaining())
                .ok_or_else(|| Error::parse(format!("invalid operation size {}", op_size)))?;
            let value = bytes_to_particle(particle_type, &mut conn.buffer, particle_size)?;
            if value == Value::Nil {
                continue;
            }

            // Multiple operations on the same bin collapse into one ordered
            // sequence, preserving arrival order.
            match bins.entry(name) {
                Vacant(entry) => {
                    entry.insert(value);
                }
                Occupied(entry) => match entry.into_mut() {
                    Value::List(list) => list.push(value),
                    prev => {
                        let first = std::mem::replace(prev, Value::Nil);
                        *prev = Value::List(vec![first, value]);
                    }
                },
            }
        }

        Ok(Record::new(None, bins, generation, expiration))
    }
}

impl<'a> Command for ReadCommand<'a> {
    fn policy(&self) -> &crate::policy::BasePolicy {
        self.policy
    }

    fn write_buffer(&mut self, conn: &mut Connection) -> Result<()> {
        conn.buffer.set_read(self.policy, self.single.key, &self.bins)
    }

    fn get_node(&mut self) -> Result<Arc<Node>> {
        self.single.get_node()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        conn.read_record_message()?;

        let result_code = ResultCode::from(conn.buffer.read_u8_at(5));
        let generation = conn.buffer.read_u32_at(6);
        let expiration = conn.buffer.read_u32_at(10);
        let field_count = conn.buffer.read_u16_at(18) as usize;
        let op_count = conn.buffer.read_u16_at(20) as usize;
        conn.buffer.skip_to_body();

        match result_code {
            ResultCode::Ok => {
                let record = if self.bins.is_none() {
                    self.parse_fields(conn, field_count)?;
                    Record::new(None, HashMap::new(), generation, expiration)
                } else {
                    self.parse_record(conn, op_count, field_count, generation, expiration)?
                };
                self.record = Some(record);
                Ok(())
            }
            ResultCode::KeyNotFoundError => {
                self.record = None;
                Ok(())
            }
            ResultCode::FilteredOut => {
                if self.policy.fail_on_filtered_out {
                    return Err(Error::server(result_code));
                }
                self.record = None;
                Ok(())
            }
            ResultCode::UdfBadResponse => {
                // The FAILURE bin carries the failure text; a malformed one
                // degrades to a generic message instead of a parse error.
                let record =
                    self.parse_record(conn, op_count, field_count, generation, expiration)?;
                let reason = record
                    .bins
                    .get("FAILURE")
                    .map_or(String::from("UDF error"), ToString::to_string);
                Err(Error::new(ErrorKind::Udf(reason)))
            }
            rc => Err(Error::server(rc)),
        }
    }

    fn prepare_retry(&mut self, timed_out: bool) -> bool {
        self.single.prepare_retry(timed_out);
        true
    }

    fn is_write(&self) -> bool {
        false
    }

    fn latency_type(&self) -> LatencyType {
        LatencyType::Read
    }
}
