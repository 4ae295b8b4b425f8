//! Request construction and response decoding for the binary key-value
//! protocol. A `Buffer` owns one growable byte vector plus a cursor; the
//! single-key builders run the classic two-pass shape (estimate offsets,
//! size the vector, then write), while the multi-record builders assemble
//! their index field out-of-line and splice it in as bytes.

use crate::bin::{Bin, Bins};
use crate::commands::field_type::FieldType;
use crate::errors::{Error, Result};
use crate::key::Key;
use crate::operations::{OpData, Operation, OperationType};
use crate::policy::{
    BasePolicy, BatchPolicy, CommitLevel, GenerationPolicy, RecordExistsAction, ScanPolicy,
    WritePolicy,
};
use crate::txn::Txn;
use crate::value::{ParticleType, Value};
use byteorder::{BigEndian, ByteOrder, LittleEndian, NetworkEndian, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io;
use std::io::{Read, Write};

// Contains a read operation.
pub const INFO1_READ: u8 = 1;
// Get all bins.
pub const INFO1_GET_ALL: u8 = 1 << 1;
// Batch-index protocol request.
pub const INFO1_BATCH: u8 = 1 << 3;
// Do not read the bins.
pub const INFO1_NOBINDATA: u8 = 1 << 5;
// Involve all replicas in the read.
pub const INFO1_CONSISTENCY_ALL: u8 = 1 << 6;

// Create or update record.
pub const INFO2_WRITE: u8 = 1;
// Remove record.
pub const INFO2_DELETE: u8 = 1 << 1;
// Update iff expected generation == old.
pub const INFO2_GENERATION: u8 = 1 << 2;
// Update iff new generation > old, good for restore.
pub const INFO2_GENERATION_GT: u8 = 1 << 3;
// Leave a tombstone on delete.
pub const INFO2_DURABLE_DELETE: u8 = 1 << 4;
// Create only, fail if the record exists.
pub const INFO2_CREATE_ONLY: u8 = 1 << 5;
// Return a result for every operation.
pub const INFO2_RESPOND_ALL_OPS: u8 = 1 << 7;

// Last frame of a multi-part response.
pub const INFO3_LAST: u8 = 1;
// Commit to master only before declaring success.
pub const INFO3_COMMIT_MASTER: u8 = 1 << 1;
// Partition finished streaming (scans).
pub const INFO3_PARTITION_DONE: u8 = 1 << 2;
// Update only, merge bins.
pub const INFO3_UPDATE_ONLY: u8 = 1 << 3;
// Create or completely replace record.
pub const INFO3_CREATE_OR_REPLACE: u8 = 1 << 4;
// Completely replace existing record only.
pub const INFO3_REPLACE_ONLY: u8 = 1 << 5;
// Linearizable read on strongly-consistent namespaces.
pub const INFO3_LINEARIZE_READ: u8 = 1 << 6;

// Transaction roll intent.
pub const INFO4_MRT_ROLL_FORWARD: u8 = 1 << 1;
pub const INFO4_MRT_ROLL_BACK: u8 = 1 << 2;
// Write only when the record is already locked by this transaction.
pub const INFO4_MRT_ON_LOCKING_ONLY: u8 = 1 << 4;

pub const MSG_TOTAL_HEADER_SIZE: usize = 30;
pub const MSG_REMAINING_HEADER_SIZE: usize = 22;
pub const FIELD_HEADER_SIZE: usize = 5;
pub const OPERATION_HEADER_SIZE: usize = 8;
const DIGEST_SIZE: usize = 20;

pub const PROTO_VERSION: u8 = 2;
pub const PROTO_TYPE_INFO: u8 = 1;
pub const PROTO_TYPE_ADMIN: u8 = 2;
pub const PROTO_TYPE_AS_MSG: u8 = 3;
pub const PROTO_TYPE_COMPRESSED: u8 = 4;

// Corrupted streams can carry absurd sizes; anything larger is rejected
// before allocation.
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

// Requests below this many payload bytes are never worth compressing.
const COMPRESS_THRESHOLD: usize = 128;

/// Command scratch buffer. One per connection; rebuilt for every attempt.
#[derive(Debug, Default)]
pub struct Buffer {
    pub data_buffer: Vec<u8>,
    pub data_offset: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data_buffer: Vec::new(),
            data_offset: 0,
        }
    }

    /// Bytes of the built frame, ready for the socket.
    #[inline]
    pub fn frame(&self) -> &[u8] {
        &self.data_buffer[..self.data_offset]
    }

    #[inline]
    fn begin(&mut self) {
        self.data_offset = MSG_TOTAL_HEADER_SIZE;
    }

    #[inline]
    fn size_buffer(&mut self) -> Result<()> {
        let size = self.data_offset;
        self.resize_buffer(size)
    }

    pub fn resize_buffer(&mut self, size: usize) -> Result<()> {
        if size > MAX_BUFFER_SIZE {
            return Err(Error::parse(format!("invalid buffer size {}", size)));
        }
        self.data_buffer.resize(size, 0);
        Ok(())
    }

    #[inline]
    pub fn reset_offset(&mut self) {
        self.data_offset = 0;
    }

    /// Stamp the proto header over bytes 0..8 and leave the cursor at the
    /// frame end.
    pub(crate) fn end(&mut self, proto_type: u8) {
        let size = (self.data_offset - 8) as u64
            | (u64::from(PROTO_VERSION) << 56)
            | (u64::from(proto_type) << 48);
        let offset = self.data_offset;
        self.data_offset = 0;
        self.write_u64(size);
        self.data_offset = offset;
    }

    //
    // Single-key request builders
    //

    pub fn set_read(&mut self, policy: &BasePolicy, key: &Key, bins: &Bins) -> Result<()> {
        let bin_names: &[String] = match bins {
            Bins::Some(names) => names,
            _ => &[],
        };

        self.begin();
        let mut field_count = self.estimate_key_size(key, false);
        field_count += self.estimate_txn_size(policy);
        field_count += self.estimate_filter_size(policy);
        for name in bin_names {
            self.estimate_operation_size_for_bin_name(name);
        }
        self.size_buffer()?;

        let read_attr = match bins {
            Bins::All => INFO1_READ | INFO1_GET_ALL,
            Bins::None => INFO1_READ | INFO1_NOBINDATA,
            Bins::Some(_) => INFO1_READ,
        };
        self.write_header_read(policy, read_attr, 0, field_count, bin_names.len() as u16);
        self.write_key(key, false);
        self.write_txn_fields(policy);
        self.write_filter_field(policy);
        for name in bin_names {
            self.write_operation_for_bin_name(name, OperationType::Read);
        }
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(policy)
    }

    pub fn set_exists(&mut self, policy: &BasePolicy, key: &Key) -> Result<()> {
        self.begin();
        let mut field_count = self.estimate_key_size(key, false);
        field_count += self.estimate_txn_size(policy);
        field_count += self.estimate_filter_size(policy);
        self.size_buffer()?;

        self.write_header_read(policy, INFO1_READ | INFO1_NOBINDATA, 0, field_count, 0);
        self.write_key(key, false);
        self.write_txn_fields(policy);
        self.write_filter_field(policy);
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(policy)
    }

    pub fn set_write(
        &mut self,
        policy: &WritePolicy,
        op_type: OperationType,
        key: &Key,
        bins: &[Bin],
    ) -> Result<()> {
        self.begin();
        let mut field_count = self.estimate_key_size(key, policy.send_key);
        field_count += self.estimate_txn_size(&policy.base);
        field_count += self.estimate_filter_size(&policy.base);
        for bin in bins {
            self.estimate_operation_size_for_bin(bin);
        }
        self.size_buffer()?;

        self.write_header_write(policy, 0, INFO2_WRITE, field_count, bins.len() as u16);
        self.write_key(key, policy.send_key);
        self.write_txn_fields(&policy.base);
        self.write_filter_field(&policy.base);
        for bin in bins {
            self.write_operation_for_bin(bin, op_type);
        }
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    pub fn set_delete(&mut self, policy: &WritePolicy, key: &Key) -> Result<()> {
        self.begin();
        let mut field_count = self.estimate_key_size(key, false);
        field_count += self.estimate_txn_size(&policy.base);
        field_count += self.estimate_filter_size(&policy.base);
        self.size_buffer()?;

        self.write_header_write(policy, 0, INFO2_WRITE | INFO2_DELETE, field_count, 0);
        self.write_key(key, false);
        self.write_txn_fields(&policy.base);
        self.write_filter_field(&policy.base);
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    pub fn set_touch(&mut self, policy: &WritePolicy, key: &Key) -> Result<()> {
        self.begin();
        let mut field_count = self.estimate_key_size(key, policy.send_key);
        field_count += self.estimate_txn_size(&policy.base);
        self.estimate_operation_size_plain();
        self.size_buffer()?;

        self.write_header_write(policy, 0, INFO2_WRITE, field_count, 1);
        self.write_key(key, policy.send_key);
        self.write_txn_fields(&policy.base);
        self.write_operation_for_op_type(OperationType::Touch);
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    pub fn set_operate(
        &mut self,
        policy: &WritePolicy,
        key: &Key,
        operations: &[Operation],
    ) -> Result<()> {
        self.begin();

        let mut read_attr: u8 = 0;
        let mut write_attr: u8 = 0;
        let mut read_bin = false;
        let mut read_header = false;

        for operation in operations {
            match operation.op {
                OperationType::Read | OperationType::CdtRead => {
                    read_attr |= INFO1_READ;
                    if operation.header_only {
                        read_header = true;
                    } else {
                        if operation.bin_name.is_empty() {
                            read_attr |= INFO1_GET_ALL;
                        }
                        read_bin = true;
                    }
                }
                _ => write_attr |= INFO2_WRITE,
            }
            self.estimate_operation_size_for_operation(operation);
        }

        let send_key = policy.send_key && write_attr != 0;
        let mut field_count = self.estimate_key_size(key, send_key);
        field_count += self.estimate_txn_size(&policy.base);
        field_count += self.estimate_filter_size(&policy.base);
        self.size_buffer()?;

        if read_header && !read_bin {
            read_attr |= INFO1_NOBINDATA;
        }
        if policy.respond_all_ops {
            write_attr |= INFO2_RESPOND_ALL_OPS;
        }

        if write_attr != 0 {
            self.write_header_write(policy, read_attr, write_attr, field_count, operations.len() as u16);
        } else {
            self.write_header_read(&policy.base, read_attr, 0, field_count, operations.len() as u16);
        }
        self.write_key(key, send_key);
        self.write_txn_fields(&policy.base);
        self.write_filter_field(&policy.base);
        for operation in operations {
            self.write_operation_for_operation(operation);
        }
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    pub fn set_udf(
        &mut self,
        policy: &WritePolicy,
        key: &Key,
        package: &str,
        function: &str,
        args: &[Value],
    ) -> Result<()> {
        let arg_list = Value::List(args.to_vec());
        let mut packed_args = Vec::new();
        crate::msgpack::encode_value(&mut packed_args, &arg_list)?;

        self.begin();
        let mut field_count = self.estimate_key_size(key, policy.send_key);
        field_count += self.estimate_txn_size(&policy.base);
        self.data_offset += package.len() + FIELD_HEADER_SIZE;
        self.data_offset += function.len() + FIELD_HEADER_SIZE;
        self.data_offset += packed_args.len() + FIELD_HEADER_SIZE;
        field_count += 3;
        self.size_buffer()?;

        self.write_header_write(policy, 0, INFO2_WRITE, field_count, 0);
        self.write_key(key, policy.send_key);
        self.write_txn_fields(&policy.base);
        self.write_field_str(package, FieldType::UdfPackageName);
        self.write_field_str(function, FieldType::UdfFunction);
        self.write_field_bytes(&packed_args, FieldType::UdfArgList);
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    //
    // Scan
    //

    pub fn set_scan(
        &mut self,
        policy: &ScanPolicy,
        namespace: &str,
        set_name: &str,
        bins: &Bins,
        task_id: u64,
    ) -> Result<()> {
        let bin_names: &[String] = match bins {
            Bins::Some(names) => names,
            _ => &[],
        };

        self.begin();
        let mut field_count: u16 = 0;
        if !namespace.is_empty() {
            self.data_offset += namespace.len() + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        if !set_name.is_empty() {
            self.data_offset += set_name.len() + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        // Task id, socket timeout, then the optional throttles.
        self.data_offset += 8 + FIELD_HEADER_SIZE;
        field_count += 1;
        self.data_offset += 4 + FIELD_HEADER_SIZE;
        field_count += 1;
        if policy.records_per_second > 0 {
            self.data_offset += 4 + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        if policy.max_records > 0 {
            self.data_offset += 8 + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        for name in bin_names {
            self.estimate_operation_size_for_bin_name(name);
        }
        self.size_buffer()?;

        let read_attr = if policy.include_bin_data {
            if bin_names.is_empty() {
                INFO1_READ | INFO1_GET_ALL
            } else {
                INFO1_READ
            }
        } else {
            INFO1_READ | INFO1_NOBINDATA
        };
        self.write_header_read(&policy.base, read_attr, 0, field_count, bin_names.len() as u16);

        if !namespace.is_empty() {
            self.write_field_str(namespace, FieldType::Namespace);
        }
        if !set_name.is_empty() {
            self.write_field_str(set_name, FieldType::Table);
        }
        self.write_field_header(8, FieldType::QueryId);
        self.write_u64(task_id);
        self.write_field_header(4, FieldType::SocketTimeout);
        self.write_u32(policy.base.socket_timeout.as_millis() as u32);
        if policy.records_per_second > 0 {
            self.write_field_header(4, FieldType::RecordsPerSecond);
            self.write_u32(policy.records_per_second);
        }
        if policy.max_records > 0 {
            self.write_field_header(8, FieldType::MaxRecords);
            self.write_u64(policy.max_records);
        }
        for name in bin_names {
            self.write_operation_for_bin_name(name, OperationType::Read);
        }
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    //
    // Batch (index dialect): the batch field is assembled out-of-line so
    // sizing it is exact by construction.
    //

    pub fn set_batch_index_read(
        &mut self,
        policy: &BatchPolicy,
        entries: &[(u32, &Key)],
        bins: &Bins,
        header_only: bool,
    ) -> Result<()> {
        let entry_attr = if header_only {
            INFO1_READ | INFO1_NOBINDATA
        } else {
            match bins {
                Bins::None => INFO1_READ | INFO1_NOBINDATA,
                Bins::All => INFO1_READ | INFO1_GET_ALL,
                Bins::Some(_) => INFO1_READ,
            }
        };
        let bin_names: &[String] = match bins {
            Bins::Some(names) => names,
            _ => &[],
        };

        let mut batch_field = Vec::with_capacity(entries.len() * 64);
        batch_field.write_u32::<BigEndian>(entries.len() as u32).unwrap();
        batch_field.write_u8(Buffer::batch_flags(policy)).unwrap();
        for (offset, key) in entries {
            Buffer::write_batch_entry_header(
                &mut batch_field,
                *offset,
                entry_attr,
                0,
                0,
                Buffer::batch_entry_field_count(key, policy.send_set_name, false),
                bin_names.len() as u16,
            );
            Buffer::write_batch_entry_key(&mut batch_field, key, policy.send_set_name);
            for name in bin_names {
                Buffer::write_batch_entry_bin_name(&mut batch_field, name);
            }
        }

        self.write_batch_frame(&policy.base, &batch_field, &[], 0)
    }

    /// Transaction verify: one read per key carrying the version to check.
    pub fn set_txn_verify(
        &mut self,
        policy: &BatchPolicy,
        entries: &[(u32, &Key, u64)],
    ) -> Result<()> {
        let mut batch_field = Vec::with_capacity(entries.len() * 64);
        batch_field.write_u32::<BigEndian>(entries.len() as u32).unwrap();
        batch_field.write_u8(Buffer::batch_flags(policy)).unwrap();
        for (offset, key, version) in entries {
            Buffer::write_batch_entry_header(
                &mut batch_field,
                *offset,
                INFO1_READ | INFO1_NOBINDATA,
                0,
                0,
                Buffer::batch_entry_field_count(key, false, true),
                0,
            );
            Buffer::write_batch_entry_key(&mut batch_field, key, false);
            batch_field.write_u32::<BigEndian>(8 + 1).unwrap();
            batch_field.write_u8(FieldType::RecordVersion as u8).unwrap();
            batch_field.write_u64::<BigEndian>(*version).unwrap();
        }

        self.write_batch_frame(&policy.base, &batch_field, &[], 0)
    }

    /// Transaction roll: forward or backward application of the txn's
    /// writes, tagged with the txn id and roll intent.
    pub fn set_txn_roll(
        &mut self,
        policy: &BatchPolicy,
        entries: &[(u32, &Key)],
        txn: &Txn,
        roll_attr: u8,
    ) -> Result<()> {
        let mut batch_field = Vec::with_capacity(entries.len() * 64);
        batch_field.write_u32::<BigEndian>(entries.len() as u32).unwrap();
        batch_field.write_u8(Buffer::batch_flags(policy)).unwrap();
        for (offset, key) in entries {
            Buffer::write_batch_entry_header(
                &mut batch_field,
                *offset,
                0,
                INFO2_WRITE | INFO2_DURABLE_DELETE,
                roll_attr,
                Buffer::batch_entry_field_count(key, false, false),
                0,
            );
            Buffer::write_batch_entry_key(&mut batch_field, key, false);
        }

        let mut head_fields: Vec<(FieldType, Vec<u8>)> = Vec::new();
        let mut id_data = Vec::new();
        id_data.write_u64::<BigEndian>(txn.id()).unwrap();
        head_fields.push((FieldType::MrtId, id_data));
        let deadline = txn.deadline();
        if deadline != 0 {
            let mut deadline_data = Vec::new();
            deadline_data.write_u32::<LittleEndian>(deadline).unwrap();
            head_fields.push((FieldType::MrtDeadline, deadline_data));
        }

        self.write_batch_frame(&policy.base, &batch_field, &head_fields, roll_attr)
    }

    fn write_batch_frame(
        &mut self,
        policy: &BasePolicy,
        batch_field: &[u8],
        head_fields: &[(FieldType, Vec<u8>)],
        info4: u8,
    ) -> Result<()> {
        self.begin();
        let mut field_count = 1u16;
        self.data_offset += batch_field.len() + FIELD_HEADER_SIZE;
        for (_, data) in head_fields {
            self.data_offset += data.len() + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        field_count += self.estimate_filter_size(policy);
        self.size_buffer()?;

        self.write_header_read(policy, INFO1_READ | INFO1_BATCH, 0, field_count, 0);
        self.patch_info4(info4);
        for (ftype, data) in head_fields {
            self.write_field_bytes(data, *ftype);
        }
        self.write_filter_field(policy);
        self.write_field_bytes(batch_field, FieldType::BatchIndex);
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(policy)
    }

    fn batch_flags(policy: &BatchPolicy) -> u8 {
        let mut flags = 0u8;
        if policy.allow_inline {
            flags |= 1;
        }
        if policy.respond_all_keys {
            flags |= 1 << 1;
        }
        flags
    }

    fn batch_entry_field_count(key: &Key, send_set_name: bool, with_version: bool) -> u16 {
        let mut count = 2; // namespace + digest
        if send_set_name && !key.set_name.is_empty() {
            count += 1;
        }
        if with_version {
            count += 1;
        }
        count
    }

    fn write_batch_entry_header(
        out: &mut Vec<u8>,
        offset: u32,
        info1: u8,
        info2: u8,
        info4: u8,
        field_count: u16,
        op_count: u16,
    ) {
        out.write_u32::<BigEndian>(offset).unwrap();
        out.write_u8(info1).unwrap();
        out.write_u8(info2).unwrap();
        out.write_u8(info4).unwrap();
        out.write_u16::<BigEndian>(field_count).unwrap();
        out.write_u16::<BigEndian>(op_count).unwrap();
    }

    fn write_batch_entry_key(out: &mut Vec<u8>, key: &Key, send_set_name: bool) {
        out.write_u32::<BigEndian>(key.namespace.len() as u32 + 1).unwrap();
        out.write_u8(FieldType::Namespace as u8).unwrap();
        out.write_all(key.namespace.as_bytes()).unwrap();
        if send_set_name && !key.set_name.is_empty() {
            out.write_u32::<BigEndian>(key.set_name.len() as u32 + 1).unwrap();
            out.write_u8(FieldType::Table as u8).unwrap();
            out.write_all(key.set_name.as_bytes()).unwrap();
        }
        out.write_u32::<BigEndian>(DIGEST_SIZE as u32 + 1).unwrap();
        out.write_u8(FieldType::DigestRipe as u8).unwrap();
        out.write_all(&key.digest).unwrap();
    }

    fn write_batch_entry_bin_name(out: &mut Vec<u8>, name: &str) {
        out.write_u32::<BigEndian>(name.len() as u32 + 4).unwrap();
        out.write_u8(OperationType::Read as u8).unwrap();
        out.write_u8(ParticleType::Null as u8).unwrap();
        out.write_u8(0).unwrap();
        out.write_u8(name.len() as u8).unwrap();
        out.write_all(name.as_bytes()).unwrap();
    }

    //
    // Batch (direct dialect): one frame per (node, namespace), keys shipped
    // as a digest array.
    //

    pub fn set_batch_direct_read(
        &mut self,
        policy: &BatchPolicy,
        namespace: &str,
        digests: &[[u8; 20]],
        bins: &Bins,
        header_only: bool,
    ) -> Result<()> {
        let bin_names: &[String] = match bins {
            Bins::Some(names) => names,
            _ => &[],
        };

        self.begin();
        self.data_offset += namespace.len() + FIELD_HEADER_SIZE;
        self.data_offset += digests.len() * DIGEST_SIZE + FIELD_HEADER_SIZE;
        let field_count = 2u16;
        for name in bin_names {
            self.estimate_operation_size_for_bin_name(name);
        }
        self.size_buffer()?;

        let read_attr = if header_only || bins.is_none() {
            INFO1_READ | INFO1_NOBINDATA
        } else if bin_names.is_empty() {
            INFO1_READ | INFO1_GET_ALL
        } else {
            INFO1_READ
        };
        self.write_header_read(&policy.base, read_attr, 0, field_count, bin_names.len() as u16);
        self.write_field_str(namespace, FieldType::Namespace);
        self.write_field_header(digests.len() * DIGEST_SIZE, FieldType::DigestArray);
        for digest in digests {
            self.write_bytes(digest);
        }
        for name in bin_names {
            self.write_operation_for_bin_name(name, OperationType::Read);
        }
        self.end(PROTO_TYPE_AS_MSG);
        self.maybe_compress(&policy.base)
    }

    //
    // Header writers
    //

    fn write_header_read(
        &mut self,
        policy: &BasePolicy,
        read_attr: u8,
        info3_attr: u8,
        field_count: u16,
        op_count: u16,
    ) {
        self.data_offset = 8;
        self.write_u8(MSG_REMAINING_HEADER_SIZE as u8);
        self.write_u8(read_attr);
        self.write_u8(0);
        self.write_u8(info3_attr);
        self.write_u8(0);
        self.write_u8(0);
        self.write_u32(0); // generation
        self.write_u32(0); // record ttl
        self.write_u32(Buffer::server_timeout_millis(policy));
        self.write_u16(field_count);
        self.write_u16(op_count);
        self.data_offset = MSG_TOTAL_HEADER_SIZE;
    }

    fn write_header_write(
        &mut self,
        policy: &WritePolicy,
        read_attr: u8,
        write_attr: u8,
        field_count: u16,
        op_count: u16,
    ) {
        let mut generation: u32 = 0;
        let mut info_attr: u8 = 0;
        let mut write_attr = write_attr;

        match policy.record_exists_action {
            RecordExistsAction::Update => (),
            RecordExistsAction::UpdateOnly => info_attr |= INFO3_UPDATE_ONLY,
            RecordExistsAction::Replace => info_attr |= INFO3_CREATE_OR_REPLACE,
            RecordExistsAction::ReplaceOnly => info_attr |= INFO3_REPLACE_ONLY,
            RecordExistsAction::CreateOnly => write_attr |= INFO2_CREATE_ONLY,
        }

        match policy.generation_policy {
            GenerationPolicy::None => (),
            GenerationPolicy::ExpectEqual => {
                generation = policy.generation;
                write_attr |= INFO2_GENERATION;
            }
            GenerationPolicy::ExpectGreater => {
                generation = policy.generation;
                write_attr |= INFO2_GENERATION_GT;
            }
        }

        if policy.durable_delete {
            write_attr |= INFO2_DURABLE_DELETE;
        }
        if policy.commit_level == CommitLevel::Master {
            info_attr |= INFO3_COMMIT_MASTER;
        }

        self.data_offset = 8;
        self.write_u8(MSG_REMAINING_HEADER_SIZE as u8);
        self.write_u8(read_attr);
        self.write_u8(write_attr);
        self.write_u8(info_attr);
        self.write_u8(0);
        self.write_u8(0);
        self.write_u32(generation);
        self.write_u32(policy.expiration.as_u32());
        self.write_u32(Buffer::server_timeout_millis(&policy.base));
        self.write_u16(field_count);
        self.write_u16(op_count);
        self.data_offset = MSG_TOTAL_HEADER_SIZE;
    }

    #[inline]
    fn server_timeout_millis(policy: &BasePolicy) -> u32 {
        policy.total_timeout.as_millis() as u32
    }

    /// Set the transaction roll intent in the message header.
    fn patch_info4(&mut self, info4: u8) {
        self.data_buffer[12] = info4;
    }

    //
    // Field and key writers
    //

    fn estimate_key_size(&mut self, key: &Key, send_key: bool) -> u16 {
        let mut field_count: u16 = 0;
        if !key.namespace.is_empty() {
            self.data_offset += key.namespace.len() + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        if !key.set_name.is_empty() {
            self.data_offset += key.set_name.len() + FIELD_HEADER_SIZE;
            field_count += 1;
        }
        self.data_offset += DIGEST_SIZE + FIELD_HEADER_SIZE;
        field_count += 1;
        if send_key {
            if let Some(user_key) = &key.user_key {
                self.data_offset += user_key.estimate_size() + FIELD_HEADER_SIZE + 1;
                field_count += 1;
            }
        }
        field_count
    }

    fn write_key(&mut self, key: &Key, send_key: bool) {
        if !key.namespace.is_empty() {
            self.write_field_str(&key.namespace, FieldType::Namespace);
        }
        if !key.set_name.is_empty() {
            self.write_field_str(&key.set_name, FieldType::Table);
        }
        self.write_field_bytes(&key.digest, FieldType::DigestRipe);
        if send_key {
            if let Some(user_key) = &key.user_key {
                self.write_field_value(user_key, FieldType::Key);
            }
        }
    }

    fn estimate_txn_size(&mut self, policy: &BasePolicy) -> u16 {
        let mut field_count = 0;
        if let Some(txn) = &policy.txn {
            self.data_offset += 8 + FIELD_HEADER_SIZE;
            field_count += 1;
            if txn.deadline() != 0 {
                self.data_offset += 4 + FIELD_HEADER_SIZE;
                field_count += 1;
            }
        }
        field_count
    }

    fn write_txn_fields(&mut self, policy: &BasePolicy) {
        if let Some(txn) = &policy.txn {
            self.write_field_header(8, FieldType::MrtId);
            self.write_u64(txn.id());
            let deadline = txn.deadline();
            if deadline != 0 {
                // The deadline is reflected back exactly as the server sent
                // it: little-endian, unlike every other field payload.
                self.write_field_header(4, FieldType::MrtDeadline);
                self.write_u32_le(deadline);
            }
        }
    }

    fn estimate_filter_size(&mut self, policy: &BasePolicy) -> u16 {
        match &policy.filter_exp {
            Some(filter) => {
                self.data_offset += filter.len() + FIELD_HEADER_SIZE;
                1
            }
            None => 0,
        }
    }

    fn write_filter_field(&mut self, policy: &BasePolicy) {
        if let Some(filter) = &policy.filter_exp {
            self.write_field_bytes(filter, FieldType::FilterExp);
        }
    }

    fn write_field_header(&mut self, size: usize, ftype: FieldType) {
        self.write_u32(size as u32 + 1);
        self.write_u8(ftype as u8);
    }

    fn write_field_str(&mut self, field: &str, ftype: FieldType) {
        self.write_field_header(field.len(), ftype);
        self.write_str(field);
    }

    fn write_field_bytes(&mut self, bytes: &[u8], ftype: FieldType) {
        self.write_field_header(bytes.len(), ftype);
        self.write_bytes(bytes);
    }

    fn write_field_value(&mut self, value: &Value, ftype: FieldType) {
        self.write_field_header(value.estimate_size() + 1, ftype);
        self.write_u8(value.particle_type() as u8);
        value.write_to(self).expect("sized buffer cannot reject particle");
    }

    //
    // Operation writers
    //

    fn estimate_operation_size_for_bin(&mut self, bin: &Bin) {
        self.data_offset += bin.name.len() + OPERATION_HEADER_SIZE + bin.value.estimate_size();
    }

    fn estimate_operation_size_for_operation(&mut self, operation: &Operation) {
        self.data_offset +=
            operation.bin_name.len() + OPERATION_HEADER_SIZE + operation.particle_size();
    }

    fn estimate_operation_size_for_bin_name(&mut self, bin_name: &str) {
        self.data_offset += bin_name.len() + OPERATION_HEADER_SIZE;
    }

    fn estimate_operation_size_plain(&mut self) {
        self.data_offset += OPERATION_HEADER_SIZE;
    }

    fn write_operation_for_bin(&mut self, bin: &Bin, op_type: OperationType) {
        let name_length = bin.name.len();
        let value_length = bin.value.estimate_size();

        self.write_u32((name_length + value_length + 4) as u32);
        self.write_u8(op_type as u8);
        self.write_u8(bin.value.particle_type() as u8);
        self.write_u8(0);
        self.write_u8(name_length as u8);
        self.write_str(&bin.name);
        bin.value
            .write_to(self)
            .expect("sized buffer cannot reject particle");
    }

    fn write_operation_for_operation(&mut self, operation: &Operation) {
        let name_length = operation.bin_name.len();
        let value_length = operation.particle_size();

        self.write_u32((name_length + value_length + 4) as u32);
        self.write_u8(operation.op as u8);
        self.write_u8(operation.particle_type() as u8);
        self.write_u8(0);
        self.write_u8(name_length as u8);
        self.write_str(&operation.bin_name);
        match &operation.data {
            OpData::Value(value) => value
                .write_to(self)
                .expect("sized buffer cannot reject particle"),
            OpData::Cdt(bytes) => self.write_bytes(bytes),
        }
    }

    fn write_operation_for_bin_name(&mut self, name: &str, op_type: OperationType) {
        self.write_u32(name.len() as u32 + 4);
        self.write_u8(op_type as u8);
        self.write_u8(0);
        self.write_u8(0);
        self.write_u8(name.len() as u8);
        self.write_str(name);
    }

    fn write_operation_for_op_type(&mut self, op_type: OperationType) {
        self.write_u32(4);
        self.write_u8(op_type as u8);
        self.write_u8(0);
        self.write_u8(0);
        self.write_u8(0);
    }

    //
    // Compression envelope
    //

    /// Wrap the built frame in the compressed envelope when the policy asks
    /// for it and the payload is large enough to be worth it.
    fn maybe_compress(&mut self, policy: &BasePolicy) -> Result<()> {
        if policy.compress && self.data_offset - 8 > COMPRESS_THRESHOLD {
            self.compress_frame()?;
        }
        Ok(())
    }

    pub fn compress_frame(&mut self) -> Result<()> {
        let body_len = self.data_offset - 8;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.data_buffer[8..self.data_offset])
            .map_err(|_| Error::parse("zlib compression failed"))?;
        let compressed = encoder
            .finish()
            .map_err(|_| Error::parse("zlib compression failed"))?;

        self.resize_buffer(8 + 8 + compressed.len())?;
        self.data_offset = 0;
        let size = (8 + compressed.len()) as u64
            | (u64::from(PROTO_VERSION) << 56)
            | (u64::from(PROTO_TYPE_COMPRESSED) << 48);
        self.write_u64(size);
        self.write_u64(body_len as u64);
        self.write_bytes(&compressed);
        Ok(())
    }

    //
    // Primitive cursor reads and writes
    //

    #[inline]
    pub fn read_u8(&mut self) -> u8 {
        let val = self.data_buffer[self.data_offset];
        self.data_offset += 1;
        val
    }

    #[inline]
    pub fn read_u8_at(&self, pos: usize) -> u8 {
        self.data_buffer[pos]
    }

    #[inline]
    pub fn read_u16(&mut self) -> u16 {
        let val = NetworkEndian::read_u16(&self.data_buffer[self.data_offset..]);
        self.data_offset += 2;
        val
    }

    #[inline]
    pub fn read_u16_at(&self, pos: usize) -> u16 {
        NetworkEndian::read_u16(&self.data_buffer[pos..])
    }

    #[inline]
    pub fn read_u32(&mut self) -> u32 {
        let val = NetworkEndian::read_u32(&self.data_buffer[self.data_offset..]);
        self.data_offset += 4;
        val
    }

    #[inline]
    pub fn read_u32_at(&self, pos: usize) -> u32 {
        NetworkEndian::read_u32(&self.data_buffer[pos..])
    }

    #[inline]
    pub fn read_u32_le(&mut self) -> u32 {
        let val = LittleEndian::read_u32(&self.data_buffer[self.data_offset..]);
        self.data_offset += 4;
        val
    }

    #[inline]
    pub fn read_u64(&mut self) -> u64 {
        let val = NetworkEndian::read_u64(&self.data_buffer[self.data_offset..]);
        self.data_offset += 8;
        val
    }

    #[inline]
    pub fn read_i64(&mut self) -> i64 {
        self.read_u64() as i64
    }

    #[inline]
    pub fn read_f64(&mut self) -> f64 {
        let val = NetworkEndian::read_f64(&self.data_buffer[self.data_offset..]);
        self.data_offset += 8;
        val
    }

    #[inline]
    pub fn read_slice(&mut self, count: usize) -> &[u8] {
        let slice = &self.data_buffer[self.data_offset..self.data_offset + count];
        self.data_offset += count;
        slice
    }

    pub fn read_str(&mut self, count: usize) -> Result<String> {
        let bytes = self.read_slice(count);
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::parse("invalid utf8 string"))
    }

    #[inline]
    pub fn skip(&mut self, count: usize) {
        self.data_offset += count;
    }

    /// Position the cursor just past a 22-byte message header.
    #[inline]
    pub fn skip_to_body(&mut self) {
        self.data_offset = MSG_REMAINING_HEADER_SIZE;
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data_buffer.len().saturating_sub(self.data_offset)
    }

    #[inline]
    pub fn write_u8(&mut self, val: u8) {
        self.ensure(1);
        self.data_buffer[self.data_offset] = val;
        self.data_offset += 1;
    }

    #[inline]
    pub fn write_u16(&mut self, val: u16) {
        self.ensure(2);
        NetworkEndian::write_u16(&mut self.data_buffer[self.data_offset..], val);
        self.data_offset += 2;
    }

    #[inline]
    pub fn write_u32(&mut self, val: u32) {
        self.ensure(4);
        NetworkEndian::write_u32(&mut self.data_buffer[self.data_offset..], val);
        self.data_offset += 4;
    }

    #[inline]
    pub fn write_u32_le(&mut self, val: u32) {
        self.ensure(4);
        LittleEndian::write_u32(&mut self.data_buffer[self.data_offset..], val);
        self.data_offset += 4;
    }

    #[inline]
    pub fn write_u64(&mut self, val: u64) {
        self.ensure(8);
        NetworkEndian::write_u64(&mut self.data_buffer[self.data_offset..], val);
        self.data_offset += 8;
    }

    #[inline]
    pub fn write_i64(&mut self, val: i64) {
        self.write_u64(val as u64);
    }

    #[inline]
    pub fn write_f64(&mut self, val: f64) {
        self.ensure(8);
        NetworkEndian::write_f64(&mut self.data_buffer[self.data_offset..], val);
        self.data_offset += 8;
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data_buffer[self.data_offset..self.data_offset + bytes.len()].copy_from_slice(bytes);
        self.data_offset += bytes.len();
    }

    #[inline]
    pub fn write_str(&mut self, val: &str) {
        self.write_bytes(val.as_bytes());
    }

    #[inline]
    fn ensure(&mut self, extra: usize) {
        let needed = self.data_offset + extra;
        if needed > self.data_buffer.len() {
            self.data_buffer.resize(needed, 0);
        }
    }
}

/// Particle writers stream msgpack straight into the buffer.
impl io::Write for Buffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Inflate a compressed message body. `expected` is the size announced in
/// the envelope and bounds the allocation.
pub fn inflate(src: &[u8], expected: usize) -> Result<Vec<u8>> {
    if expected > MAX_BUFFER_SIZE {
        return Err(Error::parse(format!(
            "compressed message announces {} bytes",
            expected
        )));
    }
    let mut decoder = ZlibDecoder::new(src);
    let mut inflated = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut inflated)
        .map_err(|_| Error::parse("zlib inflation failed"))?;
    if inflated.len() != expected {
        return Err(Error::parse(format!(
            "compressed message inflated to {} bytes, expected {}",
            inflated.len(),
            expected
        )));
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ReadPolicy;

    fn read_frame(policy: &ReadPolicy, key: &Key, bins: &Bins) -> Buffer {
        let mut buffer = Buffer::new();
        buffer.set_read(policy, key, bins).unwrap();
        buffer
    }

    #[test]
    fn test_proto_header_shape() {
        let key = Key::new("ns1", "set1", "alice").unwrap();
        let buffer = read_frame(&ReadPolicy::default(), &key, &Bins::All);

        let frame = buffer.frame();
        assert_eq!(hex::encode(&frame[..2]), "0203"); // version, AS_MSG
        let size = NetworkEndian::read_u64(&frame[..8]) & 0x0000_FFFF_FFFF_FFFF;
        assert_eq!(size as usize, frame.len() - 8);
        assert_eq!(frame[8], MSG_REMAINING_HEADER_SIZE as u8);
        assert_eq!(frame[9], INFO1_READ | INFO1_GET_ALL);
    }

    #[test]
    fn test_read_with_bin_names_counts_ops() {
        let key = Key::new("ns1", "set1", "alice").unwrap();
        let bins = Bins::Some(vec!["age".to_string(), "name".to_string()]);
        let buffer = read_frame(&ReadPolicy::default(), &key, &bins);

        let frame = buffer.frame();
        assert_eq!(frame[9], INFO1_READ);
        let n_fields = NetworkEndian::read_u16(&frame[26..28]);
        let n_ops = NetworkEndian::read_u16(&frame[28..30]);
        assert_eq!(n_fields, 3); // namespace, set, digest
        assert_eq!(n_ops, 2);
    }

    #[test]
    fn test_write_header_records_generation_policy() {
        let mut policy = WritePolicy::default();
        policy.generation_policy = GenerationPolicy::ExpectEqual;
        policy.generation = 7;
        let key = Key::new("ns", "set", "k").unwrap();
        let bins = vec![Bin::new("a", 1i64)];

        let mut buffer = Buffer::new();
        buffer
            .set_write(&policy, OperationType::Write, &key, &bins)
            .unwrap();

        let frame = buffer.frame();
        assert_eq!(frame[10] & INFO2_WRITE, INFO2_WRITE);
        assert_eq!(frame[10] & INFO2_GENERATION, INFO2_GENERATION);
        assert_eq!(NetworkEndian::read_u32(&frame[14..18]), 7);
    }

    #[test]
    fn test_delete_sets_delete_flag() {
        let key = Key::new("ns", "set", "k").unwrap();
        let mut buffer = Buffer::new();
        buffer.set_delete(&WritePolicy::default(), &key).unwrap();
        assert_eq!(buffer.frame()[10], INFO2_WRITE | INFO2_DELETE);
    }

    #[test]
    fn test_estimate_matches_write_for_operate() {
        let key = Key::new("ns", "set", "k").unwrap();
        let ops = vec![
            crate::operations::put(Bin::new("a", "value")),
            crate::operations::get_bin("b"),
            crate::operations::add(Bin::new("c", 10i64)),
        ];
        let mut buffer = Buffer::new();
        buffer.set_operate(&WritePolicy::default(), &key, &ops).unwrap();

        // The announced size must exactly match the bytes produced.
        let frame = buffer.frame();
        let size = NetworkEndian::read_u64(&frame[..8]) & 0x0000_FFFF_FFFF_FFFF;
        assert_eq!(size as usize, frame.len() - 8);
    }

    #[test]
    fn test_compression_roundtrip() {
        let key = Key::new("ns", "set", "k").unwrap();
        let big = "x".repeat(4096);
        let bins = vec![Bin::new("payload", big.as_str())];

        let mut plain = Buffer::new();
        plain
            .set_write(&WritePolicy::default(), OperationType::Write, &key, &bins)
            .unwrap();
        let plain_body = plain.frame()[8..].to_vec();

        let mut policy = WritePolicy::default();
        policy.base.compress = true;
        let mut compressed = Buffer::new();
        compressed
            .set_write(&policy, OperationType::Write, &key, &bins)
            .unwrap();

        let frame = compressed.frame();
        assert_eq!(frame[1], PROTO_TYPE_COMPRESSED);
        assert!(frame.len() < plain_body.len() + 8);
        let announced = NetworkEndian::read_u64(&frame[8..16]) as usize;
        assert_eq!(announced, plain_body.len());
        let inflated = inflate(&frame[16..], announced).unwrap();
        assert_eq!(inflated, plain_body);
    }

    #[test]
    fn test_oversized_resize_rejected() {
        let mut buffer = Buffer::new();
        assert!(buffer.resize_buffer(MAX_BUFFER_SIZE + 1).is_err());
        assert!(buffer.resize_buffer(64).is_ok());
    }

    #[test]
    fn test_batch_index_field_dedup() {
        let k1 = Key::new("ns", "set", "k1").unwrap();
        let k2 = Key::new("ns", "set", "k2").unwrap();
        let entries = vec![(0u32, &k1), (2u32, &k2)];

        let mut buffer = Buffer::new();
        buffer
            .set_batch_index_read(&BatchPolicy::default(), &entries, &Bins::All, false)
            .unwrap();

        let frame = buffer.frame();
        assert_eq!(frame[9] & INFO1_BATCH, INFO1_BATCH);
        // One field: the batch index blob.
        assert_eq!(NetworkEndian::read_u16(&frame[26..28]), 1);
        // Entry count lives right behind the field header.
        let count = NetworkEndian::read_u32(&frame[MSG_TOTAL_HEADER_SIZE + FIELD_HEADER_SIZE..]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_txn_fields_written_for_tagged_policy() {
        let txn = std::sync::Arc::new(Txn::new());
        txn.set_deadline(0x0102_0304);
        let mut policy = ReadPolicy::default();
        policy.txn = Some(txn.clone());

        let key = Key::new("ns", "set", "k").unwrap();
        let buffer = read_frame(&policy, &key, &Bins::All);
        let frame = buffer.frame();

        // Walk fields looking for the txn id and little-endian deadline.
        let mut offset = MSG_TOTAL_HEADER_SIZE;
        let n_fields = NetworkEndian::read_u16(&frame[26..28]);
        let mut found_id = false;
        let mut found_deadline = false;
        for _ in 0..n_fields {
            let len = NetworkEndian::read_u32(&frame[offset..]) as usize;
            let ftype = frame[offset + 4];
            let data = &frame[offset + 5..offset + 4 + len];
            if ftype == FieldType::MrtId as u8 {
                assert_eq!(NetworkEndian::read_u64(data), txn.id());
                found_id = true;
            }
            if ftype == FieldType::MrtDeadline as u8 {
                assert_eq!(LittleEndian::read_u32(data), 0x0102_0304);
                found_deadline = true;
            }
            offset += 4 + len;
        }
        assert!(found_id && found_deadline);
    }
}
