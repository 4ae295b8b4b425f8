//! Row-level parsing shared by the streaming commands. A multi-record
//! response is a train of frames, each holding repeated
//! `22-byte header, fields, operations` rows; the train ends with a row
//! flagged INFO3_LAST.

use crate::commands::buffer;
use crate::commands::buffer::Buffer;
use crate::commands::field_type::FieldType;
use crate::errors::{Error, Result};
use crate::key::Key;
use crate::record::Record;
use crate::result_code::ResultCode;
use crate::value::{bytes_to_particle, Value};
use hashbrown::HashMap;

/// Outcome of parsing one row, expressed as data rather than control-flow
/// exceptions.
#[derive(Debug)]
pub enum Row {
    Record(u32, Record),
    /// Row addressed a key the server did not find (batch responses).
    NotFound(u32),
    /// End-of-stream marker row.
    End,
    /// A partition finished streaming; no record follows.
    PartitionDone,
}

/// Parse the row at the buffer cursor. `size` bounds the message; the
/// cursor advances past the row.
pub(crate) fn parse_row(buffer: &mut Buffer) -> Result<Row> {
    if buffer.remaining() < buffer::MSG_REMAINING_HEADER_SIZE {
        return Err(Error::parse("truncated record row"));
    }
    let base = buffer.data_offset;
    let info3 = buffer.read_u8_at(base + 3);
    let result_code = ResultCode::from(buffer.read_u8_at(base + 5));
    let generation = buffer.read_u32_at(base + 6);
    let expiration = buffer.read_u32_at(base + 10);
    let batch_index = buffer.read_u32_at(base + 14);
    let field_count = buffer.read_u16_at(base + 18) as usize;
    let op_count = buffer.read_u16_at(base + 20) as usize;
    buffer.data_offset = base + buffer::MSG_REMAINING_HEADER_SIZE;

    if info3 & buffer::INFO3_LAST != 0 {
        // The end marker may carry a result code describing why the stream
        // stopped early.
        return match result_code {
            ResultCode::Ok | ResultCode::KeyNotFoundError => Ok(Row::End),
            rc => Err(Error::server(rc)),
        };
    }

    match result_code {
        ResultCode::Ok => (),
        ResultCode::KeyNotFoundError => {
            skip_fields_and_ops(buffer, field_count, op_count)?;
            return Ok(Row::NotFound(batch_index));
        }
        rc => return Err(Error::server(rc)),
    }

    let key = parse_key(buffer, field_count)?;

    if info3 & buffer::INFO3_PARTITION_DONE != 0 {
        return Ok(Row::PartitionDone);
    }

    let mut bins: HashMap<String, Value> = HashMap::with_capacity(op_count);
    for _ in 0..op_count {
        let op_size = buffer.read_u32() as usize;
        buffer.skip(1);
        let particle_type = buffer.read_u8();
        buffer.skip(1);
        let name_size = buffer.read_u8() as usize;
        let name = buffer.read_str(name_size)?;
        let particle_size = op_size
            .checked_sub(4 + name_size)
            .filter(|size| *size <= buffer.remaining())
            .ok_or_else(|| Error::parse(format!("invalid operation size {}", op_size)))?;
        let value = bytes_to_particle(particle_type, buffer, particle_size)?;
        bins.insert(name, value);
    }

    let record = Record::new(Some(key), bins, generation, expiration);
    Ok(Row::Record(batch_index, record))
}

/// Reassemble the key identity a row carries in its fields.
pub(crate) fn parse_key(buffer: &mut Buffer, field_count: usize) -> Result<Key> {
    let mut digest = [0u8; 20];
    let mut namespace = String::new();
    let mut set_name = String::new();
    let mut user_key: Option<Value> = None;

    for _ in 0..field_count {
        let field_len = buffer.read_u32() as usize;
        if field_len < 1 || field_len > buffer.remaining() {
            return Err(Error::parse(format!("invalid field length {}", field_len)));
        }
        let field_type = buffer.read_u8();

        match field_type {
            x if x == FieldType::DigestRipe as u8 => {
                if field_len - 1 != digest.len() {
                    return Err(Error::parse(format!("digest field of {} bytes", field_len - 1)));
                }
                digest.copy_from_slice(buffer.read_slice(field_len - 1));
            }
            x if x == FieldType::Namespace as u8 => {
                namespace = buffer.read_str(field_len - 1)?;
            }
            x if x == FieldType::Table as u8 => {
                set_name = buffer.read_str(field_len - 1)?;
            }
            x if x == FieldType::Key as u8 => {
                let particle_type = buffer.read_u8();
                user_key = Some(bytes_to_particle(particle_type, buffer, field_len - 2)?);
            }
            _ => buffer.skip(field_len - 1),
        }
    }

    let mut key = Key::from_digest(namespace, set_name, digest);
    key.user_key = user_key;
    Ok(key)
}

fn skip_fields_and_ops(buffer: &mut Buffer, field_count: usize, op_count: usize) -> Result<()> {
    for _ in 0..field_count {
        let field_len = buffer.read_u32() as usize;
        buffer.skip(field_len);
    }
    for _ in 0..op_count {
        let op_size = buffer.read_u32() as usize;
        buffer.skip(op_size);
    }
    Ok(())
}
