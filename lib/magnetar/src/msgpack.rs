//! Msgpack encoding of list and map particles, built on the low-level `rmp`
//! primitives. Strings, blobs and geo-json nested inside collections carry
//! their particle type as the first payload byte; scalars use the plain
//! msgpack representations. Server-ordered maps are written as a map with a
//! leading `(ext, nil)` marker pair.

use crate::errors::{Error, Result};
use crate::value::{ParticleType, Value};
use byteorder::{BigEndian, ReadBytesExt};
use ordered_float::OrderedFloat;
use rmp::Marker;
use std::io;

const ORDERED_MAP_FLAG: u8 = 0x01;

#[inline]
fn enc_err() -> Error {
    Error::parse("msgpack encoding failed")
}

#[inline]
fn dec_err() -> Error {
    Error::parse("truncated or malformed msgpack particle")
}

/// Encode a value into `w` in the wire representation used by list and map
/// particles. Top-level callers pass `List`/`Map` values; scalars are only
/// reached through recursion.
pub fn encode_value<W: io::Write>(w: &mut W, value: &Value) -> Result<()> {
    match value {
        Value::Nil => rmp::encode::write_nil(w).map_err(|_| enc_err()),
        Value::Bool(val) => rmp::encode::write_bool(w, *val).map_err(|_| enc_err()),
        Value::Int(val) => {
            rmp::encode::write_sint(w, *val).map_err(|_| enc_err())?;
            Ok(())
        }
        Value::Float(val) => {
            rmp::encode::write_f64(w, val.into_inner()).map_err(|_| enc_err())?;
            Ok(())
        }
        Value::String(s) => write_prefixed_str(w, ParticleType::String, s),
        Value::GeoJson(s) => write_prefixed_str(w, ParticleType::GeoJson, s),
        Value::Blob(b) => write_prefixed_bin(w, ParticleType::Blob, b),
        Value::HostBlob(b) => write_prefixed_bin(w, ParticleType::HostBlob, b),
        Value::List(items) => {
            rmp::encode::write_array_len(w, items.len() as u32).map_err(|_| enc_err())?;
            for item in items {
                encode_value(w, item)?;
            }
            Ok(())
        }
        Value::Map(pairs) => {
            rmp::encode::write_map_len(w, pairs.len() as u32).map_err(|_| enc_err())?;
            write_pairs(w, pairs)
        }
        Value::OrderedMap(pairs) => {
            // Key-ordered maps announce themselves with an (ext, nil) pair
            // ahead of the payload entries.
            rmp::encode::write_map_len(w, pairs.len() as u32 + 1).map_err(|_| enc_err())?;
            rmp::encode::write_ext_meta(w, 1, 0).map_err(|_| enc_err())?;
            w.write_all(&[ORDERED_MAP_FLAG]).map_err(|_| enc_err())?;
            rmp::encode::write_nil(w).map_err(|_| enc_err())?;
            write_pairs(w, pairs)
        }
    }
}

fn write_pairs<W: io::Write>(w: &mut W, pairs: &[(Value, Value)]) -> Result<()> {
    for (key, val) in pairs {
        encode_value(w, key)?;
        encode_value(w, val)?;
    }
    Ok(())
}

fn write_prefixed_str<W: io::Write>(w: &mut W, particle: ParticleType, s: &str) -> Result<()> {
    rmp::encode::write_str_len(w, s.len() as u32 + 1).map_err(|_| enc_err())?;
    w.write_all(&[particle as u8]).map_err(|_| enc_err())?;
    w.write_all(s.as_bytes()).map_err(|_| enc_err())
}

fn write_prefixed_bin<W: io::Write>(w: &mut W, particle: ParticleType, b: &[u8]) -> Result<()> {
    rmp::encode::write_bin_len(w, b.len() as u32 + 1).map_err(|_| enc_err())?;
    w.write_all(&[particle as u8]).map_err(|_| enc_err())?;
    w.write_all(b).map_err(|_| enc_err())
}

/// Number of bytes `encode_value` will produce for this value.
pub fn encoded_size(value: &Value) -> usize {
    let mut sink = CountingSink { count: 0 };
    encode_value(&mut sink, value).expect("counting sink cannot fail");
    sink.count
}

struct CountingSink {
    count: usize,
}

impl io::Write for CountingSink {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += buf.len();
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode one msgpack value from the reader.
pub fn decode_value<R: io::Read>(r: &mut R) -> Result<Value> {
    let marker = rmp::decode::read_marker(r).map_err(|_| dec_err())?;
    decode_inner(marker, r)
}

fn decode_inner<R: io::Read>(marker: Marker, r: &mut R) -> Result<Value> {
    match marker {
        Marker::Null => Ok(Value::Nil),
        Marker::True => Ok(Value::Bool(true)),
        Marker::False => Ok(Value::Bool(false)),
        Marker::FixPos(val) => Ok(Value::Int(val as i64)),
        Marker::FixNeg(val) => Ok(Value::Int(val as i64)),
        Marker::U8 => Ok(Value::Int(r.read_u8().map_err(|_| dec_err())? as i64)),
        Marker::U16 => Ok(Value::Int(
            r.read_u16::<BigEndian>().map_err(|_| dec_err())? as i64
        )),
        Marker::U32 => Ok(Value::Int(
            r.read_u32::<BigEndian>().map_err(|_| dec_err())? as i64
        )),
        Marker::U64 => Ok(Value::Int(
            r.read_u64::<BigEndian>().map_err(|_| dec_err())? as i64
        )),
        Marker::I8 => Ok(Value::Int(r.read_i8().map_err(|_| dec_err())? as i64)),
        Marker::I16 => Ok(Value::Int(
            r.read_i16::<BigEndian>().map_err(|_| dec_err())? as i64
        )),
        Marker::I32 => Ok(Value::Int(
            r.read_i32::<BigEndian>().map_err(|_| dec_err())? as i64
        )),
        Marker::I64 => Ok(Value::Int(r.read_i64::<BigEndian>().map_err(|_| dec_err())?)),
        Marker::F32 => Ok(Value::Float(OrderedFloat(
            r.read_f32::<BigEndian>().map_err(|_| dec_err())? as f64,
        ))),
        Marker::F64 => Ok(Value::Float(OrderedFloat(
            r.read_f64::<BigEndian>().map_err(|_| dec_err())?,
        ))),
        Marker::FixStr(len) => decode_prefixed_str(r, len as usize),
        Marker::Str8 => {
            let len = r.read_u8().map_err(|_| dec_err())? as usize;
            decode_prefixed_str(r, len)
        }
        Marker::Str16 => {
            let len = r.read_u16::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_prefixed_str(r, len)
        }
        Marker::Str32 => {
            let len = r.read_u32::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_prefixed_str(r, len)
        }
        Marker::Bin8 => {
            let len = r.read_u8().map_err(|_| dec_err())? as usize;
            decode_prefixed_bin(r, len)
        }
        Marker::Bin16 => {
            let len = r.read_u16::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_prefixed_bin(r, len)
        }
        Marker::Bin32 => {
            let len = r.read_u32::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_prefixed_bin(r, len)
        }
        Marker::FixArray(len) => decode_list(r, len as usize),
        Marker::Array16 => {
            let len = r.read_u16::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_list(r, len)
        }
        Marker::Array32 => {
            let len = r.read_u32::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_list(r, len)
        }
        Marker::FixMap(len) => decode_map(r, len as usize),
        Marker::Map16 => {
            let len = r.read_u16::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_map(r, len)
        }
        Marker::Map32 => {
            let len = r.read_u32::<BigEndian>().map_err(|_| dec_err())? as usize;
            decode_map(r, len)
        }
        _ => Err(dec_err()),
    }
}

fn decode_prefixed_str<R: io::Read>(r: &mut R, len: usize) -> Result<Value> {
    if len == 0 {
        return Ok(Value::String(String::new()));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(|_| dec_err())?;
    let particle = payload[0];
    let text = String::from_utf8(payload.split_off(1))
        .map_err(|_| Error::parse("invalid utf8 in string particle"))?;
    match ParticleType::from_u8(particle)? {
        ParticleType::GeoJson => Ok(Value::GeoJson(text)),
        _ => Ok(Value::String(text)),
    }
}

fn decode_prefixed_bin<R: io::Read>(r: &mut R, len: usize) -> Result<Value> {
    if len == 0 {
        return Ok(Value::Blob(Vec::new()));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(|_| dec_err())?;
    let particle = payload[0];
    let body = payload.split_off(1);
    match ParticleType::from_u8(particle)? {
        ParticleType::HostBlob => Ok(Value::HostBlob(body)),
        ParticleType::String => Ok(Value::String(
            String::from_utf8(body).map_err(|_| Error::parse("invalid utf8 in string particle"))?,
        )),
        _ => Ok(Value::Blob(body)),
    }
}

fn decode_list<R: io::Read>(r: &mut R, len: usize) -> Result<Value> {
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(decode_value(r)?);
    }
    Ok(Value::List(items))
}

fn decode_map<R: io::Read>(r: &mut R, len: usize) -> Result<Value> {
    if len == 0 {
        return Ok(Value::Map(Vec::new()));
    }

    let first = rmp::decode::read_marker(r).map_err(|_| dec_err())?;
    let (ordered, remaining, carry) = match first {
        Marker::FixExt1 => {
            // type id + flag byte, then the nil filler value.
            let mut meta = [0u8; 2];
            r.read_exact(&mut meta).map_err(|_| dec_err())?;
            decode_value(r)?;
            (true, len - 1, None)
        }
        marker => {
            let key = decode_inner(marker, r)?;
            let val = decode_value(r)?;
            (false, len - 1, Some((key, val)))
        }
    };

    let mut pairs = Vec::with_capacity(remaining + carry.is_some() as usize);
    if let Some(pair) = carry {
        pairs.push(pair);
    }
    for _ in 0..remaining {
        let key = decode_value(r)?;
        let val = decode_value(r)?;
        pairs.push((key, val));
    }

    if ordered {
        Ok(Value::OrderedMap(pairs))
    } else {
        Ok(Value::Map(pairs))
    }
}
