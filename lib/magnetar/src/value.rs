use crate::commands::buffer::Buffer;
use crate::errors::{Error, Result};
use crate::msgpack;
use ordered_float::OrderedFloat;
use std::fmt;

/// Particle type byte identifying a value variant on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParticleType {
    Null = 0,
    Integer = 1,
    Double = 2,
    String = 3,
    Blob = 4,
    /// Host-language serialized object; opaque bytes the caller encodes.
    HostBlob = 8,
    Bool = 17,
    Map = 19,
    List = 20,
    GeoJson = 23,
}

impl ParticleType {
    pub fn from_u8(particle: u8) -> Result<ParticleType> {
        match particle {
            0 => Ok(ParticleType::Null),
            1 => Ok(ParticleType::Integer),
            2 => Ok(ParticleType::Double),
            3 => Ok(ParticleType::String),
            4 => Ok(ParticleType::Blob),
            8 => Ok(ParticleType::HostBlob),
            17 => Ok(ParticleType::Bool),
            19 => Ok(ParticleType::Map),
            20 => Ok(ParticleType::List),
            23 => Ok(ParticleType::GeoJson),
            particle => Err(Error::parse(format!("unknown particle type {}", particle))),
        }
    }
}

/// A single typed value as stored in a bin or used as a user key.
///
/// Scalars go on the wire in their raw particle encoding; lists and maps are
/// msgpack-encoded. `OrderedMap` is a map the server keeps key-ordered; it
/// differs from `Map` only by a marker in the encoded form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    String(String),
    Blob(Vec<u8>),
    HostBlob(Vec<u8>),
    GeoJson(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    OrderedMap(Vec<(Value, Value)>),
}

impl Value {
    #[inline]
    pub fn particle_type(&self) -> ParticleType {
        match self {
            Value::Nil => ParticleType::Null,
            Value::Bool(_) => ParticleType::Bool,
            Value::Int(_) => ParticleType::Integer,
            Value::Float(_) => ParticleType::Double,
            Value::String(_) => ParticleType::String,
            Value::Blob(_) => ParticleType::Blob,
            Value::HostBlob(_) => ParticleType::HostBlob,
            Value::GeoJson(_) => ParticleType::GeoJson,
            Value::List(_) => ParticleType::List,
            Value::Map(_) | Value::OrderedMap(_) => ParticleType::Map,
        }
    }

    /// Exact number of particle bytes `write_to` will produce.
    pub fn estimate_size(&self) -> usize {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) | Value::GeoJson(s) => s.len(),
            Value::Blob(b) | Value::HostBlob(b) => b.len(),
            Value::List(_) | Value::Map(_) | Value::OrderedMap(_) => msgpack::encoded_size(self),
        }
    }

    /// Append the particle bytes to the command buffer.
    pub fn write_to(&self, buffer: &mut Buffer) -> Result<()> {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(val) => {
                buffer.write_u8(*val as u8);
                Ok(())
            }
            Value::Int(val) => {
                buffer.write_i64(*val);
                Ok(())
            }
            Value::Float(val) => {
                buffer.write_f64(val.into_inner());
                Ok(())
            }
            Value::String(s) | Value::GeoJson(s) => {
                buffer.write_str(s);
                Ok(())
            }
            Value::Blob(b) | Value::HostBlob(b) => {
                buffer.write_bytes(b);
                Ok(())
            }
            Value::List(_) | Value::Map(_) | Value::OrderedMap(_) => {
                msgpack::encode_value(buffer, self)
            }
        }
    }
}

/// Decode `len` particle bytes at the buffer cursor into a value.
pub fn bytes_to_particle(particle: u8, buffer: &mut Buffer, len: usize) -> Result<Value> {
    match ParticleType::from_u8(particle)? {
        ParticleType::Null => {
            buffer.skip(len);
            Ok(Value::Nil)
        }
        ParticleType::Integer => {
            if len != 8 {
                return Err(Error::parse(format!("integer particle of {} bytes", len)));
            }
            Ok(Value::Int(buffer.read_i64()))
        }
        ParticleType::Double => {
            if len != 8 {
                return Err(Error::parse(format!("double particle of {} bytes", len)));
            }
            Ok(Value::Float(OrderedFloat(buffer.read_f64())))
        }
        ParticleType::String => Ok(Value::String(buffer.read_str(len)?)),
        ParticleType::Blob => Ok(Value::Blob(buffer.read_slice(len).to_vec())),
        ParticleType::HostBlob => Ok(Value::HostBlob(buffer.read_slice(len).to_vec())),
        ParticleType::Bool => {
            if len != 1 {
                return Err(Error::parse(format!("bool particle of {} bytes", len)));
            }
            Ok(Value::Bool(buffer.read_u8() != 0))
        }
        ParticleType::GeoJson => Ok(Value::GeoJson(buffer.read_str(len)?)),
        ParticleType::List | ParticleType::Map => {
            let mut slice = buffer.read_slice(len);
            msgpack::decode_value(&mut slice)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "NIL"),
            Value::Bool(val) => write!(f, "{}", val),
            Value::Int(val) => write!(f, "{}", val),
            Value::Float(val) => write!(f, "{}", val),
            Value::String(val) | Value::GeoJson(val) => write!(f, "{}", val),
            Value::Blob(val) | Value::HostBlob(val) => write!(f, "{:02X?}", val),
            Value::List(vals) => {
                write!(f, "[")?;
                for (i, val) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val)?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) | Value::OrderedMap(pairs) => {
                write!(f, "{{")?;
                for (i, (key, val)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, val)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(val: i64) -> Value {
        Value::Int(val)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(val: i32) -> Value {
        Value::Int(val as i64)
    }
}

impl From<u32> for Value {
    #[inline]
    fn from(val: u32) -> Value {
        Value::Int(val as i64)
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(val: bool) -> Value {
        Value::Bool(val)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(val: f64) -> Value {
        Value::Float(OrderedFloat(val))
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(val: &str) -> Value {
        Value::String(val.to_string())
    }
}

impl From<String> for Value {
    #[inline]
    fn from(val: String) -> Value {
        Value::String(val)
    }
}

impl From<Vec<u8>> for Value {
    #[inline]
    fn from(val: Vec<u8>) -> Value {
        Value::Blob(val)
    }
}

impl From<Vec<Value>> for Value {
    #[inline]
    fn from(val: Vec<Value>) -> Value {
        Value::List(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_particle_type_mapping() {
        assert_eq!(Value::Nil.particle_type(), ParticleType::Null);
        assert_eq!(Value::from(1i64).particle_type(), ParticleType::Integer);
        assert_eq!(Value::from(1.5f64).particle_type(), ParticleType::Double);
        assert_eq!(Value::from("a").particle_type(), ParticleType::String);
        assert_eq!(Value::from(vec![1u8]).particle_type(), ParticleType::Blob);
        assert_eq!(Value::from(true).particle_type(), ParticleType::Bool);
        assert_eq!(
            Value::List(vec![Value::Nil]).particle_type(),
            ParticleType::List
        );
        assert_eq!(Value::Map(vec![]).particle_type(), ParticleType::Map);
        assert_eq!(Value::OrderedMap(vec![]).particle_type(), ParticleType::Map);
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(Value::Nil.estimate_size(), 0);
        assert_eq!(Value::from(12i64).estimate_size(), 8);
        assert_eq!(Value::from(0.5f64).estimate_size(), 8);
        assert_eq!(Value::from("abcde").estimate_size(), 5);
        assert_eq!(Value::from(true).estimate_size(), 1);
    }

    #[test]
    fn test_unknown_particle_rejected() {
        assert!(ParticleType::from_u8(99).is_err());
    }
}
