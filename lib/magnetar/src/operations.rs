use crate::bin::Bin;
use crate::msgpack;
use crate::value::{ParticleType, Value};

/// Operation type byte on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperationType {
    Read = 1,
    Write = 2,
    CdtRead = 3,
    CdtModify = 4,
    Incr = 5,
    Append = 9,
    Prepend = 10,
    Touch = 11,
    Delete = 14,
}

impl OperationType {
    #[inline]
    pub fn is_write(self) -> bool {
        !matches!(self, OperationType::Read | OperationType::CdtRead)
    }
}

/// Payload of a single operation. CDT operations carry their sub-opcode and
/// parameters pre-encoded as msgpack in the particle bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpData {
    Value(Value),
    Cdt(Vec<u8>),
}

/// One entry of an operate command's operation list.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op: OperationType,
    /// Empty name addresses the whole record (get-all, touch).
    pub bin_name: String,
    pub data: OpData,
    /// Read of metadata only; sets the no-bin-data read flag.
    pub header_only: bool,
}

impl Operation {
    #[inline]
    pub fn particle_type(&self) -> ParticleType {
        match &self.data {
            OpData::Value(value) => value.particle_type(),
            OpData::Cdt(_) => ParticleType::Blob,
        }
    }

    #[inline]
    pub fn particle_size(&self) -> usize {
        match &self.data {
            OpData::Value(value) => value.estimate_size(),
            OpData::Cdt(bytes) => bytes.len(),
        }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.op.is_write()
    }
}

/// Read all bins.
pub fn get() -> Operation {
    Operation {
        op: OperationType::Read,
        bin_name: String::new(),
        data: OpData::Value(Value::Nil),
        header_only: false,
    }
}

/// Read a single named bin.
pub fn get_bin<S: Into<String>>(name: S) -> Operation {
    Operation {
        op: OperationType::Read,
        bin_name: name.into(),
        data: OpData::Value(Value::Nil),
        header_only: false,
    }
}

/// Read record metadata (generation, expiration) without bin data.
pub fn get_header() -> Operation {
    Operation {
        op: OperationType::Read,
        bin_name: String::new(),
        data: OpData::Value(Value::Nil),
        header_only: true,
    }
}

pub fn put(bin: Bin) -> Operation {
    Operation {
        op: OperationType::Write,
        bin_name: bin.name,
        data: OpData::Value(bin.value),
        header_only: false,
    }
}

pub fn add(bin: Bin) -> Operation {
    Operation {
        op: OperationType::Incr,
        bin_name: bin.name,
        data: OpData::Value(bin.value),
        header_only: false,
    }
}

pub fn append(bin: Bin) -> Operation {
    Operation {
        op: OperationType::Append,
        bin_name: bin.name,
        data: OpData::Value(bin.value),
        header_only: false,
    }
}

pub fn prepend(bin: Bin) -> Operation {
    Operation {
        op: OperationType::Prepend,
        bin_name: bin.name,
        data: OpData::Value(bin.value),
        header_only: false,
    }
}

pub fn touch() -> Operation {
    Operation {
        op: OperationType::Touch,
        bin_name: String::new(),
        data: OpData::Value(Value::Nil),
        header_only: false,
    }
}

pub fn delete() -> Operation {
    Operation {
        op: OperationType::Delete,
        bin_name: String::new(),
        data: OpData::Value(Value::Nil),
        header_only: false,
    }
}

/// List operations. Only the slice of the CDT family the client itself
/// needs (transaction monitor upkeep) is provided.
pub mod lists {
    use super::*;

    const APPEND_ITEMS: i64 = 2;

    /// Server-side list ordering.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum ListOrder {
        Unordered = 0,
        Ordered = 1,
    }

    /// Write flags for list modifications.
    pub mod write_flags {
        pub const DEFAULT: i64 = 0;
        pub const ADD_UNIQUE: i64 = 1;
        pub const NO_FAIL: i64 = 4;
        pub const PARTIAL: i64 = 8;
    }

    /// Append `items` to the list bin, creating it with the given order if
    /// absent. Flags control duplicate handling.
    pub fn append_items<S: Into<String>>(
        bin_name: S,
        items: Vec<Value>,
        order: ListOrder,
        flags: i64,
    ) -> Operation {
        let params = Value::List(vec![
            Value::Int(APPEND_ITEMS),
            Value::List(items),
            Value::Int(order as i64),
            Value::Int(flags),
        ]);
        let mut encoded = Vec::new();
        msgpack::encode_value(&mut encoded, &params).expect("vec sink cannot fail");

        Operation {
            op: OperationType::CdtModify,
            bin_name: bin_name.into(),
            data: OpData::Cdt(encoded),
            header_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_classification() {
        assert!(!get().is_write());
        assert!(!get_header().is_write());
        assert!(put(Bin::new("a", 1i64)).is_write());
        assert!(add(Bin::new("a", 1i64)).is_write());
        assert!(touch().is_write());
        assert!(delete().is_write());
        assert!(lists::append_items(
            "l",
            vec![Value::Int(1)],
            lists::ListOrder::Ordered,
            lists::write_flags::ADD_UNIQUE
        )
        .is_write());
    }

    #[test]
    fn test_cdt_payload_is_msgpack_array() {
        let op = lists::append_items(
            "l",
            vec![Value::Int(5)],
            lists::ListOrder::Ordered,
            lists::write_flags::NO_FAIL,
        );
        let bytes = match &op.data {
            OpData::Cdt(bytes) => bytes.clone(),
            _ => panic!("expected cdt payload"),
        };
        let decoded = crate::msgpack::decode_value(&mut bytes.as_slice()).unwrap();
        match decoded {
            Value::List(items) => {
                assert_eq!(items[0], Value::Int(2));
                assert_eq!(items[1], Value::List(vec![Value::Int(5)]));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
