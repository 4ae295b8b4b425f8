use crate::value::Value;

/// A named value to be written into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    #[inline]
    pub fn new<S: Into<String>, V: Into<Value>>(name: S, value: V) -> Bin {
        Bin {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Bin selector for read commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Bins {
    /// Return every bin of the record.
    All,
    /// Return record metadata only, no bin data.
    None,
    /// Return the named bins.
    Some(Vec<String>),
}

impl Bins {
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Bins::None)
    }
}

impl<'a> From<&'a [&'a str]> for Bins {
    fn from(names: &'a [&'a str]) -> Bins {
        Bins::Some(names.iter().map(|name| (*name).to_string()).collect())
    }
}
