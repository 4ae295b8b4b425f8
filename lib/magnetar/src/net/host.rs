use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Network address of one cluster node.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    #[inline]
    pub fn new<S: Into<String>>(name: S, port: u16) -> Host {
        Host {
            name: name.into(),
            port,
        }
    }

    #[inline]
    pub fn address(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_format() {
        assert_eq!(Host::new("10.0.0.1", 3000).address(), "10.0.0.1:3000");
    }
}
