use crate::errors::{Error, Result};
use crate::value::Value;
use byteorder::{BigEndian, WriteBytesExt};
use ripemd::{Digest, Ripemd160};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Unique record identifier. The 20-byte RIPEMD-160 digest over
/// `set_name || particle_type || user_key` is the stable identity; two keys
/// are equal iff their digests are equal.
#[derive(Debug, Clone)]
pub struct Key {
    pub namespace: String,
    pub set_name: String,
    pub user_key: Option<Value>,
    pub digest: [u8; 20],
}

impl Key {
    /// Build a key from its user-visible parts. Only integer, string and
    /// blob user keys are hashable per the wire protocol.
    pub fn new<S1, S2, V>(namespace: S1, set_name: S2, user_key: V) -> Result<Key>
    where
        S1: Into<String>,
        S2: Into<String>,
        V: Into<Value>,
    {
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = Key::compute_digest(&set_name, &user_key)?;

        Ok(Key {
            namespace: namespace.into(),
            set_name,
            user_key: Some(user_key),
            digest,
        })
    }

    /// Reconstruct a key from a digest received off the wire, where the
    /// user-visible key value may be absent.
    #[inline]
    pub fn from_digest<S1, S2>(namespace: S1, set_name: S2, digest: [u8; 20]) -> Key
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Key {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: None,
            digest,
        }
    }

    fn compute_digest(set_name: &str, user_key: &Value) -> Result<[u8; 20]> {
        let mut hasher = Ripemd160::new();
        hasher.update(set_name.as_bytes());
        hasher.update(&[user_key.particle_type() as u8]);

        match user_key {
            Value::Int(val) => {
                let mut bytes = [0u8; 8];
                (&mut bytes[..]).write_i64::<BigEndian>(*val).unwrap();
                hasher.update(&bytes);
            }
            Value::String(s) => hasher.update(s.as_bytes()),
            Value::Blob(b) => hasher.update(b),
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported user key type {:?}",
                    other.particle_type()
                )))
            }
        }

        let mut digest = [0u8; 20];
        digest.copy_from_slice(&hasher.finalize());
        Ok(digest)
    }
}

impl PartialEq for Key {
    #[inline]
    fn eq(&self, other: &Key) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Key {}

impl Hash for Key {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.user_key {
            Some(value) => write!(f, "{}:{}:{}", self.namespace, self.set_name, value),
            None => write!(
                f,
                "{}:{}:<{}>",
                self.namespace,
                self.set_name,
                self.digest[..4]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_depends_on_set_and_key_only() {
        let a = Key::new("ns1", "set1", "alice").unwrap();
        let b = Key::new("ns2", "set1", "alice").unwrap();
        let c = Key::new("ns1", "set2", "alice").unwrap();

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_distinguishes_key_types() {
        // "1" as a string and 1 as an integer must not collide.
        let s = Key::new("ns", "set", "1").unwrap();
        let i = Key::new("ns", "set", 1i64).unwrap();
        assert_ne!(s.digest, i.digest);
    }

    #[test]
    fn test_integer_key_stable_digest() {
        let a = Key::new("ns", "set", 42i64).unwrap();
        let b = Key::new("other", "set", 42i64).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 20);
    }

    #[test]
    fn test_blob_key_allowed_float_rejected() {
        assert!(Key::new("ns", "set", vec![1u8, 2, 3]).is_ok());
        assert!(Key::new("ns", "set", 1.5f64).is_err());
    }

    #[test]
    fn test_from_digest_equality() {
        let a = Key::new("ns", "set", "thing").unwrap();
        let b = Key::from_digest("ns", "set", a.digest);
        assert_eq!(a, b);
        assert!(b.user_key.is_none());
    }
}
