//! Command execution core for the Aerospike binary wire protocol: key
//! digesting and partition routing, per-node connection pooling with
//! error-rate backoff, request framing with optional zlib compression, a
//! shared retry engine with dual socket/total deadlines, single-key and
//! batch commands, scans, UDF invocation, the admin sub-protocol and
//! multi-record transactions with verify-commit semantics.
//!
//! Cluster topology discovery is deliberately out of scope: an external
//! tender feeds `Cluster` through `add_node` and `set_partition_map`, and
//! every command picks its node from the current snapshot.
//!
//! ```no_run
//! use magnetar::{Bin, Bins, Client, ClientPolicy, Host, Key, ReadPolicy, WritePolicy};
//!
//! let client = Client::new(
//!     ClientPolicy::default(),
//!     &[Host::new("127.0.0.1", 3000)],
//!     None,
//! )
//! .unwrap();
//!
//! let key = Key::new("test", "demo", "alice").unwrap();
//! client
//!     .put(&WritePolicy::default(), &key, &[Bin::new("age", 30i64)])
//!     .unwrap();
//! let record = client.get(&ReadPolicy::default(), &key, Bins::All).unwrap();
//! println!("{:?}", record);
//! ```

pub mod batch;
pub mod bin;
pub mod client;
pub mod cluster;
pub mod commands;
pub mod errors;
pub mod key;
pub mod msgpack;
pub mod net;
pub mod operations;
pub mod policy;
pub mod record;
pub mod recordset;
pub mod result_code;
pub mod txn;
pub mod user;
pub mod value;

pub use crate::batch::BatchRecord;
pub use crate::bin::{Bin, Bins};
pub use crate::client::{Client, UdfLang};
pub use crate::cluster::{Cluster, Node, NodeFeatures, Partition, PartitionMap};
pub use crate::commands::{CancelToken, LatencyType};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::key::Key;
pub use crate::net::Host;
pub use crate::policy::{
    AdminPolicy, BasePolicy, BatchPolicy, ClientPolicy, CommitLevel, Expiration, GenerationPolicy,
    ReadPolicy, RecordExistsAction, Replica, ScanPolicy, WritePolicy,
};
pub use crate::record::Record;
pub use crate::recordset::Recordset;
pub use crate::result_code::ResultCode;
pub use crate::txn::{AbortStatus, CommitStage, CommitStatus, Txn, TxnRoll, TxnState};
pub use crate::user::{AdminUser, Privilege, PrivilegeCode, Role};
pub use crate::value::{ParticleType, Value};
