use crate::policy::{
    BasePolicy, CommitLevel, Expiration, GenerationPolicy, RecordExistsAction,
};
use serde_derive::{Deserialize, Serialize};

/// Options for single-record writes, deletes and touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicy {
    #[serde(flatten)]
    pub base: BasePolicy,
    pub record_exists_action: RecordExistsAction,
    pub generation_policy: GenerationPolicy,
    /// Expected generation when the generation policy demands one.
    pub generation: u32,
    pub expiration: Expiration,
    pub commit_level: CommitLevel,
    /// Leave a tombstone on delete so the record cannot resurrect after a
    /// node failure.
    pub durable_delete: bool,
    /// Return a result for every operation of an operate command instead of
    /// only the last one per bin.
    pub respond_all_ops: bool,
    /// Ship the user key alongside the digest.
    pub send_key: bool,
}

impl Default for WritePolicy {
    fn default() -> WritePolicy {
        WritePolicy {
            base: BasePolicy::default(),
            record_exists_action: RecordExistsAction::Update,
            generation_policy: GenerationPolicy::None,
            generation: 0,
            expiration: Expiration::NamespaceDefault,
            commit_level: CommitLevel::All,
            durable_delete: false,
            respond_all_ops: false,
            send_key: false,
        }
    }
}
