use dura_durable::DurableError;
use dura_merge::MergeError;
use dura_store::StoreError;
use dura_types::{DurableId, SeqRange, TypeError};

/// Errors from repository operations and the engine around them.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("durable error: {0}")]
    Durable(#[from] DurableError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Repository state or a layer file failed to encode or decode.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("layer file {gen_id} of repo {owner} not found")]
    FileNotFound { owner: DurableId, gen_id: u64 },

    /// Two layer files partially overlap, so no neighborly mapping exists.
    #[error("repo {owner} has overlapping layer files {first:?} and {second:?}")]
    OverlappingFiles {
        owner: DurableId,
        first: SeqRange,
        second: SeqRange,
    },

    /// A merge needs more block slots than it was granted.
    #[error("merge of {inputs} files exceeds budget of {budget} slots")]
    OverBudget { inputs: usize, budget: usize },

    #[error("merge called with no input files")]
    NothingToMerge,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;
