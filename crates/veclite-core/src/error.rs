use thiserror::Error;

/// Error taxonomy for every veclite crate.
///
/// Expected-absence cases (`NotFound` on a missing WAL, HEAD or ANN payload)
/// are recovered locally by callers; `Corrupt` and `VersionUnsupported` are
/// the only truly exceptional variants.
#[derive(Debug, Error)]
pub enum VecliteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("id {0} already exists")]
    AlreadyExists(u32),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid vector: {0}")]
    InvalidVector(String),

    #[error("corrupt data at byte {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    #[error("unsupported format version {0}")]
    VersionUnsupported(u32),

    #[error("lock held: {0}")]
    Locked(String),

    #[error("head epoch conflict: expected {expected}, found {found}")]
    ConflictEpoch { expected: u64, found: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl VecliteError {
    pub fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            offset,
            detail: detail.into(),
        }
    }

    /// True when the error means a blob key simply was not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, VecliteError>;
