#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Corruption: {0}")]
    Corruption(#[from] CorruptionError),

    #[error("VarInt: {0}")]
    VarInt(#[from] VarIntError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Decode-side failures of the write batch wire format. Iteration stops at
/// the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorruptionError {
    #[error("malformed WriteBatch (too small)")]
    BatchTooSmall,

    #[error("bad WriteBatch Put")]
    BadPut,

    #[error("bad WriteBatch Delete")]
    BadDelete,

    #[error("unknown WriteBatch tag")]
    UnknownTag,

    #[error("WriteBatch has wrong count")]
    WrongCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarIntError {
    #[error("Insufficient bytes")]
    InsufficientBytes,

    #[error("Overflow")]
    Overflow,
}
