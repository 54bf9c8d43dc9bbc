use thiserror::Error;

/// Every failure mode surfaced by the crate.
///
/// Structural errors (checksum mismatch, corrupt node, invalid signature)
/// propagate immediately from the operation that detected them. Unlock
/// failures are distinguished from key-bag corruption so callers can retry
/// with different credentials.
#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("corrupt node: {0}")]
    CorruptNode(String),

    #[error("corrupt extent: {0}")]
    CorruptExtent(String),

    #[error("corrupt compressed header: {0}")]
    CorruptCompressedHeader(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("no volume found in container")]
    NoVolume,

    #[error("unsupported version / feature flags: {0}")]
    UnsupportedVersion(String),

    #[error("unsupported compression method: {0}")]
    UnsupportedCompressionMethod(u32),

    #[error("unsupported encryption method: {0}")]
    EncryptionMethodUnsupported(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("volume is locked; call unlock() first")]
    Locked,

    #[error("unlock failed: no key-bag slot matched the supplied credentials")]
    UnlockFailed,

    #[error("virtual object {oid} has no mapping at or below xid {xid_max}")]
    VirtualObjectMissing { oid: u64, xid_max: u64 },

    #[error("sub-node resolution failed for oid {0}")]
    SubNodeResolutionFailed(u64),

    #[error("B-tree descent exceeded the maximum depth")]
    DescentDepthExceeded,

    #[error("out of bounds: {0}")]
    OutOfBounds(String),
}

pub type Result<T> = std::result::Result<T, ApfsError>;
