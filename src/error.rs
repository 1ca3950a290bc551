use libipld::Cid;
use libp2p::identity::PeerId;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by every component. Transport retries are the
/// caller's responsibility; none of these are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("{0} is already pinned")]
    AlreadyPinned(Cid),
    #[error("{0} is not pinned")]
    NotPinned(Cid),
    #[error("block {0} not found")]
    ContentNotFound(Cid),
    #[error("fingerprint mismatch: expected {expected}, computed {computed}")]
    FingerprintMismatch { expected: Cid, computed: Cid },
    #[error("payload is empty")]
    PayloadEmpty,
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("unknown peer {0}")]
    PeerUnknown(PeerId),
    #[error("failed to open stream: {0}")]
    StreamOpenFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("component closed")]
    Closed,
    #[error("archive corrupted: {0}")]
    Corrupted(String),
    #[error("archive has no metadata document")]
    MetadataMissing,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("unsupported codec 0x{0:x}")]
    UnsupportedCodec(u64),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Backend(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::backend(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::backend(err)
    }
}
