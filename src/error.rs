use thiserror::Error;

/// Error taxonomy for the PSX connector (spec.md §7).
///
/// Frame and Protocol variants are recoverable: the dispatcher logs them and
/// keeps the session alive. Sequence and Transport variants drive session
/// recovery. InvalidConfig is the only variant that aborts startup.
#[derive(Debug, Error)]
pub enum PsxFixError {
    /// Malformed frame: bad checksum, body-length mismatch, unparseable field.
    #[error("frame error: {0}")]
    Frame(String),

    /// Unexpected MsgType, missing required tag, or similar protocol anomaly.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Surfaced via Logout/Reject carrying a sequence-error indication.
    #[error("sequence error: {0}")]
    Sequence(String),

    /// Connect timeout, reset, broken pipe, or any I/O failure on the socket.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid configuration detected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A command or event channel into the dispatcher closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, PsxFixError>;
