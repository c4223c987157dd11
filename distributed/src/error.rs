use std::{error::Error, fmt, io};

/// The distributed module's result type.
pub type Result<T> = std::result::Result<T, CommError>;

/// Collective-communication failures. All of these are run-fatal: continuing
/// with divergent worker state risks silent corruption.
#[derive(Debug)]
pub enum CommError {
    /// A serialized all_gather payload exceeded the reserved buffer size.
    PayloadTooLarge { len: usize, capacity: usize },
    /// Ranks disagreed on the shape of a reduced buffer.
    ShapeMismatch { got: usize, expected: usize },
    /// A peer left the group (crashed or errored out) while others were
    /// blocked in a collective.
    Abandoned,
    /// The master rank did not provide a value for a broadcast.
    MissingBroadcastRoot,
    /// Payload (de)serialization failed.
    Codec(serde_json::Error),
    /// Spawning a worker thread failed.
    Spawn(io::Error),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::PayloadTooLarge { len, capacity } => write!(
                f,
                "all_gather payload of {len} bytes exceeds the {capacity}-byte buffer"
            ),
            CommError::ShapeMismatch { got, expected } => write!(
                f,
                "reduction buffer length mismatch: got {got}, expected {expected}"
            ),
            CommError::Abandoned => {
                write!(f, "a peer worker left the group during a collective")
            }
            CommError::MissingBroadcastRoot => {
                write!(f, "broadcast called without a value on the master rank")
            }
            CommError::Codec(e) => write!(f, "payload codec error: {e}"),
            CommError::Spawn(e) => write!(f, "failed to spawn worker thread: {e}"),
        }
    }
}

impl Error for CommError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommError::Codec(e) => Some(e),
            CommError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CommError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}
