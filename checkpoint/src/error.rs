use std::{error::Error, fmt, io, path::PathBuf};

use distributed::CommError;

/// The checkpoint module's result type.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Checkpoint persistence failures.
///
/// A silently-missing checkpoint is a correctness risk for resumability, so
/// I/O problems during save are surfaced, and a missing/corrupt file on an
/// explicitly requested load is fatal rather than downgraded to a fresh run.
#[derive(Debug)]
pub enum CheckpointError {
    /// The checkpoint directory cannot be written by the master.
    Unwritable { dir: PathBuf, source: io::Error },
    /// A requested checkpoint file does not exist.
    Missing(PathBuf),
    /// The file exists but does not decode as a run snapshot.
    Corrupt { path: PathBuf, detail: String },
    /// Reading or writing a checkpoint failed.
    Io { path: PathBuf, source: io::Error },
    /// Distributing the loaded snapshot across ranks failed.
    Comm(CommError),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Unwritable { dir, source } => {
                write!(f, "checkpoint directory {} is not writable: {source}", dir.display())
            }
            CheckpointError::Missing(path) => {
                write!(f, "checkpoint {} does not exist", path.display())
            }
            CheckpointError::Corrupt { path, detail } => {
                write!(f, "checkpoint {} is corrupt: {detail}", path.display())
            }
            CheckpointError::Io { path, source } => {
                write!(f, "checkpoint io error at {}: {source}", path.display())
            }
            CheckpointError::Comm(e) => write!(f, "checkpoint distribution error: {e}"),
        }
    }
}

impl Error for CheckpointError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointError::Unwritable { source, .. } => Some(source),
            CheckpointError::Io { source, .. } => Some(source),
            CheckpointError::Comm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommError> for CheckpointError {
    fn from(value: CommError) -> Self {
        Self::Comm(value)
    }
}
