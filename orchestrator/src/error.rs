use std::{error::Error, fmt, io};

use checkpoint::CheckpointError;
use distributed::CommError;
use ml::MlError;

/// The orchestrator's result type.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Run-fatal failures, one variant per failure category.
///
/// Recoverable numeric failures never appear here — they are absorbed inside
/// the trainer as skipped steps.
#[derive(Debug)]
pub enum TrainError {
    /// Coordination failure: barrier/gather/reduce broke down.
    Comm(CommError),
    /// Resource failure: checkpoint directory or snapshot problems.
    Checkpoint(CheckpointError),
    /// Collaborator failure: dataset, registry, or optimizer contract.
    Ml(MlError),
    /// Other I/O, e.g. a sink that could not be created.
    Io(io::Error),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Comm(e) => write!(f, "coordination failure: {e}"),
            TrainError::Checkpoint(e) => write!(f, "checkpoint failure: {e}"),
            TrainError::Ml(e) => write!(f, "collaborator failure: {e}"),
            TrainError::Io(e) => write!(f, "io failure: {e}"),
        }
    }
}

impl Error for TrainError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainError::Comm(e) => Some(e),
            TrainError::Checkpoint(e) => Some(e),
            TrainError::Ml(e) => Some(e),
            TrainError::Io(e) => Some(e),
        }
    }
}

impl From<CommError> for TrainError {
    fn from(value: CommError) -> Self {
        Self::Comm(value)
    }
}

impl From<CheckpointError> for TrainError {
    fn from(value: CheckpointError) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<MlError> for TrainError {
    fn from(value: MlError) -> Self {
        Self::Ml(value)
    }
}

impl From<io::Error> for TrainError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
