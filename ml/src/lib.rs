//! Collaborator contracts the orchestration engine trains against: dataset
//! loading and sharding, models over flat parameter vectors, the multi-task
//! criterion, the Adam optimizer, and the fixed learning-rate schedule.
//!
//! Everything here is deliberately behind narrow interfaces — the engine
//! only ever sees flat `f32` buffers, batches, and loss outputs.

mod criterion;
mod dataset;
mod error;
mod loader;
mod model;
mod optim;
mod registry;
mod schedule;

pub use criterion::{Criterion, LossOutput, MultiTaskBce, auroc};
pub use dataset::{Dataset, shard_range, shuffle};
pub use error::{MlError, Result};
pub use loader::{Batch, DataLoader};
pub use model::{LinearModel, MlpModel, Model};
pub use optim::{Adam, AdamConfig, clip_grad_norm};
pub use registry::{ModelSpec, Registry};
pub use schedule::FixedSchedule;
