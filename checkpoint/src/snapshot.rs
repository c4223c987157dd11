use std::collections::HashMap;
use std::path::Path;

use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, TensorView};

use crate::error::{CheckpointError, Result};

const MODEL_TENSOR: &str = "model";
const EXP_AVG_TENSOR: &str = "optimizer.exp_avg";
const EXP_AVG_SQ_TENSOR: &str = "optimizer.exp_avg_sq";

/// Adam moment buffers and bias-correction powers, persisted alongside the
/// model so a resumed run continues the same optimizer trajectory.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptimizerState {
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
    pub beta1_power: f32,
    pub beta2_power: f32,
}

/// One persisted run snapshot.
///
/// Self-sufficient for bit-reproducible resumption at the same seed and
/// world size: data-order randomness is derived from `(seed, epoch)`, so no
/// separate RNG blob is needed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub epoch: u64,
    pub num_updates: u64,
    pub best_score: Option<f64>,
    pub seed: u64,
    pub model_params: Vec<f32>,
    pub optimizer: Option<OptimizerState>,
}

impl Snapshot {
    /// A copy without the optimizer tensors, for `no_save_optimizer_state`.
    pub fn without_optimizer(&self) -> Self {
        Self {
            optimizer: None,
            ..self.clone()
        }
    }
}

pub(crate) fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let mut meta = HashMap::new();
    meta.insert("epoch".to_string(), snapshot.epoch.to_string());
    meta.insert("num_updates".to_string(), snapshot.num_updates.to_string());
    meta.insert("seed".to_string(), snapshot.seed.to_string());
    if let Some(best) = snapshot.best_score {
        meta.insert("best_score".to_string(), best.to_string());
    }

    let mut tensors = vec![(MODEL_TENSOR, view(&snapshot.model_params))];
    if let Some(opt) = &snapshot.optimizer {
        meta.insert("beta1_power".to_string(), opt.beta1_power.to_string());
        meta.insert("beta2_power".to_string(), opt.beta2_power.to_string());
        tensors.push((EXP_AVG_TENSOR, view(&opt.exp_avg)));
        tensors.push((EXP_AVG_SQ_TENSOR, view(&opt.exp_avg_sq)));
    }

    safetensors::serialize(tensors, &Some(meta)).map_err(|e| CheckpointError::Corrupt {
        path: Path::new("<encode>").to_path_buf(),
        detail: e.to_string(),
    })
}

pub(crate) fn decode(buf: &[u8], path: &Path) -> Result<Snapshot> {
    let corrupt = |detail: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        detail,
    };

    let (_, header) = SafeTensors::read_metadata(buf).map_err(|e| corrupt(e.to_string()))?;
    let meta = header
        .metadata()
        .as_ref()
        .ok_or_else(|| corrupt("missing run metadata".to_string()))?;

    let tensors = SafeTensors::deserialize(buf).map_err(|e| corrupt(e.to_string()))?;
    let model_params = floats(&tensors, MODEL_TENSOR, path)?;

    let optimizer = if tensors.tensor(EXP_AVG_TENSOR).is_ok() {
        Some(OptimizerState {
            exp_avg: floats(&tensors, EXP_AVG_TENSOR, path)?,
            exp_avg_sq: floats(&tensors, EXP_AVG_SQ_TENSOR, path)?,
            beta1_power: field(meta, "beta1_power", path)?,
            beta2_power: field(meta, "beta2_power", path)?,
        })
    } else {
        None
    };

    Ok(Snapshot {
        epoch: field(meta, "epoch", path)?,
        num_updates: field(meta, "num_updates", path)?,
        seed: field(meta, "seed", path)?,
        best_score: match meta.get("best_score") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                corrupt(format!("unparseable best_score {raw:?}"))
            })?),
            None => None,
        },
        model_params,
        optimizer,
    })
}

fn view(data: &[f32]) -> TensorView<'_> {
    // F32 data of matching length always forms a valid 1-D view.
    TensorView::new(Dtype::F32, vec![data.len()], bytemuck::cast_slice(data))
        .expect("1-D f32 view")
}

fn floats(tensors: &SafeTensors<'_>, name: &str, path: &Path) -> Result<Vec<f32>> {
    let tensor = tensors.tensor(name).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("tensor {name}: {e}"),
    })?;
    if tensor.dtype() != Dtype::F32 {
        return Err(CheckpointError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("tensor {name} has dtype {:?}, expected F32", tensor.dtype()),
        });
    }
    // The on-disk byte offset is not alignment-guaranteed; collect by copy.
    Ok(bytemuck::pod_collect_to_vec(tensor.data()))
}

fn field<T: std::str::FromStr>(
    meta: &HashMap<String, String>,
    key: &str,
    path: &Path,
) -> Result<T> {
    meta.get(key)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("missing or unparseable metadata field {key:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot {
            epoch: 7,
            num_updates: 350,
            best_score: Some(0.84),
            seed: 42,
            model_params: vec![0.1, -0.2, 0.3],
            optimizer: Some(OptimizerState {
                exp_avg: vec![0.01, 0.02, 0.03],
                exp_avg_sq: vec![0.001, 0.002, 0.003],
                beta1_power: 0.9,
                beta2_power: 0.999,
            }),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let snapshot = sample();
        let bytes = encode(&snapshot).unwrap();
        let decoded = decode(&bytes, Path::new("test")).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn round_trip_without_optimizer_or_best() {
        let snapshot = Snapshot {
            best_score: None,
            ..sample().without_optimizer()
        };
        let bytes = encode(&snapshot).unwrap();
        let decoded = decode(&bytes, Path::new("test")).unwrap();
        assert_eq!(decoded.best_score, None);
        assert_eq!(decoded.optimizer, None);
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn garbage_bytes_decode_as_corrupt() {
        let err = decode(b"not a checkpoint", Path::new("bad")).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }
}
