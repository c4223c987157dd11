use crate::loader::Batch;

/// Loss output for one batch.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Mean loss over the active (non-masked) task labels, in nats.
    pub loss: f64,
    pub batch_size: usize,
    /// `(score, label)` pairs for every active task label, consumed by
    /// ranking metrics during validation.
    pub pairs: Vec<(f32, f32)>,
}

/// Maps model logits to a loss and its gradient.
pub trait Criterion: Send {
    fn name(&self) -> &'static str;

    /// Computes the batch loss and writes `d(loss)/d(logits)` into
    /// `dlogits` (resized to match `logits`).
    fn compute(&self, logits: &[f32], batch: &Batch, dlogits: &mut Vec<f32>) -> LossOutput;
}

/// Multi-task binary cross-entropy with logits.
///
/// Each target column is an independent binary task; labels below zero mark
/// the task inactive for that sample and contribute neither loss nor
/// gradient. Mirrors the multi-task prediction objective this engine was
/// built around.
#[derive(Debug, Clone, Default)]
pub struct MultiTaskBce;

impl Criterion for MultiTaskBce {
    fn name(&self) -> &'static str {
        "multitask_bce"
    }

    fn compute(&self, logits: &[f32], batch: &Batch, dlogits: &mut Vec<f32>) -> LossOutput {
        dlogits.clear();
        dlogits.resize(logits.len(), 0.0);

        let active = batch.ys.iter().filter(|&&y| y >= 0.0).count().max(1);
        let scale = 1.0 / active as f32;

        let mut loss = 0.0_f64;
        let mut pairs = Vec::with_capacity(active);

        for ((&z, &y), d) in logits.iter().zip(&batch.ys).zip(dlogits.iter_mut()) {
            if y < 0.0 {
                continue;
            }
            // Numerically stable BCE-with-logits:
            // max(z, 0) - z*y + ln(1 + e^-|z|)
            let bce = z.max(0.0) - z * y + (-z.abs()).exp().ln_1p();
            loss += f64::from(bce);

            let p = sigmoid(z);
            *d = (p - y) * scale;
            pairs.push((p, y));
        }

        LossOutput {
            loss: loss / active as f64,
            batch_size: batch.len,
            pairs,
        }
    }
}

#[inline]
fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// Area under the ROC curve over `(score, label)` pairs, tie-aware
/// (Mann-Whitney rank statistic).
///
/// Returns `None` when only one class is present, where the metric is
/// undefined.
pub fn auroc(pairs: &[(f32, f32)]) -> Option<f64> {
    let positives = pairs.iter().filter(|(_, y)| *y > 0.5).count();
    let negatives = pairs.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut sorted: Vec<&(f32, f32)> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Average ranks across tied scores, then sum ranks of the positives.
    let mut rank_sum = 0.0_f64;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &&(_, y) in &sorted[i..=j] {
            if y > 0.5 {
                rank_sum += avg_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}
