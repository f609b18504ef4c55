//! Alphas search loop.
use crate::alphas::Alphas;
use crate::config::SearchConfig;
use crate::flops_loss::{Calibration, FlopsLoss, LossKey};
use crate::model::BaseNet;
use crate::replicator::{
    DeviceSlot, ModelReplicator, MultinomialPolicy, PathSample, ReplicaSettings, SamplingPolicy,
};
use crate::{ErrorKind, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;

const ALPHAS_CSV: &str = "alphas.csv";
const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Statistics of a single alphas update.
#[derive(Debug, Clone, PartialEq)]
pub struct AlphasStepStats {
    pub loss_avg: BTreeMap<LossKey, f64>,
    /// Sample variance of the total loss (0 for a single sample).
    pub loss_variance: f64,
    /// Entropy of every alphas slot after the update.
    pub entropy: Vec<f64>,
}

/// Per-epoch search summary.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: Vec<AlphasStepStats>,
    /// Width ratios of the deterministic path of the alphas.
    pub partition: Vec<f64>,
    pub partition_flops_ratio: f64,
}

/// Sets the score-function gradient of `alphas` from the scored samples.
///
/// `grad = E[counts(path) * total] - E[total] * E[counts]`.
pub fn update_alphas_gradients(
    alphas: &mut Alphas,
    samples: &[PathSample],
    n_samples: usize,
) -> Result<AlphasStepStats> {
    track_assert_eq!(samples.len(), n_samples, ErrorKind::InvalidInput);
    track_assert!(n_samples > 0, ErrorKind::InvalidInput);
    let n = n_samples as f64;

    let mut loss_avg = LossKey::ALL
        .iter()
        .map(|&k| (k, 0.0))
        .collect::<BTreeMap<_, _>>();
    let mut v2 = alphas
        .values()
        .iter()
        .map(|v| vec![0.0; v.len()])
        .collect::<Vec<_>>();
    for sample in samples {
        for (key, sum) in loss_avg.iter_mut() {
            *sum += sample.loss.get(*key);
        }
        let counts = track!(alphas.selection_counts(&sample.path))?;
        for (acc, slot) in v2.iter_mut().zip(counts) {
            for (a, c) in acc.iter_mut().zip(slot) {
                *a += c * sample.loss.total;
            }
        }
    }
    loss_avg.values_mut().for_each(|v| *v /= n);
    let total_avg = loss_avg[&LossKey::Total];

    let grad = v2
        .into_iter()
        .zip(alphas.expected_counts())
        .map(|(v2, expected)| {
            v2.into_iter()
                .zip(expected)
                .map(|(v2, e)| v2 / n - total_avg * e)
                .collect()
        })
        .collect();
    track!(alphas.set_grad(grad))?;

    let loss_variance = if n_samples > 1 {
        samples
            .iter()
            .map(|s| (s.loss.total - total_avg).powi(2))
            .sum::<f64>()
            / (n - 1.0)
    } else {
        0.0
    };
    Ok(AlphasStepStats {
        loss_avg,
        loss_variance,
        entropy: alphas.entropy(),
    })
}

/// Owns the searched model and drives the alphas updates.
#[derive(Debug)]
pub struct SearchRegime<B: Backend, P = MultinomialPolicy> {
    config: SearchConfig,
    model: BaseNet<B>,
    flops_loss: Arc<FlopsLoss>,
    replicator: ModelReplicator<B, P>,
    rng: StdRng,
}
impl<B, P> SearchRegime<B, P>
where
    B: Backend,
    P: SamplingPolicy<B>,
{
    /// Builds the model on the first device and a replicator over every device.
    pub fn new(
        config: SearchConfig,
        calibration: &Calibration,
        slots: Vec<DeviceSlot<B>>,
        policy: P,
    ) -> Result<Self> {
        let device = track_assert_some!(
            slots.first().map(|s| s.device.clone()),
            ErrorKind::InvalidInput,
            "no devices"
        );
        let model = track!(BaseNet::new(config.model.clone(), &device))?;
        let flops_loss = Arc::new(track!(FlopsLoss::new(calibration))?);
        let settings = ReplicaSettings {
            bn_steps: config.bn_steps,
            max_resample_attempts: config.max_resample_attempts,
        };
        let replicator = track!(ModelReplicator::new(
            &model,
            slots,
            Arc::clone(&flops_loss),
            settings,
            policy
        ))?;
        let rng = StdRng::seed_from_u64(config.seed);
        info!(
            "Search regime: model={}, layers={}, paths={}, baseline_flops={:?}",
            model.config().registry_key(),
            model.n_layers(),
            model.n_combinations(),
            model.baseline_flops()
        );
        Ok(Self {
            config,
            model,
            flops_loss,
            replicator,
            rng,
        })
    }

    pub fn model(&self) -> &BaseNet<B> {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut BaseNet<B> {
        &mut self.model
    }

    pub fn flops_loss(&self) -> &FlopsLoss {
        &self.flops_loss
    }

    /// Samples paths on every device and takes one gradient step on the alphas.
    pub fn train_alphas_step(
        &mut self,
        input: &Tensor<B, 4>,
        target: &Tensor<B, 1, Int>,
        bn_batches: &[Tensor<B, 4>],
    ) -> Result<AlphasStepStats> {
        let n_samples = self.config.n_samples;
        let samples = track!(self.replicator.loss(
            &self.model,
            input,
            target,
            bn_batches,
            n_samples,
            &mut self.rng
        ))?;
        for sample in &samples {
            track!(self.model.set_curr_width_idx(&sample.path))?;
        }

        let mut stats = track!(update_alphas_gradients(
            self.model.alphas_mut(),
            &samples,
            n_samples
        ))?;
        self.model.alphas_mut().step(self.config.alphas_learning_rate);
        stats.entropy = self.model.alphas().entropy();
        debug!(
            "Alphas step: loss_avg={:?}, loss_variance={}",
            stats.loss_avg, stats.loss_variance
        );
        Ok(stats)
    }

    /// Refreshes the replicas' weight snapshots.
    pub fn init_new_epoch(&mut self) {
        self.replicator.init_new_epoch(&self.model);
    }

    /// Runs `epochs` passes over `batches`, one alphas step per batch.
    ///
    /// With a `save_dir`, the alphas CSV and a checkpoint are written there after every epoch.
    pub fn search(
        &mut self,
        epochs: usize,
        batches: &[(Tensor<B, 4>, Tensor<B, 1, Int>)],
    ) -> Result<Vec<EpochSummary>> {
        track_assert!(!batches.is_empty(), ErrorKind::InvalidInput, "no batches");
        let bn_batches = batches.iter().map(|b| b.0.clone()).collect::<Vec<_>>();

        let mut summaries = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            self.init_new_epoch();
            let mut steps = Vec::with_capacity(batches.len());
            for (i, (input, target)) in batches.iter().enumerate() {
                let stats = track!(self.train_alphas_step(input, target, &bn_batches))?;
                info!(
                    "Epoch {} batch {}/{}: loss={:.5}, variance={:.5}",
                    epoch,
                    i + 1,
                    batches.len(),
                    stats.loss_avg[&LossKey::Total],
                    stats.loss_variance
                );
                steps.push(stats);
            }

            self.model.log_forward_counters();
            self.model.log_top_alphas(self.config.top_k);
            if let Some(dir) = self.config.model.save_dir.clone() {
                track!(self.model.save_alphas_csv(dir.join(ALPHAS_CSV), epoch))?;
                track!(self.model.save(dir.join(CHECKPOINT_FILE)))?;
            }

            let path = track!(self.model.choose_path_alphas_as_partition())?;
            let partition = track!(self.model.path_ratios(&path))?;
            let partition_flops_ratio = self.model.flops_ratio();
            info!(
                "Epoch {}: partition={:?}, flops_ratio={:.3}",
                epoch, partition, partition_flops_ratio
            );
            summaries.push(EpochSummary {
                epoch,
                steps,
                partition,
                partition_flops_ratio,
            });
        }
        Ok(summaries)
    }
}
