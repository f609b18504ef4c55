//! Path sampling fanned out over several devices.
//!
//! Every call to [`ModelReplicator::loss`] spawns one worker thread per device. A worker
//! rebuilds the model on its device from a weight snapshot, then repeatedly draws a path
//! it has not drawn yet, fine-tunes the batch-norm statistics of that path and scores it.
use crate::alphas::Alphas;
use crate::config::ModelConfig;
use crate::flops_loss::{FlopsLoss, LossDict};
use crate::model::BaseNet;
use crate::path::PathsHistory;
use crate::state::StateDict;
use crate::{ErrorKind, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use trackable::error::ErrorKindExt;

/// A device the search runs on.
#[derive(Debug, Clone)]
pub struct DeviceSlot<B: Backend> {
    pub id: usize,
    pub device: B::Device,
}
impl<B: Backend> DeviceSlot<B> {
    pub fn new(id: usize, device: B::Device) -> Self {
        Self { id, device }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSettings {
    /// Train-mode forwards run on a sampled path before it is evaluated.
    pub bn_steps: usize,
    pub max_resample_attempts: usize,
}

/// A scored path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSample {
    pub loss: LossDict,
    pub path: Vec<usize>,
    pub ratios: Vec<f64>,
}

/// Samples produced by the worker of a device.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub device: usize,
    pub samples: Vec<PathSample>,
}

/// Everything a worker needs; owned by the worker thread.
#[derive(Debug)]
pub struct ReplicaTask<B: Backend> {
    pub slot: DeviceSlot<B>,
    pub model_config: ModelConfig,
    pub state: StateDict<B>,
    pub alphas: Alphas,
    pub input: Tensor<B, 4>,
    pub target: Tensor<B, 1, Int>,
    pub bn_batches: Vec<Tensor<B, 4>>,
    pub n_samples: usize,
    pub flops_loss: Arc<FlopsLoss>,
    pub settings: ReplicaSettings,
    pub seed: u64,
}

/// A private model copy living on a single device.
#[derive(Debug)]
pub struct Replica<B: Backend> {
    model: BaseNet<B>,
    original: StateDict<B>,
    input: Tensor<B, 4>,
    target: Tensor<B, 1, Int>,
    bn_batches: Vec<Tensor<B, 4>>,
    flops_loss: Arc<FlopsLoss>,
    settings: ReplicaSettings,
}
impl<B: Backend> Replica<B> {
    /// Builds the model of `task` on its device.
    pub fn new(task: ReplicaTask<B>) -> Result<Self> {
        let mut model = track!(BaseNet::new(task.model_config, &task.slot.device))?;
        track!(model.load_state_dict(&task.state))?;
        track!(model.update_alphas(&task.alphas))?;
        Ok(Self {
            model,
            original: task.state,
            input: task.input,
            target: task.target,
            bn_batches: task.bn_batches,
            flops_loss: task.flops_loss,
            settings: task.settings,
        })
    }

    pub fn model(&self) -> &BaseNet<B> {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut BaseNet<B> {
        &mut self.model
    }

    pub fn settings(&self) -> ReplicaSettings {
        self.settings
    }

    /// Undoes the batch-norm fine-tuning of previous paths.
    pub fn restore_original_weights(&mut self) -> Result<()> {
        track!(self.model.load_state_dict(&self.original))
    }

    /// Fine-tunes the batch-norm statistics of `path` with train-mode forwards.
    pub fn train(&mut self, path: &[usize]) -> Result<()> {
        self.model.train();
        track!(self.model.set_curr_width_idx(path))?;
        for step in 0..self.settings.bn_steps {
            let batch = if self.bn_batches.is_empty() {
                self.input.clone()
            } else {
                self.bn_batches[step % self.bn_batches.len()].clone()
            };
            let _ = self.model.forward(batch);
        }
        Ok(())
    }

    /// Scores the current path on the evaluation batch.
    pub fn evaluate(&mut self) -> LossDict {
        self.model.eval();
        let logits = self.model.forward(self.input.clone());
        let flops = self.model.count_flops();
        self.flops_loss.forward(logits, self.target.clone(), flops)
    }
}

/// How a worker iterates and how worker results are merged.
pub trait SamplingPolicy<B: Backend>: Send + Sync + 'static {
    fn iterate_over_samples(
        &self,
        replica: &mut Replica<B>,
        history: &mut PathsHistory,
        rng: &mut StdRng,
        samples: &mut Vec<PathSample>,
    ) -> Result<()>;

    fn process_results(&self, reports: Vec<WorkerReport>) -> Result<Vec<PathSample>>;
}

/// One scored path per iteration; results of every device concatenated in device order.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultinomialPolicy;
impl<B: Backend> SamplingPolicy<B> for MultinomialPolicy {
    fn iterate_over_samples(
        &self,
        replica: &mut Replica<B>,
        history: &mut PathsHistory,
        rng: &mut StdRng,
        samples: &mut Vec<PathSample>,
    ) -> Result<()> {
        let sample = track!(evaluate_sample(replica, history, rng))?;
        samples.push(sample);
        Ok(())
    }

    fn process_results(&self, reports: Vec<WorkerReport>) -> Result<Vec<PathSample>> {
        Ok(reports.into_iter().flat_map(|r| r.samples).collect())
    }
}

/// Restores the replica and draws paths until one is not in `history`.
pub fn generate_new_path<B: Backend>(
    replica: &mut Replica<B>,
    history: &mut PathsHistory,
    rng: &mut StdRng,
) -> Result<Vec<usize>> {
    track!(replica.restore_original_weights())?;

    let n_combinations = replica.model().n_combinations();
    track_assert!(
        (history.len() as u128) < n_combinations,
        ErrorKind::Exhausted,
        "all {} paths have been drawn",
        n_combinations
    );
    let max_attempts = replica.settings().max_resample_attempts;
    for _ in 0..max_attempts {
        let path = track!(replica.model_mut().choose_path_by_alphas(rng))?;
        if !history.check_and_insert(&path) {
            return Ok(path);
        }
    }
    track_panic!(
        ErrorKind::Exhausted,
        "no unseen path after {} draws",
        max_attempts
    );
}

/// Draws an unseen path, fine-tunes it and scores it.
pub fn evaluate_sample<B: Backend>(
    replica: &mut Replica<B>,
    history: &mut PathsHistory,
    rng: &mut StdRng,
) -> Result<PathSample> {
    let path = track!(generate_new_path(replica, history, rng))?;
    let ratios = track!(replica.model().path_ratios(&path))?;
    track!(replica.train(&path))?;
    let loss = replica.evaluate();
    debug!("Sampled path: ratios={:?}, loss={:?}", ratios, loss);
    Ok(PathSample { loss, path, ratios })
}

/// Body of a worker thread.
pub fn loss_per_replication<B, P>(task: ReplicaTask<B>, policy: &P) -> Result<WorkerReport>
where
    B: Backend,
    P: SamplingPolicy<B>,
{
    let device = task.slot.id;
    let n_samples = task.n_samples;
    let mut rng = StdRng::seed_from_u64(task.seed);
    let mut replica = track!(Replica::new(task))?;
    let mut history = PathsHistory::new();
    let mut samples = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        debug!("Sample {}/{} on device {}", i + 1, n_samples, device);
        track!(policy.iterate_over_samples(&mut replica, &mut history, &mut rng, &mut samples))?;
    }
    Ok(WorkerReport { device, samples })
}

/// Distributes path sampling over devices.
#[derive(Debug)]
pub struct ModelReplicator<B: Backend, P> {
    slots: Vec<DeviceSlot<B>>,
    states: Vec<StateDict<B>>,
    model_config: ModelConfig,
    flops_loss: Arc<FlopsLoss>,
    settings: ReplicaSettings,
    policy: Arc<P>,
}
impl<B, P> ModelReplicator<B, P>
where
    B: Backend,
    P: SamplingPolicy<B>,
{
    pub fn new(
        model: &BaseNet<B>,
        slots: Vec<DeviceSlot<B>>,
        flops_loss: Arc<FlopsLoss>,
        settings: ReplicaSettings,
        policy: P,
    ) -> Result<Self> {
        track_assert!(!slots.is_empty(), ErrorKind::InvalidInput, "no devices");
        for (i, slot) in slots.iter().enumerate() {
            track_assert!(
                slots[..i].iter().all(|s| s.id != slot.id),
                ErrorKind::InvalidInput,
                "duplicated device id {}",
                slot.id
            );
        }
        info!("Replications: {}", slots.len());

        let mut this = Self {
            slots,
            states: Vec::new(),
            model_config: model.replica_config(),
            flops_loss,
            settings,
            policy: Arc::new(policy),
        };
        this.init_new_epoch(model);
        Ok(this)
    }

    pub fn slots(&self) -> &[DeviceSlot<B>] {
        &self.slots
    }

    /// Takes a new snapshot of the source model weights on every device.
    pub fn init_new_epoch(&mut self, model: &BaseNet<B>) {
        let state = model.state_dict();
        self.states = self
            .slots
            .iter()
            .map(|slot| state.to_device(&slot.device))
            .collect();
        self.model_config = model.replica_config();
    }

    /// Number of samples per device id: `n / k` each, the remainder to the first devices.
    pub fn split_samples(&self, n_samples: usize) -> BTreeMap<usize, usize> {
        let k = self.slots.len();
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let extra = usize::from(i < n_samples % k);
                (slot.id, n_samples / k + extra)
            })
            .collect()
    }

    /// Samples `n_samples` distinct-per-device paths of `model` and scores them.
    pub fn loss<R: Rng + ?Sized>(
        &self,
        model: &BaseNet<B>,
        input: &Tensor<B, 4>,
        target: &Tensor<B, 1, Int>,
        bn_batches: &[Tensor<B, 4>],
        n_samples: usize,
        rng: &mut R,
    ) -> Result<Vec<PathSample>> {
        let per_device = self.split_samples(n_samples);

        let mut handles = Vec::with_capacity(self.slots.len());
        for (slot, state) in self.slots.iter().zip(self.states.iter()) {
            let n = per_device.get(&slot.id).copied().unwrap_or(0);
            if n == 0 {
                continue;
            }
            let device = &slot.device;
            let task = ReplicaTask {
                slot: slot.clone(),
                model_config: self.model_config.clone(),
                state: state.clone(),
                alphas: model.alphas().clone(),
                input: input.clone().to_device(device),
                target: target.clone().to_device(device),
                bn_batches: bn_batches
                    .iter()
                    .map(|b| b.clone().to_device(device))
                    .collect(),
                n_samples: n,
                flops_loss: Arc::clone(&self.flops_loss),
                settings: self.settings,
                seed: rng.gen(),
            };
            let policy = Arc::clone(&self.policy);
            let handle = thread::Builder::new()
                .name(format!("replica-{}", slot.id))
                .spawn(move || loss_per_replication(task, policy.as_ref()))
                .map_err(|e| ErrorKind::Worker.cause(e))?;
            handles.push((slot.id, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut failure = None;
        for (id, handle) in handles {
            match handle.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    let e = ErrorKind::Worker.cause(format!("worker of device {} panicked", id));
                    failure.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = failure {
            return Err(track!(e));
        }
        track!(self.policy.process_results(reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dataset;
    use crate::flops_loss::Calibration;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};
    use trackable::result::TopLevelResult;

    type TestBackend = NdArray;

    fn model(widths: Vec<f64>) -> Result<BaseNet<TestBackend>> {
        let config = ModelConfig::new("resnet18".to_owned(), Dataset::Cifar10, widths)
            .with_input_size(Some(8));
        BaseNet::new(config, &Default::default())
    }

    fn flops_loss() -> Result<Arc<FlopsLoss>> {
        let calibration = track!(Calibration::from_points(&[
            ("0.25".to_owned(), 1.0, 2.5),
            ("1".to_owned(), 1e9, 0.5),
        ]))?;
        Ok(Arc::new(track!(FlopsLoss::new(&calibration))?))
    }

    fn replicator(
        model: &BaseNet<TestBackend>,
        ids: &[usize],
    ) -> Result<ModelReplicator<TestBackend, MultinomialPolicy>> {
        let slots = ids
            .iter()
            .map(|&id| DeviceSlot::new(id, Default::default()))
            .collect();
        let settings = ReplicaSettings {
            bn_steps: 1,
            max_resample_attempts: 100,
        };
        ModelReplicator::new(model, slots, track!(flops_loss())?, settings, MultinomialPolicy)
    }

    fn batch() -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 1, Int>) {
        let device = Default::default();
        let input = Tensor::random([4, 3, 8, 8], Distribution::Default, &device);
        let target = Tensor::from_data(TensorData::new(vec![0i64, 1, 2, 3], [4]), &device);
        (input, target)
    }

    #[test]
    fn split_samples_works() -> TopLevelResult {
        let model = track!(model(vec![0.5, 1.0]))?;
        let replicator = track!(replicator(&model, &[0, 1, 2]))?;
        let split = replicator.split_samples(10);
        assert_eq!(split.into_iter().collect::<Vec<_>>(), [(0, 4), (1, 3), (2, 3)]);

        for n in 0..20 {
            let split = replicator.split_samples(n);
            assert_eq!(split.values().sum::<usize>(), n);
            let max = split.values().max().copied().unwrap_or(0);
            let min = split.values().min().copied().unwrap_or(0);
            assert!(max - min <= 1);
        }

        assert!(self::replicator(&model, &[]).is_err());
        assert!(self::replicator(&model, &[1, 1]).is_err());
        Ok(())
    }

    #[test]
    fn loss_works() -> TopLevelResult {
        let model = track!(model(vec![0.5, 1.0]))?;
        let replicator = track!(replicator(&model, &[0, 1]))?;
        let (input, target) = batch();
        let mut rng = StdRng::seed_from_u64(1);

        let samples = track!(replicator.loss(&model, &input, &target, &[], 5, &mut rng))?;
        assert_eq!(samples.len(), 5);
        for sample in &samples {
            assert_eq!(sample.path.len(), 19);
            assert!(sample.ratios.iter().all(|&r| r == 0.5 || r == 1.0));
            assert!(sample.loss.total.is_finite());
            assert!(sample.loss.flops > 0.0);
        }
        Ok(())
    }

    #[test]
    fn worker_paths_are_unique() -> TopLevelResult {
        let model = track!(model(vec![0.5, 1.0]))?;
        let (input, target) = batch();
        let task = ReplicaTask {
            slot: DeviceSlot::new(0, Default::default()),
            model_config: model.replica_config(),
            state: model.state_dict(),
            alphas: model.alphas().clone(),
            input,
            target,
            bn_batches: Vec::new(),
            n_samples: 6,
            flops_loss: track!(flops_loss())?,
            settings: ReplicaSettings {
                bn_steps: 0,
                max_resample_attempts: 100,
            },
            seed: 3,
        };
        let report = track!(loss_per_replication(task, &MultinomialPolicy))?;
        assert_eq!(report.samples.len(), 6);
        let mut history = PathsHistory::new();
        for sample in &report.samples {
            assert!(!history.check_and_insert(&sample.path));
        }
        Ok(())
    }

    #[test]
    fn exhausted_paths_fail_the_call() -> TopLevelResult {
        let model = track!(model(vec![1.0]))?;
        assert_eq!(model.n_combinations(), 1);
        let replicator = track!(replicator(&model, &[0]))?;
        let (input, target) = batch();
        let mut rng = StdRng::seed_from_u64(1);

        let samples = track!(replicator.loss(&model, &input, &target, &[], 1, &mut rng))?;
        assert_eq!(samples.len(), 1);

        let e = replicator
            .loss(&model, &input, &target, &[], 2, &mut rng)
            .err()
            .expect("exhausted");
        assert_eq!(*e.kind(), ErrorKind::Exhausted);
        Ok(())
    }
}
