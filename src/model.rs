//! Width-switchable network built from an architecture plan.
use crate::alphas::Alphas;
use crate::block::Block;
use crate::config::ModelConfig;
use crate::layer::{LayerId, SlimConv, SlimLinear};
use crate::resnet::{ArchitectureRegistry, Network};
use crate::state::StateDict;
use crate::width::{FlopsTable, ForwardCounters};
use crate::{ErrorKind, Result};
use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use trackable::error::ErrorKindExt;

const ARCHITECTURE_FILE: &str = "model.json";
const ALPHAS_KEY: &str = "alphas";

/// Name of a reference width configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselineKey {
    /// Every optimization layer uses the same width ratio.
    Width(f64),

    /// The configured per-layer partition.
    Partition,
}
impl fmt::Display for BaselineKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BaselineKey::Width(r) => write!(f, "{}", r),
            BaselineKey::Partition => write!(f, "Partition"),
        }
    }
}

/// Forward counters of a single counter layer, most visited width first.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterRow {
    pub layer: usize,
    pub description: String,
    pub counts: Vec<(f64, u64)>,
    pub total: u64,
}

/// A residual network whose convolutions switch between width ratios.
#[derive(Debug)]
pub struct BaseNet<B: Backend> {
    config: ModelConfig,
    layers: Vec<SlimConv<B>>,
    blocks: Vec<Block>,
    fc: SlimLinear<B>,
    optimization: Vec<LayerId>,
    counters: Vec<LayerId>,
    partition_blocks: (usize, Vec<usize>),
    baseline_width: Vec<(BaselineKey, Vec<usize>)>,
    baseline_flops: BTreeMap<String, f64>,
    baseline_value: f64,
    alphas: Alphas,
    random_weights: Option<StateDict<B>>,
    training: bool,
    device: B::Device,
}
impl<B: Backend> BaseNet<B> {
    /// Builds the model with the built-in architectures.
    pub fn new(config: ModelConfig, device: &B::Device) -> Result<Self> {
        track!(Self::with_registry(
            config,
            &ArchitectureRegistry::default(),
            device
        ))
    }

    pub fn with_registry(
        config: ModelConfig,
        registry: &ArchitectureRegistry,
        device: &B::Device,
    ) -> Result<Self> {
        let architecture = track!(registry.get(&config.registry_key()))?;
        let plan = architecture.plan(config.dataset, config.effective_input_size());
        let Network { layers, blocks, fc } = track!(plan.build(&config.widths, device))?;

        let optimization = blocks
            .iter()
            .flat_map(|b| b.optimization_layers())
            .collect::<Vec<_>>();
        let counters = blocks
            .iter()
            .flat_map(|b| b.counter_layers())
            .collect::<Vec<_>>();
        let alphas = track!(Alphas::new(
            config.alphas,
            optimization.len(),
            config.widths.len()
        ))?;

        let mut this = Self {
            partition_blocks: architecture.partition_blocks(),
            config,
            layers,
            blocks,
            fc,
            optimization,
            counters,
            baseline_width: Vec::new(),
            baseline_flops: BTreeMap::new(),
            baseline_value: 0.0,
            alphas,
            random_weights: None,
            training: true,
            device: device.clone(),
        };
        if this.config.save_random_weights {
            this.random_weights = Some(this.state_dict());
        }

        if let Some(tables) = this.config.model_flops.clone() {
            track!(this.set_flops_data(tables))?;
        }
        if let Some(partition) = this.config.partition.clone() {
            track!(this.add_partition(&partition))?;
        }
        this.build_flops_tables();

        track!(this.build_baseline())?;
        this.reset_forward_counters();

        if let Some(dir) = this.config.save_dir.clone() {
            track!(this.print_to_file(dir))?;
        }
        Ok(this)
    }

    fn set_flops_data(&mut self, tables: Vec<FlopsTable>) -> Result<()> {
        track_assert_eq!(
            tables.len(),
            self.counters.len(),
            ErrorKind::InvalidInput,
            "one FLOPs table per counter layer is required"
        );
        for (&id, table) in self.counters.iter().zip(tables) {
            self.layers[id].set_flops_data(table);
        }
        Ok(())
    }

    /// FLOPs tables of the counter layers, in counter-layer order.
    pub fn flops_data(&self) -> Vec<FlopsTable> {
        self.counters
            .iter()
            .map(|&id| self.layers[id].flops_data().clone())
            .collect()
    }

    fn build_flops_tables(&mut self) {
        for &id in &self.counters {
            let input_widths = self.layers[id].input().width_list(&self.layers);
            self.layers[id].build_flops_table(&input_widths);
        }
    }

    /// Appends the partition ratios as an extra width of every optimization layer.
    fn add_partition(&mut self, partition: &[f64]) -> Result<()> {
        track_assert_eq!(
            partition.len(),
            self.optimization.len(),
            ErrorKind::InvalidInput,
            "partition length mismatch"
        );
        for (i, &ratio) in partition.iter().enumerate() {
            track_assert!(
                ratio > 0.0 && ratio <= 1.0,
                ErrorKind::InvalidInput,
                "partition ratio {} of layer {} is out of (0, 1]",
                ratio,
                i
            );
        }
        for (&id, &ratio) in self.optimization.iter().zip(partition) {
            self.layers[id].add_width(ratio, &self.device);
        }

        let n_widths = self.config.widths.len() + 1;
        for block in &self.blocks {
            for id in block.counter_layers() {
                let n = self.layers[id].n_widths();
                if n >= n_widths {
                    continue;
                }
                track_assert_eq!(n_widths - n, 1, ErrorKind::InvalidInput);
                let placeholder = match block.downsample() {
                    Some(d) if d.src() == id => {
                        let conv2 = &self.layers[block.output_layer()];
                        conv2.width_ratio_by_idx(n_widths - 1).unwrap_or(0.0)
                    }
                    _ => 0.0,
                };
                self.layers[id].add_width(placeholder, &self.device);
            }
        }

        let indices = self
            .optimization
            .iter()
            .map(|&id| self.layers[id].n_widths() - 1)
            .collect::<Vec<_>>();
        for ((&id, &idx), &ratio) in self.optimization.iter().zip(&indices).zip(partition) {
            track_assert_eq!(
                self.layers[id].width_ratio_by_idx(idx),
                Some(ratio),
                ErrorKind::InvalidInput
            );
        }
        self.baseline_width.push((BaselineKey::Partition, indices));
        Ok(())
    }

    fn build_baseline(&mut self) -> Result<()> {
        let mut baseline_width = track!(self.build_homogeneous_width_idx(&self.config.widths))?;
        baseline_width.append(&mut self.baseline_width);
        self.baseline_width = baseline_width;

        let known = self.config.baseline_flops.clone().filter(|flops| {
            self.baseline_width
                .iter()
                .all(|(key, _)| flops.contains_key(&key.to_string()))
        });
        self.baseline_flops = match known {
            Some(flops) => flops,
            None => track!(self.calc_baseline_flops())?,
        };

        let baseline = BaselineKey::Width(track!(self.config.baseline_ratio())?);
        self.baseline_value = *track_assert_some!(
            self.baseline_flops.get(&baseline.to_string()),
            ErrorKind::InvalidInput,
            "baseline {} is not a configured width",
            baseline
        );
        track_assert!(self.baseline_value > 0.0, ErrorKind::InvalidInput);
        Ok(())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn layers(&self) -> &[SlimConv<B>] {
        &self.layers
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Layers whose widths are chosen by a path.
    pub fn optimization_layers(&self) -> &[LayerId] {
        &self.optimization
    }

    pub fn counter_layers(&self) -> &[LayerId] {
        &self.counters
    }

    /// Layers that take part in the forward pass under the current widths.
    pub fn flops_layers(&self) -> Vec<LayerId> {
        self.blocks.iter().flat_map(|b| b.flops_layers()).collect()
    }

    pub fn n_layers(&self) -> usize {
        self.optimization.len()
    }

    pub fn partition_blocks(&self) -> &(usize, Vec<usize>) {
        &self.partition_blocks
    }

    pub fn curr_width_idx(&self) -> Vec<usize> {
        self.optimization
            .iter()
            .map(|&id| self.layers[id].curr_width_idx())
            .collect()
    }

    pub fn curr_width_ratio(&self) -> Vec<f64> {
        self.optimization
            .iter()
            .map(|&id| self.layers[id].curr_width_ratio())
            .collect()
    }

    pub fn curr_width(&self) -> Vec<usize> {
        self.optimization
            .iter()
            .map(|&id| self.layers[id].curr_width())
            .collect()
    }

    /// Sets the width index of every optimization layer, then realigns the blocks.
    ///
    /// Nothing is changed if `idx_list` is invalid.
    pub fn set_curr_width_idx(&mut self, idx_list: &[usize]) -> Result<()> {
        track_assert_eq!(
            idx_list.len(),
            self.optimization.len(),
            ErrorKind::InvalidInput
        );
        for (&id, &idx) in self.optimization.iter().zip(idx_list) {
            track_assert!(
                idx < self.layers[id].n_widths(),
                ErrorKind::InvalidInput,
                "width index {} is out of range for layer {}",
                idx,
                id
            );
        }

        for (&id, &idx) in self.optimization.iter().zip(idx_list) {
            track!(self.layers[id].set_curr_width_idx(idx))?;
        }
        for block in &mut self.blocks {
            track!(block.update_curr_width(&mut self.layers))?;
        }
        Ok(())
    }

    /// Width ratio of every optimization layer for `path`.
    pub fn path_ratios(&self, path: &[usize]) -> Result<Vec<f64>> {
        track_assert_eq!(path.len(), self.optimization.len(), ErrorKind::InvalidInput);
        self.optimization
            .iter()
            .zip(path)
            .map(|(&id, &idx)| {
                let ratio = track_assert_some!(
                    self.layers[id].width_ratio_by_idx(idx),
                    ErrorKind::InvalidInput
                );
                Ok(ratio)
            })
            .collect()
    }

    /// One index list per distinct ratio, selecting that ratio in every optimization layer.
    pub fn build_homogeneous_width_idx(
        &self,
        ratios: &[f64],
    ) -> Result<Vec<(BaselineKey, Vec<usize>)>> {
        let mut homogeneous: Vec<(BaselineKey, Vec<usize>)> = Vec::new();
        for &ratio in ratios {
            let key = BaselineKey::Width(ratio);
            if homogeneous.iter().any(|(k, _)| *k == key) {
                continue;
            }
            let indices = self
                .optimization
                .iter()
                .map(|&id| track!(self.layers[id].width_ratio_idx(ratio)))
                .collect::<Result<Vec<_>>>()?;
            homogeneous.push((key, indices));
        }
        Ok(homogeneous)
    }

    pub fn baseline_width(&self) -> &[(BaselineKey, Vec<usize>)] {
        &self.baseline_width
    }

    /// Runs `f` under every baseline width configuration.
    ///
    /// The current widths are restored afterwards. With `restore_org_state` the forward
    /// counters are restored as well.
    pub fn apply_on_baseline<T, F>(
        &mut self,
        mut f: F,
        restore_org_state: bool,
    ) -> Result<Vec<(BaselineKey, T)>>
    where
        F: FnMut(&mut Self) -> T,
    {
        let saved_idx = self.curr_width_idx();
        let saved_counters = if restore_org_state {
            Some(
                self.layers
                    .iter()
                    .map(|l| l.counters().clone())
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };

        let mut results = Vec::with_capacity(self.baseline_width.len());
        for (key, idx_list) in self.baseline_width.clone() {
            track!(self.set_curr_width_idx(&idx_list))?;
            results.push((key, f(self)));
        }

        track!(self.set_curr_width_idx(&saved_idx))?;
        if let Some(counters) = saved_counters {
            self.restore_forward_counters(counters);
        }
        Ok(results)
    }

    fn restore_forward_counters(&mut self, counters: Vec<ForwardCounters>) {
        for (layer, c) in self.layers.iter_mut().zip(counters) {
            layer.set_counters(c);
        }
    }

    /// FLOPs of a forward pass under the current widths.
    pub fn count_flops(&self) -> f64 {
        self.flops_layers()
            .into_iter()
            .map(|id| {
                let layer = &self.layers[id];
                layer.count_flops(layer.input().curr_width(&self.layers))
            })
            .sum()
    }

    pub fn flops_ratio(&self) -> f64 {
        self.count_flops() / self.baseline_value
    }

    /// Counts the FLOPs of every baseline configuration.
    pub fn calc_baseline_flops(&mut self) -> Result<BTreeMap<String, f64>> {
        let flops = track!(self.apply_on_baseline(|m| m.count_flops(), true))?;
        Ok(flops
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect())
    }

    pub fn baseline_flops(&self) -> &BTreeMap<String, f64> {
        &self.baseline_flops
    }

    /// FLOPs of the configured baseline width.
    pub fn baseline_value(&self) -> f64 {
        self.baseline_value
    }

    pub fn baseline_flops_ratio(&self) -> BTreeMap<String, f64> {
        self.baseline_flops
            .iter()
            .map(|(k, v)| (k.clone(), v / self.baseline_value))
            .collect()
    }

    pub fn alphas(&self) -> &Alphas {
        &self.alphas
    }

    pub fn alphas_mut(&mut self) -> &mut Alphas {
        &mut self.alphas
    }

    pub fn update_alphas(&mut self, src: &Alphas) -> Result<()> {
        track!(self.alphas.update(src))
    }

    /// Number of distinct paths the alphas can draw.
    pub fn n_combinations(&self) -> u128 {
        (self.alphas.n_outcomes() as u128).saturating_pow(self.n_layers() as u32)
    }

    /// Draws a path from the alphas and selects it.
    pub fn choose_path_by_alphas<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Vec<usize>> {
        let path = track!(self.alphas.sample_path(rng))?;
        track!(self.set_curr_width_idx(&path))?;
        Ok(path)
    }

    /// Selects the deterministic path of the alphas.
    pub fn choose_path_alphas_as_partition(&mut self) -> Result<Vec<usize>> {
        let path = self.alphas.argmax_path();
        track!(self.set_curr_width_idx(&path))?;
        Ok(path)
    }

    pub fn reset_forward_counters(&mut self) {
        for &id in &self.counters {
            self.layers[id].reset_forward_counters();
        }
    }

    /// Logs the forward counters of every counter layer, then resets them.
    pub fn log_forward_counters(&mut self) -> Vec<CounterRow> {
        let mut rows = Vec::with_capacity(self.counters.len());
        for (i, &id) in self.counters.iter().enumerate() {
            let layer = &self.layers[id];
            let mut counts = layer.forward_counters();
            counts.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.total_cmp(&a.0)));
            let total = counts.iter().map(|c| c.1).sum();
            info!("Forward counters: layer={}, counts={:?}, total={}", i, counts, total);
            rows.push(CounterRow {
                layer: i,
                description: layer.to_string(),
                counts,
                total,
            });
        }
        self.reset_forward_counters();
        rows
    }

    /// Logs the `k` most probable widths of every alphas slot.
    pub fn log_top_alphas(&self, k: usize) -> Vec<Vec<(f64, f64)>> {
        let top = self
            .alphas
            .top_k(k)
            .into_iter()
            .map(|slot| {
                slot.into_iter()
                    .map(|(idx, p)| (self.config.widths[idx], p))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        for (slot, entries) in top.iter().enumerate() {
            info!("Alphas (top {}): slot={}, {:?}", k, slot, entries);
        }
        top
    }

    pub fn save_alphas_csv<P: AsRef<Path>>(&self, path: P, epoch: usize) -> Result<()> {
        track!(self.alphas.save_csv(path, epoch))
    }

    /// Writes the architecture description to `model.json` in `dir`, unless it already exists.
    pub fn print_to_file<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let path = dir.as_ref().join(ARCHITECTURE_FILE);
        if path.exists() {
            return Ok(());
        }
        track_any_err!(fs::create_dir_all(dir.as_ref()); dir.as_ref())?;

        let mut rows = Vec::new();
        for (i, &id) in self.flops_layers().iter().enumerate() {
            let layer = &self.layers[id];
            rows.push(json!({
                "layer": i,
                "filters": layer.shape().out_planes,
                "ratios": layer.widths().ratios(),
                "widths": layer.widths().channels(),
                "flops": layer.flops_data().entries(),
                "architecture": layer.to_string(),
            }));
        }
        rows.push(json!({
            "layer": rows.len(),
            "architecture": "AdaptiveAvgPool2d(output_size=1)",
        }));
        rows.push(json!({
            "layer": rows.len(),
            "architecture": self.fc.to_string(),
        }));

        let description = json!({
            "model": self.config.registry_key(),
            "layers": rows,
            "alphas": self.log_top_alphas(self.config.widths.len()),
            "baseline_flops": self.baseline_flops,
        });
        let file = track_any_err!(File::create(&path); path)?;
        track_any_err!(serde_json::to_writer_pretty(BufWriter::new(file), &description))?;
        Ok(())
    }

    /// The configuration replicas are built from: FLOPs are carried over instead of recounted.
    pub fn replica_config(&self) -> ModelConfig {
        self.config
            .clone()
            .with_model_flops(Some(self.flops_data()))
            .with_baseline_flops(Some(self.baseline_flops.clone()))
            .with_save_random_weights(false)
            .with_save_dir(None)
    }

    pub fn state_dict(&self) -> StateDict<B> {
        let mut state = StateDict::new();
        for (id, layer) in self.layers.iter().enumerate() {
            state.insert(format!("layers.{}.weight", id), layer.weight().clone());
            for (w, bn) in layer.bns().iter().enumerate() {
                for (name, tensor) in bn.params() {
                    state.insert(format!("layers.{}.bn.{}.{}", id, w, name), tensor.clone());
                }
            }
        }
        state.insert("fc.weight".to_owned(), self.fc.weight().clone());
        state.insert("fc.bias".to_owned(), self.fc.bias().clone());
        state
    }

    pub fn load_state_dict(&mut self, state: &StateDict<B>) -> Result<()> {
        let device = self.device.clone();
        for (id, layer) in self.layers.iter_mut().enumerate() {
            let weight = track!(state.get::<4>(&format!("layers.{}.weight", id)))?;
            track_assert_eq!(weight.dims(), layer.weight().dims(), ErrorKind::InvalidInput);
            *layer.weight_mut() = weight.to_device(&device);
            for (w, bn) in layer.bns_mut().iter_mut().enumerate() {
                for (name, tensor) in bn.params_mut() {
                    let key = format!("layers.{}.bn.{}.{}", id, w, name);
                    let value = track!(state.get::<1>(&key))?;
                    track_assert_eq!(value.dims(), tensor.dims(), ErrorKind::InvalidInput, "{}", key);
                    *tensor = value.to_device(&device);
                }
            }
        }

        let weight = track!(state.get::<2>("fc.weight"))?;
        track_assert_eq!(weight.dims(), self.fc.weight().dims(), ErrorKind::InvalidInput);
        *self.fc.weight_mut() = weight.to_device(&device);
        let bias = track!(state.get::<1>("fc.bias"))?;
        track_assert_eq!(bias.dims(), self.fc.bias().dims(), ErrorKind::InvalidInput);
        *self.fc.bias_mut() = bias.to_device(&device);
        Ok(())
    }

    /// Restores the weights captured at construction (`save_random_weights`).
    pub fn load_random_weights(&mut self) -> Result<()> {
        let weights = track_assert_some!(
            self.random_weights.clone(),
            ErrorKind::InvalidInput,
            "random weights were not saved"
        );
        track!(self.load_state_dict(&weights))?;
        info!("Loaded random weights");
        Ok(())
    }

    /// Writes the weights and the alphas to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut state = self.state_dict();
        let values = self.alphas.values();
        let n_outcomes = self.alphas.n_outcomes();
        let flat = values
            .iter()
            .flatten()
            .map(|&v| v as f32)
            .collect::<Vec<_>>();
        let alphas = Tensor::<B, 1>::from_data(
            TensorData::new(flat, [values.len() * n_outcomes]),
            &self.device,
        )
        .reshape([values.len(), n_outcomes]);
        state.insert(ALPHAS_KEY.to_owned(), alphas);
        track!(state.save(path))
    }

    /// Restores a checkpoint written by [`BaseNet::save`].
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let state = track!(StateDict::load(path, &self.device))?;
        track!(self.load_state_dict(&state))?;

        let alphas = track!(state.get::<2>(ALPHAS_KEY))?;
        let [n_slots, n_outcomes] = alphas.dims();
        let flat = alphas
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ErrorKind::Other.cause(format!("{:?}", e)))?;
        let values = flat
            .chunks(n_outcomes.max(1))
            .take(n_slots)
            .map(|row| row.iter().map(|&v| f64::from(v)).collect())
            .collect();
        track!(self.alphas.set_values(values))
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// `x` is `[batch, 3, height, width]`; returns `[batch, classes]` logits.
    pub fn forward(&mut self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut out = x;
        for block in &self.blocks {
            out = block.forward(&mut self.layers, out, self.training);
        }
        let [batch, channels, _, _] = out.dims();
        let pooled = adaptive_avg_pool2d(out, [1, 1]).reshape([batch, channels]);
        self.fc.forward(pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DownsampleState;
    use crate::config::{AlphasKind, Dataset};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use std::path::PathBuf;
    use trackable::result::TopLevelResult;

    type TestBackend = NdArray;

    fn config() -> ModelConfig {
        ModelConfig::new("resnet18".to_owned(), Dataset::Cifar10, vec![0.5, 1.0])
            .with_input_size(Some(8))
    }

    fn model(config: ModelConfig) -> Result<BaseNet<TestBackend>> {
        BaseNet::new(config, &Default::default())
    }

    #[test]
    fn construction_works() -> TopLevelResult {
        let model = track!(model(config()))?;
        assert_eq!(model.n_layers(), 19);
        assert_eq!(model.counter_layers().len(), 28);
        assert_eq!(model.baseline_width().len(), 2);
        assert_eq!(model.curr_width_idx(), vec![0; 19]);
        assert_eq!(model.flops_ratio(), 1.0);
        assert_eq!(model.n_combinations(), 1 << 19);

        let ratios = model.baseline_flops_ratio();
        assert_eq!(ratios["0.5"], 1.0);
        assert!(ratios["1"] > 3.0);
        Ok(())
    }

    #[test]
    fn set_curr_width_idx_is_validated() -> TopLevelResult {
        let mut model = track!(model(config()))?;
        let mut path = vec![0; 19];
        path[3] = 1;
        track!(model.set_curr_width_idx(&path))?;
        assert_eq!(model.curr_width_idx(), path);
        assert_eq!(model.curr_width_ratio()[3], 1.0);
        assert_eq!(model.curr_width()[3], 16);

        let mut invalid = vec![1; 19];
        invalid[18] = 2;
        assert!(model.set_curr_width_idx(&invalid).is_err());
        assert!(model.set_curr_width_idx(&[0; 18]).is_err());
        assert_eq!(model.curr_width_idx(), path);
        Ok(())
    }

    #[test]
    fn homogeneous_width_idx_works() -> TopLevelResult {
        let model = track!(model(config()))?;
        let widths = track!(model.build_homogeneous_width_idx(&[1.0, 0.5, 1.0]))?;
        assert_eq!(widths.len(), 2);
        assert_eq!(widths[0], (BaselineKey::Width(1.0), vec![1; 19]));
        assert_eq!(widths[1], (BaselineKey::Width(0.5), vec![0; 19]));
        assert!(model.build_homogeneous_width_idx(&[0.75]).is_err());

        let mut model = model;
        track!(model.set_curr_width_idx(&widths[0].1))?;
        assert_eq!(model.curr_width_ratio(), vec![1.0; 19]);
        track!(model.set_curr_width_idx(&widths[1].1))?;
        assert_eq!(model.curr_width_ratio(), vec![0.5; 19]);
        Ok(())
    }

    #[test]
    fn apply_on_baseline_restores_state() -> TopLevelResult {
        let mut model = track!(model(config()))?;
        let mut path = vec![1; 19];
        path[0] = 0;
        track!(model.set_curr_width_idx(&path))?;
        let counters = model
            .layers()
            .iter()
            .map(|l| l.counters().clone())
            .collect::<Vec<_>>();

        let flops = track!(model.apply_on_baseline(|m| m.count_flops(), true))?;
        assert_eq!(flops.len(), 2);
        assert!(flops[0].1 < flops[1].1);
        assert_eq!(model.curr_width_idx(), path);
        let restored = model
            .layers()
            .iter()
            .map(|l| l.counters().clone())
            .collect::<Vec<_>>();
        assert_eq!(restored, counters);
        Ok(())
    }

    #[test]
    fn apply_on_baseline_covers_partition() -> TopLevelResult {
        let mut model = track!(model(config().with_partition(Some(vec![0.25; 19]))))?;
        let mut path = vec![0; 19];
        path[7] = 1;
        track!(model.set_curr_width_idx(&path))?;

        let ratios = track!(model.apply_on_baseline(|m| m.curr_width_ratio(), true))?;
        let keys = ratios.iter().map(|r| r.0).collect::<Vec<_>>();
        assert_eq!(
            keys,
            [
                BaselineKey::Width(0.5),
                BaselineKey::Width(1.0),
                BaselineKey::Partition
            ]
        );
        assert_eq!(ratios[2].1, vec![0.25; 19]);
        assert_eq!(model.curr_width_idx(), path);
        Ok(())
    }

    #[test]
    fn temporary_downsample_is_activated_by_width_mismatch() -> TopLevelResult {
        let mut model = track!(model(config()))?;
        // stem at 0.5, block 1 conv2 at 1.0
        let mut path = vec![0; 19];
        path[2] = 1;
        track!(model.set_curr_width_idx(&path))?;
        let state = model.blocks()[1].downsample().map(|d| d.state());
        assert_eq!(state, Some(DownsampleState::TemporaryActive));
        let state = model.blocks()[3].downsample().map(|d| d.state());
        assert_eq!(state, Some(DownsampleState::TemporaryInactive));

        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Default, model.device());
        assert_eq!(model.forward(x).dims(), [2, 10]);
        Ok(())
    }

    #[test]
    fn partition_is_injected() -> TopLevelResult {
        let partition = (0..19)
            .map(|i| if i % 2 == 0 { 0.75 } else { 0.25 })
            .collect::<Vec<_>>();
        let mut model = track!(model(config().with_partition(Some(partition.clone()))))?;
        assert_eq!(model.baseline_width().len(), 3);
        assert_eq!(model.baseline_width()[2].0, BaselineKey::Partition);
        assert!(model.baseline_flops().contains_key("Partition"));
        assert_eq!(model.alphas().n_outcomes(), 2);

        track!(model.set_curr_width_idx(&[2; 19]))?;
        assert_eq!(model.curr_width_ratio(), partition);
        for &id in model.counter_layers() {
            assert_eq!(model.layers()[id].n_widths(), 3);
        }

        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Default, model.device());
        assert_eq!(model.forward(x).dims(), [2, 10]);

        assert!(self::model(config().with_partition(Some(vec![0.5; 3]))).is_err());
        Ok(())
    }

    #[test]
    fn replica_config_skips_recounting() -> TopLevelResult {
        let source = track!(model(config().with_partition(Some(vec![0.25; 19]))))?;
        let replica_config = source.replica_config();
        assert_eq!(
            replica_config.model_flops.as_ref().map(|t| t.len()),
            Some(28)
        );

        let replica = track!(model(replica_config))?;
        assert_eq!(replica.baseline_flops(), source.baseline_flops());
        assert_eq!(replica.flops_data(), source.flops_data());
        Ok(())
    }

    #[test]
    fn state_dict_round_trip() -> TopLevelResult {
        let device = Default::default();
        let mut source = track!(model(config()))?;
        let mut target = track!(model(config()))?;
        source.eval();
        target.eval();
        track!(target.load_state_dict(&source.state_dict()))?;

        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Default, &device);
        let expected = source.forward(x.clone()).into_data().to_vec::<f32>().expect("f32 data");
        let actual = target.forward(x).into_data().to_vec::<f32>().expect("f32 data");
        assert_eq!(actual, expected);

        let mut other = track!(model(config().with_partition(Some(vec![0.25; 19]))))?;
        assert!(other.load_state_dict(&source.state_dict()).is_err());
        Ok(())
    }

    #[test]
    fn random_weights_are_restorable() -> TopLevelResult {
        let device = Default::default();
        let mut model = track!(model(config().with_save_random_weights(true)))?;
        model.eval();
        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Default, &device);
        let expected = model.forward(x.clone()).into_data().to_vec::<f32>().expect("f32 data");

        model.train();
        let _ = model.forward(x.clone());
        track!(model.load_random_weights())?;
        model.eval();
        let actual = model.forward(x).into_data().to_vec::<f32>().expect("f32 data");
        assert_eq!(actual, expected);

        let mut plain = track!(self::model(config()))?;
        assert!(plain.load_random_weights().is_err());
        Ok(())
    }

    #[test]
    fn forward_counters_are_logged_and_reset() -> TopLevelResult {
        let mut model = track!(model(config()))?;
        track!(model.set_curr_width_idx(&[1; 19]))?;
        track!(model.set_curr_width_idx(&[1; 19]))?;
        let rows = model.log_forward_counters();
        assert_eq!(rows.len(), 28);
        assert_eq!(rows[0].counts, vec![(1.0, 2), (0.5, 0)]);
        assert_eq!(rows[0].total, 2);

        let rows = model.log_forward_counters();
        assert_eq!(rows[0].total, 0);
        Ok(())
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slimnas-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn out_of_range_partition_is_rejected() {
        let mut partition = vec![0.5; 19];
        partition[5] = 1.5;
        assert!(model(config().with_partition(Some(partition.clone()))).is_err());

        partition[5] = 0.0;
        assert!(model(config().with_partition(Some(partition))).is_err());
    }

    #[test]
    fn architecture_is_dumped_once() -> TopLevelResult {
        let dir = temp_dir("dump");
        let _ = track!(model(config().with_save_dir(Some(dir.clone()))))?;
        let path = dir.join(ARCHITECTURE_FILE);
        let text = track_any_err!(fs::read_to_string(&path))?;
        let dump: serde_json::Value = track_any_err!(serde_json::from_str(&text))?;
        assert_eq!(dump["model"], "resnet18_cifar10");
        let stem = &dump["layers"][0];
        assert_eq!(stem["ratios"], json!([0.5, 1.0]));
        assert_eq!(stem["widths"], json!([8, 16]));
        assert_eq!(stem["flops"].as_array().map(|a| a.len()), Some(2));

        track_any_err!(fs::write(&path, "{}"))?;
        let _ = track!(model(config().with_save_dir(Some(dir.clone()))))?;
        assert_eq!(track_any_err!(fs::read_to_string(&path))?, "{}");
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn checkpoint_restores_weights_and_alphas() -> TopLevelResult {
        let dir = temp_dir("checkpoint");
        track_any_err!(fs::create_dir_all(&dir))?;
        let path = dir.join("checkpoint.bin");

        let mut source = track!(model(config()))?;
        track!(source.alphas_mut().set_values(vec![vec![0.25, -1.5]]))?;
        track!(source.save(&path))?;

        let mut target = track!(model(config()))?;
        track!(target.load(&path))?;
        assert_eq!(target.alphas().values(), &[vec![0.25, -1.5]]);

        source.eval();
        target.eval();
        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Default, source.device());
        let expected = source.forward(x.clone()).into_data().to_vec::<f32>().expect("f32 data");
        let actual = target.forward(x).into_data().to_vec::<f32>().expect("f32 data");
        assert_eq!(actual, expected);

        let mut categorical = track!(model(config().with_alphas(AlphasKind::Categorical)))?;
        assert!(categorical.load(&path).is_err());
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }
}
