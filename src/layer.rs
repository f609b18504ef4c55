//! Width-switchable computation units.
use crate::width::{FlopsTable, ForwardCounters, WidthSet};
use crate::{ErrorKind, Result};
use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Distribution, Tensor};

/// Index of a layer in the layer arena of a model.
pub type LayerId = usize;

/// Where a layer reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerInput {
    /// The network input image.
    Image { channels: usize },

    /// The output of another layer.
    Layer(LayerId),
}
impl LayerInput {
    /// Channel count this input currently produces.
    pub fn curr_width<B: Backend>(&self, layers: &[SlimConv<B>]) -> usize {
        match *self {
            LayerInput::Image { channels } => channels,
            LayerInput::Layer(id) => layers[id].widths().curr_width(),
        }
    }

    /// Every channel count this input can produce.
    pub fn width_list<B: Backend>(&self, layers: &[SlimConv<B>]) -> Vec<usize> {
        match *self {
            LayerInput::Image { channels } => vec![channels],
            LayerInput::Layer(id) => layers[id].widths().channels().to_vec(),
        }
    }
}

/// Batch normalization over the channel dimension of `[batch, channels, height, width]` inputs.
#[derive(Debug, Clone)]
pub struct BatchNorm<B: Backend> {
    gamma: Tensor<B, 1>,
    beta: Tensor<B, 1>,
    running_mean: Tensor<B, 1>,
    running_var: Tensor<B, 1>,
    channels: usize,
    momentum: f64,
    epsilon: f64,
}
impl<B: Backend> BatchNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            gamma: Tensor::ones([channels], device),
            beta: Tensor::zeros([channels], device),
            running_mean: Tensor::zeros([channels], device),
            running_var: Tensor::ones([channels], device),
            channels,
            momentum: 0.1,
            epsilon: 1e-5,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Normalizes `x`.
    ///
    /// In training mode the batch statistics are used and folded into the running statistics.
    pub fn forward(&mut self, x: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        if training {
            let mean = x.clone().mean_dim(0).mean_dim(2).mean_dim(3);
            let centered = x - mean.clone();
            let var = centered
                .clone()
                .powf_scalar(2.0)
                .mean_dim(0)
                .mean_dim(2)
                .mean_dim(3);

            let n = (batch * height * width) as f64;
            let unbiased = if n > 1.0 { n / (n - 1.0) } else { 1.0 };
            let m = self.momentum;
            self.running_mean = self
                .running_mean
                .clone()
                .mul_scalar(1.0 - m)
                .add(mean.reshape([channels]).mul_scalar(m));
            self.running_var = self
                .running_var
                .clone()
                .mul_scalar(1.0 - m)
                .add(var.clone().reshape([channels]).mul_scalar(m * unbiased));

            self.normalize(centered, var)
        } else {
            let mean = self.running_mean.clone().reshape([1, channels, 1, 1]);
            let var = self.running_var.clone().reshape([1, channels, 1, 1]);
            self.normalize(x - mean, var)
        }
    }

    fn normalize(&self, centered: Tensor<B, 4>, var: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = self.channels;
        let std = var.add_scalar(self.epsilon).sqrt();
        centered.div(std) * self.gamma.clone().reshape([1, channels, 1, 1])
            + self.beta.clone().reshape([1, channels, 1, 1])
    }

    pub(crate) fn params(&self) -> [(&'static str, &Tensor<B, 1>); 4] {
        [
            ("gamma", &self.gamma),
            ("beta", &self.beta),
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ]
    }

    pub(crate) fn params_mut(&mut self) -> [(&'static str, &mut Tensor<B, 1>); 4] {
        [
            ("gamma", &mut self.gamma),
            ("beta", &mut self.beta),
            ("running_mean", &mut self.running_mean),
            ("running_var", &mut self.running_var),
        ]
    }
}

/// Shape parameters of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub in_planes: usize,
    pub out_planes: usize,
    pub kernel_size: usize,
    pub stride: usize,
}
impl ConvShape {
    pub fn padding(&self) -> usize {
        self.kernel_size / 2
    }

    /// Spatial output size for a square input of `input_size`.
    pub fn output_size(&self, input_size: usize) -> usize {
        (input_size + 2 * self.padding()).saturating_sub(self.kernel_size) / self.stride + 1
    }
}

/// A convolution followed by batch normalization, switchable between several output widths.
///
/// Every width owns a private batch norm, since the statistics of a narrowed layer differ
/// from those of the same layer at another width.
#[derive(Debug, Clone)]
pub struct SlimConv<B: Backend> {
    widths: WidthSet,
    shape: ConvShape,
    input: LayerInput,
    output_size: usize,
    weight: Tensor<B, 4>,
    bns: Vec<BatchNorm<B>>,
    flops: FlopsTable,
    counters: ForwardCounters,
}
impl<B: Backend> SlimConv<B> {
    pub fn new(
        ratios: &[f64],
        shape: ConvShape,
        input: LayerInput,
        input_size: usize,
        device: &B::Device,
    ) -> Result<Self> {
        track_assert!(shape.stride > 0, ErrorKind::InvalidInput);
        let widths = track!(WidthSet::new(ratios, shape.out_planes))?;

        // He initialization (fan-out)
        let k = shape.kernel_size;
        let std = (2.0 / (k * k * shape.out_planes) as f64).sqrt();
        let weight = Tensor::random(
            [shape.out_planes, shape.in_planes, k, k],
            Distribution::Normal(0.0, std),
            device,
        );
        let bns = widths
            .channels()
            .iter()
            .map(|&c| BatchNorm::new(c, device))
            .collect();
        let counters = ForwardCounters::new(widths.n_widths());
        Ok(Self {
            widths,
            shape,
            input,
            output_size: shape.output_size(input_size),
            weight,
            bns,
            flops: FlopsTable::default(),
            counters,
        })
    }

    pub fn widths(&self) -> &WidthSet {
        &self.widths
    }

    pub fn shape(&self) -> ConvShape {
        self.shape
    }

    pub fn input(&self) -> LayerInput {
        self.input
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn n_widths(&self) -> usize {
        self.widths.n_widths()
    }

    pub fn curr_width_idx(&self) -> usize {
        self.widths.curr_idx()
    }

    pub fn curr_width(&self) -> usize {
        self.widths.curr_width()
    }

    pub fn curr_width_ratio(&self) -> f64 {
        self.widths.curr_ratio()
    }

    pub fn width_ratio_by_idx(&self, idx: usize) -> Option<f64> {
        self.widths.ratio_by_idx(idx)
    }

    pub fn width_ratio_idx(&self, ratio: f64) -> Result<usize> {
        track!(self.widths.ratio_idx(ratio))
    }

    /// Selects the width at `idx` and counts the visit.
    pub fn set_curr_width_idx(&mut self, idx: usize) -> Result<()> {
        track!(self.widths.set_curr_idx(idx))?;
        self.counters.increment(idx);
        Ok(())
    }

    /// Appends a candidate width (with a fresh batch norm) and returns its index.
    pub fn add_width(&mut self, ratio: f64, device: &B::Device) -> usize {
        let idx = self.widths.add_width(ratio);
        let channels = self.widths.channels()[idx];
        self.bns.push(BatchNorm::new(channels, device));
        self.counters.add_width();
        idx
    }

    pub fn forward(&mut self, x: Tensor<B, 4>, training: bool) -> Tensor<B, 4> {
        let [_, in_channels, _, _] = x.dims();
        let out_channels = self.widths.curr_width();
        let weight = self
            .weight
            .clone()
            .narrow(0, 0, out_channels)
            .narrow(1, 0, in_channels);
        let stride = self.shape.stride;
        let padding = self.shape.padding();
        let options = ConvOptions::new([stride, stride], [padding, padding], [1, 1], 1);
        let out = conv2d(x, weight, None, options);
        self.bns[self.widths.curr_idx()].forward(out, training)
    }

    /// FLOPs of a forward with `in_channels` input channels at the current width.
    pub fn flops(&self, in_channels: usize, out_channels: usize) -> f64 {
        let k = self.shape.kernel_size as f64;
        let positions = (self.output_size * self.output_size) as f64;
        in_channels as f64 * out_channels as f64 * k * k * positions
    }

    /// Looks the current width's FLOPs up in the precomputed table.
    pub fn count_flops(&self, in_channels: usize) -> f64 {
        self.flops
            .get(in_channels, self.widths.curr_width())
            .unwrap_or_default()
    }

    /// Fills the FLOPs table for every combination of `input_widths` and this layer's widths.
    ///
    /// Already known combinations are kept as they are.
    pub fn build_flops_table(&mut self, input_widths: &[usize]) {
        for &in_channels in input_widths {
            for idx in 0..self.widths.n_widths() {
                let out_channels = self.widths.channels()[idx];
                let flops = self.flops(in_channels, out_channels);
                self.flops.insert(in_channels, out_channels, flops);
            }
        }
    }

    pub fn flops_data(&self) -> &FlopsTable {
        &self.flops
    }

    pub fn set_flops_data(&mut self, table: FlopsTable) {
        self.flops = table;
    }

    pub fn forward_counters(&self) -> Vec<(f64, u64)> {
        self.counters.by_ratio(self.widths.ratios())
    }

    pub fn counters(&self) -> &ForwardCounters {
        &self.counters
    }

    pub(crate) fn set_counters(&mut self, counters: ForwardCounters) {
        self.counters = counters;
    }

    pub fn reset_forward_counters(&mut self) {
        self.counters.reset();
    }

    pub(crate) fn weight(&self) -> &Tensor<B, 4> {
        &self.weight
    }

    pub(crate) fn weight_mut(&mut self) -> &mut Tensor<B, 4> {
        &mut self.weight
    }

    pub(crate) fn bns(&self) -> &[BatchNorm<B>] {
        &self.bns
    }

    pub(crate) fn bns_mut(&mut self) -> &mut [BatchNorm<B>] {
        &mut self.bns
    }
}
impl<B: Backend> std::fmt::Display for SlimConv<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "SlimConv({}, {}, kernel_size=({k}, {k}), stride=({s}, {s}), widths={:?})",
            self.shape.in_planes,
            self.shape.out_planes,
            self.widths.channels(),
            k = self.shape.kernel_size,
            s = self.shape.stride
        )
    }
}

/// Fully connected classifier whose input features follow the width of the last layer.
#[derive(Debug, Clone)]
pub struct SlimLinear<B: Backend> {
    weight: Tensor<B, 2>,
    bias: Tensor<B, 1>,
}
impl<B: Backend> SlimLinear<B> {
    pub fn new(in_features: usize, out_features: usize, device: &B::Device) -> Self {
        let bound = 1.0 / (in_features as f64).sqrt();
        Self {
            weight: Tensor::random(
                [out_features, in_features],
                Distribution::Uniform(-bound, bound),
                device,
            ),
            bias: Tensor::zeros([out_features], device),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// `x` is `[batch, features]` where `features` may be smaller than `in_features()`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [_, features] = x.dims();
        let out_features = self.out_features();
        let weight = self.weight.clone().narrow(1, 0, features);
        x.matmul(weight.transpose()) + self.bias.clone().reshape([1, out_features])
    }

    pub(crate) fn weight(&self) -> &Tensor<B, 2> {
        &self.weight
    }

    pub(crate) fn weight_mut(&mut self) -> &mut Tensor<B, 2> {
        &mut self.weight
    }

    pub(crate) fn bias(&self) -> &Tensor<B, 1> {
        &self.bias
    }

    pub(crate) fn bias_mut(&mut self) -> &mut Tensor<B, 1> {
        &mut self.bias
    }
}
impl<B: Backend> std::fmt::Display for SlimLinear<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Linear(in_features={}, out_features={})",
            self.in_features(),
            self.out_features()
        )
    }
}
