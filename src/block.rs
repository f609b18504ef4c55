//! Blocks of width-switchable layers.
use crate::layer::{LayerId, LayerInput, SlimConv};
use crate::Result;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::module::max_pool2d;
use burn::tensor::Tensor;

/// Whether a residual shortcut is always a convolution or only when widths disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsampleKind {
    /// Input and output planes differ, so the shortcut always projects.
    Permanent,

    /// Input and output planes are equal; projection is needed only when the
    /// current input width differs from conv2's current width.
    Temporary,
}

/// Observable state of a [`Downsample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsampleState {
    PermanentActive,
    TemporaryInactive,
    TemporaryActive,
}

/// 1x1 projection shortcut of a basic block.
#[derive(Debug, Clone)]
pub struct Downsample {
    kind: DownsampleKind,
    src: LayerId,
    conv2: LayerId,
    input: LayerInput,
    active: bool,
}
impl Downsample {
    pub fn new(kind: DownsampleKind, src: LayerId, conv2: LayerId, input: LayerInput) -> Self {
        Self {
            kind,
            src,
            conv2,
            input,
            active: kind == DownsampleKind::Permanent,
        }
    }

    pub fn kind(&self) -> DownsampleKind {
        self.kind
    }

    /// The projection layer, whether or not it is currently used.
    pub fn src(&self) -> LayerId {
        self.src
    }

    pub fn state(&self) -> DownsampleState {
        match (self.kind, self.active) {
            (DownsampleKind::Permanent, _) => DownsampleState::PermanentActive,
            (DownsampleKind::Temporary, false) => DownsampleState::TemporaryInactive,
            (DownsampleKind::Temporary, true) => DownsampleState::TemporaryActive,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The projection layer when it takes part in the forward pass.
    pub fn current(&self) -> Option<LayerId> {
        if self.active {
            Some(self.src)
        } else {
            None
        }
    }

    /// Aligns the projection with conv2 after conv2's width changed.
    pub fn update_curr_width<B: Backend>(&mut self, layers: &mut [SlimConv<B>]) -> Result<()> {
        let conv2_idx = layers[self.conv2].curr_width_idx();
        track!(layers[self.src].set_curr_width_idx(conv2_idx))?;
        if self.kind == DownsampleKind::Temporary {
            let input_width = self.input.curr_width(layers);
            self.active = input_width != layers[self.conv2].curr_width();
        }
        Ok(())
    }

    fn residual<B: Backend>(
        &self,
        layers: &mut [SlimConv<B>],
        x: Tensor<B, 4>,
        training: bool,
    ) -> Tensor<B, 4> {
        match self.current() {
            Some(id) => layers[id].forward(x, training),
            None => x,
        }
    }
}

/// Two 3x3 convolutions with a residual connection.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub conv1: LayerId,
    pub conv2: LayerId,
    pub downsample: Downsample,
}
impl BasicBlock {
    fn forward<B: Backend>(
        &self,
        layers: &mut [SlimConv<B>],
        x: Tensor<B, 4>,
        training: bool,
    ) -> Tensor<B, 4> {
        let out = relu(layers[self.conv1].forward(x.clone(), training));
        let out = layers[self.conv2].forward(out, training);
        let residual = self.downsample.residual(layers, x, training);
        relu(out + residual)
    }
}

/// Element of a network's block sequence.
#[derive(Debug, Clone)]
pub enum Block {
    /// Input convolution, optionally followed by a 3x3 stride 2 max pool.
    Stem { conv: LayerId, max_pool: bool },

    Basic(BasicBlock),
}
impl Block {
    /// Layers whose width is chosen by the search.
    pub fn optimization_layers(&self) -> Vec<LayerId> {
        match self {
            Block::Stem { conv, .. } => vec![*conv],
            Block::Basic(b) => vec![b.conv1, b.conv2],
        }
    }

    /// Layers that run in the forward pass under the current widths.
    pub fn flops_layers(&self) -> Vec<LayerId> {
        match self {
            Block::Stem { conv, .. } => vec![*conv],
            Block::Basic(b) => {
                let mut layers = vec![b.conv1];
                layers.extend(b.downsample.current());
                layers.push(b.conv2);
                layers
            }
        }
    }

    /// Layers whose width selections are counted.
    pub fn counter_layers(&self) -> Vec<LayerId> {
        match self {
            Block::Stem { conv, .. } => vec![*conv],
            Block::Basic(b) => vec![b.conv1, b.downsample.src(), b.conv2],
        }
    }

    /// The layer whose width is this block's output width.
    pub fn output_layer(&self) -> LayerId {
        match self {
            Block::Stem { conv, .. } => *conv,
            Block::Basic(b) => b.conv2,
        }
    }

    pub fn downsample(&self) -> Option<&Downsample> {
        match self {
            Block::Stem { .. } => None,
            Block::Basic(b) => Some(&b.downsample),
        }
    }

    pub fn update_curr_width<B: Backend>(&mut self, layers: &mut [SlimConv<B>]) -> Result<()> {
        match self {
            Block::Stem { .. } => Ok(()),
            Block::Basic(b) => track!(b.downsample.update_curr_width(layers)),
        }
    }

    pub fn forward<B: Backend>(
        &self,
        layers: &mut [SlimConv<B>],
        x: Tensor<B, 4>,
        training: bool,
    ) -> Tensor<B, 4> {
        match self {
            Block::Stem { conv, max_pool } => {
                let out = relu(layers[*conv].forward(x, training));
                if *max_pool {
                    max_pool2d(out, [3, 3], [2, 2], [1, 1], [1, 1])
                } else {
                    out
                }
            }
            Block::Basic(b) => b.forward(layers, x, training),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::ConvShape;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use trackable::result::TopLevelResult;

    type TestBackend = NdArray;

    fn conv(
        in_planes: usize,
        out_planes: usize,
        kernel_size: usize,
        stride: usize,
        input: LayerInput,
    ) -> Result<SlimConv<TestBackend>> {
        let shape = ConvShape {
            in_planes,
            out_planes,
            kernel_size,
            stride,
        };
        SlimConv::new(&[0.5, 1.0], shape, input, 4, &Default::default())
    }

    // stem(8) -> basic(8 -> 8)
    fn temporary_block() -> Result<(Vec<SlimConv<TestBackend>>, Vec<Block>)> {
        let stem = track!(conv(3, 8, 3, 1, LayerInput::Image { channels: 3 }))?;
        let conv1 = track!(conv(8, 8, 3, 1, LayerInput::Layer(0)))?;
        let conv2 = track!(conv(8, 8, 3, 1, LayerInput::Layer(1)))?;
        let src = track!(conv(8, 8, 1, 1, LayerInput::Layer(0)))?;
        let blocks = vec![
            Block::Stem {
                conv: 0,
                max_pool: false,
            },
            Block::Basic(BasicBlock {
                conv1: 1,
                conv2: 2,
                downsample: Downsample::new(
                    DownsampleKind::Temporary,
                    3,
                    2,
                    LayerInput::Layer(0),
                ),
            }),
        ];
        Ok((vec![stem, conv1, conv2, src], blocks))
    }

    #[test]
    fn temporary_downsample_follows_widths() -> TopLevelResult {
        let (mut layers, mut blocks) = track!(temporary_block())?;
        assert_eq!(
            blocks[1].downsample().map(|d| d.state()),
            Some(DownsampleState::TemporaryInactive)
        );

        track!(layers[2].set_curr_width_idx(1))?;
        track!(blocks[1].update_curr_width(&mut layers))?;
        assert_eq!(
            blocks[1].downsample().map(|d| d.state()),
            Some(DownsampleState::TemporaryActive)
        );
        assert_eq!(layers[3].curr_width_idx(), 1);
        assert_eq!(blocks[1].flops_layers(), vec![1, 3, 2]);

        track!(layers[0].set_curr_width_idx(1))?;
        track!(blocks[1].update_curr_width(&mut layers))?;
        assert_eq!(
            blocks[1].downsample().map(|d| d.state()),
            Some(DownsampleState::TemporaryInactive)
        );
        assert_eq!(blocks[1].flops_layers(), vec![1, 2]);
        assert_eq!(blocks[1].counter_layers(), vec![1, 3, 2]);
        Ok(())
    }

    #[test]
    fn forward_with_mixed_widths() -> TopLevelResult {
        let (mut layers, mut blocks) = track!(temporary_block())?;
        track!(layers[1].set_curr_width_idx(1))?;
        track!(layers[2].set_curr_width_idx(1))?;
        for block in &mut blocks {
            track!(block.update_curr_width(&mut layers))?;
        }

        let x = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Default, &Default::default());
        let mut out = x;
        for block in &blocks {
            out = block.forward(&mut layers, out, true);
        }
        assert_eq!(out.dims(), [2, 8, 4, 4]);
        Ok(())
    }
}
