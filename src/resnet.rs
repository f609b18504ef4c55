//! Residual architectures and their registry.
use crate::block::{BasicBlock, Block, Downsample, DownsampleKind};
use crate::config::Dataset;
use crate::layer::{ConvShape, LayerInput, SlimConv, SlimLinear};
use crate::{ErrorKind, Result};
use burn::tensor::backend::Backend;
use std::collections::HashMap;
use std::fmt;

const IMAGE_CHANNELS: usize = 3;

/// Input convolution of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StemPlan {
    pub out_planes: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub max_pool: bool,
}

/// Layout of a network: the stem, the output planes of every basic block and the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    pub input_size: usize,
    pub stem: StemPlan,
    pub blocks: Vec<usize>,
    pub n_classes: usize,
}

/// Layers and blocks instantiated from a [`NetworkPlan`].
#[derive(Debug, Clone)]
pub struct Network<B: Backend> {
    pub layers: Vec<SlimConv<B>>,
    pub blocks: Vec<Block>,
    pub fc: SlimLinear<B>,
}

impl NetworkPlan {
    /// Builds every layer with the candidate width `ratios`.
    pub fn build<B: Backend>(&self, ratios: &[f64], device: &B::Device) -> Result<Network<B>> {
        let mut layers = Vec::new();
        let mut blocks = Vec::new();

        let stem_shape = ConvShape {
            in_planes: IMAGE_CHANNELS,
            out_planes: self.stem.out_planes,
            kernel_size: self.stem.kernel_size,
            stride: self.stem.stride,
        };
        let stem = track!(SlimConv::new(
            ratios,
            stem_shape,
            LayerInput::Image {
                channels: IMAGE_CHANNELS
            },
            self.input_size,
            device
        ))?;
        let mut size = stem.output_size();
        if self.stem.max_pool {
            size = (size + 2 - 3) / 2 + 1;
        }
        layers.push(stem);
        blocks.push(Block::Stem {
            conv: 0,
            max_pool: self.stem.max_pool,
        });

        let mut prev = LayerInput::Layer(0);
        let mut in_planes = self.stem.out_planes;
        for &out_planes in &self.blocks {
            let stride = 1;
            let stride1 = if in_planes == out_planes {
                stride
            } else {
                stride + 1
            };
            let conv1_shape = ConvShape {
                in_planes,
                out_planes,
                kernel_size: 3,
                stride: stride1,
            };
            let conv1 = track!(SlimConv::new(ratios, conv1_shape, prev, size, device))?;
            let conv1_id = layers.len();
            let conv1_size = conv1.output_size();
            layers.push(conv1);

            let conv2_shape = ConvShape {
                in_planes: out_planes,
                out_planes,
                kernel_size: 3,
                stride,
            };
            let conv2 = track!(SlimConv::new(
                ratios,
                conv2_shape,
                LayerInput::Layer(conv1_id),
                conv1_size,
                device
            ))?;
            let conv2_id = layers.len();
            let conv2_size = conv2.output_size();
            layers.push(conv2);

            let src_shape = ConvShape {
                in_planes,
                out_planes,
                kernel_size: 1,
                stride: stride1,
            };
            let src = track!(SlimConv::new(ratios, src_shape, prev, size, device))?;
            track_assert_eq!(src.output_size(), conv2_size, ErrorKind::InvalidInput);
            let src_id = layers.len();
            layers.push(src);

            let kind = if in_planes == out_planes {
                DownsampleKind::Temporary
            } else {
                DownsampleKind::Permanent
            };
            blocks.push(Block::Basic(BasicBlock {
                conv1: conv1_id,
                conv2: conv2_id,
                downsample: Downsample::new(kind, src_id, conv2_id, prev),
            }));

            prev = LayerInput::Layer(conv2_id);
            in_planes = out_planes;
            size = conv2_size;
        }

        let fc = SlimLinear::new(in_planes, self.n_classes, device);
        Ok(Network { layers, blocks, fc })
    }
}

/// A model family that can be laid out for a dataset.
pub trait Architecture: Send + Sync {
    fn name(&self) -> &str;

    fn plan(&self, dataset: Dataset, input_size: usize) -> NetworkPlan;

    /// Number of partition blocks and the number of layer groups in each.
    fn partition_blocks(&self) -> (usize, Vec<usize>) {
        (3, vec![4, 3, 3])
    }
}

const RESNET18_PLANES: [usize; 9] = [16, 16, 16, 32, 32, 32, 64, 64, 64];

/// ResNet for 32x32 inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResNet18Cifar;
impl Architecture for ResNet18Cifar {
    fn name(&self) -> &str {
        "resnet18_cifar"
    }

    fn plan(&self, dataset: Dataset, input_size: usize) -> NetworkPlan {
        NetworkPlan {
            input_size,
            stem: StemPlan {
                out_planes: 16,
                kernel_size: 3,
                stride: 1,
                max_pool: false,
            },
            blocks: RESNET18_PLANES.to_vec(),
            n_classes: dataset.n_classes(),
        }
    }
}

/// ResNet for 224x224 inputs, four times wider than [`ResNet18Cifar`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ResNet18Imagenet;
impl Architecture for ResNet18Imagenet {
    fn name(&self) -> &str {
        "resnet18_imagenet"
    }

    fn plan(&self, dataset: Dataset, input_size: usize) -> NetworkPlan {
        NetworkPlan {
            input_size,
            stem: StemPlan {
                out_planes: 64,
                kernel_size: 7,
                stride: 2,
                max_pool: true,
            },
            blocks: RESNET18_PLANES.iter().map(|p| p * 4).collect(),
            n_classes: dataset.n_classes(),
        }
    }
}

/// Architectures by `"{model}_{dataset}"` key.
pub struct ArchitectureRegistry {
    entries: HashMap<String, Box<dyn Architecture>>,
}
impl ArchitectureRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register<A>(&mut self, key: &str, architecture: A)
    where
        A: Architecture + 'static,
    {
        self.entries.insert(key.to_owned(), Box::new(architecture));
    }

    pub fn get(&self, key: &str) -> Result<&dyn Architecture> {
        let architecture = track_assert_some!(
            self.entries.get(key),
            ErrorKind::InvalidInput,
            "Unknown model: {:?}",
            key
        );
        Ok(architecture.as_ref())
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys = self.entries.keys().map(|k| k.as_str()).collect::<Vec<_>>();
        keys.sort();
        keys
    }
}
impl Default for ArchitectureRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("resnet18_cifar10", ResNet18Cifar);
        registry.register("resnet18_cifar100", ResNet18Cifar);
        registry.register("resnet18_imagenet", ResNet18Imagenet);
        registry
    }
}
impl fmt::Debug for ArchitectureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ArchitectureRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DownsampleState;
    use burn::backend::NdArray;
    use trackable::result::TopLevelResult;

    #[test]
    fn registry_works() -> TopLevelResult {
        let registry = ArchitectureRegistry::default();
        assert_eq!(
            registry.keys(),
            ["resnet18_cifar10", "resnet18_cifar100", "resnet18_imagenet"]
        );
        let plan = track!(registry.get("resnet18_cifar100"))?.plan(Dataset::Cifar100, 32);
        assert_eq!(plan.n_classes, 100);
        assert!(registry.get("resnet50_cifar10").is_err());
        Ok(())
    }

    #[test]
    fn cifar_network_layout() -> TopLevelResult {
        let plan = ResNet18Cifar.plan(Dataset::Cifar10, 8);
        let network = track!(plan.build::<NdArray>(&[0.5, 1.0], &Default::default()))?;
        assert_eq!(network.blocks.len(), 10);
        assert_eq!(network.layers.len(), 1 + 9 * 3);
        assert_eq!(network.fc.in_features(), 64);

        let kinds = network
            .blocks
            .iter()
            .filter_map(|b| b.downsample().map(|d| d.state()))
            .filter(|s| *s == DownsampleState::PermanentActive)
            .count();
        assert_eq!(kinds, 2);

        // 8 -> 8 -> 4 -> 2
        let last = network.blocks[9].output_layer();
        assert_eq!(network.layers[last].output_size(), 2);
        Ok(())
    }
}
