//! Experiment configuration.
use crate::width::FlopsTable;
use crate::ErrorKind;
use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use trackable::error::ErrorKindExt;

/// Datasets a model can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Cifar10,
    Cifar100,
    Imagenet,
}
impl Dataset {
    pub fn n_classes(self) -> usize {
        match self {
            Dataset::Cifar10 => 10,
            Dataset::Cifar100 => 100,
            Dataset::Imagenet => 1000,
        }
    }

    pub fn input_size(self) -> usize {
        match self {
            Dataset::Cifar10 | Dataset::Cifar100 => 32,
            Dataset::Imagenet => 224,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dataset::Cifar10 => "cifar10",
            Dataset::Cifar100 => "cifar100",
            Dataset::Imagenet => "imagenet",
        }
    }
}
impl FromStr for Dataset {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "cifar10" => Ok(Dataset::Cifar10),
            "cifar100" => Ok(Dataset::Cifar100),
            "imagenet" => Ok(Dataset::Imagenet),
            _ => track_panic!(ErrorKind::InvalidInput, "Unknown dataset: {:?}", s),
        }
    }
}

/// How path-selection parameters are shared between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlphasKind {
    /// A single distribution shared by every optimization layer.
    Multinomial,

    /// An independent distribution per optimization layer.
    Categorical,
}

/// Configuration of a width-switchable model.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Model family (e.g., `resnet18`).
    pub model: String,
    pub dataset: Dataset,
    /// Candidate width ratios of every optimization layer.
    pub widths: Vec<f64>,
    /// Width ratio the FLOPs ratio is computed against (`widths[0]` if omitted).
    pub baseline: Option<f64>,
    /// Overrides the dataset input size.
    pub input_size: Option<usize>,
    /// Per optimization layer width ratios, injected as an extra candidate width.
    pub partition: Option<Vec<f64>>,
    /// Precomputed FLOPs tables, one per counter layer.
    pub model_flops: Option<Vec<FlopsTable>>,
    /// Precomputed FLOPs of every baseline width.
    pub baseline_flops: Option<BTreeMap<String, f64>>,
    #[config(default = false)]
    pub save_random_weights: bool,
    #[config(default = "AlphasKind::Multinomial")]
    pub alphas: AlphasKind,
    /// Directory the architecture description is written to.
    pub save_dir: Option<PathBuf>,
}
impl ModelConfig {
    /// Registry key of the architecture, e.g. `resnet18_cifar10`.
    pub fn registry_key(&self) -> String {
        format!("{}_{}", self.model, self.dataset.name())
    }

    pub fn baseline_ratio(&self) -> crate::Result<f64> {
        match self.baseline {
            Some(b) => Ok(b),
            None => Ok(*track_assert_some!(self.widths.first(), ErrorKind::InvalidInput)),
        }
    }

    pub fn effective_input_size(&self) -> usize {
        self.input_size.unwrap_or_else(|| self.dataset.input_size())
    }
}

/// Configuration of an alphas search.
#[derive(Config, Debug)]
pub struct SearchConfig {
    pub model: ModelConfig,
    /// Path of the FLOPs/loss calibration artifact (JSON).
    pub calibration: PathBuf,
    #[config(default = "vec![0]")]
    pub devices: Vec<usize>,
    /// Number of paths sampled per alphas step (over all devices).
    #[config(default = 8)]
    pub n_samples: usize,
    /// Train-mode forwards used to fine-tune the batch-norm statistics of a sampled path.
    #[config(default = 2)]
    pub bn_steps: usize,
    #[config(default = 0.01)]
    pub alphas_learning_rate: f64,
    #[config(default = 10000)]
    pub max_resample_attempts: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 2)]
    pub top_k: usize,
}
impl SearchConfig {
    /// Loads a `SearchConfig` from the given JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let config = <Self as Config>::load(path.as_ref())
            .map_err(|e| ErrorKind::InvalidInput.cause(format!("{:?}", e)))?;
        track_assert!(
            config.n_samples > 0,
            ErrorKind::InvalidInput,
            "n_samples must be positive"
        );
        Ok(config)
    }
}
