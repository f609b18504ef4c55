//! Width-slimmable network architecture search.
//!
//! A residual network whose convolutions can run at several width ratios is searched with
//! learned per-layer width distributions ("alphas"). Paths are sampled on every device,
//! their batch-norm statistics are briefly fine-tuned, and each path is scored by a loss
//! calibrated against the expected loss of homogeneous-width networks of similar FLOPs.
//!
//! # References
//!
//! - [Slimmable Neural Networks](https://arxiv.org/abs/1812.08928)
#![warn(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate trackable;

pub use self::alphas::Alphas;
pub use self::config::{AlphasKind, Dataset, ModelConfig, SearchConfig};
pub use self::error::{Error, ErrorKind};
pub use self::flops_loss::{Calibration, FlopsLoss, LossDict, LossKey};
pub use self::model::{BaseNet, BaselineKey};
pub use self::path::PathsHistory;
pub use self::replicator::{DeviceSlot, ModelReplicator, MultinomialPolicy, PathSample};
pub use self::regime::SearchRegime;

pub mod alphas;
pub mod block;
pub mod config;
pub mod flops_loss;
pub mod layer;
pub mod model;
pub mod path;
pub mod regime;
pub mod replicator;
pub mod resnet;
pub mod state;
pub mod width;

mod error;

/// This crate specific `Result` type.
pub type Result<T> = std::result::Result<T, Error>;
