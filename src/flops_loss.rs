//! Loss of a path relative to the loss expected for its FLOPs.
use crate::{ErrorKind, Result};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const NEGATIVE_SLOPE: f64 = 0.1;

/// Line through two consecutive calibration points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearLine {
    pub x0: f64,
    pub x1: f64,
    pub slope: f64,
    pub intercept: f64,
}
impl LinearLine {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Measured FLOPs and loss of the homogeneous-width networks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// FLOPs by width ratio key (e.g., `"0.25"`).
    pub flops_dict: BTreeMap<String, f64>,

    /// One line per pair of consecutive FLOPs values.
    pub linear_line_params: Vec<LinearLine>,
}
impl Calibration {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let calibration = track_any_err!(serde_json::from_reader(reader))?;
        Ok(calibration)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = track_any_err!(File::open(&path); path.as_ref())?;
        track!(Self::from_reader(BufReader::new(file)))
    }

    /// Fits the piecewise linear model through `(ratio key, flops, loss)` points.
    pub fn from_points(points: &[(String, f64, f64)]) -> Result<Self> {
        track_assert!(points.len() >= 2, ErrorKind::InvalidInput);
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut linear_line_params = Vec::new();
        for pair in sorted.windows(2) {
            let (_, x0, y0) = pair[0];
            let (_, x1, y1) = pair[1];
            track_assert!(
                x0 < x1,
                ErrorKind::InvalidInput,
                "duplicated FLOPs value {}",
                x0
            );
            let slope = (y1 - y0) / (x1 - x0);
            linear_line_params.push(LinearLine {
                x0,
                x1,
                slope,
                intercept: y0 - slope * x0,
            });
        }
        let flops_dict = sorted.into_iter().map(|(k, x, _)| (k, x)).collect();
        Ok(Self {
            flops_dict,
            linear_line_params,
        })
    }
}

/// Names of the values in a [`LossDict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LossKey {
    Total,
    CrossEntropy,
    Flops,
}
impl LossKey {
    pub const ALL: [LossKey; 3] = [LossKey::Total, LossKey::CrossEntropy, LossKey::Flops];
}
impl fmt::Display for LossKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LossKey::Total => write!(f, "Total"),
            LossKey::CrossEntropy => write!(f, "CrossEntropy"),
            LossKey::Flops => write!(f, "Flops"),
        }
    }
}

/// Loss values of a single evaluated path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossDict {
    pub cross_entropy: f64,
    pub flops: f64,
    pub total: f64,
}
impl LossDict {
    pub fn get(&self, key: LossKey) -> f64 {
        match key {
            LossKey::Total => self.total,
            LossKey::CrossEntropy => self.cross_entropy,
            LossKey::Flops => self.flops,
        }
    }
}

/// `s + leaky_relu(x, s)`.
#[derive(Debug, Clone, Copy)]
struct LossShaping {
    negative_slope: f64,
}
impl LossShaping {
    fn apply(&self, x: f64) -> f64 {
        let leaky = if x >= 0.0 { x } else { self.negative_slope * x };
        self.negative_slope + leaky
    }
}

/// Cross entropy compared to the calibrated expected loss at the same FLOPs.
#[derive(Debug, Clone)]
pub struct FlopsLoss {
    breakpoints: Vec<f64>,
    lines: Vec<LinearLine>,
    shaping: LossShaping,
}
impl FlopsLoss {
    pub fn new(calibration: &Calibration) -> Result<Self> {
        let mut breakpoints = calibration.flops_dict.values().copied().collect::<Vec<_>>();
        breakpoints.sort_by(|a, b| a.total_cmp(b));
        breakpoints.dedup();
        track_assert!(
            breakpoints.len() >= 2,
            ErrorKind::InvalidInput,
            "at least two calibration points are required"
        );

        let mut lines = Vec::with_capacity(breakpoints.len() - 1);
        for pair in breakpoints.windows(2) {
            let line = track_assert_some!(
                calibration
                    .linear_line_params
                    .iter()
                    .find(|l| same(l.x0, pair[0]) && same(l.x1, pair[1])),
                ErrorKind::InvalidInput,
                "no linear line for the FLOPs bracket [{}, {}]",
                pair[0],
                pair[1]
            );
            lines.push(*line);
        }
        Ok(Self {
            breakpoints,
            lines,
            shaping: LossShaping {
                negative_slope: NEGATIVE_SLOPE,
            },
        })
    }

    pub fn breakpoints(&self) -> &[f64] {
        &self.breakpoints
    }

    /// The line of the bracket `flops` falls in.
    ///
    /// Values below the first breakpoint use the first bracket and values above the last
    /// breakpoint extrapolate the last bracket.
    pub fn line(&self, flops: f64) -> &LinearLine {
        let idx = self.breakpoints.partition_point(|&x| x < flops);
        if idx == 0 {
            &self.lines[0]
        } else if idx >= self.breakpoints.len() {
            &self.lines[self.lines.len() - 1]
        } else {
            &self.lines[idx - 1]
        }
    }

    pub fn expected_loss(&self, flops: f64) -> f64 {
        self.line(flops).eval(flops)
    }

    /// Shaped relative difference between `cross_entropy` and the expected loss.
    pub fn total(&self, cross_entropy: f64, flops: f64) -> f64 {
        let expected = self.expected_loss(flops);
        self.shaping.apply((cross_entropy - expected) / expected)
    }

    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        target: Tensor<B, 1, Int>,
        flops: f64,
    ) -> LossDict {
        let cross_entropy = cross_entropy(logits, target);
        LossDict {
            cross_entropy,
            flops,
            total: self.total(cross_entropy, flops),
        }
    }
}

fn same(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

/// Mean negative log-likelihood of `target` under `logits`.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, target: Tensor<B, 1, Int>) -> f64 {
    let [batch] = target.dims();
    let log_probs = log_softmax(logits, 1);
    let picked = log_probs.gather(1, target.reshape([batch, 1]));
    picked.mean().neg().into_scalar().elem::<f64>()
}
