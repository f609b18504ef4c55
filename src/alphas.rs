//! Learned width-selection distributions.
use crate::config::AlphasKind;
use crate::{ErrorKind, Result};
use rand::distributions::{Distribution as _, WeightedIndex};
use rand::Rng;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Logits of the width distribution(s) of the optimization layers.
///
/// A `Multinomial` instance has a single slot shared by every layer;
/// a `Categorical` instance has one slot per layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Alphas {
    kind: AlphasKind,
    values: Vec<Vec<f64>>,
    grad: Vec<Vec<f64>>,
    n_layers: usize,
}
impl Alphas {
    /// Makes a uniform distribution over `n_outcomes` widths for `n_layers` layers.
    pub fn new(kind: AlphasKind, n_layers: usize, n_outcomes: usize) -> Result<Self> {
        track_assert!(n_layers > 0, ErrorKind::InvalidInput);
        track_assert!(n_outcomes > 0, ErrorKind::InvalidInput);
        let n_slots = match kind {
            AlphasKind::Multinomial => 1,
            AlphasKind::Categorical => n_layers,
        };
        let values = vec![vec![0.0; n_outcomes]; n_slots];
        Ok(Self {
            kind,
            grad: values.clone(),
            values,
            n_layers,
        })
    }

    pub fn kind(&self) -> AlphasKind {
        self.kind
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_outcomes(&self) -> usize {
        self.values[0].len()
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn grad(&self) -> &[Vec<f64>] {
        &self.grad
    }

    /// Copies the values of `src`.
    pub fn update(&mut self, src: &Alphas) -> Result<()> {
        track_assert_eq!(self.kind, src.kind, ErrorKind::InvalidInput);
        track_assert_eq!(self.n_layers, src.n_layers, ErrorKind::InvalidInput);
        track_assert_eq!(
            self.n_outcomes(),
            src.n_outcomes(),
            ErrorKind::InvalidInput
        );
        self.values.clone_from(&src.values);
        Ok(())
    }

    /// Replaces the logits; the shape must stay the same.
    pub fn set_values(&mut self, values: Vec<Vec<f64>>) -> Result<()> {
        track_assert_eq!(values.len(), self.values.len(), ErrorKind::InvalidInput);
        for v in &values {
            track_assert_eq!(v.len(), self.n_outcomes(), ErrorKind::InvalidInput);
        }
        self.values = values;
        Ok(())
    }

    pub fn probs(&self) -> Vec<Vec<f64>> {
        self.values.iter().map(|v| softmax(v)).collect()
    }

    fn slot(&self, layer: usize) -> usize {
        match self.kind {
            AlphasKind::Multinomial => 0,
            AlphasKind::Categorical => layer,
        }
    }

    /// Draws one width index per optimization layer.
    pub fn sample_path<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<usize>> {
        let dists = self
            .probs()
            .into_iter()
            .map(|p| track_any_err!(WeightedIndex::new(p)).map_err(crate::Error::from))
            .collect::<Result<Vec<_>>>()?;
        let path = (0..self.n_layers)
            .map(|layer| dists[self.slot(layer)].sample(rng))
            .collect();
        Ok(path)
    }

    /// Deterministic path following the distribution.
    ///
    /// Per-layer slots take their argmax. The shared slot apportions the layers to
    /// outcomes by largest remainder, assigning outcomes to layers in ascending index order.
    pub fn argmax_path(&self) -> Vec<usize> {
        match self.kind {
            AlphasKind::Categorical => self.probs().iter().map(|p| argmax(p)).collect(),
            AlphasKind::Multinomial => {
                let probs = softmax(&self.values[0]);
                let n = self.n_layers as f64;
                let mut counts = probs
                    .iter()
                    .map(|p| (p * n).floor() as usize)
                    .collect::<Vec<_>>();
                let mut remainders = probs
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (i, p * n - (p * n).floor()))
                    .collect::<Vec<_>>();
                remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

                let assigned = counts.iter().sum::<usize>();
                for &(i, _) in remainders
                    .iter()
                    .take(self.n_layers.saturating_sub(assigned))
                {
                    counts[i] += 1;
                }
                counts
                    .iter()
                    .enumerate()
                    .flat_map(|(i, &c)| std::iter::repeat(i).take(c))
                    .collect()
            }
        }
    }

    /// The `k` most probable outcomes of every slot, most probable first.
    pub fn top_k(&self, k: usize) -> Vec<Vec<(usize, f64)>> {
        self.probs()
            .into_iter()
            .map(|p| {
                let mut ranked = p.into_iter().enumerate().collect::<Vec<_>>();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                ranked.truncate(k);
                ranked
            })
            .collect()
    }

    /// Shannon entropy (nats) of every slot.
    pub fn entropy(&self) -> Vec<f64> {
        self.probs()
            .iter()
            .map(|p| {
                -p.iter()
                    .filter(|&&x| x > 0.0)
                    .map(|&x| x * x.ln())
                    .sum::<f64>()
            })
            .collect()
    }

    /// How many times each outcome of each slot is selected by `path`.
    pub fn selection_counts(&self, path: &[usize]) -> Result<Vec<Vec<f64>>> {
        track_assert_eq!(path.len(), self.n_layers, ErrorKind::InvalidInput);
        let mut counts = vec![vec![0.0; self.n_outcomes()]; self.values.len()];
        for (layer, &idx) in path.iter().enumerate() {
            track_assert!(
                idx < self.n_outcomes(),
                ErrorKind::InvalidInput,
                "width index {} is not a sampling outcome",
                idx
            );
            counts[self.slot(layer)][idx] += 1.0;
        }
        Ok(counts)
    }

    /// Expected value of `selection_counts` under the current distribution.
    pub fn expected_counts(&self) -> Vec<Vec<f64>> {
        let scale = match self.kind {
            AlphasKind::Multinomial => self.n_layers as f64,
            AlphasKind::Categorical => 1.0,
        };
        self.probs()
            .into_iter()
            .map(|p| p.into_iter().map(|x| x * scale).collect())
            .collect()
    }

    pub fn set_grad(&mut self, grad: Vec<Vec<f64>>) -> Result<()> {
        track_assert_eq!(grad.len(), self.values.len(), ErrorKind::InvalidInput);
        for g in &grad {
            track_assert_eq!(g.len(), self.n_outcomes(), ErrorKind::InvalidInput);
        }
        self.grad = grad;
        Ok(())
    }

    /// Plain gradient descent step.
    pub fn step(&mut self, learning_rate: f64) {
        for (values, grad) in self.values.iter_mut().zip(self.grad.iter()) {
            for (v, g) in values.iter_mut().zip(grad.iter()) {
                *v -= learning_rate * g;
            }
        }
    }

    /// Appends the current probabilities to the CSV file at `path`.
    ///
    /// One row per slot: `epoch,slot,p_0,...,p_n`. The header is written when the file is created.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P, epoch: usize) -> Result<()> {
        let path = path.as_ref();
        let is_new = !path.exists();
        let mut file = track_any_err!(OpenOptions::new().create(true).append(true).open(path))?;
        if is_new {
            let header = (0..self.n_outcomes())
                .map(|i| format!("p_{}", i))
                .collect::<Vec<_>>()
                .join(",");
            track_any_err!(writeln!(file, "epoch,slot,{}", header))?;
        }
        for (slot, probs) in self.probs().iter().enumerate() {
            let row = probs
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            track_any_err!(writeln!(file, "{},{},{}", epoch, slot, row))?;
        }
        Ok(())
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps = logits.iter().map(|x| (x - max).exp()).collect::<Vec<_>>();
    let sum = exps.iter().sum::<f64>();
    exps.into_iter().map(|x| x / sum).collect()
}

fn argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, x) in xs.iter().enumerate() {
        if *x > xs[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use trackable::result::TopLevelResult;

    #[test]
    fn uniform_alphas_work() -> TopLevelResult {
        let alphas = track!(Alphas::new(AlphasKind::Multinomial, 5, 4))?;
        assert_eq!(alphas.probs(), vec![vec![0.25; 4]]);
        assert!((alphas.entropy()[0] - 4f64.ln()).abs() < 1e-12);
        assert_eq!(alphas.expected_counts(), vec![vec![1.25; 4]]);
        Ok(())
    }

    #[test]
    fn sample_path_covers_every_layer() -> TopLevelResult {
        let mut rng = StdRng::seed_from_u64(0);
        let alphas = track!(Alphas::new(AlphasKind::Categorical, 7, 3))?;
        for _ in 0..20 {
            let path = track!(alphas.sample_path(&mut rng))?;
            assert_eq!(path.len(), 7);
            assert!(path.iter().all(|&i| i < 3));
        }
        Ok(())
    }

    #[test]
    fn argmax_path_apportions_layers() -> TopLevelResult {
        let mut alphas = track!(Alphas::new(AlphasKind::Multinomial, 5, 3))?;
        let mut src = alphas.clone();
        src.values[0] = vec![0.0, 2f64.ln(), 0.0];
        track!(alphas.update(&src))?;

        // probs = [0.25, 0.5, 0.25] -> counts [1.25, 2.5, 1.25]
        assert_eq!(alphas.argmax_path(), vec![0, 1, 1, 1, 2]);

        let mut categorical = track!(Alphas::new(AlphasKind::Categorical, 2, 3))?;
        categorical.values = vec![vec![0.0, 1.0, 0.0], vec![3.0, 1.0, 0.0]];
        assert_eq!(categorical.argmax_path(), vec![1, 0]);
        assert_eq!(categorical.top_k(2)[1].iter().map(|x| x.0).collect::<Vec<_>>(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn selection_counts_are_summed_per_outcome() -> TopLevelResult {
        let alphas = track!(Alphas::new(AlphasKind::Multinomial, 5, 3))?;
        let counts = track!(alphas.selection_counts(&[0, 2, 0, 1, 0]))?;
        assert_eq!(counts, vec![vec![3.0, 1.0, 1.0]]);
        assert!(alphas.selection_counts(&[0, 3, 0, 1, 0]).is_err());
        assert!(alphas.selection_counts(&[0]).is_err());
        Ok(())
    }

    #[test]
    fn step_descends_gradient() -> TopLevelResult {
        let mut alphas = track!(Alphas::new(AlphasKind::Multinomial, 2, 2))?;
        track!(alphas.set_grad(vec![vec![1.0, -1.0]]))?;
        alphas.step(0.5);
        assert_eq!(alphas.values(), &[vec![-0.5, 0.5]]);
        assert!(alphas.set_grad(vec![vec![1.0]]).is_err());

        let other = track!(Alphas::new(AlphasKind::Multinomial, 3, 2))?;
        assert!(alphas.update(&other).is_err());

        track!(alphas.set_values(vec![vec![2.0, 0.0]]))?;
        assert_eq!(alphas.argmax_path(), vec![0, 0]);
        assert!(alphas.set_values(vec![vec![1.0, 2.0, 3.0]]).is_err());
        Ok(())
    }
}
