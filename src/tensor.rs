//! Dense per-layer probability tensor
//!
//! Owns a `[layer][position][vocab]` array of f32 probabilities. This is the
//! input of the trajectory extractor and is built either from plain nested
//! vectors or from candle tensors produced by a forward pass.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};

/// Row-stochastic probabilities, shape `(n_layers, n_positions, vocab_size)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityTensor {
    /// Row-major storage: index = (layer * n_positions + position) * vocab_size + token
    data: Vec<f32>,
    n_layers: usize,
    n_positions: usize,
    vocab_size: usize,
}

impl ProbabilityTensor {
    /// Wrap flat row-major data with an explicit shape
    pub fn new(data: Vec<f32>, shape: (usize, usize, usize)) -> Result<Self> {
        let (n_layers, n_positions, vocab_size) = shape;
        let expected = n_layers
            .checked_mul(n_positions)
            .and_then(|n| n.checked_mul(vocab_size))
            .with_context(|| {
                format!("Shape ({n_layers}, {n_positions}, {vocab_size}) overflows usize")
            })?;
        anyhow::ensure!(
            data.len() == expected,
            "Probability data has {} values, shape ({n_layers}, {n_positions}, {vocab_size}) needs {expected}",
            data.len()
        );
        Ok(Self {
            data,
            n_layers,
            n_positions,
            vocab_size,
        })
    }

    /// An empty tensor with zero layers, positions and vocabulary
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            n_layers: 0,
            n_positions: 0,
            vocab_size: 0,
        }
    }

    /// Build from `probs[layer][position][token]`
    ///
    /// Every layer must have the same number of positions and every row the
    /// same vocabulary size.
    pub fn from_nested(probs: &[Vec<Vec<f32>>]) -> Result<Self> {
        let n_layers = probs.len();
        let n_positions = probs.first().map_or(0, Vec::len);
        let vocab_size = probs
            .first()
            .and_then(|layer| layer.first())
            .map_or(0, Vec::len);

        let mut data = Vec::with_capacity(n_layers * n_positions * vocab_size);
        for (layer, rows) in probs.iter().enumerate() {
            anyhow::ensure!(
                rows.len() == n_positions,
                "Layer {layer} has {} positions, expected {n_positions}",
                rows.len()
            );
            for (position, row) in rows.iter().enumerate() {
                anyhow::ensure!(
                    row.len() == vocab_size,
                    "Row (layer {layer}, position {position}) has {} entries, expected {vocab_size}",
                    row.len()
                );
                data.extend_from_slice(row);
            }
        }

        Self::new(data, (n_layers, n_positions, vocab_size))
    }

    /// Build from a candle tensor of probabilities
    ///
    /// Accepts shape `(layers, positions, vocab)` or `(layers, 1, positions, vocab)`.
    pub fn from_tensor(probs: &Tensor) -> Result<Self> {
        let probs = match probs.dims() {
            [_, _, _] => probs.clone(),
            [_, 1, _, _] => probs.squeeze(1)?,
            dims => anyhow::bail!(
                "Expected probabilities of shape (layers, positions, vocab), got {dims:?}"
            ),
        };
        let (n_layers, n_positions, vocab_size) = probs.dims3()?;
        let data: Vec<f32> = probs
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()
            .context("Failed to read probability tensor")?;
        Self::new(data, (n_layers, n_positions, vocab_size))
    }

    /// Build from a candle tensor of raw logits, applying softmax over the vocabulary
    pub fn from_logits(logits: &Tensor) -> Result<Self> {
        let logits_f32 = logits.to_dtype(DType::F32)?.contiguous()?;
        let probs = candle_nn::ops::softmax_last_dim(&logits_f32)?;
        Self::from_tensor(&probs)
    }

    /// Stack one `(positions, vocab)` probability tensor per layer
    pub fn from_layer_tensors(layers: &[Tensor]) -> Result<Self> {
        if layers.is_empty() {
            return Ok(Self::empty());
        }
        let stacked = Tensor::stack(layers, 0).context("Per-layer tensors differ in shape")?;
        Self::from_tensor(&stacked)
    }

    /// Shape as `(n_layers, n_positions, vocab_size)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_layers, self.n_positions, self.vocab_size)
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_positions(&self) -> usize {
        self.n_positions
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// True when there is no `(layer, position)` row at all
    pub fn is_empty(&self) -> bool {
        self.n_layers == 0 || self.n_positions == 0
    }

    /// The vocabulary distribution at `(layer, position)`
    ///
    /// Panics if either index is out of range.
    pub fn row(&self, layer: usize, position: usize) -> &[f32] {
        assert!(layer < self.n_layers && position < self.n_positions);
        let start = (layer * self.n_positions + position) * self.vocab_size;
        &self.data[start..start + self.vocab_size]
    }

    /// Probability of `token` at `(layer, position)`
    pub fn get(&self, layer: usize, position: usize, token: usize) -> f32 {
        self.row(layer, position)[token]
    }

    /// Fail on the first NaN or infinite value
    pub fn validate_finite(&self) -> Result<()> {
        if let Some(idx) = self.data.iter().position(|p| !p.is_finite()) {
            let row = idx / self.vocab_size;
            let (layer, position) = (row / self.n_positions, row % self.n_positions);
            let token = idx % self.vocab_size;
            anyhow::bail!(
                "Non-finite probability {} at layer {layer}, position {position}, token {token}",
                self.data[idx]
            );
        }
        Ok(())
    }

    /// Largest `|sum(row) - 1|` over all rows (0.0 for an empty tensor)
    pub fn max_row_deviation(&self) -> f32 {
        if self.vocab_size == 0 {
            return 0.0;
        }
        self.data
            .chunks(self.vocab_size)
            .map(|row| (row.iter().sum::<f32>() - 1.0).abs())
            .fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn two_layer() -> ProbabilityTensor {
        ProbabilityTensor::from_nested(&[
            vec![vec![0.1, 0.4, 0.3, 0.2]],
            vec![vec![0.05, 0.05, 0.1, 0.8]],
        ])
        .unwrap()
    }

    #[test]
    fn test_from_nested_shape_and_access() {
        let probs = two_layer();
        assert_eq!(probs.shape(), (2, 1, 4));
        assert_eq!(probs.row(1, 0), &[0.05, 0.05, 0.1, 0.8]);
        assert_eq!(probs.get(0, 0, 1), 0.4);
        assert!(!probs.is_empty());
    }

    #[test]
    fn test_from_nested_rejects_ragged_rows() {
        let err = ProbabilityTensor::from_nested(&[vec![vec![0.5, 0.5], vec![1.0]]]).unwrap_err();
        assert!(err.to_string().contains("position 1"));

        let err =
            ProbabilityTensor::from_nested(&[vec![vec![1.0]], vec![vec![1.0], vec![1.0]]])
                .unwrap_err();
        assert!(err.to_string().contains("Layer 1"));
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(ProbabilityTensor::new(vec![0.0; 5], (1, 2, 3)).is_err());
        assert!(ProbabilityTensor::new(vec![0.0; 6], (1, 2, 3)).is_ok());
    }

    #[test]
    fn test_new_rejects_overflowing_shape() {
        // 2^63 * 2 * 1 wraps to 0, which would match an empty buffer
        let err = ProbabilityTensor::new(vec![], (1 << 63, 2, 1)).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_validate_finite_reports_location() {
        let mut nested = vec![vec![vec![0.5, 0.5], vec![0.5, 0.5]]; 2];
        nested[1][0][1] = f32::NAN;
        let probs = ProbabilityTensor::from_nested(&nested).unwrap();
        let err = probs.validate_finite().unwrap_err().to_string();
        assert!(err.contains("layer 1, position 0, token 1"), "{err}");

        assert!(two_layer().validate_finite().is_ok());
        assert!(ProbabilityTensor::empty().validate_finite().is_ok());
    }

    #[test]
    fn test_from_tensor_roundtrips_values() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(
            vec![0.1f32, 0.4, 0.3, 0.2, 0.05, 0.05, 0.1, 0.8],
            (2, 1, 4),
            &device,
        )
        .unwrap();
        assert_eq!(ProbabilityTensor::from_tensor(&t).unwrap(), two_layer());

        let batched = t.unsqueeze(1).unwrap();
        assert_eq!(ProbabilityTensor::from_tensor(&batched).unwrap(), two_layer());

        let flat = Tensor::zeros((4,), DType::F32, &device).unwrap();
        assert!(ProbabilityTensor::from_tensor(&flat).is_err());
    }

    #[test]
    fn test_from_logits_is_row_stochastic() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 0.0, 0.0, 0.0], (1, 2, 3), &device)
            .unwrap();
        let probs = ProbabilityTensor::from_logits(&logits).unwrap();
        assert!(probs.max_row_deviation() < 1e-5);
        let row = probs.row(0, 0);
        assert!(row[2] > row[1] && row[1] > row[0]);
        assert!((probs.get(0, 1, 0) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_layer_tensors_stacks() {
        let device = Device::Cpu;
        let l0 = Tensor::from_vec(vec![0.1f32, 0.4, 0.3, 0.2], (1, 4), &device).unwrap();
        let l1 = Tensor::from_vec(vec![0.05f32, 0.05, 0.1, 0.8], (1, 4), &device).unwrap();
        let probs = ProbabilityTensor::from_layer_tensors(&[l0, l1]).unwrap();
        assert_eq!(probs, two_layer());
        assert!(ProbabilityTensor::from_layer_tensors(&[]).unwrap().is_empty());
    }
}
