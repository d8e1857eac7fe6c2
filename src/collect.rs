//! Logit lens collection
//!
//! Runs a prompt through a model, projects every requested decoder block's
//! output through the final norm and output head, and reduces the resulting
//! `[layer][position][vocab]` distribution with the trajectory extractor.
//! Only the reduced result leaves this module.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::architecture::{ArchitectureRegistry, ModelConfig, ModuleTree};
use crate::extract::{TopKGrid, TrackedPosition, TrajectoryExtractor};
use crate::logit_lens::{LayerPredictions, PositionAnalysis, TokenPrediction};
use crate::tensor::ProbabilityTensor;
use crate::tokenizer::TokenCodec;

/// Rows whose sum strays further than this from 1.0 get a warning
const ROW_SUM_TOLERANCE: f32 = 1e-3;

/// A model that can report the hidden state emitted by its decoder blocks
///
/// Implementors run the forward pass (locally or remotely) and return only
/// the requested block outputs.
pub trait LensModel: ModuleTree {
    fn config(&self) -> &ModelConfig;

    /// Output hidden state of each block in `layers`, in the same order
    ///
    /// `blocks` is the module path of the decoder block list. Each tensor is
    /// `(seq_len, d_model)` or `(1, seq_len, d_model)`.
    fn block_outputs(&self, blocks: &str, input_ids: &[u32], layers: &[usize])
        -> Result<Vec<Tensor>>;
}

/// Configuration for a logit lens collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensConfig {
    /// Entries kept per (layer, position)
    pub top_k: usize,
    /// Track the union of top-k tokens across all layers
    pub track_across_layers: bool,
    /// Layer indices to analyze (None = all layers)
    pub layers: Option<Vec<usize>>,
    /// Architecture family (None = detect from config.json)
    pub model_type: Option<String>,
    /// Allow position-parallel top-k on large tensors
    pub parallel: bool,
}

impl Default for LensConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            track_across_layers: true,
            layers: None,
            model_type: None,
            parallel: true,
        }
    }
}

impl LensConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lens config: {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse lens config")
    }

    pub fn extractor(&self) -> Result<TrajectoryExtractor> {
        Ok(TrajectoryExtractor::new(self.top_k)?.with_parallel(self.parallel))
    }
}

/// Reduced logit lens data for one prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensData {
    /// Input token strings
    pub tokens: Vec<String>,
    /// Input token ids
    pub token_ids: Vec<u32>,
    /// Layer indices analyzed, in tensor order
    pub layers: Vec<usize>,
    /// Top-k at every (layer, position)
    pub top_k: TopKGrid,
    /// Per-position tracked tokens and trajectories (None in top-k only mode)
    pub tracked: Option<Vec<TrackedPosition>>,
}

impl LensData {
    /// Reduce an already computed probability tensor
    ///
    /// `layers` labels the tensor's layer axis and `token_ids` its position
    /// axis; both lengths must match the tensor.
    pub fn from_probabilities(
        probs: &ProbabilityTensor,
        layers: Vec<usize>,
        token_ids: Vec<u32>,
        tokenizer: &dyn TokenCodec,
        config: &LensConfig,
    ) -> Result<Self> {
        let (n_layers, n_positions, vocab_size) = probs.shape();
        anyhow::ensure!(
            layers.len() == n_layers,
            "{} layer labels for a tensor with {n_layers} layers",
            layers.len()
        );
        anyhow::ensure!(
            token_ids.len() == n_positions,
            "{} input tokens for a tensor with {n_positions} positions",
            token_ids.len()
        );

        let deviation = probs.max_row_deviation();
        if deviation > ROW_SUM_TOLERANCE {
            warn!("Probability rows deviate from 1.0 by up to {deviation:.4}");
        }

        let extractor = config.extractor()?;
        let (top_k, tracked) = if config.track_across_layers {
            let extraction = extractor.extract(probs)?;
            (extraction.top_k, Some(extraction.tracked))
        } else {
            (extractor.top_k(probs)?, None)
        };
        debug!("Reduced ({n_layers}, {n_positions}, {vocab_size}) tensor with k={}", config.top_k);

        Ok(Self {
            tokens: token_ids.iter().map(|&t| tokenizer.decode_token(t)).collect(),
            token_ids,
            layers,
            top_k,
            tracked,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn n_positions(&self) -> usize {
        self.tokens.len()
    }

    /// Check that every axis agrees with `layers` and `tokens`
    ///
    /// Data deserialized from JSON must pass this before it is indexed.
    pub fn validate(&self) -> Result<()> {
        let (n_layers, n_positions) = (self.n_layers(), self.n_positions());
        anyhow::ensure!(
            self.token_ids.len() == n_positions,
            "{} token ids for {n_positions} tokens",
            self.token_ids.len()
        );
        self.top_k.validate()?;
        anyhow::ensure!(
            self.top_k.n_layers() == n_layers && self.top_k.n_positions() == n_positions,
            "Top-k grid is {}x{}, expected {n_layers} layers x {n_positions} positions",
            self.top_k.n_layers(),
            self.top_k.n_positions()
        );
        if let Some(tracked) = &self.tracked {
            anyhow::ensure!(
                tracked.len() == n_positions,
                "Tracked data covers {} positions, expected {n_positions}",
                tracked.len()
            );
            for (position, entry) in tracked.iter().enumerate() {
                entry
                    .validate(n_layers)
                    .with_context(|| format!("Invalid tracked data at position {position}"))?;
            }
        }
        Ok(())
    }

    /// Decoded top-k per layer at one position, plus tracked tokens outside it
    pub fn analysis(&self, position: usize, tokenizer: &dyn TokenCodec) -> Result<PositionAnalysis> {
        self.validate()?;
        anyhow::ensure!(
            position < self.n_positions(),
            "Position {position} out of range ({} positions)",
            self.n_positions()
        );
        let decode = |token_id: u32, probability: f32| TokenPrediction {
            token_id,
            token: tokenizer.decode_token(token_id),
            probability,
        };
        let tracked = self.tracked.as_ref().map(|t| &t[position]);

        let layers = self
            .layers
            .iter()
            .enumerate()
            .map(|(idx, &layer)| {
                let top = self.top_k.get(idx, position);
                let top_k = top.iter().map(|e| decode(e.token_id, e.probability)).collect();
                let mut tracked_outside: Vec<TokenPrediction> = tracked
                    .map(|t| {
                        t.token_ids
                            .iter()
                            .zip(&t.trajectories[idx])
                            .filter(|(id, _)| top.iter().all(|e| e.token_id != **id))
                            .map(|(&id, &p)| decode(id, p))
                            .collect()
                    })
                    .unwrap_or_default();
                tracked_outside.sort_by(|a, b| b.probability.total_cmp(&a.probability));
                LayerPredictions {
                    layer,
                    top_k,
                    tracked_outside,
                }
            })
            .collect();

        Ok(PositionAnalysis {
            position,
            input_token: self.tokens[position].clone(),
            layers,
        })
    }
}

/// Decode tracked token ids to strings, one list per position
pub fn decode_tracked_tokens(data: &LensData, tokenizer: &dyn TokenCodec) -> Result<Vec<Vec<String>>> {
    let tracked = data
        .tracked
        .as_ref()
        .context("No tracked tokens: collect with track_across_layers enabled")?;
    Ok(tracked
        .iter()
        .map(|pos| pos.token_ids.iter().map(|&t| tokenizer.decode_token(t)).collect())
        .collect())
}

/// Logit lens collector bound to an architecture registry
pub struct LogitLens<'a, M: ?Sized> {
    registry: &'a ArchitectureRegistry<M>,
    config: LensConfig,
}

impl<'a, M: LensModel + ?Sized> LogitLens<'a, M> {
    pub fn new(registry: &'a ArchitectureRegistry<M>, config: LensConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &LensConfig {
        &self.config
    }

    /// Run the prompt and return reduced logit lens data
    pub fn collect(
        &self,
        model: &M,
        tokenizer: &dyn TokenCodec,
        prompt: &str,
    ) -> Result<LensData> {
        let spec = self
            .registry
            .resolve(model.config(), self.config.model_type.as_deref())?;
        let n_layers = spec.n_layers(model.config())?;
        info!("Architecture: {} ({} layers)", spec.family, n_layers);

        let layers: Vec<usize> = match &self.config.layers {
            Some(layers) => layers.clone(),
            None => (0..n_layers).collect(),
        };
        if let Some(&bad) = layers.iter().find(|&&l| l >= n_layers) {
            anyhow::bail!("Layer {bad} out of range (model has {n_layers} layers)");
        }

        let token_ids = tokenizer.encode(prompt)?;
        info!("Prompt: {} tokens, {} layers", token_ids.len(), layers.len());

        let probs = if token_ids.is_empty() || layers.is_empty() {
            ProbabilityTensor::new(Vec::new(), (layers.len(), token_ids.len(), 0))?
        } else {
            let hidden = model.block_outputs(&spec.blocks, &token_ids, &layers)?;
            anyhow::ensure!(
                hidden.len() == layers.len(),
                "Model returned {} block outputs for {} layers",
                hidden.len(),
                layers.len()
            );
            let per_layer = hidden
                .iter()
                .zip(&layers)
                .map(|(h, layer)| -> Result<Tensor> {
                    let h = match h.dims() {
                        [1, _, _] => h.squeeze(0)?,
                        _ => h.clone(),
                    };
                    let logits = spec
                        .project(model, &h)
                        .with_context(|| format!("Logit lens projection failed at layer {layer}"))?
                        .to_dtype(DType::F32)?
                        .contiguous()?;
                    Ok(candle_nn::ops::softmax_last_dim(&logits)?)
                })
                .collect::<Result<Vec<Tensor>>>()?;
            ProbabilityTensor::from_layer_tensors(&per_layer)?
        };

        LensData::from_probabilities(&probs, layers, token_ids, tokenizer, &self.config)
    }
}
