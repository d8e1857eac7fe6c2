//! Trajectory extraction: reduce a dense `[layer][position][vocab]` tensor
//! to a small per-position token set with full-depth trajectories.
//!
//! For every position, the top-k tokens of each layer are unioned into a
//! tracked set, and each tracked token's probability is then read back at
//! *every* layer. Tokens that never reach the top-k at any layer are dropped,
//! which bounds the output to `O(L·P·k)` instead of `O(L·P·V)`.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tensor::ProbabilityTensor;

/// Default tensor size (in values) from which top-k runs position-parallel
pub const PARALLEL_THRESHOLD: usize = 1 << 20;

/// One entry of a top-k list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopKEntry {
    pub token_id: u32,
    pub probability: f32,
}

/// Top-k entries for every `(layer, position)`, stored `[layer][position][k]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKGrid {
    k: usize,
    n_layers: usize,
    n_positions: usize,
    entries: Vec<TopKEntry>,
}

impl TopKGrid {
    /// A grid with no rows (zero layers or zero positions)
    pub fn empty(k: usize, n_layers: usize, n_positions: usize) -> Self {
        debug_assert!(n_layers == 0 || n_positions == 0);
        Self {
            k,
            n_layers,
            n_positions,
            entries: Vec::new(),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_positions(&self) -> usize {
        self.n_positions
    }

    /// Check that the entry buffer matches the declared shape
    pub fn validate(&self) -> Result<()> {
        let expected = self
            .n_layers
            .checked_mul(self.n_positions)
            .and_then(|n| n.checked_mul(self.k));
        anyhow::ensure!(
            expected == Some(self.entries.len()),
            "Top-k grid ({} layers, {} positions, k={}) holds {} entries",
            self.n_layers,
            self.n_positions,
            self.k,
            self.entries.len()
        );
        Ok(())
    }

    /// Top-k at `(layer, position)`, sorted descending by probability
    ///
    /// Panics if either index is out of range.
    pub fn get(&self, layer: usize, position: usize) -> &[TopKEntry] {
        assert!(layer < self.n_layers && position < self.n_positions);
        let start = (layer * self.n_positions + position) * self.k;
        &self.entries[start..start + self.k]
    }

    /// Token ids of the top-k at `(layer, position)`
    pub fn token_ids(&self, layer: usize, position: usize) -> Vec<u32> {
        self.get(layer, position).iter().map(|e| e.token_id).collect()
    }
}

/// Tracked tokens at one position and their probability at every layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    /// Ascending token ids, unique
    pub token_ids: Vec<u32>,
    /// `[n_layers][token_ids.len()]`, same column order as `token_ids`
    pub trajectories: Vec<Vec<f32>>,
}

impl TrackedPosition {
    /// Number of tracked tokens
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Check ids are strictly ascending and every layer row has one value per id
    pub fn validate(&self, n_layers: usize) -> Result<()> {
        anyhow::ensure!(
            self.token_ids.windows(2).all(|w| w[0] < w[1]),
            "Tracked token ids are not strictly ascending: {:?}",
            self.token_ids
        );
        anyhow::ensure!(
            self.trajectories.len() == n_layers,
            "Tracked trajectories cover {} layers, expected {n_layers}",
            self.trajectories.len()
        );
        if let Some((layer, row)) = self
            .trajectories
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.token_ids.len())
        {
            anyhow::bail!(
                "Trajectory row for layer {layer} has {} values for {} tracked tokens",
                row.len(),
                self.token_ids.len()
            );
        }
        Ok(())
    }

    /// Probability of `token_id` at each layer, if it is tracked here
    pub fn trajectory(&self, token_id: u32) -> Option<Vec<f32>> {
        let column = self.token_ids.binary_search(&token_id).ok()?;
        Some(self.trajectories.iter().map(|row| row[column]).collect())
    }

    /// Probabilities of all tracked tokens at one layer
    pub fn layer_row(&self, layer: usize) -> Option<&[f32]> {
        self.trajectories.get(layer).map(Vec::as_slice)
    }
}

/// Result of a full extraction: the top-k grid plus per-position tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryExtraction {
    pub top_k: TopKGrid,
    pub tracked: Vec<TrackedPosition>,
}

/// Stateless top-k / trajectory extractor
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryExtractor {
    k: usize,
    parallel: bool,
    parallel_threshold: usize,
}

impl TrajectoryExtractor {
    /// Create an extractor taking `k` entries per `(layer, position)`
    pub fn new(k: usize) -> Result<Self> {
        anyhow::ensure!(k > 0, "top_k must be at least 1");
        Ok(Self {
            k,
            parallel: true,
            parallel_threshold: PARALLEL_THRESHOLD,
        })
    }

    /// Enable or disable position-parallel top-k on large tensors
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Tensor size (in values) from which the parallel path is taken
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn runs_parallel(&self, probs: &ProbabilityTensor) -> bool {
        let (n_layers, n_positions, vocab_size) = probs.shape();
        self.parallel && n_layers * n_positions * vocab_size >= self.parallel_threshold
    }

    /// Top-k only (no tracking): the smallest possible output
    pub fn top_k(&self, probs: &ProbabilityTensor) -> Result<TopKGrid> {
        probs.validate_finite()?;
        let (n_layers, n_positions, vocab_size) = probs.shape();
        if probs.is_empty() {
            return Ok(TopKGrid::empty(self.k, n_layers, n_positions));
        }
        anyhow::ensure!(
            self.k <= vocab_size,
            "top_k ({}) exceeds vocabulary size ({vocab_size})",
            self.k
        );

        // Per position: [layer][k]
        let per_position: Vec<Vec<Vec<TopKEntry>>> =
            if self.runs_parallel(probs) {
                debug!("Parallel top-k over {n_positions} positions");
                (0..n_positions)
                    .into_par_iter()
                    .map(|p| self.position_top_k(probs, p))
                    .collect()
            } else {
                (0..n_positions)
                    .map(|p| self.position_top_k(probs, p))
                    .collect()
            };

        let mut entries = Vec::with_capacity(n_layers * n_positions * self.k);
        for layer in 0..n_layers {
            for position in &per_position {
                entries.extend_from_slice(&position[layer]);
            }
        }

        Ok(TopKGrid {
            k: self.k,
            n_layers,
            n_positions,
            entries,
        })
    }

    /// Top-k at every layer, union into tracked sets, gather trajectories
    pub fn extract(&self, probs: &ProbabilityTensor) -> Result<TrajectoryExtraction> {
        let top_k = self.top_k(probs)?;
        let (n_layers, n_positions, _) = probs.shape();
        if probs.is_empty() {
            return Ok(TrajectoryExtraction {
                top_k,
                tracked: Vec::new(),
            });
        }

        let tracked: Vec<TrackedPosition> = (0..n_positions)
            .map(|position| {
                let token_ids: Vec<u32> = (0..n_layers)
                    .flat_map(|layer| top_k.get(layer, position).iter().map(|e| e.token_id))
                    .collect::<BTreeSet<u32>>()
                    .into_iter()
                    .collect();
                let trajectories = (0..n_layers)
                    .map(|layer| {
                        let row = probs.row(layer, position);
                        token_ids.iter().map(|&t| row[t as usize]).collect()
                    })
                    .collect();
                TrackedPosition {
                    token_ids,
                    trajectories,
                }
            })
            .collect();

        debug!(
            "Tracked {} tokens across {n_positions} positions",
            tracked.iter().map(TrackedPosition::len).sum::<usize>()
        );

        Ok(TrajectoryExtraction { top_k, tracked })
    }

    fn position_top_k(&self, probs: &ProbabilityTensor, position: usize) -> Vec<Vec<TopKEntry>> {
        (0..probs.n_layers())
            .map(|layer| top_k_of_row(probs.row(layer, position), self.k))
            .collect()
    }
}

/// Descending probability, ties broken by ascending token id
fn rank(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

/// The `k` highest entries of a finite row; `k <= row.len()`
fn top_k_of_row(row: &[f32], k: usize) -> Vec<TopKEntry> {
    let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, rank);
        indexed.truncate(k);
    }
    indexed.sort_by(rank);
    indexed
        .into_iter()
        .map(|(idx, probability)| TopKEntry {
            token_id: idx as u32,
            probability,
        })
        .collect()
}
