//! Per-position logit lens view
//!
//! For one input position, lists what each layer would predict if it were
//! the last layer. Alongside each layer's top-k, tokens from the position's
//! tracked set that sit outside that layer's top-k are listed too, so a
//! token can be followed as it rises into or falls out of the top-k.

use std::fmt::Write;

use crate::tokenizer::format_token;

/// A decoded token with its probability at one layer
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub token: String,
    pub probability: f32,
}

/// Predictions at one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPredictions {
    pub layer: usize,
    /// Best first
    pub top_k: Vec<TokenPrediction>,
    /// Tracked tokens not in this layer's top-k, best first
    pub tracked_outside: Vec<TokenPrediction>,
}

impl LayerPredictions {
    /// `token` anywhere at this layer, top-k first
    fn find(&self, token: &str) -> Option<&TokenPrediction> {
        self.top_k
            .iter()
            .chain(&self.tracked_outside)
            .find(|p| p.token == token)
    }
}

/// Layer-by-layer predictions at one input position
#[derive(Debug, Clone, PartialEq)]
pub struct PositionAnalysis {
    pub position: usize,
    /// Input token at `position`
    pub input_token: String,
    pub layers: Vec<LayerPredictions>,
}

impl PositionAnalysis {
    /// Top-1 token and probability per layer
    pub fn top1(&self) -> Vec<(usize, &str, f32)> {
        self.layers
            .iter()
            .filter_map(|l| l.top_k.first().map(|p| (l.layer, p.token.as_str(), p.probability)))
            .collect()
    }

    /// First layer whose best `k` predictions contain `token` (exact match)
    pub fn first_layer_in_top(&self, token: &str, k: usize) -> Option<usize> {
        self.layers
            .iter()
            .find(|l| l.top_k.iter().take(k).any(|p| p.token == token))
            .map(|l| l.layer)
    }

    /// Probability of `token` at every layer where it is known
    ///
    /// Layers where the token is neither in the top-k nor tracked are skipped.
    pub fn trajectory(&self, token: &str) -> Vec<(usize, f32)> {
        self.layers
            .iter()
            .filter_map(|l| l.find(token).map(|p| (l.layer, p.probability)))
            .collect()
    }

    /// One line per layer: top-1 and how many tracked tokens lie outside the top-k
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Position {} (input \"{}\")",
            self.position,
            format_token(&self.input_token)
        );
        for layer in &self.layers {
            let Some(top) = layer.top_k.first() else {
                continue;
            };
            let _ = write!(
                out,
                "  L{:<3} {:>14} {:6.2}%",
                layer.layer,
                format!("\"{}\"", format_token(&top.token)),
                top.probability * 100.0
            );
            if !layer.tracked_outside.is_empty() {
                let _ = write!(out, "  (+{} tracked)", layer.tracked_outside.len());
            }
            out.push('\n');
        }
        out
    }

    /// Every top-k entry per layer, then tracked tokens outside it marked `~`
    pub fn detailed(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Position {} (input \"{}\")",
            self.position,
            format_token(&self.input_token)
        );
        for layer in &self.layers {
            let _ = writeln!(out, "L{}", layer.layer);
            for (rank, p) in layer.top_k.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "  {:>2} {:>16} {:7.3}%",
                    rank + 1,
                    format!("\"{}\"", format_token(&p.token)),
                    p.probability * 100.0
                );
            }
            for p in &layer.tracked_outside {
                let _ = writeln!(
                    out,
                    "   ~ {:>16} {:7.3}%",
                    format!("\"{}\"", format_token(&p.token)),
                    p.probability * 100.0
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(token_id: u32, token: &str, probability: f32) -> TokenPrediction {
        TokenPrediction {
            token_id,
            token: token.to_string(),
            probability,
        }
    }

    fn capital() -> PositionAnalysis {
        PositionAnalysis {
            position: 3,
            input_token: " of".to_string(),
            layers: vec![
                LayerPredictions {
                    layer: 0,
                    top_k: vec![pred(1, " the", 0.5)],
                    tracked_outside: vec![pred(2, " Paris", 0.01)],
                },
                LayerPredictions {
                    layer: 4,
                    top_k: vec![pred(2, " Paris", 0.6)],
                    tracked_outside: vec![pred(1, " the", 0.1)],
                },
            ],
        }
    }

    #[test]
    fn test_top1_and_first_layer() {
        let analysis = capital();
        assert_eq!(analysis.top1(), vec![(0, " the", 0.5), (4, " Paris", 0.6)]);
        assert_eq!(analysis.first_layer_in_top(" Paris", 1), Some(4));
        // Exact match: a substring does not count
        assert_eq!(analysis.first_layer_in_top("Paris", 1), None);
    }

    #[test]
    fn test_trajectory_uses_tracked_tokens() {
        let analysis = capital();
        assert_eq!(analysis.trajectory(" Paris"), vec![(0, 0.01), (4, 0.6)]);
        assert!(analysis.trajectory(" Rome").is_empty());
    }

    #[test]
    fn test_summary_and_detailed_text() {
        let analysis = capital();
        let summary = analysis.summary();
        assert!(summary.starts_with("Position 3 (input \" of\")"));
        assert_eq!(summary.matches("(+1 tracked)").count(), 2);

        let detailed = analysis.detailed();
        assert!(detailed.contains("\" Paris\""));
        assert_eq!(detailed.matches("   ~ ").count(), 2);
    }
}
