//! Widget payloads and HTML rendering
//!
//! The interactive logit lens widget accepts two JSON layouts:
//!
//! - **v2 (compact)**: `{ meta, layers, input, tracked, topk }` where
//!   `tracked[pos]` maps token string → trajectory and `topk[layer][pos]`
//!   lists token strings. This is what [`format_data_for_widget`] produces.
//! - **v1 (cells)**: `{ layers, tokens, cells, meta }` with one fully
//!   expanded cell per `(position, layer)`.
//!
//! Anything else is rejected rather than guessed at.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::collect::LensData;
use crate::tokenizer::TokenCodec;

/// Current compact payload version
pub const WIDGET_VERSION: u32 = 2;

/// Public URL of the widget script loaded by rendered fragments
pub const WIDGET_JS_URL: &str =
    "https://davidbau.github.io/logitlenskit/js/dist/logit-lens-widget.min.js";

/// Decimal places kept for probabilities in payloads
pub const PROBABILITY_DECIMALS: i32 = 5;

/// Round a probability for transmission
pub fn round_probability(p: f32) -> f64 {
    let scale = 10f64.powi(PROBABILITY_DECIMALS);
    (f64::from(p) * scale).round() / scale
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetMeta {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for WidgetMeta {
    fn default() -> Self {
        Self {
            version: WIDGET_VERSION,
            timestamp: None,
            model: None,
        }
    }
}

/// Compact (v2) widget payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetData {
    #[serde(default)]
    pub meta: WidgetMeta,
    pub layers: Vec<usize>,
    pub input: Vec<String>,
    /// Per position: token string → probability at each layer
    pub tracked: Vec<BTreeMap<String, Vec<f64>>>,
    /// `[layer][position]` → top-k token strings, best first
    pub topk: Vec<Vec<Vec<String>>>,
}

impl WidgetData {
    /// Check that every axis agrees with `layers` and `input`
    pub fn validate(&self) -> Result<()> {
        let (n_layers, n_positions) = (self.layers.len(), self.input.len());
        anyhow::ensure!(
            self.topk.len() == n_layers,
            "topk has {} layers, expected {n_layers}",
            self.topk.len()
        );
        for (layer, row) in self.topk.iter().enumerate() {
            anyhow::ensure!(
                row.len() == n_positions,
                "topk layer {layer} has {} positions, expected {n_positions}",
                row.len()
            );
        }
        anyhow::ensure!(
            self.tracked.len() == n_positions,
            "tracked has {} positions, expected {n_positions}",
            self.tracked.len()
        );
        for (position, tokens) in self.tracked.iter().enumerate() {
            if let Some((token, trajectory)) =
                tokens.iter().find(|(_, t)| t.len() != n_layers)
            {
                anyhow::bail!(
                    "tracked token {token:?} at position {position} has {} values, expected {n_layers}",
                    trajectory.len()
                );
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build the compact payload from collected lens data
///
/// Requires tracked trajectories; top-k only data cannot drive the widget.
pub fn format_data_for_widget(
    data: &LensData,
    tokenizer: &dyn TokenCodec,
    model_name: Option<&str>,
) -> Result<WidgetData> {
    data.validate()?;
    let tracked = data
        .tracked
        .as_ref()
        .context("Widget needs tracked trajectories: collect with track_across_layers enabled")?;

    let meta = WidgetMeta {
        version: WIDGET_VERSION,
        timestamp: Some(chrono::Utc::now().to_rfc3339()),
        model: model_name.map(str::to_string),
    };

    let tracked = tracked
        .iter()
        .map(|position| {
            position
                .token_ids
                .iter()
                .enumerate()
                .map(|(column, &token_id)| {
                    let trajectory = position
                        .trajectories
                        .iter()
                        .map(|row| round_probability(row[column]))
                        .collect();
                    (tokenizer.decode_token(token_id), trajectory)
                })
                .collect()
        })
        .collect();

    let topk = (0..data.n_layers())
        .map(|layer| {
            (0..data.n_positions())
                .map(|position| {
                    data.top_k
                        .get(layer, position)
                        .iter()
                        .map(|e| tokenizer.decode_token(e.token_id))
                        .collect()
                })
                .collect()
        })
        .collect();

    Ok(WidgetData {
        meta,
        layers: data.layers.clone(),
        input: data.tokens.clone(),
        tracked,
        topk,
    })
}

/// One prediction inside an expanded cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPrediction {
    pub token: String,
    pub prob: f64,
    #[serde(default)]
    pub trajectory: Vec<f64>,
}

/// Expanded data for one `(position, layer)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Top-1 token
    pub token: String,
    pub prob: f64,
    #[serde(default)]
    pub trajectory: Vec<f64>,
    #[serde(default)]
    pub topk: Vec<CellPrediction>,
}

/// Expanded (v1) widget payload, `cells[position][layer]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellGrid {
    pub layers: Vec<usize>,
    pub tokens: Vec<String>,
    pub cells: Vec<Vec<Cell>>,
    #[serde(default)]
    pub meta: WidgetMeta,
}

/// A payload in either recognized layout
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetPayload {
    Cells(CellGrid),
    Compact(WidgetData),
}

impl WidgetPayload {
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json).context("Widget payload is not valid JSON")?;
        Self::from_value(value)
    }

    /// Detect the layout and parse it
    pub fn from_value(mut value: Value) -> Result<Self> {
        let obj = value
            .as_object_mut()
            .context("Widget payload must be a JSON object")?;

        if obj.contains_key("cells") {
            // Hybrid payloads name the token list `input`
            if !obj.contains_key("tokens") {
                if let Some(input) = obj.get("input").cloned() {
                    obj.insert("tokens".to_string(), input);
                }
            }
            let grid: CellGrid =
                serde_json::from_value(value).context("Malformed cell (v1) widget payload")?;
            debug!("Parsed v1 payload: {} positions", grid.cells.len());
            return Ok(Self::Cells(grid));
        }

        let compact_keys = ["layers", "input", "tracked", "topk"];
        if compact_keys.iter().all(|k| obj.contains_key(*k)) {
            let data: WidgetData =
                serde_json::from_value(value).context("Malformed compact (v2) widget payload")?;
            data.validate()?;
            debug!("Parsed v2 payload: {} positions", data.input.len());
            return Ok(Self::Compact(data));
        }

        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        anyhow::bail!(
            "Unrecognized widget payload with keys {keys:?}: expected `cells` (v1) \
             or `layers`/`input`/`tracked`/`topk` (v2)"
        )
    }

    /// Expand to the per-cell layout the widget renders from
    ///
    /// Compact payloads are shape-checked first.
    pub fn into_cells(self) -> Result<CellGrid> {
        match self {
            Self::Cells(grid) => Ok(grid),
            Self::Compact(data) => {
                data.validate()?;
                let cells = (0..data.input.len())
                    .map(|position| {
                        let tracked_at_pos = &data.tracked[position];
                        (0..data.layers.len())
                            .map(|layer| {
                                let topk: Vec<CellPrediction> = data.topk[layer][position]
                                    .iter()
                                    .map(|token| {
                                        let trajectory =
                                            tracked_at_pos.get(token).cloned().unwrap_or_default();
                                        CellPrediction {
                                            token: token.clone(),
                                            prob: trajectory.get(layer).copied().unwrap_or(0.0),
                                            trajectory,
                                        }
                                    })
                                    .collect();
                                let (token, prob, trajectory) = topk.first().map_or_else(
                                    || (String::new(), 0.0, Vec::new()),
                                    |top| (top.token.clone(), top.prob, top.trajectory.clone()),
                                );
                                Cell {
                                    token,
                                    prob,
                                    trajectory,
                                    topk,
                                }
                            })
                            .collect()
                    })
                    .collect();
                Ok(CellGrid {
                    layers: data.layers,
                    tokens: data.input,
                    cells,
                    meta: data.meta,
                })
            }
        }
    }
}

/// Options for [`render_html`]
#[derive(Debug, Clone, Default)]
pub struct HtmlOptions {
    pub title: Option<String>,
    /// Element id of the container (random `logit-lens-xxxxxxxx` if None)
    pub container_id: Option<String>,
}

fn random_container_id() -> String {
    format!("logit-lens-{:08x}", rand::random::<u32>())
}

/// JSON that is safe to embed inside a `<script>` element
fn script_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}

/// Render a self-contained HTML fragment that mounts the widget
pub fn render_html(data: &WidgetData, options: &HtmlOptions) -> Result<String> {
    data.validate()?;

    let container_id = options
        .container_id
        .clone()
        .unwrap_or_else(random_container_id);
    anyhow::ensure!(
        !container_id.is_empty()
            && container_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        "Invalid container id {container_id:?}: use letters, digits, '-' or '_'"
    );

    let mut ui_state = serde_json::Map::new();
    if let Some(title) = &options.title {
        ui_state.insert("title".to_string(), Value::String(title.clone()));
    }

    let data_json = script_json(data)?;
    let ui_json = script_json(&ui_state)?;

    Ok(format!(
        r##"<div id="{container_id}" style="background: white; padding: 20px; border-radius: 8px;"></div>
<script>
(function() {{
    var data = {data_json};
    var uiState = {ui_json};
    if (typeof LogitLensWidget !== 'undefined') {{
        LogitLensWidget("#{container_id}", data, uiState);
    }} else {{
        var script = document.createElement('script');
        script.src = "{WIDGET_JS_URL}";
        script.onload = function() {{
            LogitLensWidget("#{container_id}", data, uiState);
        }};
        document.head.appendChild(script);
    }}
}})();
</script>
"##
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::LensConfig;
    use crate::tensor::ProbabilityTensor;
    use crate::tokenizer::IdCodec;

    fn lens_data() -> LensData {
        let probs = ProbabilityTensor::from_nested(&[
            vec![vec![0.1, 0.4, 0.3, 0.2]],
            vec![vec![0.05, 0.05, 0.1, 0.8]],
        ])
        .unwrap();
        let config = LensConfig {
            top_k: 2,
            ..Default::default()
        };
        LensData::from_probabilities(&probs, vec![0, 1], vec![0], &IdCodec, &config).unwrap()
    }

    #[test]
    fn test_round_probability() {
        assert_eq!(round_probability(0.4), 0.4);
        assert_eq!(round_probability(0.123_456_7), 0.12346);
        assert_eq!(round_probability(1.0), 1.0);
    }

    #[test]
    fn test_format_data_for_widget() {
        let widget = format_data_for_widget(&lens_data(), &IdCodec, Some("toy")).unwrap();
        assert_eq!(widget.meta.version, 2);
        assert_eq!(widget.meta.model.as_deref(), Some("toy"));
        assert!(widget.meta.timestamp.is_some());
        assert_eq!(widget.layers, vec![0, 1]);
        assert_eq!(widget.input, vec!["<0>"]);
        assert_eq!(widget.topk[0][0], vec!["<1>", "<2>"]);
        assert_eq!(widget.topk[1][0], vec!["<3>", "<2>"]);
        assert_eq!(widget.tracked[0]["<3>"], vec![0.2, 0.8]);
        assert_eq!(widget.tracked[0]["<1>"], vec![0.4, 0.05]);
        assert!(widget.validate().is_ok());
    }

    #[test]
    fn test_top_k_only_data_rejected() {
        let mut data = lens_data();
        data.tracked = None;
        assert!(format_data_for_widget(&data, &IdCodec, None).is_err());
    }

    #[test]
    fn test_compact_payload_normalizes_to_cells() {
        let widget = format_data_for_widget(&lens_data(), &IdCodec, None).unwrap();
        let payload = WidgetPayload::from_json(&widget.to_json().unwrap()).unwrap();
        assert!(matches!(payload, WidgetPayload::Compact(_)));

        let grid = payload.into_cells().unwrap();
        assert_eq!(grid.tokens, vec!["<0>"]);
        assert_eq!(grid.cells.len(), 1);
        assert_eq!(grid.cells[0].len(), 2);
        let cell = &grid.cells[0][1];
        assert_eq!(cell.token, "<3>");
        assert_eq!(cell.prob, 0.8);
        assert_eq!(cell.trajectory, vec![0.2, 0.8]);
        assert_eq!(cell.topk[1].token, "<2>");
        assert_eq!(cell.topk[1].prob, 0.1);
    }

    #[test]
    fn test_untracked_topk_token_defaults_to_zero() {
        let json = r#"{
            "layers": [0],
            "input": ["a"],
            "tracked": [{}],
            "topk": [[["x"]]]
        }"#;
        let grid = WidgetPayload::from_json(json).unwrap().into_cells().unwrap();
        assert_eq!(grid.cells[0][0].token, "x");
        assert_eq!(grid.cells[0][0].prob, 0.0);
        assert!(grid.cells[0][0].trajectory.is_empty());
        assert_eq!(grid.meta.version, WIDGET_VERSION);
    }

    #[test]
    fn test_cell_payload_accepts_input_alias() {
        let json = r#"{
            "layers": [0],
            "input": ["a"],
            "cells": [[{"token": "b", "prob": 0.5}]]
        }"#;
        let payload = WidgetPayload::from_json(json).unwrap();
        let grid = payload.into_cells().unwrap();
        assert_eq!(grid.tokens, vec!["a"]);
        assert_eq!(grid.cells[0][0].token, "b");
    }

    #[test]
    fn test_unrecognized_payload_rejected() {
        let err = WidgetPayload::from_json(r#"{"tokens": ["a"], "probs": []}"#).unwrap_err();
        assert!(err.to_string().contains("Unrecognized widget payload"));
        assert!(WidgetPayload::from_json("[1, 2]").is_err());
        assert!(WidgetPayload::from_json("not json").is_err());
    }

    #[test]
    fn test_malformed_lens_data_rejected() {
        let mut value = serde_json::to_value(lens_data()).unwrap();
        value["tracked"][0]["token_ids"] = serde_json::json!([0, 1]);
        value["tracked"][0]["trajectories"] = serde_json::json!([[1.0]]);
        let data: LensData = serde_json::from_value(value).unwrap();
        assert!(format_data_for_widget(&data, &IdCodec, None).is_err());

        let mut value = serde_json::to_value(lens_data()).unwrap();
        value["top_k"]["k"] = serde_json::json!(3);
        value["top_k"]["entries"] = serde_json::json!([]);
        let data: LensData = serde_json::from_value(value).unwrap();
        assert!(format_data_for_widget(&data, &IdCodec, None).is_err());
    }

    #[test]
    fn test_into_cells_rejects_inconsistent_compact() {
        let mut widget = format_data_for_widget(&lens_data(), &IdCodec, None).unwrap();
        widget.topk.pop();
        let err = WidgetPayload::Compact(widget).into_cells().unwrap_err();
        assert!(err.to_string().contains("topk has 1 layers"));
    }

    #[test]
    fn test_compact_shape_mismatch_rejected() {
        let json = r#"{
            "layers": [0, 1],
            "input": ["a"],
            "tracked": [{}],
            "topk": [[["x"]]]
        }"#;
        let err = WidgetPayload::from_json(json).unwrap_err();
        assert!(err.to_string().contains("topk has 1 layers"));
    }

    #[test]
    fn test_render_html() {
        let widget = format_data_for_widget(&lens_data(), &IdCodec, None).unwrap();
        let options = HtmlOptions {
            title: Some("Capital </script> test".to_string()),
            container_id: Some("lens-1".to_string()),
        };
        let html = render_html(&widget, &options).unwrap();
        assert!(html.contains(r#"<div id="lens-1""#));
        assert!(html.contains(r##"LogitLensWidget("#lens-1", data, uiState)"##));
        assert!(html.contains(WIDGET_JS_URL));
        assert!(html.contains(r"Capital <\/script> test"));
        assert_eq!(html.matches("</script>").count(), 1);
    }

    #[test]
    fn test_render_html_container_ids() {
        let widget = format_data_for_widget(&lens_data(), &IdCodec, None).unwrap();
        let html = render_html(&widget, &HtmlOptions::default()).unwrap();
        assert!(html.contains(r#"<div id="logit-lens-"#));

        let bad = HtmlOptions {
            container_id: Some("x\" onload=\"".to_string()),
            ..Default::default()
        };
        assert!(render_html(&widget, &bad).is_err());
    }
}
