// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // l, p, v, k standard in tensor code
#![allow(clippy::similar_names)] // related variables like `layer`/`layers`
#![allow(clippy::module_name_repetitions)] // WidgetData in widget.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! logitlens-rs: compact logit lens trajectories
//!
//! Reduces a `[layer][position][vocab]` probability tensor to the top-k
//! predictions per layer and position, plus the probability trajectory of
//! every token that reached the top-k at any layer.
//!
//! ## Architecture
//!
//! - `tensor`: Dense probability tensor with shape and finiteness checks
//! - `extract`: Top-k selection and cross-layer trajectory tracking
//! - `architecture`: Registry of decoder families and their module paths
//! - `tokenizer`: Tokenizer adapters (tokenizers, HuggingFace Hub)
//! - `collect`: Logit lens collection from a model run
//! - `logit_lens`: Per-position layer-by-layer view with tracked tokens
//! - `widget`: Widget payloads and the HTML fragment

pub mod architecture;
pub mod collect;
pub mod extract;
pub mod logit_lens;
pub mod tensor;
pub mod tokenizer;
pub mod widget;

pub use architecture::{Accessor, ArchitectureRegistry, ArchitectureSpec, ModelConfig, ModuleTree};
pub use collect::{decode_tracked_tokens, LensConfig, LensData, LensModel, LogitLens};
pub use extract::{
    TopKEntry, TopKGrid, TrackedPosition, TrajectoryExtraction, TrajectoryExtractor,
    PARALLEL_THRESHOLD,
};
pub use logit_lens::{LayerPredictions, PositionAnalysis, TokenPrediction};
pub use tensor::ProbabilityTensor;
pub use tokenizer::{fetch_tokenizer, format_token, load_tokenizer, IdCodec, TokenCodec};
pub use widget::{
    format_data_for_widget, render_html, round_probability, Cell, CellGrid, CellPrediction,
    HtmlOptions, WidgetData, WidgetMeta, WidgetPayload, WIDGET_VERSION,
};
