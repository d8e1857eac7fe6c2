//! logitlens-rs CLI: reduce a saved logit lens tensor and render it

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use logitlens_rs::{
    fetch_tokenizer, format_data_for_widget, load_tokenizer, render_html, HtmlOptions, IdCodec,
    LensConfig, LensData, ProbabilityTensor, TokenCodec,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "logitlens-rs")]
#[command(about = "Top-k trajectory extraction for logit lens tensors")]
#[command(version)]
struct Cli {
    /// Safetensors file holding a (layers, positions, vocab) tensor
    #[arg(short, long)]
    probs: PathBuf,

    /// Name of the tensor inside the file
    #[arg(long, default_value = "probs")]
    tensor: String,

    /// The tensor holds raw logits; apply softmax first
    #[arg(long)]
    logits: bool,

    /// Lens configuration JSON (flags below override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of top predictions per layer and position
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Top-k only: skip cross-layer trajectory tracking
    #[arg(long)]
    no_track: bool,

    /// Layer labels for the tensor's layer axis (default: 0..layers)
    #[arg(long, value_delimiter = ',')]
    layers: Option<Vec<usize>>,

    /// Local tokenizer.json for labels
    #[arg(long, conflicts_with = "tokenizer_repo")]
    tokenizer: Option<PathBuf>,

    /// HuggingFace model ID to fetch tokenizer.json from
    #[arg(long)]
    tokenizer_repo: Option<String>,

    /// Model name recorded in the widget metadata
    #[arg(long)]
    model_name: Option<String>,

    /// Position to summarize on stdout (default: last)
    #[arg(long)]
    position: Option<usize>,

    /// Print every layer's top-k and tracked tokens instead of the top-1 summary
    #[arg(long)]
    detailed: bool,

    /// Write the reduced data as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write a self-contained HTML widget fragment
    #[arg(long)]
    html: Option<PathBuf>,

    /// Widget title
    #[arg(long)]
    title: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => LensConfig::load(path)?,
        None => LensConfig::default(),
    };
    if let Some(k) = cli.top_k {
        config.top_k = k;
    }
    if cli.no_track {
        config.track_across_layers = false;
    }
    info!("Config: {:?}", config);

    let tokenizer: Box<dyn TokenCodec> = match (&cli.tokenizer, &cli.tokenizer_repo) {
        (Some(path), _) => Box::new(load_tokenizer(path)?),
        (None, Some(repo)) => Box::new(fetch_tokenizer(repo)?),
        (None, None) => Box::new(IdCodec),
    };

    // Load tensors
    info!("Loading {}", cli.probs.display());
    let tensors = candle_core::safetensors::load(&cli.probs, &Device::Cpu)
        .with_context(|| format!("Failed to read {}", cli.probs.display()))?;
    let raw = tensors.get(&cli.tensor).with_context(|| {
        let mut names: Vec<&String> = tensors.keys().collect();
        names.sort();
        format!("No tensor '{}' in file (found {names:?})", cli.tensor)
    })?;
    let probs = if cli.logits {
        ProbabilityTensor::from_logits(raw)?
    } else {
        ProbabilityTensor::from_tensor(raw)?
    };
    let (n_layers, n_positions, vocab_size) = probs.shape();
    info!("Tensor: {n_layers} layers, {n_positions} positions, {vocab_size} vocab");

    let token_ids = match tensors.get("input_ids") {
        Some(ids) => input_ids(ids)?,
        None => (0..n_positions as u32).collect(),
    };
    let layers = cli
        .layers
        .clone()
        .or_else(|| config.layers.clone())
        .unwrap_or_else(|| (0..n_layers).collect());

    let data = LensData::from_probabilities(&probs, layers, token_ids, tokenizer.as_ref(), &config)?;

    if n_positions > 0 {
        let position = cli.position.unwrap_or(n_positions - 1);
        let analysis = data.analysis(position, tokenizer.as_ref())?;
        if cli.detailed {
            print!("{}", analysis.detailed());
        } else {
            print!("{}", analysis.summary());
        }
    }

    if let Some(tracked) = &data.tracked {
        let total: usize = tracked.iter().map(|t| t.len()).sum();
        info!(
            "Tracked {} tokens ({:.1} per position)",
            total,
            total as f64 / n_positions.max(1) as f64
        );
    }

    if let Some(path) = &cli.json {
        std::fs::write(path, serde_json::to_string_pretty(&data)?)?;
        info!("Data saved to {}", path.display());
    }

    if let Some(path) = &cli.html {
        let widget = format_data_for_widget(&data, tokenizer.as_ref(), cli.model_name.as_deref())?;
        let options = HtmlOptions {
            title: cli.title.clone(),
            container_id: None,
        };
        std::fs::write(path, render_html(&widget, &options)?)?;
        info!("Widget saved to {}", path.display());
    }

    Ok(())
}

/// Read a `(positions,)` or `(1, positions)` id tensor as u32
fn input_ids(ids: &Tensor) -> Result<Vec<u32>> {
    let ids = ids.flatten_all()?.to_dtype(DType::U32)?;
    Ok(ids.to_vec1()?)
}
