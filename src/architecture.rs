//! Model architecture registry
//!
//! Each transformer family keeps its decoder blocks, final norm and output
//! projection under different module paths. The registry maps a family name
//! to those accessors so the logit lens can be applied uniformly.
//!
//! Detection order:
//! 1. an explicit model type (alias-resolved);
//! 2. `model_type` from `config.json`, exact family or alias;
//! 3. best-effort substring match of the `architectures` names against the
//!    known families and aliases. This is a heuristic: a name that happens to
//!    contain a family string will match it.

use std::borrow::Cow;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Module, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Resolve named sub-modules of a loaded model (e.g. `"model.norm"`)
pub trait ModuleTree {
    fn module(&self, path: &str) -> Result<&dyn Module>;
}

/// How to reach a component that maps hidden states forward
pub enum Accessor<M: ?Sized> {
    /// Dot-separated module path, resolved through [`ModuleTree`]
    Path(Cow<'static, str>),
    /// Function returning the module to apply
    Module(for<'a> fn(&'a M) -> Result<&'a dyn Module>),
    /// Function computing the output directly from the hidden state
    Apply(fn(&M, &Tensor) -> Result<Tensor>),
}

impl<M: ?Sized> Accessor<M> {
    pub fn path(path: &'static str) -> Self {
        Self::Path(Cow::Borrowed(path))
    }
}

impl<M: ModuleTree + ?Sized> Accessor<M> {
    /// Run `hidden` through the component this accessor points at
    pub fn apply(&self, model: &M, hidden: &Tensor) -> Result<Tensor> {
        match self {
            Self::Path(path) => {
                let module = model
                    .module(path)
                    .with_context(|| format!("Module '{path}' not found"))?;
                Ok(module.forward(hidden)?)
            }
            Self::Module(resolve) => Ok(resolve(model)?.forward(hidden)?),
            Self::Apply(apply) => apply(model, hidden),
        }
    }
}

impl<M: ?Sized> Clone for Accessor<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Path(path) => Self::Path(path.clone()),
            Self::Module(f) => Self::Module(*f),
            Self::Apply(f) => Self::Apply(*f),
        }
    }
}

impl<M: ?Sized> std::fmt::Debug for Accessor<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Module(_) => f.write_str("Module(<fn>)"),
            Self::Apply(_) => f.write_str("Apply(<fn>)"),
        }
    }
}

/// Where one architecture family keeps the pieces the logit lens needs
pub struct ArchitectureSpec<M: ?Sized> {
    /// Registry key, lowercase
    pub family: Cow<'static, str>,
    /// Path to the list of decoder blocks whose outputs are hidden states
    pub blocks: Cow<'static, str>,
    /// Final normalization applied before the output projection
    pub final_norm: Accessor<M>,
    /// Projection from hidden states to vocabulary logits
    pub lm_head: Accessor<M>,
    /// `config.json` key holding the number of decoder blocks
    pub n_layers_key: Cow<'static, str>,
}

impl<M: ?Sized> ArchitectureSpec<M> {
    /// A family whose components are all reachable by path
    pub fn paths(
        family: &'static str,
        blocks: &'static str,
        final_norm: &'static str,
        lm_head: &'static str,
        n_layers_key: &'static str,
    ) -> Self {
        Self {
            family: Cow::Borrowed(family),
            blocks: Cow::Borrowed(blocks),
            final_norm: Accessor::path(final_norm),
            lm_head: Accessor::path(lm_head),
            n_layers_key: Cow::Borrowed(n_layers_key),
        }
    }

    /// Read the number of decoder blocks from the model config
    pub fn n_layers(&self, config: &ModelConfig) -> Result<usize> {
        config.usize_field(&self.n_layers_key)
    }

    /// Final norm followed by output projection: hidden states → logits
    pub fn project(&self, model: &M, hidden: &Tensor) -> Result<Tensor>
    where
        M: ModuleTree,
    {
        let normed = self.final_norm.apply(model, hidden)?;
        self.lm_head.apply(model, &normed)
    }
}

impl<M: ?Sized> std::fmt::Debug for ArchitectureSpec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchitectureSpec")
            .field("family", &self.family)
            .field("blocks", &self.blocks)
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .field("n_layers_key", &self.n_layers_key)
            .finish()
    }
}

impl<M: ?Sized> Clone for ArchitectureSpec<M> {
    fn clone(&self) -> Self {
        Self {
            family: self.family.clone(),
            blocks: self.blocks.clone(),
            final_norm: self.final_norm.clone(),
            lm_head: self.lm_head.clone(),
            n_layers_key: self.n_layers_key.clone(),
        }
    }
}

/// Fields of a HuggingFace `config.json` used for detection and layer count
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub architectures: Option<Vec<String>>,
    /// Everything else in the file
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    /// Load from a `config.json` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config: {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse model config")
    }

    /// A non-negative integer field, e.g. `num_hidden_layers`
    pub fn usize_field(&self, key: &str) -> Result<usize> {
        let value = self
            .extra
            .get(key)
            .with_context(|| format!("Model config has no '{key}' field"))?;
        let n = value
            .as_u64()
            .with_context(|| format!("Model config field '{key}' is not an integer: {value}"))?;
        Ok(usize::try_from(n)?)
    }
}

/// Immutable lookup table from family name to [`ArchitectureSpec`]
///
/// Build it once (usually with [`ArchitectureRegistry::builtin`]), optionally
/// extend it with custom families, then hand it to the collector.
pub struct ArchitectureRegistry<M: ?Sized> {
    families: Vec<ArchitectureSpec<M>>,
    aliases: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

impl<M: ?Sized> std::fmt::Debug for ArchitectureRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchitectureRegistry")
            .field("families", &self.family_names())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl<M: ?Sized> Clone for ArchitectureRegistry<M> {
    fn clone(&self) -> Self {
        Self {
            families: self.families.clone(),
            aliases: self.aliases.clone(),
        }
    }
}

impl<M: ?Sized> Default for ArchitectureRegistry<M> {
    fn default() -> Self {
        Self::builtin()
    }
}

impl<M: ?Sized> ArchitectureRegistry<M> {
    /// The built-in families, in detection order
    pub fn builtin() -> Self {
        let families = vec![
            ArchitectureSpec::paths("llama", "model.layers", "model.norm", "lm_head", "num_hidden_layers"),
            ArchitectureSpec::paths("mistral", "model.layers", "model.norm", "lm_head", "num_hidden_layers"),
            ArchitectureSpec::paths("qwen2", "model.layers", "model.norm", "lm_head", "num_hidden_layers"),
            ArchitectureSpec::paths("gpt2", "transformer.h", "transformer.ln_f", "lm_head", "n_layer"),
            ArchitectureSpec::paths("gptj", "transformer.h", "transformer.ln_f", "lm_head", "n_layer"),
            ArchitectureSpec::paths(
                "gpt_neox",
                "gpt_neox.layers",
                "gpt_neox.final_layer_norm",
                "embed_out",
                "num_hidden_layers",
            ),
            ArchitectureSpec::paths(
                "olmo",
                "model.transformer.blocks",
                "model.transformer.ln_f",
                "model.transformer.ff_out",
                "n_layers",
            ),
            ArchitectureSpec::paths(
                "phi",
                "model.layers",
                "model.final_layernorm",
                "lm_head",
                "num_hidden_layers",
            ),
            ArchitectureSpec::paths("gemma", "model.layers", "model.norm", "lm_head", "num_hidden_layers"),
        ];

        let aliases = [
            ("llama2", "llama"),
            ("llama3", "llama"),
            ("codellama", "llama"),
            ("pythia", "gpt_neox"),
            ("gpt-j", "gptj"),
            ("gpt-neox", "gpt_neox"),
            ("qwen", "qwen2"),
            ("gemma2", "gemma"),
            ("phi3", "phi"),
            ("phi-3", "phi"),
        ]
        .into_iter()
        .map(|(alias, target)| (Cow::Borrowed(alias), Cow::Borrowed(target)))
        .collect();

        Self { families, aliases }
    }

    /// Add or replace a family
    pub fn with_family(mut self, spec: ArchitectureSpec<M>) -> Self {
        if let Some(existing) = self.families.iter_mut().find(|f| f.family == spec.family) {
            *existing = spec;
        } else {
            self.families.push(spec);
        }
        self
    }

    /// Add or replace an alias pointing at an existing family
    pub fn with_alias(
        mut self,
        alias: impl Into<Cow<'static, str>>,
        target: impl Into<Cow<'static, str>>,
    ) -> Self {
        let alias = alias.into().to_lowercase();
        let target = target.into();
        self.aliases.retain(|(a, _)| *a != alias);
        self.aliases.push((Cow::Owned(alias), target));
        self
    }

    /// Names of all registered families
    pub fn family_names(&self) -> Vec<&str> {
        self.families.iter().map(|f| &*f.family).collect()
    }

    /// Look up a family by name, then by alias (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&ArchitectureSpec<M>> {
        let name = name.to_lowercase();
        if let Some(spec) = self.families.iter().find(|f| f.family == name) {
            return Some(spec);
        }
        let (_, target) = self.aliases.iter().find(|(alias, _)| *alias == name)?;
        self.families.iter().find(|f| f.family == *target)
    }

    /// Pick the spec for a model: explicit type if given, otherwise detected
    pub fn resolve(
        &self,
        config: &ModelConfig,
        model_type: Option<&str>,
    ) -> Result<&ArchitectureSpec<M>> {
        match model_type {
            Some(name) => self.get(name).with_context(|| {
                format!(
                    "Unknown model type: {name}. Supported types: {:?}",
                    self.family_names()
                )
            }),
            None => self.detect(config),
        }
    }

    /// Detect the family from `config.json` contents
    pub fn detect(&self, config: &ModelConfig) -> Result<&ArchitectureSpec<M>> {
        let model_type = config.model_type.as_deref().unwrap_or("").to_lowercase();

        if !model_type.is_empty() {
            if let Some(spec) = self.get(&model_type) {
                debug!("Architecture '{}' from model_type", spec.family);
                return Ok(spec);
            }
        }

        for arch in config.architectures.iter().flatten() {
            let arch_lower = arch.to_lowercase();
            if let Some(spec) = self
                .families
                .iter()
                .find(|f| arch_lower.contains(&*f.family))
            {
                debug!("Architecture '{}' guessed from '{arch}'", spec.family);
                return Ok(spec);
            }
            for (alias, target) in &self.aliases {
                let squashed = alias.replace(['-', '_'], "");
                if arch_lower.contains(&squashed) {
                    if let Some(spec) = self.get(target) {
                        debug!("Architecture '{}' guessed from '{arch}' via alias '{alias}'", spec.family);
                        return Ok(spec);
                    }
                }
            }
        }

        anyhow::bail!(
            "Unknown model type: '{model_type}'. Supported types: {:?}. \
             Pass a model type explicitly or register a custom architecture.",
            self.family_names()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config(model_type: &str, architectures: &[&str]) -> ModelConfig {
        ModelConfig {
            model_type: Some(model_type.to_string()),
            architectures: Some(architectures.iter().map(|s| s.to_string()).collect()),
            extra: serde_json::Map::new(),
        }
    }

    struct Doubler;

    impl Module for Doubler {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            xs.affine(2.0, 0.0)
        }
    }

    struct Toy {
        norm: Doubler,
    }

    impl ModuleTree for Toy {
        fn module(&self, path: &str) -> Result<&dyn Module> {
            match path {
                "model.norm" => Ok(&self.norm),
                _ => anyhow::bail!("no module {path}"),
            }
        }
    }

    #[test]
    fn test_builtin_families() {
        let registry = ArchitectureRegistry::<Toy>::builtin();
        assert_eq!(registry.family_names().len(), 9);
        let gpt2 = registry.get("gpt2").unwrap();
        assert_eq!(gpt2.blocks, "transformer.h");
        assert!(matches!(&gpt2.final_norm, Accessor::Path(p) if p == "transformer.ln_f"));
        assert_eq!(gpt2.n_layers_key, "n_layer");
    }

    #[test]
    fn test_aliases() {
        let registry = ArchitectureRegistry::<Toy>::builtin();
        assert_eq!(registry.get("pythia").unwrap().family, "gpt_neox");
        assert_eq!(registry.get("Llama3").unwrap().family, "llama");
        assert_eq!(registry.get("codellama").unwrap().family, "llama");
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_family_name_wins_over_shadowing_alias() {
        let registry = ArchitectureRegistry::<Toy>::builtin().with_alias("gpt2", "llama");
        assert_eq!(registry.get("gpt2").unwrap().family, "gpt2");
        assert_eq!(registry.detect(&config("gpt2", &[])).unwrap().family, "gpt2");
    }

    #[test]
    fn test_detect_direct_and_alias() {
        let registry = ArchitectureRegistry::<Toy>::builtin();
        assert_eq!(registry.detect(&config("llama", &[])).unwrap().family, "llama");
        assert_eq!(registry.detect(&config("pythia", &[])).unwrap().family, "gpt_neox");
    }

    #[test]
    fn test_detect_architecture_fallback() {
        let registry = ArchitectureRegistry::<Toy>::builtin();
        let cases = [
            ("LlamaForCausalLM", "llama"),
            ("GPTNeoXForCausalLM", "gpt_neox"),
            ("Qwen2ForCausalLM", "qwen2"),
            ("Phi3ForCausalLM", "phi"),
            ("GPT2LMHeadModel", "gpt2"),
        ];
        for (arch, family) in cases {
            let spec = registry.detect(&config("", &[arch])).unwrap();
            assert_eq!(spec.family, family, "{arch}");
        }
    }

    #[test]
    fn test_unknown_model_names_supported_set() {
        let registry = ArchitectureRegistry::<Toy>::builtin();
        let err = registry.detect(&config("unknown", &[])).unwrap_err().to_string();
        assert!(err.contains("Unknown model type"));
        assert!(err.contains("gpt_neox"));

        let err = registry.resolve(&config("llama", &[]), Some("bert")).unwrap_err();
        assert!(err.to_string().contains("Unknown model type: bert"));
    }

    #[test]
    fn test_resolve_prefers_explicit_type() {
        let registry = ArchitectureRegistry::<Toy>::builtin();
        let spec = registry.resolve(&config("gpt2", &[]), Some("llama")).unwrap();
        assert_eq!(spec.family, "llama");
        let spec = registry.resolve(&config("gpt2", &[]), None).unwrap();
        assert_eq!(spec.family, "gpt2");
    }

    #[test]
    fn test_custom_family_and_alias() {
        fn toy_norm(m: &Toy) -> Result<&dyn Module> {
            Ok(&m.norm)
        }
        fn halve(_: &Toy, h: &Tensor) -> Result<Tensor> {
            Ok(h.affine(0.5, 0.0)?)
        }
        let registry = ArchitectureRegistry::<Toy>::builtin()
            .with_family(ArchitectureSpec {
                family: "toy".into(),
                blocks: "blocks".into(),
                final_norm: Accessor::Module(toy_norm),
                lm_head: Accessor::Apply(halve),
                n_layers_key: "depth".into(),
            })
            .with_alias("ToyNet", "toy");

        let spec = registry.get("toynet").unwrap();
        let hidden = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let out = spec.project(&Toy { norm: Doubler }, &hidden).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_path_accessor_resolves_through_tree() {
        let toy = Toy { norm: Doubler };
        let hidden = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let out = Accessor::<Toy>::path("model.norm").apply(&toy, &hidden).unwrap();
        assert_eq!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);

        let err = Accessor::<Toy>::path("lm_head").apply(&toy, &hidden).unwrap_err();
        assert!(err.to_string().contains("lm_head"));
    }

    #[test]
    fn test_model_config_layer_count() {
        let cfg = ModelConfig::from_json(
            r#"{"model_type": "gpt2", "n_layer": 12, "architectures": ["GPT2LMHeadModel"]}"#,
        )
        .unwrap();
        let registry = ArchitectureRegistry::<Toy>::builtin();
        let spec = registry.detect(&cfg).unwrap();
        assert_eq!(spec.n_layers(&cfg).unwrap(), 12);

        let missing = ModelConfig::from_json(r#"{"model_type": "llama"}"#).unwrap();
        assert!(spec.n_layers(&missing).is_err());
    }
}
