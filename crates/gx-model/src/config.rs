//! Parsed `genai_config.json`.
//!
//! The document is read once and treated as immutable by every component.
//! `Config::overlay` exists for callers that adjust a configuration (for
//! example to enable compilation) before handing it to `Model::new`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};

/// Stage id of the primary decoder session.
pub const DECODER_STAGE: &str = "decoder";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the configuration was loaded from. Model, tokenizer and
    /// artifact paths are resolved against it.
    #[serde(skip)]
    pub config_path: PathBuf,
    pub model: ModelConfig,
    pub search: SearchConfig,
}

impl Config {
    pub const FILENAME: &'static str = "genai_config.json";

    /// Load `genai_config.json` from a model directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let path = dir.join(Self::FILENAME);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ModelError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text, dir)
    }

    /// Parse a configuration document, resolving relative paths against `dir`.
    pub fn from_json(json: &str, dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let mut config: Config = serde_json::from_str(json).map_err(|source| ModelError::Json {
            path: dir.join(Self::FILENAME),
            source,
        })?;
        config.config_path = dir.to_path_buf();
        Ok(config)
    }

    /// Deep-merge a JSON document into this configuration. Objects merge key
    /// by key; any other value replaces what was there.
    pub fn overlay(&mut self, json: &str) -> Result<()> {
        let json_error = |source| ModelError::Json {
            path: self.config_path.join(Self::FILENAME),
            source,
        };
        let patch: Value = serde_json::from_str(json).map_err(json_error)?;
        let mut current = serde_json::to_value(&*self).map_err(json_error)?;
        merge_json(&mut current, patch);
        let mut merged: Config = serde_json::from_value(current).map_err(json_error)?;
        merged.config_path = std::mem::take(&mut self.config_path);
        *self = merged;
        Ok(())
    }

    /// Resolve a file name from the configuration against the config directory.
    pub fn resolve(&self, filename: impl AsRef<Path>) -> PathBuf {
        self.config_path.join(filename)
    }
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

/// One token id or a list of them (`eos_token_id` accepts both).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    One(i32),
    Many(Vec<i32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<i32> {
        match self {
            TokenIds::One(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

impl Default for TokenIds {
    fn default() -> Self {
        TokenIds::Many(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub model_type: String,
    pub bos_token_id: Option<i32>,
    pub eos_token_id: TokenIds,
    pub pad_token_id: Option<i32>,
    pub context_length: usize,
    pub vocab_size: usize,
    pub decoder: DecoderConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<VisionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub filename: String,
    pub session_options: SessionOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_options: Option<CompileOptions>,
    pub run_options: BTreeMap<String, String>,
    pub head_size: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
    pub inputs: DecoderInputs,
    pub outputs: DecoderOutputs,
    /// Ordered stages, each a single-key object `{ "<stage id>": { ... } }`.
    pub pipeline: Vec<BTreeMap<String, PipelineModel>>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            filename: "model.onnx".to_string(),
            session_options: SessionOptions::default(),
            compile_options: None,
            run_options: BTreeMap::new(),
            head_size: 0,
            hidden_size: 0,
            num_attention_heads: 0,
            num_hidden_layers: 0,
            num_key_value_heads: 0,
            inputs: DecoderInputs::default(),
            outputs: DecoderOutputs::default(),
            pipeline: Vec::new(),
        }
    }
}

impl DecoderConfig {
    /// Pipeline stages in execution order.
    pub fn pipeline_models(&self) -> impl Iterator<Item = (&str, &PipelineModel)> {
        self.pipeline
            .iter()
            .flat_map(|stage| stage.iter().map(|(id, model)| (id.as_str(), model)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderInputs {
    pub input_ids: String,
    pub inputs_embeds: String,
    pub attention_mask: String,
    pub position_ids: String,
    /// Name template with `%d` standing for the layer index.
    pub past_key_names: String,
    pub past_value_names: String,
}

impl Default for DecoderInputs {
    fn default() -> Self {
        Self {
            input_ids: "input_ids".to_string(),
            inputs_embeds: "inputs_embeds".to_string(),
            attention_mask: "attention_mask".to_string(),
            position_ids: "position_ids".to_string(),
            past_key_names: "past_key_values.%d.key".to_string(),
            past_value_names: "past_key_values.%d.value".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderOutputs {
    pub logits: String,
    pub present_key_names: String,
    pub present_value_names: String,
}

impl Default for DecoderOutputs {
    fn default() -> Self {
        Self {
            logits: "logits".to_string(),
            present_key_names: "present.%d.key".to_string(),
            present_value_names: "present.%d.value".to_string(),
        }
    }
}

/// Substitute the layer index into a `%d` name template.
pub fn layer_name(template: &str, layer: usize) -> String {
    template.replacen("%d", &layer.to_string(), 1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineModel {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_options: Option<SessionOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_options: Option<CompileOptions>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Renames a stage output before later stages (and the next step) see it.
    pub output_names_forwarder: BTreeMap<String, String>,
    pub run_on_prompt: bool,
    pub run_on_token_gen: bool,
}

impl Default for PipelineModel {
    fn default() -> Self {
        Self {
            filename: String::new(),
            session_options: None,
            compile_options: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_names_forwarder: BTreeMap::new(),
            run_on_prompt: true,
            run_on_token_gen: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Execution providers in priority order, each `{ "<name>": { options } }`.
    pub provider_options: Vec<BTreeMap<String, BTreeMap<String, String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_severity_level: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_optimization_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intra_op_num_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inter_op_num_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_cpu_mem_arena: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_profiling: Option<String>,
    pub config_entries: BTreeMap<String, String>,
}

impl SessionOptions {
    /// Providers in priority order as `(name, options)`.
    pub fn providers(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.provider_options
            .iter()
            .flat_map(|p| p.iter().map(|(name, opts)| (name.as_str(), opts)))
    }

    /// Name of the highest-priority provider, if any is configured.
    pub fn primary_provider(&self) -> Option<&str> {
        self.providers().next().map(|(name, _)| name)
    }

    /// True when any provider asks for graph capture.
    pub fn graph_capture_enabled(&self) -> bool {
        const KEYS: [&str; 3] = ["enable_cuda_graph", "enable_graph_capture", "enableGraphCapture"];
        self.providers().any(|(_, opts)| {
            KEYS.iter()
                .filter_map(|k| opts.get(*k))
                .any(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_ep_context: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_optimization_level: Option<i32>,
    /// Artifact path relative to the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ep_context_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ep_context_embed_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_compile_if_needed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_initializers_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_initializers_size_threshold: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub inputs: VisionInputs,
    /// Side length for processors that require square inputs.
    pub image_size: usize,
    /// Patch side used to derive the number of image tokens.
    pub crop_size: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
    pub mm_tokens_per_image: usize,
    /// Placeholder id image tokens expand to, for processors that use one.
    pub image_token_id: i32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            filename: None,
            inputs: VisionInputs::default(),
            image_size: 896,
            crop_size: 336,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            rescale_factor: 1.0 / 255.0,
            mm_tokens_per_image: 256,
            image_token_id: 200_010,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionInputs {
    pub pixel_values: String,
    pub image_sizes: String,
}

impl Default for VisionInputs {
    fn default() -> Self {
        Self {
            pixel_values: "pixel_values".to_string(),
            image_sizes: "image_sizes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub inputs: SpeechInputs,
    pub sample_rate: u32,
    /// Seconds of audio per chunk fed to the encoder.
    pub chunk_length: usize,
    /// Placeholder id audio tokens expand to, for processors that use one.
    pub audio_token_id: i32,
    /// 10 ms feature frames folded into one audio token.
    pub audio_compression_rate: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            filename: None,
            inputs: SpeechInputs::default(),
            sample_rate: 16_000,
            chunk_length: 30,
            audio_token_id: 200_011,
            audio_compression_rate: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechInputs {
    pub audio_features: String,
    pub audio_sizes: String,
}

impl Default for SpeechInputs {
    fn default() -> Self {
        Self {
            audio_features: "audio_features".to_string(),
            audio_sizes: "audio_sizes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Zero means "use the model's context length".
    pub max_length: usize,
    pub num_beams: usize,
    pub batch_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_length: 0,
            num_beams: 1,
            batch_size: 1,
        }
    }
}
