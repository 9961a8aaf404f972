//! Fixtures shared by the unit tests: a tiny BPE vocabulary, an in-memory
//! engine whose "model files" are JSON graph descriptions, and helpers that
//! lay out a model directory on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gx_tensor::{DType, DeviceInterface, DeviceType, Shape, Tensor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{Config, SessionOptions};
use crate::engine::{
    CompileRequest, Dim, EngineError, InferenceEngine, IoBinding, ModelCompatibility, RunOptions,
    Session, TensorMetadata,
};
use crate::model::Model;
use crate::session_info::SessionInfo;
use crate::tokenizer::{BpeTokenizer, Tokenizer, Vocab};

pub(crate) const TOKENIZER_JSON: &str = r#"{
  "model": {
    "type": "BPE",
    "unk_token": "<unk>",
    "vocab": {
      "<unk>": 0, "<s>": 1, "</s>": 2, "▁": 3,
      "h": 4, "e": 5, "l": 6, "o": 7, "w": 8, "r": 9, "d": 10,
      "he": 11, "ll": 12, "hell": 13, "hello": 14,
      "▁w": 15, "or": 16, "▁wor": 17, "▁world": 18, "▁worl": 29,
      "<0xE2>": 20, "<0x82>": 21, "<0xAC>": 22, "<0xC3>": 23, "<0xA9>": 24,
      "\n": 28
    },
    "merges": ["h e", "l l", "he ll", "hell o", "▁ w", "o r", "▁w or", "▁wor l", "▁worl d"]
  },
  "added_tokens": [
    {"id": 1, "content": "<s>", "special": true},
    {"id": 2, "content": "</s>", "special": true},
    {"id": 19, "content": "<|end|>", "special": true},
    {"id": 25, "content": "<start_of_image>", "special": true},
    {"id": 26, "content": "<image_soft_token>", "special": true},
    {"id": 27, "content": "<end_of_image>", "special": true},
    {"id": 30, "content": "<|user|>", "special": true},
    {"id": 31, "content": "<|assistant|>", "special": true}
  ]
}"#;

const CHAT_TEMPLATE: &str = "{{ bos_token }}{% for m in messages %}<|{{ m.role }}|>\n\
{{ m.content }}{{ eos_token }}\n{% endfor %}{% if add_generation_prompt %}<|assistant|>\n{% endif %}";

pub(crate) const VOCAB_SIZE: usize = 32;
pub(crate) const KV_HEADS: usize = 2;
pub(crate) const HEAD_SIZE: usize = 2;

/// Tokenizer over `TOKENIZER_JSON` with bos 1 and eos `[2, 19]`.
pub(crate) fn tiny_tokenizer() -> Arc<Tokenizer> {
    let vocab = Vocab::from_json(TOKENIZER_JSON).unwrap();
    let config =
        Config::from_json(r#"{"model": {"bos_token_id": 1, "eos_token_id": [2, 19]}}"#, ".").unwrap();
    Arc::new(Tokenizer::with_engine(Box::new(BpeTokenizer::new(vocab)), &config).unwrap())
}

/// A session that only declares tensors.
#[derive(Debug, Default)]
pub(crate) struct StubSession {
    pub inputs: Vec<TensorMetadata>,
    pub outputs: Vec<TensorMetadata>,
}

impl Session for StubSession {
    fn inputs(&self) -> &[TensorMetadata] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorMetadata] {
        &self.outputs
    }

    fn run(&self, _: IoBinding<'_>, _: &RunOptions) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Session info declaring `input_ids` with the given element type.
pub(crate) fn declared_info(dtype: DType) -> SessionInfo {
    let session = StubSession {
        inputs: vec![TensorMetadata::new(
            "input_ids",
            dtype,
            vec![Dim::Symbolic("batch".into()), Dim::Symbolic("seq".into())],
        )],
        outputs: Vec::new(),
    };
    let mut info = SessionInfo::new();
    info.add(&session);
    info
}

/// Records the run options of every invocation.
#[derive(Debug, Default)]
pub(crate) struct RecordingSession {
    runs: Mutex<Vec<RunOptions>>,
}

impl RecordingSession {
    pub fn runs(&self) -> Vec<RunOptions> {
        self.runs.lock().clone()
    }
}

impl Session for RecordingSession {
    fn inputs(&self) -> &[TensorMetadata] {
        &[]
    }

    fn outputs(&self) -> &[TensorMetadata] {
        &[]
    }

    fn run(&self, _: IoBinding<'_>, options: &RunOptions) -> Result<(), EngineError> {
        self.runs.lock().push(options.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockDevice(pub DeviceType);

impl DeviceInterface for MockDevice {
    fn device_type(&self) -> DeviceType {
        self.0
    }

    fn allocate(&self, dtype: DType, shape: Shape) -> gx_tensor::Result<Tensor> {
        Ok(Tensor::zeros(dtype, shape).to_device(self.0))
    }

    fn copy_from(&self, tensor: &Tensor) -> gx_tensor::Result<Tensor> {
        Ok(tensor.clone().to_device(self.0))
    }
}

/// Contents of a mock model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum MockGraph {
    /// `input_ids` in, `inputs_embeds` (`[batch, seq, 1]`, the token ids) out.
    Embeddings,
    /// Decoder reading token values from `tokens_input`.
    Decoder {
        tokens_input: String,
        layers: Vec<usize>,
        extra_inputs: Vec<String>,
        /// Outputs carrying the last position's logits, `[batch, vocab]`.
        #[serde(default)]
        extra_outputs: Vec<String>,
    },
}

/// Deterministic stand-in for a decoder graph.
///
/// Each step writes `token + 1000 * position + layer` into every new key
/// slot (values are keys plus 0.5) and returns
/// `logits[b, s, v] = 0.001 * sum(first layer keys up to s) + v`, so results
/// depend on the whole cached history.
struct MockSession {
    graph: MockGraph,
    inputs: Vec<TensorMetadata>,
    outputs: Vec<TensorMetadata>,
    runs: Arc<Mutex<Vec<RunOptions>>>,
}

fn symbolic(names: &[&str]) -> Vec<Dim> {
    names.iter().map(|n| Dim::Symbolic(n.to_string())).collect()
}

fn kv_shape() -> Vec<Dim> {
    vec![
        Dim::Symbolic("batch".into()),
        Dim::Fixed(KV_HEADS as i64),
        Dim::Symbolic("past".into()),
        Dim::Fixed(HEAD_SIZE as i64),
    ]
}

impl MockSession {
    fn new(graph: MockGraph, runs: Arc<Mutex<Vec<RunOptions>>>) -> Self {
        let (inputs, outputs) = match &graph {
            MockGraph::Embeddings => (
                vec![TensorMetadata::new("input_ids", DType::I64, symbolic(&["batch", "seq"]))],
                vec![TensorMetadata::new(
                    "inputs_embeds",
                    DType::F32,
                    vec![Dim::Symbolic("batch".into()), Dim::Symbolic("seq".into()), Dim::Fixed(1)],
                )],
            ),
            MockGraph::Decoder {
                tokens_input,
                layers,
                extra_inputs,
                extra_outputs,
            } => {
                let tokens = if tokens_input == "input_ids" {
                    TensorMetadata::new("input_ids", DType::I64, symbolic(&["batch", "seq"]))
                } else {
                    TensorMetadata::new(
                        tokens_input.clone(),
                        DType::F32,
                        vec![Dim::Symbolic("batch".into()), Dim::Symbolic("seq".into()), Dim::Fixed(1)],
                    )
                };
                let mut inputs = vec![
                    tokens,
                    TensorMetadata::new("attention_mask", DType::I64, symbolic(&["batch", "total"])),
                    TensorMetadata::new("position_ids", DType::I64, symbolic(&["batch", "seq"])),
                ];
                let mut outputs = vec![TensorMetadata::new(
                    "logits",
                    DType::F32,
                    symbolic(&["batch", "seq", "vocab"]),
                )];
                for l in layers {
                    for kind in ["key", "value"] {
                        inputs.push(TensorMetadata::new(
                            format!("past_key_values.{}.{}", l, kind),
                            DType::F32,
                            kv_shape(),
                        ));
                        outputs.push(TensorMetadata::new(
                            format!("present.{}.{}", l, kind),
                            DType::F32,
                            kv_shape(),
                        ));
                    }
                }
                for name in extra_inputs {
                    inputs.push(TensorMetadata::new(
                        name.clone(),
                        DType::F32,
                        symbolic(&["n", "c", "h", "w"]),
                    ));
                }
                for name in extra_outputs {
                    outputs.push(TensorMetadata::new(
                        name.clone(),
                        DType::F32,
                        symbolic(&["batch", "vocab"]),
                    ));
                }
                (inputs, outputs)
            }
        };
        MockSession {
            graph,
            inputs,
            outputs,
            runs,
        }
    }
}

fn engine_err(e: gx_tensor::TensorError) -> EngineError {
    EngineError::Other(e.to_string())
}

fn required<'a>(binding: &'a IoBinding<'_>, name: &str) -> Result<&'a Tensor, EngineError> {
    binding
        .input(name)
        .ok_or_else(|| EngineError::Other(format!("input '{}' not bound", name)))
}

fn check_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<(), EngineError> {
    if tensor.shape().dims() != expected {
        return Err(EngineError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.iter().map(|&d| d as i64).collect(),
            got: tensor.shape().dims().to_vec(),
        });
    }
    Ok(())
}

fn run_decoder(
    mut binding: IoBinding<'_>,
    tokens_input: &str,
    layers: &[usize],
    extra_outputs: &[String],
) -> Result<(), EngineError> {
    let tokens = required(&binding, tokens_input)?;
    let (bb, seq) = (tokens.shape().dim(0), tokens.shape().dim(1));
    let tokens = tokens.cast(DType::F32).to_vec::<f32>().map_err(engine_err)?;
    check_shape("position_ids", required(&binding, "position_ids")?, &[bb, seq])?;

    let past_len = match layers.first() {
        Some(l) => required(&binding, &format!("past_key_values.{}.key", l))?
            .shape()
            .dim(2),
        None => 0,
    };
    let total = past_len + seq;
    check_shape("attention_mask", required(&binding, "attention_mask")?, &[bb, total])?;

    let mut first_keys: Option<Vec<f32>> = None;
    let mut presents = Vec::new();
    for &layer in layers {
        let past = required(&binding, &format!("past_key_values.{}.key", layer))?;
        let mut step = Vec::with_capacity(bb * KV_HEADS * seq * HEAD_SIZE);
        for b in 0..bb {
            for _ in 0..KV_HEADS {
                for s in 0..seq {
                    let v = tokens[b * seq + s] + 1000.0 * (past_len + s) as f32 + layer as f32;
                    step.extend(std::iter::repeat(v).take(HEAD_SIZE));
                }
            }
        }
        let step = Tensor::from_vec(step, [bb, KV_HEADS, seq, HEAD_SIZE]).map_err(engine_err)?;
        let key = past.concat(&step, 2).map_err(engine_err)?;
        let values: Vec<f32> = key
            .to_vec::<f32>()
            .map_err(engine_err)?
            .into_iter()
            .map(|k| k + 0.5)
            .collect();
        if first_keys.is_none() {
            first_keys = Some(key.to_vec::<f32>().map_err(engine_err)?);
        }
        let value = Tensor::from_vec(values, key.shape().clone()).map_err(engine_err)?;
        presents.push((format!("present.{}.key", layer), key));
        presents.push((format!("present.{}.value", layer), value));
    }

    let mut logits = Vec::with_capacity(bb * seq * VOCAB_SIZE);
    for b in 0..bb {
        for s in 0..seq {
            let history: f32 = match &first_keys {
                Some(keys) => (0..=past_len + s)
                    .map(|p| keys[(b * KV_HEADS * total + p) * HEAD_SIZE])
                    .sum(),
                None => tokens[b * seq + s],
            };
            logits.extend((0..VOCAB_SIZE).map(|v| 0.001 * history + v as f32));
        }
    }
    let last: Vec<f32> = logits
        .chunks(seq * VOCAB_SIZE)
        .flat_map(|row| row[(seq - 1) * VOCAB_SIZE..].iter().copied())
        .collect();
    let last = Tensor::from_vec(last, [bb, VOCAB_SIZE]).map_err(engine_err)?;
    for name in extra_outputs {
        binding.set_output(name, last.clone());
    }
    let logits = Tensor::from_vec(logits, [bb, seq, VOCAB_SIZE]).map_err(engine_err)?;
    binding.set_output("logits", logits);
    for (name, tensor) in presents {
        binding.set_output(&name, tensor);
    }
    Ok(())
}

impl Session for MockSession {
    fn inputs(&self) -> &[TensorMetadata] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorMetadata] {
        &self.outputs
    }

    fn run(&self, mut binding: IoBinding<'_>, options: &RunOptions) -> Result<(), EngineError> {
        self.runs.lock().push(options.clone());
        match &self.graph {
            MockGraph::Embeddings => {
                let ids = required(&binding, "input_ids")?;
                let (bb, seq) = (ids.shape().dim(0), ids.shape().dim(1));
                let embeds = ids
                    .cast(DType::F32)
                    .reshape([bb, seq, 1])
                    .map_err(engine_err)?;
                binding.set_output("inputs_embeds", embeds);
                Ok(())
            }
            MockGraph::Decoder {
                tokens_input,
                layers,
                extra_outputs,
                ..
            } => run_decoder(binding, tokens_input, layers, extra_outputs),
        }
    }
}

/// Engine over JSON "model files". Compiling copies the file and marks the
/// artifact as optimal.
pub(crate) struct MockEngine {
    devices: bool,
    runs: Arc<Mutex<Vec<RunOptions>>>,
    compile_requests: Mutex<Vec<CompileRequest>>,
    opened: Mutex<Vec<PathBuf>>,
    verdicts: Mutex<HashMap<PathBuf, Option<ModelCompatibility>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        MockEngine {
            devices: true,
            runs: Arc::new(Mutex::new(Vec::new())),
            compile_requests: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            verdicts: Mutex::new(HashMap::new()),
        }
    }

    /// Report every non-CPU device as unavailable.
    pub fn without_devices(mut self) -> Self {
        self.devices = false;
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn runs(&self) -> Vec<RunOptions> {
        self.runs.lock().clone()
    }

    pub fn compile_count(&self) -> usize {
        self.compile_requests.lock().len()
    }

    pub fn compile_requests(&self) -> Vec<CompileRequest> {
        self.compile_requests.lock().clone()
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().clone()
    }

    pub fn set_verdict(&self, path: &Path, verdict: Option<ModelCompatibility>) {
        self.verdicts.lock().insert(path.to_path_buf(), verdict);
    }
}

impl InferenceEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_session(
        &self,
        path: &Path,
        _options: &SessionOptions,
    ) -> Result<Arc<dyn Session>, EngineError> {
        let load_err = |message: String| EngineError::Load {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let graph: MockGraph = serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?;
        self.opened.lock().push(path.to_path_buf());
        Ok(Arc::new(MockSession::new(graph, Arc::clone(&self.runs))))
    }

    fn compile_model(&self, request: &CompileRequest) -> Result<(), EngineError> {
        std::fs::copy(&request.input_path, &request.output_path)
            .map_err(|e| EngineError::Compile(e.to_string()))?;
        self.verdicts
            .lock()
            .insert(request.output_path.clone(), Some(ModelCompatibility::Optimal));
        self.compile_requests.lock().push(request.clone());
        Ok(())
    }

    fn model_compatibility(
        &self,
        path: &Path,
        _provider: &str,
    ) -> Result<Option<ModelCompatibility>, EngineError> {
        Ok(self.verdicts.lock().get(path).copied().flatten())
    }

    fn device(&self, device_type: DeviceType) -> Option<Arc<dyn DeviceInterface>> {
        if !self.devices {
            return None;
        }
        Some(Arc::new(MockDevice(device_type)))
    }
}

/// Knobs for `write_model_dir`.
#[derive(Debug, Clone)]
pub(crate) struct ModelDirOptions {
    pub model_type: &'static str,
    pub provider: Option<&'static str>,
    pub enable_ep_context: bool,
    pub force_compile: bool,
    pub ep_context_file_path: Option<&'static str>,
    pub pipeline: bool,
    pub embeddings_on_token_gen: bool,
    pub graph_capture: bool,
    pub num_layers: usize,
    /// Layers the decoder graph declares; all of them when `None`.
    pub declared_layers: Option<Vec<usize>>,
    pub extra_outputs: Vec<&'static str>,
}

impl Default for ModelDirOptions {
    fn default() -> Self {
        ModelDirOptions {
            model_type: "llama",
            provider: None,
            enable_ep_context: false,
            force_compile: false,
            ep_context_file_path: None,
            pipeline: false,
            embeddings_on_token_gen: true,
            graph_capture: false,
            num_layers: 2,
            declared_layers: None,
            extra_outputs: Vec::new(),
        }
    }
}

fn write_json(path: &Path, value: &impl Serialize) {
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Lay out a model directory (config, tokenizer files, mock graphs) and
/// load its configuration.
pub(crate) fn write_model_dir(dir: &Path, opts: &ModelDirOptions) -> Config {
    let provider = match opts.provider.or(opts.graph_capture.then_some("cuda")) {
        Some(name) => {
            let settings = if opts.graph_capture {
                json!({ "enable_cuda_graph": "1" })
            } else {
                json!({})
            };
            let mut entry = serde_json::Map::new();
            entry.insert(name.to_string(), settings);
            json!([entry])
        }
        None => json!([]),
    };
    let mut decoder = json!({
        "filename": "model.onnx",
        "session_options": { "provider_options": provider },
        "head_size": HEAD_SIZE,
        "hidden_size": KV_HEADS * HEAD_SIZE,
        "num_attention_heads": KV_HEADS,
        "num_key_value_heads": KV_HEADS,
        "num_hidden_layers": opts.num_layers,
    });
    if opts.enable_ep_context {
        let mut compile = json!({
            "enable_ep_context": true,
            "force_compile_if_needed": opts.force_compile,
        });
        if let Some(path) = opts.ep_context_file_path {
            compile["ep_context_file_path"] = json!(path);
        }
        decoder["compile_options"] = compile;
    }
    if opts.pipeline {
        decoder["pipeline"] = json!([
            { "embeddings": {
                "filename": "embeddings.onnx",
                "run_on_token_gen": opts.embeddings_on_token_gen,
            } },
            { "transformer": { "filename": "transformer.onnx" } },
        ]);
    }
    let mut model = json!({
        "type": opts.model_type,
        "bos_token_id": 1,
        "eos_token_id": [2, 19],
        "context_length": 64,
        "vocab_size": VOCAB_SIZE,
        "decoder": decoder,
    });
    match opts.model_type {
        "phi3v" | "gemma3" => model["vision"] = json!({}),
        "whisper" => model["speech"] = json!({}),
        _ => {}
    }
    write_json(
        &dir.join(Config::FILENAME),
        &json!({ "model": model, "search": { "max_length": 64 } }),
    );

    std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    write_json(
        &dir.join("tokenizer_config.json"),
        &json!({ "chat_template": CHAT_TEMPLATE, "bos_token": "<s>", "eos_token": "</s>" }),
    );

    let layers = opts
        .declared_layers
        .clone()
        .unwrap_or_else(|| (0..opts.num_layers).collect());
    let extra_inputs: Vec<String> = match opts.model_type {
        "phi3v" => vec!["pixel_values".into(), "image_sizes".into()],
        "gemma3" => vec!["pixel_values".into()],
        "whisper" => vec!["audio_features".into()],
        _ => Vec::new(),
    };
    let decoder_graph = |tokens_input: &str| MockGraph::Decoder {
        tokens_input: tokens_input.to_string(),
        layers: layers.clone(),
        extra_inputs: extra_inputs.clone(),
        extra_outputs: opts.extra_outputs.iter().map(|s| s.to_string()).collect(),
    };
    write_json(&dir.join("model.onnx"), &decoder_graph("input_ids"));
    write_json(&dir.join("transformer.onnx"), &decoder_graph("inputs_embeds"));
    write_json(&dir.join("embeddings.onnx"), &MockGraph::Embeddings);

    Config::from_dir(dir).unwrap()
}

pub(crate) fn mock_model_with(
    opts: &ModelDirOptions,
    engine: MockEngine,
) -> (tempfile::TempDir, Arc<MockEngine>, Arc<Model>) {
    let dir = tempfile::tempdir().unwrap();
    let config = write_model_dir(dir.path(), opts);
    let engine = Arc::new(engine);
    let model = Model::new(config, Arc::clone(&engine) as Arc<dyn InferenceEngine>).unwrap();
    (dir, engine, Arc::new(model))
}

pub(crate) fn mock_model(opts: &ModelDirOptions) -> (tempfile::TempDir, Arc<MockEngine>, Arc<Model>) {
    mock_model_with(opts, MockEngine::new())
}
