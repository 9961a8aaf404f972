//! The loaded model: sessions, devices and the factories built on them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gx_tensor::{CpuDevice, DType, DeviceInterface, DeviceType, Tensor};
use tracing::{info, warn};

use crate::compile::ArtifactStatus;
use crate::config::{layer_name, Config, SessionOptions, DECODER_STAGE};
use crate::engine::{InferenceEngine, Session};
use crate::error::{ModelError, Result};
use crate::generator_params::GeneratorParams;
use crate::processor::{self, MultiModalProcessor};
use crate::session_info::SessionInfo;
use crate::state::{DecoderState, PipelineState, State};
use crate::tokenizer::Tokenizer;

/// Model types run by a single decoder session.
const DECODER_TYPES: &[&str] = &[
    "chatglm", "gemma", "gemma2", "granite", "llama", "mistral", "nemotron", "olmo", "phi",
    "phi3", "phi3small", "phimoe", "qwen2", "qwen3",
];

/// How a model's decoding step is structured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelFamily {
    /// Text-only decoder.
    Decoder,
    /// Decoder fed by a registered multimodal processor.
    MultiModal(String),
    /// Ordered chain of sessions.
    Pipeline,
}

impl ModelFamily {
    fn from_config(config: &Config) -> Result<Self> {
        let model_type = config.model.model_type.as_str();
        if !config.model.decoder.pipeline.is_empty() {
            return Ok(ModelFamily::Pipeline);
        }
        if DECODER_TYPES.contains(&model_type) {
            return Ok(ModelFamily::Decoder);
        }
        if processor::registered_model_types().contains(&model_type) {
            return Ok(ModelFamily::MultiModal(model_type.to_string()));
        }
        Err(ModelError::UnsupportedModelType(model_type.to_string()))
    }
}

pub struct Model {
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn InferenceEngine>,
    family: ModelFamily,
    device_type: DeviceType,
    p_device: Arc<dyn DeviceInterface>,
    p_device_inputs: Arc<dyn DeviceInterface>,
    p_device_kvcache: Arc<dyn DeviceInterface>,
    allocator_cpu: Arc<dyn DeviceInterface>,
    pipeline_session_options: BTreeMap<String, SessionOptions>,
    pub(crate) pipeline_compiled_model_paths: BTreeMap<String, PathBuf>,
    pub(crate) artifact_status: BTreeMap<String, ArtifactStatus>,
    sessions: BTreeMap<String, Arc<dyn Session>>,
    session_info: SessionInfo,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("model_type", &self.config.model.model_type)
            .field("family", &self.family)
            .field("device", &self.device_type)
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Model {
    /// Load every configured session, compiling models first where
    /// `compile_options.enable_ep_context` asks for it.
    pub fn new(config: Config, engine: Arc<dyn InferenceEngine>) -> Result<Model> {
        let family = ModelFamily::from_config(&config)?;
        let decoder_options = config.model.decoder.session_options.clone();
        let device_type = match decoder_options.primary_provider() {
            None => DeviceType::Cpu,
            Some(name) => DeviceType::from_provider_name(name).ok_or_else(|| {
                ModelError::Config(format!("unknown execution provider '{}'", name))
            })?,
        };

        let allocator_cpu: Arc<dyn DeviceInterface> = Arc::new(CpuDevice::new());
        let p_device = match device_type {
            DeviceType::Cpu => Arc::clone(&allocator_cpu),
            other => engine.device(other).unwrap_or_else(|| {
                warn!(device = %other, engine = engine.name(), "device not available, falling back to cpu");
                Arc::clone(&allocator_cpu)
            }),
        };
        let p_device_inputs = match device_type {
            DeviceType::Dml | DeviceType::WebGpu => Arc::clone(&allocator_cpu),
            _ => Arc::clone(&p_device),
        };
        let p_device_kvcache = Arc::clone(&p_device);

        let pipeline_session_options = config
            .model
            .decoder
            .pipeline_models()
            .map(|(id, stage)| {
                let options = stage
                    .session_options
                    .clone()
                    .unwrap_or_else(|| decoder_options.clone());
                (id.to_string(), options)
            })
            .collect();

        let mut model = Model {
            config,
            engine,
            family,
            device_type,
            p_device,
            p_device_inputs,
            p_device_kvcache,
            allocator_cpu,
            pipeline_session_options,
            pipeline_compiled_model_paths: BTreeMap::new(),
            artifact_status: BTreeMap::new(),
            sessions: BTreeMap::new(),
            session_info: SessionInfo::new(),
        };
        model.load_sessions()?;
        info!(
            model_type = model.config.model.model_type.as_str(),
            device = %model.device_type,
            sessions = model.sessions.len(),
            "model loaded"
        );
        Ok(model)
    }

    fn load_sessions(&mut self) -> Result<()> {
        let decoder = self.config.model.decoder.clone();
        if self.family == ModelFamily::Pipeline {
            for (id, stage) in decoder.pipeline_models() {
                let options = self.pipeline_session_options.get(id).cloned().unwrap_or_default();
                let compile = stage.compile_options.as_ref().or(decoder.compile_options.as_ref());
                let path = self.compile_model(id, &stage.filename, &options, false, compile)?;
                let session = self.create_session(&path, &options)?;
                self.add_session(id, session);
            }
        } else {
            let options = decoder.session_options.clone();
            let path = self.compile_model(
                DECODER_STAGE,
                &decoder.filename,
                &options,
                true,
                decoder.compile_options.as_ref(),
            )?;
            let session = self.create_session(&path, &options)?;
            self.add_session(DECODER_STAGE, session);
        }
        Ok(())
    }

    fn add_session(&mut self, stage_id: &str, session: Arc<dyn Session>) {
        self.session_info.add(session.as_ref());
        self.sessions.insert(stage_id.to_string(), session);
    }

    /// Open a model file, resolved against the config directory, into a session.
    pub fn create_session(
        &self,
        filename: impl AsRef<Path>,
        options: &SessionOptions,
    ) -> Result<Arc<dyn Session>> {
        let path = self.config.resolve(filename);
        info!(path = %path.display(), "creating session");
        Ok(self.engine.create_session(&path, options)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn family(&self) -> &ModelFamily {
        &self.family
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn device(&self) -> &Arc<dyn DeviceInterface> {
        &self.p_device
    }

    pub fn device_inputs(&self) -> &Arc<dyn DeviceInterface> {
        &self.p_device_inputs
    }

    pub fn device_kvcache(&self) -> &Arc<dyn DeviceInterface> {
        &self.p_device_kvcache
    }

    pub fn allocator_cpu(&self) -> &Arc<dyn DeviceInterface> {
        &self.allocator_cpu
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.session_info
    }

    /// Session for a stage id (`"decoder"` for the primary decoder).
    pub fn session(&self, stage_id: &str) -> Option<&Arc<dyn Session>> {
        self.sessions.get(stage_id)
    }

    pub fn session_options(&self, stage_id: &str) -> Option<&SessionOptions> {
        if stage_id == DECODER_STAGE {
            return Some(&self.config.model.decoder.session_options);
        }
        self.pipeline_session_options.get(stage_id)
    }

    pub fn pipeline_compiled_model_path(&self, stage_id: &str) -> Option<&Path> {
        self.pipeline_compiled_model_paths
            .get(stage_id)
            .map(PathBuf::as_path)
    }

    pub fn artifact_status(&self, stage_id: &str) -> Option<ArtifactStatus> {
        self.artifact_status.get(stage_id).copied()
    }

    pub fn pad_token_id(&self) -> i32 {
        let model = &self.config.model;
        model
            .pad_token_id
            .or_else(|| model.eos_token_id.to_vec().first().copied())
            .unwrap_or(0)
    }

    /// Layer indices whose past-key input the loaded sessions declare.
    pub fn decoder_layers(&self) -> Vec<usize> {
        let decoder = &self.config.model.decoder;
        (0..decoder.num_hidden_layers)
            .filter(|&i| {
                self.session_info
                    .has_input(&layer_name(&decoder.inputs.past_key_names, i))
            })
            .collect()
    }

    /// True when the sessions declare fewer layers than `num_hidden_layers`.
    pub fn is_pruned(&self) -> bool {
        self.decoder_layers().len() < self.config.model.decoder.num_hidden_layers
    }

    /// Repeat every batch row `num_beams` times (copies of a row adjacent)
    /// and place the result on the inputs device.
    pub fn expand_inputs(&self, input: &Tensor, num_beams: usize) -> Result<Tensor> {
        if num_beams == 1 {
            return Ok(input.clone());
        }
        if num_beams == 0 {
            return Err(ModelError::InvalidArgument("num_beams must be positive".to_string()));
        }
        let expanded = input.repeat_rows(num_beams)?;
        Ok(self.p_device_inputs.copy_from(&expanded)?)
    }

    /// Execution-provider name used for EP-context artifacts, empty when the
    /// device has none.
    pub fn ep_context_provider_name(device_type: DeviceType) -> &'static str {
        match device_type {
            DeviceType::NvTensorRtRtx => "NvTensorRTRTXExecutionProvider",
            _ => "",
        }
    }

    pub fn create_state(
        self: &Arc<Self>,
        sequence_lengths: &[usize],
        params: Arc<GeneratorParams>,
    ) -> Result<Box<dyn State>> {
        if !sequence_lengths.is_empty() && sequence_lengths.len() != params.batch_size {
            return Err(ModelError::InvalidArgument(format!(
                "{} sequence lengths for batch size {}",
                sequence_lengths.len(),
                params.batch_size
            )));
        }
        let state: Box<dyn State> = match self.family {
            ModelFamily::Pipeline => Box::new(PipelineState::new(Arc::clone(self), params)?),
            ModelFamily::Decoder | ModelFamily::MultiModal(_) => {
                Box::new(DecoderState::new(Arc::clone(self), params)?)
            }
        };
        Ok(state)
    }

    pub fn create_tokenizer(&self) -> Result<Arc<Tokenizer>> {
        Ok(Arc::new(Tokenizer::from_config(&self.config)?))
    }

    pub fn create_multimodal_processor(&self) -> Result<Arc<MultiModalProcessor>> {
        let tokenizer = self.create_tokenizer()?;
        Ok(Arc::new(MultiModalProcessor::new(
            &self.config,
            &self.session_info,
            tokenizer,
        )?))
    }
}

/// Convert `input` to `dtype` in a new tensor on `device`.
pub fn cast(input: &Tensor, dtype: DType, device: &dyn DeviceInterface) -> Result<Tensor> {
    Ok(device.copy_from(&input.cast(dtype))?)
}
