use std::sync::Arc;

use gx_tensor::Tensor;

use super::{reject_modality, token_tensor, NamedTensors, Payload, Processor, INPUT_IDS};
use crate::config::{Config, SpeechConfig};
use crate::error::{ModelError, Result};
use crate::session_info::SessionInfo;
use crate::tokenizer::Tokenizer;

const MODEL_TYPE: &str = "whisper";

/// Processor for whisper speech models. Audio is required; each clip is
/// zero-padded or trimmed to one chunk of samples.
#[derive(Debug)]
pub struct WhisperProcessor {
    speech: SpeechConfig,
}

impl WhisperProcessor {
    pub fn create(config: &Config, _info: &SessionInfo) -> Result<Arc<dyn Processor>> {
        let speech = config.model.speech.clone().unwrap_or_default();
        if speech.sample_rate == 0 || speech.chunk_length == 0 {
            return Err(ModelError::Config(
                "speech.sample_rate and speech.chunk_length must be positive".to_string(),
            ));
        }
        Ok(Arc::new(WhisperProcessor { speech }))
    }

    pub fn chunk_samples(&self) -> usize {
        self.speech.sample_rate as usize * self.speech.chunk_length
    }
}

impl Processor for WhisperProcessor {
    fn model_type(&self) -> &str {
        MODEL_TYPE
    }

    fn process(&self, tokenizer: &Tokenizer, payload: &Payload<'_>) -> Result<NamedTensors> {
        reject_modality(MODEL_TYPE, "image", payload.images.is_some_and(|i| !i.is_empty()))?;
        let audios = match payload.audios {
            Some(a) if !a.is_empty() => &a.audios,
            _ => {
                return Err(ModelError::MissingModality {
                    model_type: MODEL_TYPE.to_string(),
                    modality: "audio",
                })
            }
        };
        for audio in audios {
            if audio.channels != 1 || audio.sample_rate != self.speech.sample_rate {
                return Err(ModelError::InvalidArgument(format!(
                    "audio must be mono {} Hz, got {} channel(s) at {} Hz",
                    self.speech.sample_rate, audio.channels, audio.sample_rate
                )));
            }
        }

        let rows = payload
            .prompts
            .iter()
            .map(|p| tokenizer.encode(p))
            .collect::<Result<Vec<_>>>()?;

        let chunk = self.chunk_samples();
        let mut features = Vec::with_capacity(audios.len() * chunk);
        for audio in audios {
            let take = audio.samples.len().min(chunk);
            features.extend_from_slice(&audio.samples[..take]);
            features.resize(features.len() + chunk - take, 0.0);
        }

        let mut named = NamedTensors::new();
        named.insert(INPUT_IDS.to_string(), token_tensor(&rows, tokenizer.pad_token_id())?);
        named.insert(
            self.speech.inputs.audio_features.clone(),
            Tensor::from_vec(features, [audios.len(), chunk])?,
        );
        Ok(named)
    }
}
