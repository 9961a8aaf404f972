use std::sync::Arc;

use gx_tensor::Tensor;

use super::{
    check_tag_count, count_tags, pixel_values, segments, token_tensor, Audio, NamedTensors,
    Payload, Processor, RgbImage, Segment, INPUT_IDS,
};
use crate::config::{Config, SpeechConfig, VisionConfig};
use crate::error::{ModelError, Result};
use crate::session_info::SessionInfo;
use crate::tokenizer::Tokenizer;

const MODEL_TYPE: &str = "phi4mm";

/// Processor for phi-4 multimodal prompts, which may carry images and audio
/// in the same request.
///
/// `<|image_k|>` expands to `image_token_id` once per image token and
/// `<|audio_k|>` to `audio_token_id` once per audio token. Audio clips are
/// zero-padded to the longest one; `audio_sizes` holds each clip's token
/// count.
#[derive(Debug)]
pub struct PhiMultimodalProcessor {
    vision: VisionConfig,
    speech: SpeechConfig,
}

impl PhiMultimodalProcessor {
    pub fn create(config: &Config, _info: &SessionInfo) -> Result<Arc<dyn Processor>> {
        let vision = config.model.vision.clone().unwrap_or_default();
        let speech = config.model.speech.clone().unwrap_or_default();
        if vision.crop_size == 0 {
            return Err(ModelError::Config("vision.crop_size must be positive".to_string()));
        }
        if speech.sample_rate < 100 || speech.audio_compression_rate == 0 {
            return Err(ModelError::Config(
                "speech.sample_rate must be at least 100 and audio_compression_rate positive"
                    .to_string(),
            ));
        }
        Ok(Arc::new(PhiMultimodalProcessor { vision, speech }))
    }

    /// Tokens an image occupies: one block per crop plus a global block.
    pub fn num_image_tokens(&self, image: &RgbImage) -> usize {
        let crop = self.vision.crop_size;
        let crops = image.height().div_ceil(crop) * image.width().div_ceil(crop);
        (crops + 1) * self.vision.mm_tokens_per_image
    }

    /// Tokens a clip occupies: its 10 ms frames folded by the compression
    /// rate, both rounded up.
    pub fn num_audio_tokens(&self, audio: &Audio) -> usize {
        let hop = self.speech.sample_rate as usize / 100;
        let frames = audio.samples.len().div_ceil(hop);
        frames.div_ceil(self.speech.audio_compression_rate)
    }

    fn check_audio(&self, audios: &[Audio]) -> Result<()> {
        for audio in audios {
            if audio.channels != 1 || audio.sample_rate != self.speech.sample_rate {
                return Err(ModelError::InvalidArgument(format!(
                    "audio must be mono {} Hz, got {} channel(s) at {} Hz",
                    self.speech.sample_rate, audio.channels, audio.sample_rate
                )));
            }
        }
        Ok(())
    }
}

impl Processor for PhiMultimodalProcessor {
    fn model_type(&self) -> &str {
        MODEL_TYPE
    }

    fn process(&self, tokenizer: &Tokenizer, payload: &Payload<'_>) -> Result<NamedTensors> {
        let parsed: Vec<Vec<Segment<'_>>> =
            payload.prompts.iter().map(|p| segments(p, true)).collect();
        let images = payload.images.map(|i| i.images.as_slice()).unwrap_or(&[]);
        let audios = payload.audios.map(|a| a.audios.as_slice()).unwrap_or(&[]);
        let (image_tags, audio_tags) = count_tags(&parsed);
        check_tag_count(MODEL_TYPE, "image", image_tags, images.len())?;
        check_tag_count(MODEL_TYPE, "audio", audio_tags, audios.len())?;
        self.check_audio(audios)?;

        let mut rows = Vec::with_capacity(parsed.len());
        for prompt in &parsed {
            let mut ids = tokenizer.leading_special_tokens();
            for segment in prompt {
                let (id, count) = match *segment {
                    Segment::Text(text) => {
                        ids.extend(tokenizer.encode_fragment(text)?);
                        continue;
                    }
                    Segment::Image(k) => {
                        let image = tagged(images, k, "image")?;
                        (self.vision.image_token_id, self.num_image_tokens(image))
                    }
                    Segment::Audio(k) => {
                        let audio = tagged(audios, k, "audio")?;
                        (self.speech.audio_token_id, self.num_audio_tokens(audio))
                    }
                };
                ids.extend(std::iter::repeat(id).take(count));
            }
            rows.push(ids);
        }

        let mut named = NamedTensors::new();
        named.insert(INPUT_IDS.to_string(), token_tensor(&rows, tokenizer.pad_token_id())?);
        if !images.is_empty() {
            let v = &self.vision;
            named.insert(
                v.inputs.pixel_values.clone(),
                pixel_values(images, v.rescale_factor, v.image_mean, v.image_std)?,
            );
            let sizes: Vec<i64> = images
                .iter()
                .flat_map(|i| [i.height() as i64, i.width() as i64])
                .collect();
            named.insert(
                v.inputs.image_sizes.clone(),
                Tensor::from_vec(sizes, [images.len(), 2])?,
            );
        }
        if !audios.is_empty() {
            let longest = audios.iter().map(|a| a.samples.len()).max().unwrap_or(0);
            let mut features = Vec::with_capacity(audios.len() * longest);
            for audio in audios {
                features.extend_from_slice(&audio.samples);
                features.resize(features.len() + longest - audio.samples.len(), 0.0);
            }
            let sizes: Vec<i64> = audios
                .iter()
                .map(|a| self.num_audio_tokens(a) as i64)
                .collect();
            let s = &self.speech;
            named.insert(
                s.inputs.audio_features.clone(),
                Tensor::from_vec(features, [audios.len(), longest])?,
            );
            named.insert(s.inputs.audio_sizes.clone(), Tensor::from_vec(sizes, [audios.len()])?);
        }
        Ok(named)
    }
}

/// The item a 1-based tag refers to.
fn tagged<'a, T>(items: &'a [T], k: usize, modality: &str) -> Result<&'a T> {
    k.checked_sub(1)
        .and_then(|i| items.get(i))
        .ok_or_else(|| ModelError::InvalidArgument(format!("{} tag {} has no match", modality, k)))
}
