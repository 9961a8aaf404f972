use std::sync::Arc;

use super::{pixel_values, reject_modality, token_tensor, NamedTensors, Payload, Processor, INPUT_IDS};
use crate::config::{Config, VisionConfig};
use crate::error::{ModelError, Result};
use crate::session_info::SessionInfo;
use crate::tokenizer::Tokenizer;

const MODEL_TYPE: &str = "gemma3";
pub const START_OF_IMAGE: &str = "<start_of_image>";
pub const END_OF_IMAGE: &str = "<end_of_image>";
pub const IMAGE_SOFT_TOKEN: &str = "<image_soft_token>";

/// Processor for gemma-3 prompts. Images must already be square at the
/// configured size.
#[derive(Debug)]
pub struct GemmaImageProcessor {
    vision: VisionConfig,
    expanded: String,
}

impl GemmaImageProcessor {
    pub fn create(config: &Config, _info: &SessionInfo) -> Result<Arc<dyn Processor>> {
        let vision = config
            .model
            .vision
            .clone()
            .ok_or_else(|| ModelError::MissingField("model.vision".to_string()))?;
        let expanded = format!(
            "\n\n{}{}{}\n\n",
            START_OF_IMAGE,
            IMAGE_SOFT_TOKEN.repeat(vision.mm_tokens_per_image),
            END_OF_IMAGE
        );
        Ok(Arc::new(GemmaImageProcessor { vision, expanded }))
    }
}

impl Processor for GemmaImageProcessor {
    fn model_type(&self) -> &str {
        MODEL_TYPE
    }

    fn process(&self, tokenizer: &Tokenizer, payload: &Payload<'_>) -> Result<NamedTensors> {
        reject_modality(MODEL_TYPE, "audio", payload.audios.is_some_and(|a| !a.is_empty()))?;

        let placeholders: usize = payload
            .prompts
            .iter()
            .map(|p| p.matches(START_OF_IMAGE).count())
            .sum();
        let images = payload.images.map(|i| i.images.as_slice()).unwrap_or(&[]);
        if placeholders > 0 && images.is_empty() {
            return Err(ModelError::MissingModality {
                model_type: MODEL_TYPE.to_string(),
                modality: "image",
            });
        }
        if placeholders != images.len() {
            return Err(ModelError::InvalidArgument(format!(
                "prompt has {} image placeholders but {} images were given",
                placeholders,
                images.len()
            )));
        }
        let size = self.vision.image_size;
        if let Some(bad) = images.iter().find(|i| i.width() != size || i.height() != size) {
            return Err(ModelError::InvalidArgument(format!(
                "image is {}x{}, expected {}x{}",
                bad.width(), bad.height(), size, size
            )));
        }

        let rows = payload
            .prompts
            .iter()
            .map(|p| tokenizer.encode(&p.replace(START_OF_IMAGE, &self.expanded)))
            .collect::<Result<Vec<_>>>()?;

        let mut named = NamedTensors::new();
        named.insert(INPUT_IDS.to_string(), token_tensor(&rows, tokenizer.pad_token_id())?);
        if !images.is_empty() {
            let v = &self.vision;
            named.insert(
                v.inputs.pixel_values.clone(),
                pixel_values(images, v.rescale_factor, v.image_mean, v.image_std)?,
            );
        }
        Ok(named)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Images, RgbImage};
    use crate::testing::tiny_tokenizer;

    fn processor() -> Arc<dyn Processor> {
        let config = Config::from_json(
            r#"{"model": {"type": "gemma3", "vision": {"image_size": 2, "mm_tokens_per_image": 3}}}"#,
            ".",
        )
        .unwrap();
        GemmaImageProcessor::create(&config, &SessionInfo::new()).unwrap()
    }

    #[test]
    fn test_placeholder_expansion() {
        let tok = tiny_tokenizer();
        let images = Images::new(vec![RgbImage::new(2, 2, vec![0; 12]).unwrap()]);
        let named = processor()
            .process(
                &tok,
                &Payload {
                    prompts: &["hello<start_of_image>"],
                    images: Some(&images),
                    audios: None,
                },
            )
            .unwrap();
        let ids = named[INPUT_IDS].to_vec::<i32>().unwrap();
        let newline = tok.token_to_id("\n").unwrap();
        let soft = tok.token_to_id(IMAGE_SOFT_TOKEN).unwrap();
        let expected = vec![
            14,
            newline,
            newline,
            tok.token_to_id(START_OF_IMAGE).unwrap(),
            soft,
            soft,
            soft,
            tok.token_to_id(END_OF_IMAGE).unwrap(),
            newline,
            newline,
        ];
        assert_eq!(ids, expected);
        assert_eq!(named["pixel_values"].shape().dims(), &[1, 3, 2, 2]);
    }

    #[test]
    fn test_wrong_image_size() {
        let tok = tiny_tokenizer();
        let images = Images::new(vec![RgbImage::new(1, 1, vec![0; 3]).unwrap()]);
        let err = processor()
            .process(
                &tok,
                &Payload {
                    prompts: &["<start_of_image>"],
                    images: Some(&images),
                    audios: None,
                },
            )
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_placeholder_without_image() {
        let tok = tiny_tokenizer();
        let err = processor()
            .process(
                &tok,
                &Payload {
                    prompts: &["<start_of_image>"],
                    images: None,
                    audios: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::MissingModality { .. }));
    }
}
