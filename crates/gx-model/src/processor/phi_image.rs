use std::sync::Arc;

use gx_tensor::Tensor;

use super::{
    check_tag_count, count_tags, pixel_values, reject_modality, segments, token_tensor,
    NamedTensors, Payload, Processor, Segment, INPUT_IDS,
};
use crate::config::{Config, VisionConfig};
use crate::error::{ModelError, Result};
use crate::session_info::SessionInfo;
use crate::tokenizer::Tokenizer;

const MODEL_TYPE: &str = "phi3v";

/// Processor for phi-3 vision prompts.
///
/// Each `<|image_k|>` tag (1-based) stands for image `k` and expands to as
/// many copies of the id `-k` as the image occupies tokens.
#[derive(Debug)]
pub struct PhiImageProcessor {
    vision: VisionConfig,
}

impl PhiImageProcessor {
    pub fn create(config: &Config, _info: &SessionInfo) -> Result<Arc<dyn Processor>> {
        let vision = config
            .model
            .vision
            .clone()
            .ok_or_else(|| ModelError::MissingField("model.vision".to_string()))?;
        if vision.crop_size == 0 {
            return Err(ModelError::Config("vision.crop_size must be positive".to_string()));
        }
        Ok(Arc::new(PhiImageProcessor { vision }))
    }

    /// Number of tokens an image of `height x width` occupies.
    pub fn num_image_tokens(&self, height: usize, width: usize) -> usize {
        let crop = self.vision.crop_size;
        let (h, w) = (height / crop, width / crop);
        (h * w + 1) * 144 + 1 + (h + 1) * 12
    }
}

impl Processor for PhiImageProcessor {
    fn model_type(&self) -> &str {
        MODEL_TYPE
    }

    fn process(&self, tokenizer: &Tokenizer, payload: &Payload<'_>) -> Result<NamedTensors> {
        reject_modality(MODEL_TYPE, "audio", payload.audios.is_some_and(|a| !a.is_empty()))?;

        let parsed: Vec<Vec<Segment<'_>>> =
            payload.prompts.iter().map(|p| segments(p, false)).collect();
        let images = payload.images.map(|i| i.images.as_slice()).unwrap_or(&[]);
        check_tag_count(MODEL_TYPE, "image", count_tags(&parsed).0, images.len())?;
        if let Some(first) = images.first() {
            if images
                .iter()
                .any(|i| (i.width(), i.height()) != (first.width(), first.height()))
            {
                return Err(ModelError::InvalidArgument(
                    "all images in a request must share one size".to_string(),
                ));
            }
        }

        let mut rows = Vec::with_capacity(parsed.len());
        for prompt in &parsed {
            let mut ids = tokenizer.leading_special_tokens();
            for segment in prompt {
                match *segment {
                    Segment::Text(text) => ids.extend(tokenizer.encode_fragment(text)?),
                    Segment::Image(k) => {
                        let image = k
                            .checked_sub(1)
                            .and_then(|i| images.get(i))
                            .ok_or_else(|| {
                                ModelError::InvalidArgument(format!(
                                    "image tag {} has no matching image",
                                    k
                                ))
                            })?;
                        let count = self.num_image_tokens(image.height(), image.width());
                        ids.extend(std::iter::repeat(-(k as i32)).take(count));
                    }
                    Segment::Audio(_) => {}
                }
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
        Ok(named)
    }
}
