//! Fusing text prompts with image and audio inputs.
//!
//! A `Processor` knows one model family's prompt conventions: how modality
//! placeholders in the text expand to token ids, and which tensors carry the
//! modality data. Processors are looked up by model type in a registry built
//! once per process. `MultiModalProcessor` pairs the selected processor with
//! the model's tokenizer.

mod gemma_image;
mod phi_image;
mod phi_multimodal;
mod whisper;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

use gx_tensor::{DType, Tensor};

use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::session_info::SessionInfo;
use crate::tokenizer::Tokenizer;

pub use gemma_image::GemmaImageProcessor;
pub use phi_image::PhiImageProcessor;
pub use phi_multimodal::PhiMultimodalProcessor;
pub use whisper::WhisperProcessor;

/// Tensors produced for one request, keyed by session input name.
pub type NamedTensors = BTreeMap<String, Tensor>;

/// Name of the token id tensor every processor emits.
pub const INPUT_IDS: &str = "input_ids";

/// A decoded RGB image, 8 bits per channel, row-major `height x width x 3`.
/// The buffer always matches the dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl RgbImage {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        if data.len() != width * height * 3 {
            return Err(ModelError::InvalidArgument(format!(
                "image buffer holds {} bytes, expected {} for {}x{} RGB",
                data.len(),
                width * height * 3,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Images {
    pub images: Vec<RgbImage>,
}

impl Images {
    pub fn new(images: Vec<RgbImage>) -> Self {
        Self { images }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Decoded PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Audio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Audios {
    pub audios: Vec<Audio>,
}

impl Audios {
    pub fn new(audios: Vec<Audio>) -> Self {
        Self { audios }
    }

    pub fn len(&self) -> usize {
        self.audios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.audios.is_empty()
    }
}

/// Everything one `process` call receives.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    pub prompts: &'a [&'a str],
    pub images: Option<&'a Images>,
    pub audios: Option<&'a Audios>,
}

pub trait Processor: Send + Sync + Debug {
    fn model_type(&self) -> &str;

    /// Tokenize the prompts (expanding modality placeholders) and build the
    /// modality tensors. `input_ids` is emitted as i32 `[batch, max_len]`.
    /// Inputs are validated before any tensor is built.
    fn process(&self, tokenizer: &Tokenizer, payload: &Payload<'_>) -> Result<NamedTensors>;
}

pub type ProcessorConstructor = fn(&Config, &SessionInfo) -> Result<Arc<dyn Processor>>;

fn registry() -> &'static HashMap<&'static str, ProcessorConstructor> {
    static REGISTRY: OnceLock<HashMap<&'static str, ProcessorConstructor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut table: HashMap<&'static str, ProcessorConstructor> = HashMap::new();
        table.insert("phi3v", PhiImageProcessor::create);
        table.insert("phi4mm", PhiMultimodalProcessor::create);
        table.insert("gemma3", GemmaImageProcessor::create);
        table.insert("whisper", WhisperProcessor::create);
        table
    })
}

/// Model types with a registered processor.
pub fn registered_model_types() -> Vec<&'static str> {
    let mut types: Vec<_> = registry().keys().copied().collect();
    types.sort_unstable();
    types
}

/// Build the processor registered for `config.model.model_type`.
pub fn create_processor(config: &Config, info: &SessionInfo) -> Result<Arc<dyn Processor>> {
    let model_type = config.model.model_type.as_str();
    let constructor = registry().get(model_type).ok_or_else(|| {
        ModelError::UnsupportedModelType(format!("{} has no multimodal processor", model_type))
    })?;
    constructor(config, info)
}

/// Error for a modality input the processor cannot use.
pub(crate) fn reject_modality(model_type: &str, modality: &str, present: bool) -> Result<()> {
    if present {
        return Err(ModelError::Config(format!(
            "{} does not accept {} input",
            model_type, modality
        )));
    }
    Ok(())
}

/// Check that a request brings one item per prompt tag.
pub(crate) fn check_tag_count(
    model_type: &str,
    modality: &'static str,
    tags: usize,
    given: usize,
) -> Result<()> {
    if tags > 0 && given == 0 {
        return Err(ModelError::MissingModality {
            model_type: model_type.to_string(),
            modality,
        });
    }
    if tags != given {
        return Err(ModelError::InvalidArgument(format!(
            "prompt has {} {} tags but {} were given",
            tags, modality, given
        )));
    }
    Ok(())
}

const TAG_OPEN: &str = "<|";
const TAG_CLOSE: &str = "|>";

/// A piece of a prompt: plain text or a 1-based modality tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Image(usize),
    Audio(usize),
}

/// Split a prompt around `<|image_k|>` tags and, with `audio`, `<|audio_k|>`
/// tags. Anything that does not parse as a tag stays text.
pub(crate) fn segments(prompt: &str, audio: bool) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;
    while let Some(found) = prompt[cursor..].find(TAG_OPEN) {
        let start = cursor + found;
        let body = &prompt[start + TAG_OPEN.len()..];
        let parsed = parse_tag(body, "image_")
            .map(|(k, len)| (Segment::Image(k), len))
            .or_else(|| {
                audio
                    .then(|| parse_tag(body, "audio_"))
                    .flatten()
                    .map(|(k, len)| (Segment::Audio(k), len))
            });
        match parsed {
            Some((segment, len)) => {
                if start > text_start {
                    out.push(Segment::Text(&prompt[text_start..start]));
                }
                cursor = start + TAG_OPEN.len() + len;
                text_start = cursor;
                out.push(segment);
            }
            None => cursor = start + TAG_OPEN.len(),
        }
    }
    if text_start < prompt.len() {
        out.push(Segment::Text(&prompt[text_start..]));
    }
    out
}

/// Parse `<kind><digits>|>` at the start of `body`. Returns the index and
/// the bytes consumed.
fn parse_tag(body: &str, kind: &str) -> Option<(usize, usize)> {
    let after = body.strip_prefix(kind)?;
    let digits = after.bytes().take_while(u8::is_ascii_digit).count();
    let index = after[..digits].parse().ok()?;
    after[digits..]
        .starts_with(TAG_CLOSE)
        .then_some((index, kind.len() + digits + TAG_CLOSE.len()))
}

/// Count the tags of each kind across all prompts: `(images, audios)`.
pub(crate) fn count_tags(parsed: &[Vec<Segment<'_>>]) -> (usize, usize) {
    parsed.iter().flatten().fold((0, 0), |(i, a), s| match s {
        Segment::Image(_) => (i + 1, a),
        Segment::Audio(_) => (i, a + 1),
        Segment::Text(_) => (i, a),
    })
}

/// Right-pad token rows into an i32 `[batch, max_len]` tensor.
pub(crate) fn token_tensor(rows: &[Vec<i32>], pad_token_id: i32) -> Result<Tensor> {
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let flat = crate::tokenizer::pad_inputs(rows, pad_token_id);
    Ok(Tensor::from_vec(flat, [rows.len(), max_len])?)
}

/// Rescale, normalize and lay out images channel-first as `[n, 3, h, w]`.
pub(crate) fn pixel_values(
    images: &[RgbImage],
    rescale: f32,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<Tensor> {
    let (h, w) = match images.first() {
        Some(img) => (img.height(), img.width()),
        None => return Ok(Tensor::zeros(DType::F32, [0, 3, 0, 0])),
    };
    let mut data = Vec::with_capacity(images.len() * 3 * h * w);
    for img in images {
        if (img.height(), img.width()) != (h, w) {
            return Err(ModelError::InvalidArgument(
                "all images in a request must share one size".to_string(),
            ));
        }
        let pixels = img.data();
        for c in 0..3 {
            for px in 0..h * w {
                let v = pixels[px * 3 + c] as f32 * rescale;
                data.push((v - mean[c]) / std[c]);
            }
        }
    }
    Ok(Tensor::from_vec(data, [images.len(), 3, h, w])?)
}

/// Fuses prompts with images and audio for one model.
#[derive(Debug)]
pub struct MultiModalProcessor {
    tokenizer: Arc<Tokenizer>,
    processor: Arc<dyn Processor>,
    input_ids_dtype: DType,
}

impl MultiModalProcessor {
    pub fn new(config: &Config, info: &SessionInfo, tokenizer: Arc<Tokenizer>) -> Result<Self> {
        let processor = create_processor(config, info)?;
        let input_name = &config.model.decoder.inputs.input_ids;
        let input_ids_dtype = if info.has_input(input_name) {
            info.get_input_data_type(input_name)?
        } else {
            DType::I64
        };
        Ok(Self {
            tokenizer,
            processor,
            input_ids_dtype,
        })
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    pub fn model_type(&self) -> &str {
        self.processor.model_type()
    }

    pub fn process(
        &self,
        prompt: &str,
        images: Option<&Images>,
        audios: Option<&Audios>,
    ) -> Result<NamedTensors> {
        self.process_batch(&[prompt], images, audios)
    }

    pub fn process_batch(
        &self,
        prompts: &[&str],
        images: Option<&Images>,
        audios: Option<&Audios>,
    ) -> Result<NamedTensors> {
        let payload = Payload {
            prompts,
            images,
            audios,
        };
        let mut named = self.processor.process(&self.tokenizer, &payload)?;
        if let Some(ids) = named.get_mut(INPUT_IDS) {
            if ids.dtype() != self.input_ids_dtype {
                *ids = ids.cast(self.input_ids_dtype);
            }
        }
        Ok(named)
    }
}
