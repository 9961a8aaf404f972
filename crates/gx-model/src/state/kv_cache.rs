use std::sync::Arc;

use gx_tensor::{DType, DeviceInterface, Shape, Tensor};

use crate::config::layer_name;
use crate::error::{ModelError, Result};
use crate::model::Model;

/// Key-Value cache for the decoder's attention layers.
///
/// Holds the past key and value tensors bound as session inputs on the next
/// step. After each run the session's present outputs replace them, so the
/// cache always covers exactly the positions executed so far.
///
/// Layout for each layer: `[batch * beams, kv_heads, len, head_size]`.
pub struct KvCache {
    /// Past input names, key then value for each declared layer.
    past_names: Vec<String>,
    /// Present output names, index-aligned with `past_names`.
    present_names: Vec<String>,
    pasts: Vec<Tensor>,
    device: Arc<dyn DeviceInterface>,
    dtype: DType,
    batch_beam: usize,
    num_heads: usize,
    head_size: usize,
    /// Current number of positions stored in the cache.
    len: usize,
}

impl KvCache {
    /// Create an empty cache for the layers the loaded decoder declares.
    pub fn new(model: &Model, batch_beam: usize) -> Result<Self> {
        let decoder = &model.config().model.decoder;
        let info = model.session_info();
        let mut past_names = Vec::new();
        let mut present_names = Vec::new();
        for layer in model.decoder_layers() {
            past_names.push(layer_name(&decoder.inputs.past_key_names, layer));
            past_names.push(layer_name(&decoder.inputs.past_value_names, layer));
            present_names.push(layer_name(&decoder.outputs.present_key_names, layer));
            present_names.push(layer_name(&decoder.outputs.present_value_names, layer));
        }

        let (dtype, num_heads, head_size) = match past_names.first() {
            Some(first) => {
                let shape = info.get_input_shape(first)?;
                let declared = |axis: usize, fallback: usize| {
                    shape
                        .get(axis)
                        .filter(|&&d| d > 0)
                        .map_or(fallback, |&d| d as usize)
                };
                (
                    info.get_input_data_type(first)?,
                    declared(1, decoder.num_key_value_heads),
                    declared(3, decoder.head_size),
                )
            }
            None => (DType::F32, decoder.num_key_value_heads, decoder.head_size),
        };

        let device = Arc::clone(model.device_kvcache());
        let empty = Shape::from([batch_beam, num_heads, 0, head_size]);
        let pasts = past_names
            .iter()
            .map(|_| device.allocate(dtype, empty.clone()))
            .collect::<gx_tensor::Result<Vec<_>>>()?;

        Ok(KvCache {
            past_names,
            present_names,
            pasts,
            device,
            dtype,
            batch_beam,
            num_heads,
            head_size,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn layer_count(&self) -> usize {
        self.past_names.len() / 2
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Past tensors to bind for the next step, by name. A non-empty
    /// `indices` (one per row) selects the row each new row continues; the
    /// cache itself only changes when the step's presents are absorbed.
    pub fn step_pasts(&self, indices: &[usize]) -> Result<Vec<(String, Tensor)>> {
        self.past_names
            .iter()
            .zip(&self.pasts)
            .map(|(name, past)| {
                let past = if indices.is_empty() {
                    past.clone()
                } else {
                    past.gather_rows(indices)?
                };
                Ok((name.clone(), past))
            })
            .collect()
    }

    pub fn present_names(&self) -> &[String] {
        &self.present_names
    }

    /// Replace the pasts with the presents a run produced. `take` yields the
    /// present tensor for a name; every present must cover `new_len`
    /// positions.
    pub fn absorb(
        &mut self,
        new_len: usize,
        mut take: impl FnMut(&str) -> Option<Tensor>,
    ) -> Result<()> {
        let expected = [self.batch_beam, self.num_heads, new_len, self.head_size];
        let mut presents = Vec::with_capacity(self.present_names.len());
        for name in &self.present_names {
            let tensor = take(name).ok_or_else(|| {
                ModelError::InvalidArgument(format!("session produced no '{}'", name))
            })?;
            if tensor.shape().dims() != expected {
                return Err(ModelError::TensorError(
                    gx_tensor::TensorError::ShapeMismatch {
                        expected: expected.to_vec(),
                        got: tensor.shape().dims().to_vec(),
                    },
                ));
            }
            presents.push(self.device.copy_from(&tensor)?);
        }
        self.pasts = presents;
        self.len = new_len;
        Ok(())
    }

    /// Truncate every layer to the first `index` positions.
    pub fn rewind_to(&mut self, index: usize) -> Result<()> {
        if index > self.len {
            return Err(ModelError::InvalidArgument(format!(
                "cannot rewind to {} past cached length {}",
                index, self.len
            )));
        }
        for past in &mut self.pasts {
            *past = past.narrow(2, 0, index)?;
        }
        self.len = index;
        Ok(())
    }
}
