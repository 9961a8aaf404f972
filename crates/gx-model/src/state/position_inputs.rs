use gx_tensor::{DType, Tensor};

use crate::error::{ModelError, Result};
use crate::model::Model;

/// Attention mask and position ids for each row.
///
/// On the prompt step pad tokens are masked out and real tokens are numbered
/// from zero (pads get position 0). Later steps append ones to the mask and
/// continue numbering where each row left off.
pub struct PositionInputs {
    mask_name: Option<(String, DType)>,
    position_name: Option<(String, DType)>,
    /// Per-row mask over every position executed so far.
    mask: Vec<Vec<i64>>,
}

/// Tensors for one step, plus the mask they were built from. Nothing is
/// recorded in `PositionInputs` until the step is committed.
pub struct StepPositions {
    pub attention_mask: Option<(String, Tensor)>,
    pub position_ids: Option<(String, Tensor)>,
    mask: Vec<Vec<i64>>,
}

impl PositionInputs {
    pub fn new(model: &Model, batch_beam: usize) -> Result<Self> {
        let inputs = &model.config().model.decoder.inputs;
        let info = model.session_info();
        let declared = |name: &str| -> Result<Option<(String, DType)>> {
            if info.has_input(name) {
                Ok(Some((name.to_string(), info.get_input_data_type(name)?)))
            } else {
                Ok(None)
            }
        };
        Ok(Self {
            mask_name: declared(&inputs.attention_mask)?,
            position_name: declared(&inputs.position_ids)?,
            mask: vec![Vec::new(); batch_beam],
        })
    }

    pub fn len(&self) -> usize {
        self.mask.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the tensors for a step extending every row by `seq` tokens from
    /// `next_tokens` (row-major). A non-empty `indices` first selects which
    /// row each new row continues.
    pub fn prepare(
        &self,
        indices: &[usize],
        next_tokens: &[i32],
        seq: usize,
        pad_token_id: i32,
    ) -> Result<StepPositions> {
        let rows = self.mask.len();
        if next_tokens.len() != rows * seq {
            return Err(ModelError::InvalidArgument(format!(
                "expected {} tokens for {} rows, got {}",
                rows * seq,
                rows,
                next_tokens.len()
            )));
        }
        let mut mask: Vec<Vec<i64>> = if indices.is_empty() {
            self.mask.clone()
        } else {
            indices.iter().map(|&i| self.mask[i].clone()).collect()
        };
        let prompt = self.is_empty();
        let mut positions = Vec::with_capacity(rows * seq);
        for (row, tokens) in mask.iter_mut().zip(next_tokens.chunks(seq)) {
            let mut next: i64 = row.iter().sum();
            for &token in tokens {
                let real = !prompt || token != pad_token_id;
                if real {
                    positions.push(next);
                    next += 1;
                    row.push(1);
                } else {
                    positions.push(0);
                    row.push(0);
                }
            }
        }

        let total = self.len() + seq;
        let attention_mask = match &self.mask_name {
            Some((name, dtype)) => {
                let flat: Vec<i64> = mask.iter().flatten().copied().collect();
                let t = Tensor::from_vec(flat, [rows, total])?;
                Some((name.clone(), cast_to(t, *dtype)))
            }
            None => None,
        };
        let position_ids = match &self.position_name {
            Some((name, dtype)) => {
                let t = Tensor::from_vec(positions, [rows, seq])?;
                Some((name.clone(), cast_to(t, *dtype)))
            }
            None => None,
        };
        Ok(StepPositions {
            attention_mask,
            position_ids,
            mask,
        })
    }

    /// Record a step once it has run.
    pub fn commit(&mut self, step: StepPositions) {
        self.mask = step.mask;
    }

    pub fn rewind_to(&mut self, index: usize) {
        for row in &mut self.mask {
            row.truncate(index);
        }
    }
}

fn cast_to(t: Tensor, dtype: DType) -> Tensor {
    if t.dtype() == dtype {
        t
    } else {
        t.cast(dtype)
    }
}
