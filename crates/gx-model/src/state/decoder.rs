use std::sync::Arc;

use gx_tensor::{DType, Tensor};
use tracing::debug;

use super::kv_cache::KvCache;
use super::position_inputs::{PositionInputs, StepPositions};
use super::{beam_indices, last_position_logits, step_length, State, StateCore};
use crate::config::DECODER_STAGE;
use crate::engine::Session;
use crate::error::{ModelError, Result};
use crate::generator_params::{ExtraInput, GeneratorParams};
use crate::model::Model;

/// State for models driven by a single decoder session.
pub struct DecoderState {
    core: StateCore,
    model: Arc<Model>,
    session: Arc<dyn Session>,
    kv_cache: KvCache,
    positions: PositionInputs,
    input_ids: (String, DType),
    logits_name: String,
    extra: Vec<ExtraInput>,
    batch_beam: usize,
}

impl DecoderState {
    pub fn new(model: Arc<Model>, params: Arc<GeneratorParams>) -> Result<Self> {
        let session = model
            .session(DECODER_STAGE)
            .cloned()
            .ok_or_else(|| ModelError::Config("model has no decoder session".to_string()))?;
        let decoder = &model.config().model.decoder;
        let input_name = decoder.inputs.input_ids.clone();
        let input_dtype = model.session_info().get_input_data_type(&input_name)?;
        let batch_beam = params.batch_beam_size();
        let mut state = DecoderState {
            core: StateCore::new(Arc::clone(&params), &decoder.run_options),
            kv_cache: KvCache::new(&model, batch_beam)?,
            positions: PositionInputs::new(&model, batch_beam)?,
            input_ids: (input_name, input_dtype),
            logits_name: decoder.outputs.logits.clone(),
            extra: Vec::new(),
            batch_beam,
            session,
            model,
        };
        state.set_extra_inputs(&params.extra_inputs)?;
        Ok(state)
    }

    /// Bind everything one step reads. Returns the step's positions, to be
    /// committed once the run succeeds.
    fn bind_step(
        &mut self,
        indices: &[usize],
        next_tokens: &[i32],
        seq: usize,
    ) -> Result<StepPositions> {
        let (name, dtype) = &self.input_ids;
        let ids = Tensor::from_vec(next_tokens.to_vec(), [self.batch_beam, seq])?;
        let ids = if *dtype == DType::I32 { ids } else { ids.cast(*dtype) };
        let ids = self.model.device_inputs().copy_from(&ids)?;
        self.core.bind_input(name, ids);

        let mut step = self
            .positions
            .prepare(indices, next_tokens, seq, self.model.pad_token_id())?;
        for (name, tensor) in step.attention_mask.take().into_iter().chain(step.position_ids.take()) {
            let tensor = self.model.device_inputs().copy_from(&tensor)?;
            self.core.bind_input(&name, tensor);
        }

        for (name, past) in self.kv_cache.step_pasts(indices)? {
            self.core.bind_input(&name, past);
        }
        for extra in &self.extra {
            self.core.bind_input(&extra.name, extra.tensor.clone());
        }
        for name in self.kv_cache.present_names() {
            self.core.bind_output(name, None);
        }
        self.core.bind_output(&self.logits_name, None);
        Ok(step)
    }
}

impl State for DecoderState {
    fn run(
        &mut self,
        total_length: usize,
        next_tokens: &[i32],
        next_indices: &[i32],
    ) -> Result<Tensor> {
        let indices = beam_indices(next_indices, self.batch_beam)?;
        let seq = step_length(
            next_tokens,
            self.batch_beam,
            self.positions.len(),
            total_length,
            self.core.params().max_length,
        )?;

        // the cache and positions only move once the step has fully succeeded
        let step = self.bind_step(&indices, next_tokens, seq)?;
        let capture = self.core.params().use_graph_capture && seq == 1;
        self.core.run_session(self.session.as_ref(), capture)?;

        let logits = self.core.output(&self.logits_name).ok_or_else(|| {
            ModelError::InvalidArgument(format!("session produced no '{}'", self.logits_name))
        })?;
        let last = last_position_logits(logits)?;
        let core = &mut self.core;
        self.kv_cache.absorb(total_length, |name| core.take_output(name))?;
        self.positions.commit(step);
        self.core.complete_step();
        Ok(last)
    }

    fn rewind_to(&mut self, index: usize) -> Result<()> {
        let current = self.positions.len();
        if index > current {
            return Err(ModelError::InvalidArgument(format!(
                "cannot rewind to {} past current length {}",
                index, current
            )));
        }
        if index == current {
            return Ok(());
        }
        self.kv_cache.rewind_to(index)?;
        self.positions.rewind_to(index);
        if index == 0 {
            self.core.reset_first_run();
        }
        debug!(index, "rewound decoder state");
        Ok(())
    }

    fn current_length(&self) -> usize {
        self.positions.len()
    }

    fn set_extra_inputs(&mut self, extra: &[ExtraInput]) -> Result<()> {
        let info = self.model.session_info();
        for input in extra {
            if !info.has_input(&input.name) {
                debug!(name = input.name.as_str(), "skipping extra input the model does not declare");
                continue;
            }
            let tensor = self.model.device_inputs().copy_from(&input.tensor)?;
            match self.extra.iter_mut().find(|e| e.name == input.name) {
                Some(existing) => existing.tensor = tensor,
                None => self.extra.push(ExtraInput {
                    name: input.name.clone(),
                    tensor,
                }),
            }
        }
        Ok(())
    }

    fn core(&self) -> &StateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StateCore {
        &mut self.core
    }
}
