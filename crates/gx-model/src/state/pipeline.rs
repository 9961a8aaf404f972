use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use gx_tensor::{DType, Tensor};
use tracing::debug;

use super::kv_cache::KvCache;
use super::position_inputs::{PositionInputs, StepPositions};
use super::{beam_indices, last_position_logits, step_length, State, StateCore};
use crate::config::PipelineModel;
use crate::engine::Session;
use crate::error::{ModelError, Result};
use crate::generator_params::{ExtraInput, GeneratorParams};
use crate::model::Model;

struct Stage {
    id: String,
    session: Arc<dyn Session>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    forward: BTreeMap<String, String>,
    run_on_prompt: bool,
    run_on_token_gen: bool,
}

impl Stage {
    fn new(id: &str, session: Arc<dyn Session>, config: &PipelineModel) -> Self {
        let declared = |list: &[String], meta: &[crate::engine::TensorMetadata]| {
            if list.is_empty() {
                meta.iter().map(|m| m.name.clone()).collect()
            } else {
                list.to_vec()
            }
        };
        Stage {
            id: id.to_string(),
            inputs: declared(&config.inputs, session.inputs()),
            outputs: declared(&config.outputs, session.outputs()),
            forward: config.output_names_forwarder.clone(),
            run_on_prompt: config.run_on_prompt,
            run_on_token_gen: config.run_on_token_gen,
            session,
        }
    }

    fn runs(&self, prompt: bool) -> bool {
        if prompt {
            self.run_on_prompt
        } else {
            self.run_on_token_gen
        }
    }
}

/// State for decoders split into an ordered chain of sessions.
///
/// Every stage reads its inputs from a shared pool of named tensors and
/// writes its outputs back into it, so later stages (and later steps) see
/// them. Stage outputs persist across steps, which lets a stage that only
/// runs on the prompt feed every following step. A step's tensors join the
/// pool only when the whole step succeeds.
pub struct PipelineState {
    core: StateCore,
    model: Arc<Model>,
    stages: Vec<Stage>,
    kv_cache: KvCache,
    positions: PositionInputs,
    pool: BTreeMap<String, Tensor>,
    input_ids: (String, DType),
    logits_name: String,
    batch_beam: usize,
}

impl PipelineState {
    pub fn new(model: Arc<Model>, params: Arc<GeneratorParams>) -> Result<Self> {
        let decoder = &model.config().model.decoder;
        let mut stages = Vec::new();
        for (id, stage) in decoder.pipeline_models() {
            let session = model
                .session(id)
                .cloned()
                .ok_or_else(|| ModelError::Config(format!("pipeline stage '{}' has no session", id)))?;
            stages.push(Stage::new(id, session, stage));
        }
        if stages.is_empty() {
            return Err(ModelError::Config("decoder.pipeline is empty".to_string()));
        }
        let input_name = decoder.inputs.input_ids.clone();
        let input_dtype = model.session_info().get_input_data_type(&input_name)?;
        let batch_beam = params.batch_beam_size();
        let mut state = PipelineState {
            core: StateCore::new(Arc::clone(&params), &decoder.run_options),
            kv_cache: KvCache::new(&model, batch_beam)?,
            positions: PositionInputs::new(&model, batch_beam)?,
            pool: BTreeMap::new(),
            input_ids: (input_name, input_dtype),
            logits_name: decoder.outputs.logits.clone(),
            batch_beam,
            stages,
            model,
        };
        state.set_extra_inputs(&params.extra_inputs)?;
        Ok(state)
    }

    /// Tensors one step adds to the pool, kept apart until the step
    /// succeeds, and the step's positions.
    fn step_inputs(
        &self,
        indices: &[usize],
        next_tokens: &[i32],
        seq: usize,
    ) -> Result<(BTreeMap<String, Tensor>, StepPositions)> {
        let mut fresh = BTreeMap::new();
        let (name, dtype) = &self.input_ids;
        let ids = Tensor::from_vec(next_tokens.to_vec(), [self.batch_beam, seq])?;
        let ids = if *dtype == DType::I32 { ids } else { ids.cast(*dtype) };
        fresh.insert(name.clone(), self.model.device_inputs().copy_from(&ids)?);

        let mut step = self
            .positions
            .prepare(indices, next_tokens, seq, self.model.pad_token_id())?;
        for (name, tensor) in step.attention_mask.take().into_iter().chain(step.position_ids.take()) {
            let tensor = self.model.device_inputs().copy_from(&tensor)?;
            fresh.insert(name, tensor);
        }
        fresh.extend(self.kv_cache.step_pasts(indices)?);
        Ok((fresh, step))
    }

    /// Run one stage. Inputs come from `fresh` first, then the pool; outputs
    /// land in `fresh`.
    fn run_stage(
        core: &mut StateCore,
        stage: &Stage,
        pool: &BTreeMap<String, Tensor>,
        fresh: &mut BTreeMap<String, Tensor>,
        capture: bool,
    ) -> Result<()> {
        core.clear_io();
        for name in &stage.inputs {
            match fresh.get(name).or_else(|| pool.get(name)) {
                Some(tensor) => core.bind_input(name, tensor.clone()),
                None => debug!(stage = stage.id.as_str(), name = name.as_str(), "input not available"),
            }
        }
        for name in &stage.outputs {
            core.bind_output(name, None);
        }
        core.run_session(stage.session.as_ref(), capture)?;
        for name in &stage.outputs {
            if let Some(tensor) = core.take_output(name) {
                let key = stage.forward.get(name).unwrap_or(name);
                fresh.insert(key.clone(), tensor);
            }
        }
        Ok(())
    }
}

impl State for PipelineState {
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
        let prompt = self.positions.is_empty();
        let (mut fresh, step) = self.step_inputs(&indices, next_tokens, seq)?;

        let capture = self.core.params().use_graph_capture && seq == 1;
        for stage in &self.stages {
            if !stage.runs(prompt) {
                continue;
            }
            debug!(stage = stage.id.as_str(), "running pipeline stage");
            Self::run_stage(&mut self.core, stage, &self.pool, &mut fresh, capture)?;
        }

        let logits = fresh.get(&self.logits_name).ok_or_else(|| {
            ModelError::InvalidArgument(format!("pipeline produced no '{}'", self.logits_name))
        })?;
        let last = last_position_logits(logits)?;
        self.kv_cache.absorb(total_length, |name| fresh.remove(name))?;
        self.positions.commit(step);
        self.pool.extend(fresh);
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
        Ok(())
    }

    fn current_length(&self) -> usize {
        self.positions.len()
    }

    fn set_extra_inputs(&mut self, extra: &[ExtraInput]) -> Result<()> {
        let wanted: HashSet<&str> = self
            .stages
            .iter()
            .flat_map(|s| s.inputs.iter().map(String::as_str))
            .collect();
        for input in extra {
            if !wanted.contains(input.name.as_str()) {
                debug!(name = input.name.as_str(), "skipping extra input no stage declares");
                continue;
            }
            let tensor = self.model.device_inputs().copy_from(&input.tensor)?;
            self.pool.insert(input.name.clone(), tensor);
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
