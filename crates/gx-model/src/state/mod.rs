//! Per-request execution state.
//!
//! A `State` binds the tensors of one generation request to the model's
//! sessions and runs one decoding step at a time. The shared bookkeeping
//! (bound I/O, adapters, run options, the first-run flag) lives in
//! `StateCore`; the architecture-specific states compose it.

mod decoder;
mod kv_cache;
mod pipeline;
mod position_inputs;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use gx_tensor::{DType, Tensor};
use tracing::debug;

use crate::adapters::{AdapterParams, Adapters};
use crate::engine::{IoBinding, RunOptions, Session};
use crate::error::{ModelError, Result};
use crate::generator_params::{ExtraInput, GeneratorParams};

pub use decoder::DecoderState;
pub use kv_cache::KvCache;
pub use pipeline::PipelineState;
pub use position_inputs::PositionInputs;

/// Run-option key that terminates (`"1"`) or revives (`"0"`) a state.
pub const TERMINATE_SESSION: &str = "terminate_session";
/// Run-option config entry carrying the graph-capture id on the first run.
pub const GPU_GRAPH_ID: &str = "gpu_graph_id";

static NEXT_GRAPH_ID: AtomicI32 = AtomicI32::new(1);

pub trait State: Send {
    /// Execute one decoding step and return the logits of the last position
    /// of every row, `[batch * beams, vocab]`.
    ///
    /// `next_tokens` holds `batch * beams * n` tokens for an `n`-token step
    /// and `total_length` is the sequence length after it. A non-empty
    /// `next_indices` (one per row) selects the rows whose cached state
    /// survives.
    fn run(&mut self, total_length: usize, next_tokens: &[i32], next_indices: &[i32])
        -> Result<Tensor>;

    /// Called once generation is done.
    fn finalize(&mut self, _current_length: usize) {}

    /// Discard cached state past `index`.
    fn rewind_to(&mut self, index: usize) -> Result<()>;

    /// Sequence length covered by the cached state.
    fn current_length(&self) -> usize;

    /// Bind caller-supplied tensors as extra inputs on every run. Names the
    /// model does not declare are skipped.
    fn set_extra_inputs(&mut self, extra: &[ExtraInput]) -> Result<()>;

    fn core(&self) -> &StateCore;

    fn core_mut(&mut self) -> &mut StateCore;

    fn get_input(&self, name: &str) -> Option<&Tensor> {
        self.core().input(name)
    }

    fn get_output(&self, name: &str) -> Option<&Tensor> {
        self.core().output(name)
    }

    fn clear_io(&mut self) {
        self.core_mut().clear_io();
    }

    fn set_active_adapter(&mut self, adapters: &Arc<Adapters>, name: &str) -> Result<()> {
        self.core_mut().set_active_adapter(adapters, name)
    }

    fn set_run_option(&mut self, key: &str, value: &str) -> Result<()> {
        self.core_mut().set_run_option(key, value)
    }

    fn set_run_options(&mut self, options: &BTreeMap<String, String>) -> Result<()> {
        self.core_mut().set_run_options(options)
    }
}

/// Bookkeeping shared by every state.
///
/// Input and output names are kept index-aligned with their values.
pub struct StateCore {
    params: Arc<GeneratorParams>,
    input_names: Vec<String>,
    inputs: Vec<Tensor>,
    output_names: Vec<String>,
    outputs: Vec<Option<Tensor>>,
    /// Declared session outputs no state binds itself.
    extra_outputs: Vec<String>,
    adapters: Option<Weak<Adapters>>,
    active_adapter: Option<(String, AdapterParams)>,
    ep_dynamic_options_next_run: Vec<(String, String)>,
    run_options: RunOptions,
    first_run: bool,
    graph_id: i32,
    session_terminated: bool,
}

impl StateCore {
    pub fn new(params: Arc<GeneratorParams>, run_options: &BTreeMap<String, String>) -> Self {
        let mut base = RunOptions::default();
        for (k, v) in run_options {
            base.add_config_entry(k.clone(), v.clone());
        }
        Self {
            params,
            input_names: Vec::new(),
            inputs: Vec::new(),
            output_names: Vec::new(),
            outputs: Vec::new(),
            extra_outputs: Vec::new(),
            adapters: None,
            active_adapter: None,
            ep_dynamic_options_next_run: Vec::new(),
            run_options: base,
            first_run: true,
            graph_id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            session_terminated: false,
        }
    }

    pub fn params(&self) -> &Arc<GeneratorParams> {
        &self.params
    }

    /// Bind an input, replacing any tensor already bound under `name`.
    pub fn bind_input(&mut self, name: &str, tensor: Tensor) {
        match self.input_names.iter().position(|n| n == name) {
            Some(i) => self.inputs[i] = tensor,
            None => {
                self.input_names.push(name.to_string());
                self.inputs.push(tensor);
            }
        }
    }

    /// Bind an output. `None` lets the engine allocate it.
    pub fn bind_output(&mut self, name: &str, tensor: Option<Tensor>) {
        match self.output_names.iter().position(|n| n == name) {
            Some(i) => self.outputs[i] = tensor,
            None => {
                self.output_names.push(name.to_string());
                self.outputs.push(tensor);
            }
        }
    }

    pub fn unbind_input(&mut self, name: &str) -> Option<Tensor> {
        let i = self.input_names.iter().position(|n| n == name)?;
        self.input_names.remove(i);
        Some(self.inputs.remove(i))
    }

    pub fn input(&self, name: &str) -> Option<&Tensor> {
        let i = self.input_names.iter().position(|n| n == name)?;
        self.inputs.get(i)
    }

    pub fn output(&self, name: &str) -> Option<&Tensor> {
        let i = self.output_names.iter().position(|n| n == name)?;
        self.outputs.get(i)?.as_ref()
    }

    /// Move an output out, leaving its binding engine-allocated.
    pub fn take_output(&mut self, name: &str) -> Option<Tensor> {
        let i = self.output_names.iter().position(|n| n == name)?;
        self.outputs.get_mut(i)?.take()
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn clear_io(&mut self) {
        self.input_names.clear();
        self.inputs.clear();
        self.output_names.clear();
        self.outputs.clear();
        self.extra_outputs.clear();
    }

    /// Names of the outputs bound on the caller's behalf: everything the
    /// last session run declares beyond what the state itself binds.
    pub fn extra_output_names(&self) -> &[String] {
        &self.extra_outputs
    }

    fn bind_extra_outputs(&mut self, session: &dyn Session) {
        for meta in session.outputs() {
            if !self.output_names.contains(&meta.name) {
                self.bind_output(&meta.name, None);
                self.extra_outputs.push(meta.name.clone());
            }
        }
    }

    pub fn first_run(&self) -> bool {
        self.first_run
    }

    pub(crate) fn complete_step(&mut self) {
        self.first_run = false;
    }

    pub(crate) fn reset_first_run(&mut self) {
        self.first_run = true;
    }

    pub fn graph_id(&self) -> i32 {
        self.graph_id
    }

    pub fn is_terminated(&self) -> bool {
        self.session_terminated
    }

    pub fn active_adapter(&self) -> Option<&str> {
        self.active_adapter.as_ref().map(|(name, _)| name.as_str())
    }

    /// Make `name` the active adapter. The previous adapter's parameters are
    /// unbound and its use released.
    pub fn set_active_adapter(&mut self, adapters: &Arc<Adapters>, name: &str) -> Result<()> {
        if let Some(bound) = &self.adapters {
            if !std::ptr::eq(bound.as_ptr(), Arc::as_ptr(adapters)) {
                return Err(ModelError::InvalidArgument(
                    "state is already bound to a different adapter registry".to_string(),
                ));
            }
        }
        if self.active_adapter() == Some(name) {
            return Ok(());
        }
        let params = adapters.acquire(name)?;
        self.release_adapter();
        self.adapters = Some(Arc::downgrade(adapters));
        debug!(adapter = name, "activated adapter");
        self.active_adapter = Some((name.to_string(), params));
        Ok(())
    }

    fn release_adapter(&mut self) {
        let Some((name, params)) = self.active_adapter.take() else {
            return;
        };
        for (param, _) in params.iter() {
            self.unbind_input(param);
        }
        if let Some(registry) = self.adapters.as_ref().and_then(Weak::upgrade) {
            registry.release(&name);
        }
    }

    pub fn set_run_option(&mut self, key: &str, value: &str) -> Result<()> {
        if key == TERMINATE_SESSION {
            self.session_terminated = match value {
                "1" => true,
                "0" => false,
                other => {
                    return Err(ModelError::InvalidArgument(format!(
                        "{} must be \"0\" or \"1\", got {:?}",
                        TERMINATE_SESSION, other
                    )))
                }
            };
            return Ok(());
        }
        self.ep_dynamic_options_next_run
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    pub fn set_run_options(&mut self, options: &BTreeMap<String, String>) -> Result<()> {
        for (k, v) in options {
            self.set_run_option(k, v)?;
        }
        Ok(())
    }

    /// Invoke the engine with everything currently bound.
    pub(crate) fn run_session(
        &mut self,
        session: &dyn Session,
        graph_capture_this_run: bool,
    ) -> Result<()> {
        if self.session_terminated {
            return Err(ModelError::SessionTerminated);
        }
        let mut options = self.run_options.clone();
        options.ep_dynamic_options = std::mem::take(&mut self.ep_dynamic_options_next_run);
        if self.first_run && self.params.use_graph_capture {
            let id = if graph_capture_this_run { self.graph_id } else { -1 };
            options.add_config_entry(GPU_GRAPH_ID, id.to_string());
        }
        if let Some((_, params)) = self.active_adapter.clone() {
            for (name, tensor) in params.iter() {
                if self.input(name).is_none() {
                    self.bind_input(name, tensor.clone());
                }
            }
        }
        self.bind_extra_outputs(session);

        debug!(
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            first_run = self.first_run,
            "running session"
        );
        session.run(
            IoBinding {
                input_names: &self.input_names,
                inputs: &self.inputs,
                output_names: &self.output_names,
                outputs: &mut self.outputs,
            },
            &options,
        )?;
        Ok(())
    }

    pub fn dump_inputs(&self) {
        for (name, tensor) in self.input_names.iter().zip(&self.inputs) {
            debug!(
                name = name.as_str(),
                dtype = %tensor.dtype(),
                shape = %tensor.shape(),
                device = %tensor.device(),
                "input"
            );
        }
    }

    pub fn dump_outputs(&self) {
        for (name, tensor) in self.output_names.iter().zip(&self.outputs) {
            match tensor {
                Some(t) => debug!(
                    name = name.as_str(),
                    dtype = %t.dtype(),
                    shape = %t.shape(),
                    device = %t.device(),
                    "output"
                ),
                None => debug!(name = name.as_str(), "output (unallocated)"),
            }
        }
    }
}

impl Drop for StateCore {
    fn drop(&mut self) {
        self.release_adapter();
    }
}

/// Convert beam indices to row indices, checking their count.
pub(crate) fn beam_indices(next_indices: &[i32], batch_beam: usize) -> Result<Vec<usize>> {
    if next_indices.is_empty() {
        return Ok(Vec::new());
    }
    if next_indices.len() != batch_beam {
        return Err(ModelError::InvalidArgument(format!(
            "expected {} beam indices, got {}",
            batch_beam,
            next_indices.len()
        )));
    }
    next_indices
        .iter()
        .map(|&i| {
            usize::try_from(i)
                .ok()
                .filter(|&i| i < batch_beam)
                .ok_or_else(|| ModelError::InvalidArgument(format!("beam index {} out of range", i)))
        })
        .collect()
}

/// Logits of the last position of each row as f32 `[rows, vocab]`.
pub(crate) fn last_position_logits(logits: &Tensor) -> Result<Tensor> {
    let dims = logits.shape().dims().to_vec();
    let last = match dims.as_slice() {
        [_, _] => logits.clone(),
        [rows, seq, vocab] if *seq > 0 => logits.narrow(1, seq - 1, 1)?.reshape([*rows, *vocab])?,
        _ => {
            return Err(ModelError::InvalidArgument(format!(
                "unexpected logits shape {}",
                logits.shape()
            )))
        }
    };
    Ok(if last.dtype() == DType::F32 {
        last
    } else {
        last.cast(DType::F32)
    })
}

/// Check the token count of a step and return its length per row.
/// `max_length` of zero means unbounded.
pub(crate) fn step_length(
    next_tokens: &[i32],
    batch_beam: usize,
    past: usize,
    total_length: usize,
    max_length: usize,
) -> Result<usize> {
    if next_tokens.is_empty() || next_tokens.len() % batch_beam != 0 {
        return Err(ModelError::InvalidArgument(format!(
            "{} tokens do not divide into {} rows",
            next_tokens.len(),
            batch_beam
        )));
    }
    let seq = next_tokens.len() / batch_beam;
    if past + seq != total_length {
        return Err(ModelError::InvalidArgument(format!(
            "total length {} does not match cached {} plus {} new tokens",
            total_length, past, seq
        )));
    }
    if max_length > 0 && total_length > max_length {
        return Err(ModelError::InvalidArgument(format!(
            "total length {} exceeds max_length {}",
            total_length, max_length
        )));
    }
    Ok(seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::TensorMetadata;
    use crate::testing::{RecordingSession, StubSession};

    fn core() -> StateCore {
        StateCore::new(
            Arc::new(GeneratorParams::from_config(&Config::default())),
            &BTreeMap::new(),
        )
    }

    #[test]
    fn test_bind_replace_and_clear() {
        let mut core = core();
        core.bind_input("a", Tensor::zeros(DType::F32, [1]));
        core.bind_input("b", Tensor::zeros(DType::F32, [2]));
        core.bind_input("a", Tensor::zeros(DType::F32, [3]));
        assert_eq!(core.input_names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(core.input("a").unwrap().numel(), 3);
        core.bind_output("logits", None);
        assert!(core.output("logits").is_none());
        core.clear_io();
        assert!(core.input_names().is_empty());
        assert!(core.output_names().is_empty());
        assert!(core.input("a").is_none());
    }

    #[test]
    fn test_unbind_keeps_alignment() {
        let mut core = core();
        core.bind_input("a", Tensor::zeros(DType::F32, [1]));
        core.bind_input("b", Tensor::zeros(DType::F32, [2]));
        assert!(core.unbind_input("a").is_some());
        assert_eq!(core.input("b").unwrap().numel(), 2);
        assert!(core.unbind_input("a").is_none());
    }

    #[test]
    fn test_run_options_apply_to_next_run_only() {
        let mut core = core();
        let session = RecordingSession::default();
        core.set_run_option("ep.dynamic.workload_type", "Efficient").unwrap();
        core.run_session(&session, false).unwrap();
        core.run_session(&session, false).unwrap();
        let runs = session.runs();
        assert_eq!(
            runs[0].ep_dynamic_options,
            vec![("ep.dynamic.workload_type".to_string(), "Efficient".to_string())]
        );
        assert!(runs[1].ep_dynamic_options.is_empty());
    }

    #[test]
    fn test_terminate_session() {
        let mut core = core();
        let session = RecordingSession::default();
        core.set_run_option(TERMINATE_SESSION, "1").unwrap();
        assert!(matches!(
            core.run_session(&session, false),
            Err(ModelError::SessionTerminated)
        ));
        assert!(session.runs().is_empty());
        core.set_run_option(TERMINATE_SESSION, "0").unwrap();
        core.run_session(&session, false).unwrap();
        assert!(core.set_run_option(TERMINATE_SESSION, "yes").is_err());
    }

    #[test]
    fn test_undeclared_outputs_bound_for_caller() {
        let mut core = core();
        let session = StubSession {
            outputs: vec![
                TensorMetadata::new("logits", DType::F32, Vec::new()),
                TensorMetadata::new("hidden_states", DType::F32, Vec::new()),
            ],
            ..StubSession::default()
        };
        core.bind_output("logits", None);
        core.run_session(&session, false).unwrap();
        assert_eq!(core.extra_output_names(), &["hidden_states".to_string()]);
        assert_eq!(
            core.output_names(),
            &["logits".to_string(), "hidden_states".to_string()]
        );
        core.run_session(&session, false).unwrap();
        assert_eq!(core.extra_output_names().len(), 1);
        core.clear_io();
        assert!(core.extra_output_names().is_empty());
    }

    #[test]
    fn test_graph_id_on_first_run_only() {
        let mut params = GeneratorParams::from_config(&Config::default());
        params.use_graph_capture = true;
        let mut core = StateCore::new(Arc::new(params), &BTreeMap::new());
        let session = RecordingSession::default();
        core.run_session(&session, true).unwrap();
        core.complete_step();
        core.run_session(&session, true).unwrap();
        let runs = session.runs();
        let id = core.graph_id().to_string();
        assert_eq!(runs[0].config_entry(GPU_GRAPH_ID), Some(id.as_str()));
        assert_eq!(runs[1].config_entry(GPU_GRAPH_ID), None);

        let mut params = GeneratorParams::from_config(&Config::default());
        params.use_graph_capture = true;
        let mut other = StateCore::new(Arc::new(params), &BTreeMap::new());
        other.run_session(&session, false).unwrap();
        assert_eq!(session.runs()[2].config_entry(GPU_GRAPH_ID), Some("-1"));
        assert_ne!(other.graph_id(), core.graph_id());
    }

    #[test]
    fn test_adapter_switching() {
        let adapters = Arc::new(Adapters::new());
        adapters
            .load_adapter("a", vec![("lora.a".to_string(), Tensor::zeros(DType::F32, [1]))])
            .unwrap();
        adapters
            .load_adapter("b", vec![("lora.b".to_string(), Tensor::zeros(DType::F32, [1]))])
            .unwrap();
        let session = RecordingSession::default();
        let mut core = core();

        core.set_active_adapter(&adapters, "a").unwrap();
        core.run_session(&session, false).unwrap();
        assert!(core.input("lora.a").is_some());
        assert_eq!(adapters.ref_count("a"), Some(1));

        core.set_active_adapter(&adapters, "b").unwrap();
        assert!(core.input("lora.a").is_none());
        assert_eq!(adapters.ref_count("a"), Some(0));
        core.run_session(&session, false).unwrap();
        assert!(core.input("lora.b").is_some());
        assert_eq!(core.active_adapter(), Some("b"));

        assert!(matches!(
            core.set_active_adapter(&adapters, "missing"),
            Err(ModelError::UnknownAdapter(_))
        ));
        assert_eq!(core.active_adapter(), Some("b"));

        let other = Arc::new(Adapters::new());
        assert!(core.set_active_adapter(&other, "b").is_err());

        drop(core);
        assert_eq!(adapters.ref_count("b"), Some(0));
        adapters.unload_adapter("b").unwrap();
    }

    #[test]
    fn test_beam_indices() {
        assert!(beam_indices(&[], 4).unwrap().is_empty());
        assert_eq!(beam_indices(&[1, 0], 2).unwrap(), vec![1, 0]);
        assert!(beam_indices(&[0], 2).is_err());
        assert!(beam_indices(&[0, 2], 2).is_err());
        assert!(beam_indices(&[-1, 0], 2).is_err());
    }

    #[test]
    fn test_last_position_logits() {
        let logits = Tensor::from_vec((0..12).map(|v| v as f32).collect(), [2, 2, 3]).unwrap();
        let last = last_position_logits(&logits).unwrap();
        assert_eq!(last.shape().dims(), &[2, 3]);
        assert_eq!(last.data::<f32>().unwrap(), &[3.0, 4.0, 5.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_step_length() {
        assert_eq!(step_length(&[1, 2, 3, 4], 2, 0, 2, 0).unwrap(), 2);
        assert!(step_length(&[1, 2, 3], 2, 0, 2, 0).is_err());
        assert!(step_length(&[], 1, 0, 0, 0).is_err());
        assert!(step_length(&[1, 2], 2, 3, 5, 0).is_err());
        assert_eq!(step_length(&[1, 2], 1, 2, 4, 4).unwrap(), 2);
        assert!(step_length(&[1, 2], 1, 3, 5, 4).is_err());
    }
}
