//! The seam to the inference engine.
//!
//! Everything that actually executes a graph lives behind these traits: the
//! engine creates sessions from model files, compiles models ahead of time
//! for an execution provider, reports whether a compiled artifact is still
//! suitable, and hands out device interfaces. This crate only binds tensors
//! and invokes it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gx_tensor::{DType, DeviceInterface, DeviceType, Tensor};
use thiserror::Error;

use crate::config::SessionOptions;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("shape mismatch for '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        got: Vec<usize>,
    },
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("{provider} fault: {message}")]
    ProviderFault { provider: String, message: String },
    #[error("compilation failed: {0}")]
    Compile(String),
    #[error("{0}")]
    Other(String),
}

/// A declared tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
}

/// Name, element type and shape of a session input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMetadata {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<Dim>,
}

impl TensorMetadata {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }
}

/// Per-invocation options handed to `Session::run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub config_entries: BTreeMap<String, String>,
    /// Execution-provider dynamic options applied before this run.
    pub ep_dynamic_options: Vec<(String, String)>,
}

impl RunOptions {
    pub fn add_config_entry(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config_entries.insert(key.into(), value.into());
    }

    pub fn config_entry(&self, key: &str) -> Option<&str> {
        self.config_entries.get(key).map(String::as_str)
    }
}

/// Input and output tensors bound for one run. Names and values are
/// index-aligned. An output bound as `None` is allocated by the engine; a
/// preallocated output may be replaced.
#[derive(Debug)]
pub struct IoBinding<'a> {
    pub input_names: &'a [String],
    pub inputs: &'a [Tensor],
    pub output_names: &'a [String],
    pub outputs: &'a mut [Option<Tensor>],
}

impl IoBinding<'_> {
    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.input_names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.inputs[i])
    }

    pub fn set_output(&mut self, name: &str, tensor: Tensor) -> bool {
        match self.output_names.iter().position(|n| n == name) {
            Some(i) => {
                self.outputs[i] = Some(tensor);
                true
            }
            None => false,
        }
    }
}

/// A loaded, executable model.
pub trait Session: Send + Sync {
    fn inputs(&self) -> &[TensorMetadata];

    fn outputs(&self) -> &[TensorMetadata];

    /// Execute the graph once with the given binding. Blocks until done.
    fn run(&self, binding: IoBinding<'_>, options: &RunOptions) -> Result<(), EngineError>;
}

/// Suitability of a compiled artifact for a provider, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCompatibility {
    Optimal,
    PreferRecompilation,
    Unsupported,
    NotApplicable,
}

/// Everything the engine needs to compile a model ahead of time.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub session_options: SessionOptions,
    pub provider: String,
    pub graph_optimization_level: Option<i32>,
    pub embed_ep_context: bool,
    pub flags: u32,
    pub external_initializers_path: Option<PathBuf>,
    pub external_initializers_size_threshold: usize,
}

pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Open a model file into a session. Load-time validation failures are
    /// reported here.
    fn create_session(
        &self,
        path: &Path,
        options: &SessionOptions,
    ) -> Result<Arc<dyn Session>, EngineError>;

    /// Compile a model into an EP-context artifact at `request.output_path`.
    fn compile_model(&self, request: &CompileRequest) -> Result<(), EngineError>;

    /// Compatibility metadata of a compiled artifact for `provider`, or
    /// `None` if the artifact carries none.
    fn model_compatibility(
        &self,
        path: &Path,
        provider: &str,
    ) -> Result<Option<ModelCompatibility>, EngineError>;

    /// Device interface for `device_type`, if this engine drives it.
    fn device(&self, device_type: DeviceType) -> Option<Arc<dyn DeviceInterface>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_lookup_and_set() {
        let names = vec!["input_ids".to_string()];
        let inputs = vec![Tensor::from_vec(vec![1i64, 2], [1, 2]).unwrap()];
        let out_names = vec!["logits".to_string()];
        let mut outputs = vec![None];
        let mut binding = IoBinding {
            input_names: &names,
            inputs: &inputs,
            output_names: &out_names,
            outputs: &mut outputs,
        };
        assert!(binding.input("input_ids").is_some());
        assert!(binding.input("attention_mask").is_none());
        assert!(binding.set_output("logits", Tensor::zeros(DType::F32, [1, 4])));
        assert!(!binding.set_output("hidden", Tensor::zeros(DType::F32, [1])));
        assert!(outputs[0].is_some());
    }

    #[test]
    fn test_run_option_entries() {
        let mut opts = RunOptions::default();
        opts.add_config_entry("gpu_graph_id", "-1");
        assert_eq!(opts.config_entry("gpu_graph_id"), Some("-1"));
        assert_eq!(opts.config_entry("missing"), None);
    }
}
