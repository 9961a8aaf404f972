use std::collections::HashMap;

use gx_tensor::DType;

use crate::engine::{Dim, Session, TensorMetadata};
use crate::error::{ModelError, Result};

/// Declared input/output types and shapes of every session a model loaded.
///
/// Populated with `add` while the model is constructed and read-only after.
/// When two sessions declare the same name the later one wins.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    inputs: HashMap<String, TensorMetadata>,
    outputs: HashMap<String, TensorMetadata>,
    input_order: Vec<String>,
}

impl SessionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the declared inputs and outputs of a session.
    pub fn add(&mut self, session: &dyn Session) {
        for meta in session.inputs() {
            if self.inputs.insert(meta.name.clone(), meta.clone()).is_none() {
                self.input_order.push(meta.name.clone());
            }
        }
        for meta in session.outputs() {
            self.outputs.insert(meta.name.clone(), meta.clone());
        }
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    pub fn get_input_data_type(&self, name: &str) -> Result<DType> {
        lookup(&self.inputs, name, "input").map(|m| m.dtype)
    }

    pub fn get_output_data_type(&self, name: &str) -> Result<DType> {
        lookup(&self.outputs, name, "output").map(|m| m.dtype)
    }

    /// Input names in the order they were first declared.
    pub fn get_input_names(&self) -> &[String] {
        &self.input_order
    }

    /// Declared input shape; symbolic dimensions read as -1.
    pub fn get_input_shape(&self, name: &str) -> Result<Vec<i64>> {
        lookup(&self.inputs, name, "input").map(|m| fixed_dims(&m.shape))
    }

    pub fn get_output_shape(&self, name: &str) -> Result<Vec<i64>> {
        lookup(&self.outputs, name, "output").map(|m| fixed_dims(&m.shape))
    }

    /// Symbolic dimension names of an input; `None` for fixed dimensions.
    pub fn get_input_symbolic_shape(&self, name: &str) -> Result<Vec<Option<&str>>> {
        lookup(&self.inputs, name, "input").map(|m| symbolic_dims(&m.shape))
    }

    pub fn get_output_symbolic_shape(&self, name: &str) -> Result<Vec<Option<&str>>> {
        lookup(&self.outputs, name, "output").map(|m| symbolic_dims(&m.shape))
    }
}

fn lookup<'a>(
    map: &'a HashMap<String, TensorMetadata>,
    name: &str,
    kind: &str,
) -> Result<&'a TensorMetadata> {
    map.get(name)
        .ok_or_else(|| ModelError::InvalidArgument(format!("model has no {} named '{}'", kind, name)))
}

fn fixed_dims(shape: &[Dim]) -> Vec<i64> {
    shape
        .iter()
        .map(|d| match d {
            Dim::Fixed(n) => *n,
            Dim::Symbolic(_) => -1,
        })
        .collect()
}

fn symbolic_dims(shape: &[Dim]) -> Vec<Option<&str>> {
    shape
        .iter()
        .map(|d| match d {
            Dim::Fixed(_) => None,
            Dim::Symbolic(s) => Some(s.as_str()),
        })
        .collect()
}
