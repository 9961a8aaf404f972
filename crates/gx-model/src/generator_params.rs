use gx_tensor::Tensor;

use crate::config::Config;
use crate::processor::NamedTensors;

/// A caller-supplied tensor bound as an additional session input.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraInput {
    pub name: String,
    pub tensor: Tensor,
}

/// Per-request generation settings. Built before the state and shared with
/// it read-only through `Arc`.
#[derive(Debug, Clone)]
pub struct GeneratorParams {
    pub batch_size: usize,
    pub num_beams: usize,
    pub max_length: usize,
    pub use_graph_capture: bool,
    pub extra_inputs: Vec<ExtraInput>,
}

impl GeneratorParams {
    /// Defaults from the search section and the decoder session options.
    pub fn from_config(config: &Config) -> Self {
        let search = &config.search;
        let max_length = if search.max_length == 0 {
            config.model.context_length
        } else {
            search.max_length
        };
        Self {
            batch_size: search.batch_size.max(1),
            num_beams: search.num_beams.max(1),
            max_length,
            use_graph_capture: config.model.decoder.session_options.graph_capture_enabled(),
            extra_inputs: Vec::new(),
        }
    }

    /// Rows the state runs: `batch_size * num_beams`.
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.num_beams
    }

    /// Attach named tensors (e.g. processor output) as extra inputs. A name
    /// already present is replaced.
    pub fn set_inputs(&mut self, inputs: NamedTensors) {
        for (name, tensor) in inputs {
            match self.extra_inputs.iter_mut().find(|e| e.name == name) {
                Some(existing) => existing.tensor = tensor,
                None => self.extra_inputs.push(ExtraInput { name, tensor }),
            }
        }
    }
}
