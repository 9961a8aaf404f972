//! `gx-model` - Orchestration of pre-compiled inference sessions for text
//! generation.
//!
//! A `Model` loads its sessions through an `InferenceEngine`, optionally
//! compiling them into cached EP-context artifacts first. A `State` binds
//! tensors and runs one decoding step at a time, with KV-cache rewind. The
//! `Tokenizer` and `MultiModalProcessor` turn prompts, images and audio into
//! the named tensors a state consumes.

pub mod adapters;
pub mod compile;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator_params;
pub mod logging;
pub mod model;
pub mod processor;
pub mod session_info;
pub mod state;
pub mod tokenizer;

#[cfg(test)]
mod testing;

pub use adapters::Adapters;
pub use compile::ArtifactStatus;
pub use config::Config;
pub use engine::{EngineError, InferenceEngine, ModelCompatibility, RunOptions, Session};
pub use error::{ModelError, Result};
pub use generator_params::GeneratorParams;
pub use model::{Model, ModelFamily};
pub use processor::{Audio, Audios, Images, MultiModalProcessor, NamedTensors, RgbImage};
pub use session_info::SessionInfo;
pub use state::State;
pub use tokenizer::{Tokenizer, TokenizerStream};
