use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("missing configuration field: {0}")]
    MissingField(String),
    #[error("unsupported model type: {0}")]
    UnsupportedModelType(String),
    #[error("adapter not found: {0}")]
    UnknownAdapter(String),
    #[error("adapter '{0}' is still in use")]
    AdapterInUse(String),
    #[error("{model_type} requires {modality} input")]
    MissingModality {
        model_type: String,
        modality: &'static str,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session was terminated")]
    SessionTerminated,
    #[error("tokenizer error: {0}")]
    TokenizerError(String),
    #[error("chat template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("tensor error: {0}")]
    TensorError(#[from] gx_tensor::TensorError),
}

impl ModelError {
    /// Returns true for errors caused by configuration or request setup, as
    /// opposed to failures reported by the inference engine.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::MissingField(_)
                | Self::UnsupportedModelType(_)
                | Self::UnknownAdapter(_)
                | Self::AdapterInUse(_)
                | Self::MissingModality { .. }
                | Self::InvalidArgument(_)
                | Self::Json { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
