//! Ahead-of-time compilation into EP-context artifacts and their reuse.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{CompileOptions, SessionOptions};
use crate::engine::{CompileRequest, ModelCompatibility};
use crate::error::Result;
use crate::model::Model;

/// How the artifact used for a stage was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// Compiled during this model's construction.
    Compiled,
    /// An existing artifact the engine reported as optimal.
    Reused,
    /// An existing artifact the engine would rather recompile, kept because
    /// `force_compile_if_needed` was not set.
    ReusedPreferRecompilation,
}

/// Default artifact location: `<dir>/contexts/<stem>[_<provider>]_ctx.<ext>`.
fn default_artifact_path(dir: &Path, filename: &str, provider: &str) -> PathBuf {
    let source = Path::new(filename);
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "onnx".to_string());
    let name = if provider.is_empty() {
        format!("{}_ctx.{}", stem, ext)
    } else {
        format!("{}_{}_ctx.{}", stem, provider, ext)
    };
    dir.join("contexts").join(name)
}

pub fn check_compiled_model_exists(path: &Path) -> bool {
    path.is_file()
}

impl Model {
    /// Resolve the model file to open for `stage_id`, compiling it first when
    /// `compile_options.enable_ep_context` is set and no valid artifact exists.
    ///
    /// Returns the original path when compilation is not configured. With
    /// `is_primary`, every pipeline stage is compiled as well.
    pub fn compile_model(
        &mut self,
        stage_id: &str,
        filename: &str,
        options: &SessionOptions,
        is_primary: bool,
        compile_options: Option<&CompileOptions>,
    ) -> Result<PathBuf> {
        if let Some(path) = self.pipeline_compiled_model_paths.get(stage_id) {
            return Ok(path.clone());
        }

        let path = match compile_options.filter(|c| c.enable_ep_context == Some(true)) {
            Some(compile) => self.compile_stage(stage_id, filename, options, compile)?,
            None => self.config.resolve(filename),
        };
        self.pipeline_compiled_model_paths
            .insert(stage_id.to_string(), path.clone());

        if is_primary {
            let decoder = self.config.model.decoder.clone();
            for (id, stage) in decoder.pipeline_models() {
                let stage_options = stage
                    .session_options
                    .clone()
                    .unwrap_or_else(|| decoder.session_options.clone());
                let stage_compile = stage
                    .compile_options
                    .as_ref()
                    .or(decoder.compile_options.as_ref());
                self.compile_model(id, &stage.filename, &stage_options, false, stage_compile)?;
            }
        }
        Ok(path)
    }

    fn compile_stage(
        &mut self,
        stage_id: &str,
        filename: &str,
        options: &SessionOptions,
        compile: &CompileOptions,
    ) -> Result<PathBuf> {
        let provider = Self::ep_context_provider_name(self.device_type());
        let output_path = match &compile.ep_context_file_path {
            Some(path) => self.config.resolve(path),
            None => default_artifact_path(&self.config.config_path, filename, provider),
        };
        let force = compile.force_compile_if_needed.unwrap_or(false);

        if check_compiled_model_exists(&output_path) {
            if let Some(status) = self.validate_compiled_model(&output_path, force) {
                info!(stage = stage_id, path = %output_path.display(), "reusing compiled model");
                self.artifact_status.insert(stage_id.to_string(), status);
                return Ok(output_path);
            }
        }

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let request = CompileRequest {
            input_path: self.config.resolve(filename),
            output_path: output_path.clone(),
            session_options: options.clone(),
            provider: provider.to_string(),
            graph_optimization_level: compile.graph_optimization_level,
            embed_ep_context: compile.ep_context_embed_mode.unwrap_or(false),
            flags: compile.flags.unwrap_or(0),
            external_initializers_path: compile
                .external_initializers_file_path
                .as_ref()
                .map(|p| self.config.resolve(p)),
            external_initializers_size_threshold: compile
                .external_initializers_size_threshold
                .unwrap_or(0),
        };
        self.engine.compile_model(&request)?;
        info!(stage = stage_id, path = %output_path.display(), "compiled model");
        self.artifact_status
            .insert(stage_id.to_string(), ArtifactStatus::Compiled);
        Ok(output_path)
    }

    /// Decide whether an existing artifact may be reused. `None` means it
    /// must be recompiled.
    pub fn validate_compiled_model(&self, path: &Path, force: bool) -> Option<ArtifactStatus> {
        let provider = Self::ep_context_provider_name(self.device_type());
        let verdict = match self.engine.model_compatibility(path, provider) {
            Ok(Some(verdict)) => verdict,
            Ok(None) => {
                debug!(path = %path.display(), "compiled model carries no compatibility info");
                return None;
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cannot read compatibility info");
                return None;
            }
        };
        match verdict {
            ModelCompatibility::Optimal => Some(ArtifactStatus::Reused),
            ModelCompatibility::PreferRecompilation if !force => {
                warn!(
                    path = %path.display(),
                    "compiled model is usable but recompilation is recommended; \
                     set force_compile_if_needed to recompile"
                );
                Some(ArtifactStatus::ReusedPreferRecompilation)
            }
            _ => None,
        }
    }
}
