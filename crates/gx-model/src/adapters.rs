use std::collections::HashMap;
use std::sync::Arc;

use gx_tensor::Tensor;
use parking_lot::RwLock;
use tracing::info;

use crate::error::{ModelError, Result};

/// Named parameter tensors of one adapter, bound as extra session inputs.
pub type AdapterParams = Arc<Vec<(String, Tensor)>>;

struct AdapterEntry {
    params: AdapterParams,
    refcount: usize,
}

/// Registry of loaded adapters.
///
/// States hold the registry weakly and count their use of an adapter through
/// `acquire`/`release`, so an adapter cannot be unloaded while a state has it
/// active.
#[derive(Default)]
pub struct Adapters {
    entries: RwLock<HashMap<String, AdapterEntry>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `name`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the name is already loaded.
    pub fn load_adapter(&self, name: &str, params: Vec<(String, Tensor)>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(ModelError::InvalidArgument(format!(
                "adapter '{}' is already loaded",
                name
            )));
        }
        info!(adapter = name, params = params.len(), "loaded adapter");
        entries.insert(
            name.to_string(),
            AdapterEntry {
                params: Arc::new(params),
                refcount: 0,
            },
        );
        Ok(())
    }

    /// Remove an adapter. Fails while any state has it active.
    pub fn unload_adapter(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get(name) {
            None => Err(ModelError::UnknownAdapter(name.to_string())),
            Some(entry) if entry.refcount > 0 => Err(ModelError::AdapterInUse(name.to_string())),
            Some(_) => {
                entries.remove(name);
                info!(adapter = name, "unloaded adapter");
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Number of states currently using the adapter.
    pub fn ref_count(&self, name: &str) -> Option<usize> {
        self.entries.read().get(name).map(|e| e.refcount)
    }

    pub(crate) fn acquire(&self, name: &str) -> Result<AdapterParams> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownAdapter(name.to_string()))?;
        entry.refcount += 1;
        Ok(Arc::clone(&entry.params))
    }

    pub(crate) fn release(&self, name: &str) {
        if let Some(entry) = self.entries.write().get_mut(name) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }
}
