use resource_framework::hooks::ResourceHook;
use resource_framework::resource::Resource;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Shared, append-only record of resource hook notifications.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one `"<hook> <type>/<id>"` entry per resource.
    pub fn record(&self, hook: ResourceHook, resources: &[Resource]) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for resource in resources {
            if let Some(key) = resource.key() {
                info!(hook = ?hook, key = %key, "Journaled");
                entries.push(format!("{hook:?} {key}"));
            }
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
