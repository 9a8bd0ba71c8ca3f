//! Process-wide bridge registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Bridge;

/// Registry of platform name -> bridge, consulted by the subscriber and by
/// thread-creation logic.
#[derive(Default)]
pub struct BridgeManager {
    bridges: RwLock<HashMap<String, Arc<dyn Bridge>>>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_bridge(&self, platform: &str, bridge: Arc<dyn Bridge>) {
        self.bridges.write().insert(platform.to_owned(), bridge);
        tracing::info!(platform, "bridge registered");
    }

    pub fn get_bridge(&self, platform: &str) -> Option<Arc<dyn Bridge>> {
        self.bridges.read().get(platform).cloned()
    }

    pub fn list_bridges(&self) -> Vec<String> {
        self.bridges.read().keys().cloned().collect()
    }
}
