//! Registry of runner instances.
//!
//! One runner per adapter name, created lazily on first use and shared
//! across sessions.  An unknown adapter name is a configuration error the
//! API edge reports as a validation failure.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use tether_domain::config::Settings;
use tether_domain::error::{Error, Result};
use tether_store::SessionStore;
use tether_tools::ToolExecutor;

use crate::anthropic::ClaudeBackend;
use crate::api_base::ApiRunner;
use crate::protocol::{Runner, RunnerEvents};
use crate::sidecar::SidecarRunner;

pub struct RunnerRegistry {
    settings: Settings,
    store: Arc<SessionStore>,
    executor: ToolExecutor,
    events: Arc<dyn RunnerEvents>,
    runners: Mutex<HashMap<String, Arc<dyn Runner>>>,
}

impl RunnerRegistry {
    pub fn new(
        settings: Settings,
        store: Arc<SessionStore>,
        executor: ToolExecutor,
        events: Arc<dyn RunnerEvents>,
    ) -> Self {
        Self {
            settings,
            store,
            executor,
            events,
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// The adapter used when a session has none recorded.
    pub fn default_adapter(&self) -> &str {
        &self.settings.adapter
    }

    /// Get or create the runner for an adapter (`None` = default).
    pub fn get(&self, adapter: Option<&str>) -> Result<Arc<dyn Runner>> {
        let name = adapter.unwrap_or(&self.settings.adapter).to_lowercase();

        if let Some(runner) = self.runners.lock().get(&name) {
            return Ok(runner.clone());
        }

        tracing::info!(adapter = %name, "creating runner");
        let runner: Arc<dyn Runner> = match name.as_str() {
            "claude_api" | "claude" => Arc::new(ApiRunner::new(
                ClaudeBackend::new(
                    self.settings.anthropic_api_key.clone(),
                    self.settings.claude_model.clone(),
                    self.settings.claude_max_tokens,
                )?,
                self.store.clone(),
                self.executor.clone(),
                self.events.clone(),
            )),
            "sidecar" => Arc::new(SidecarRunner::new(
                self.settings.sidecar_url.clone(),
                self.settings.sidecar_token.clone(),
                self.store.clone(),
                self.events.clone(),
            )?),
            other => {
                return Err(Error::Config(format!("unknown adapter: {other}")));
            }
        };

        self.runners.lock().insert(name, runner.clone());
        Ok(runner)
    }
}
