//! Agent backends.
//!
//! [`Runner`] is the adapter contract (`start` / `send_input` / `stop`);
//! [`RunnerEvents`] is the callback bundle runners report through.  The
//! generic [`ApiRunner`] owns the per-session conversation loop for
//! API-style backends and is parametrised by an [`ApiBackend`]; concrete
//! backends supply only message formatting, the API call, and response
//! parsing.

mod anthropic;
mod api_base;
mod prompts;
mod protocol;
mod registry;
mod sidecar;

pub use anthropic::ClaudeBackend;
pub use api_base::{ApiBackend, ApiResponse, ApiRunner, BackendContext, TokenUsage, ToolUse};
pub use prompts::SYSTEM_PROMPT;
pub use protocol::{Runner, RunnerEvents, RunnerHeader};
pub use registry::RunnerRegistry;
pub use sidecar::SidecarRunner;
