//! Sandboxed tools exposed to agent backends.
//!
//! Three tools: `file_read`, `file_write`, and `bash`, all rooted at the
//! session working directory with traversal prevention.  Failures never
//! escape; every call returns a [`ToolOutcome`].

mod definitions;
mod executor;

pub use definitions::{tool_definitions, ToolDefinition};
pub use executor::{ToolExecutor, ToolOutcome};
