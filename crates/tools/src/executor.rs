//! Tool execution rooted at the session working directory.
//!
//! Paths resolve against the workdir registered in the store; anything that
//! normalizes outside the workdir subtree is rejected before touching the
//! filesystem.  `bash` runs under `sh -c` with stdout and stderr merged and
//! a hard timeout that kills the child.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use tether_store::SessionStore;

const DEFAULT_READ_LIMIT: usize = 2000;
const DEFAULT_BASH_TIMEOUT_S: u64 = 120;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a tool invocation.  Errors are data, not panics: the
/// conversation loop feeds them back to the model as `Error: ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl ToolOutcome {
    fn ok(result: String) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// The text handed back to the model.
    pub fn content_for_model(&self) -> String {
        if self.success {
            self.result.clone().unwrap_or_default()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Executes tool calls for a session, resolving paths against its workdir.
#[derive(Clone)]
pub struct ToolExecutor {
    store: Arc<SessionStore>,
}

impl ToolExecutor {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Execute a tool by name.  Never panics and never returns `Err`; all
    /// failures are captured in the outcome.
    pub async fn execute(&self, session_id: &str, tool_name: &str, input: &Value) -> ToolOutcome {
        let outcome = match tool_name {
            "file_read" => self.file_read(session_id, input).await,
            "file_write" => self.file_write(session_id, input).await,
            "bash" => self.bash(session_id, input).await,
            other => ToolOutcome::err(format!("Unknown tool: {other}")),
        };
        if !outcome.success {
            tracing::warn!(
                session_id,
                tool = tool_name,
                error = outcome.error.as_deref().unwrap_or(""),
                "tool execution failed"
            );
        }
        outcome
    }

    fn workdir(&self, session_id: &str) -> Result<PathBuf, String> {
        self.store
            .get_workdir(session_id)
            .map(PathBuf::from)
            .ok_or_else(|| "No working directory set for session".to_string())
    }

    // ── file_read ──────────────────────────────────────────────────

    async fn file_read(&self, session_id: &str, input: &Value) -> ToolOutcome {
        let Some(path) = str_param(input, "path") else {
            return ToolOutcome::err("Missing required parameter: path");
        };
        let offset = int_param(input, "offset").unwrap_or(1).max(1) as usize;
        let limit = int_param(input, "limit")
            .map(|v| v.max(0) as usize)
            .unwrap_or(DEFAULT_READ_LIMIT);

        let workdir = match self.workdir(session_id) {
            Ok(w) => w,
            Err(e) => return ToolOutcome::err(e),
        };
        let resolved = match resolve_path(&workdir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::err(e),
        };

        if !resolved.exists() {
            return ToolOutcome::err(format!("File not found: {path}"));
        }
        if !resolved.is_file() {
            return ToolOutcome::err(format!("Not a file: {path}"));
        }

        let content = match tokio::fs::read(&resolved).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => return ToolOutcome::err(format!("Failed to read {path}: {e}")),
        };

        let numbered: Vec<String> = content
            .lines()
            .enumerate()
            .skip(offset - 1)
            .take(limit)
            .map(|(idx, line)| format!("{:6}\t{}", idx + 1, line))
            .collect();

        ToolOutcome::ok(numbered.join("\n"))
    }

    // ── file_write ─────────────────────────────────────────────────

    async fn file_write(&self, session_id: &str, input: &Value) -> ToolOutcome {
        let Some(path) = str_param(input, "path") else {
            return ToolOutcome::err("Missing required parameter: path");
        };
        let Some(content) = input.get("content").and_then(Value::as_str) else {
            return ToolOutcome::err("Missing required parameter: content");
        };

        let workdir = match self.workdir(session_id) {
            Ok(w) => w,
            Err(e) => return ToolOutcome::err(e),
        };
        let resolved = match resolve_path(&workdir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::err(e),
        };

        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutcome::err(format!("Failed to create parent directory: {e}"));
            }
        }
        if let Err(e) = tokio::fs::write(&resolved, content).await {
            return ToolOutcome::err(format!("Failed to write {path}: {e}"));
        }

        ToolOutcome::ok(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            path
        ))
    }

    // ── bash ───────────────────────────────────────────────────────

    async fn bash(&self, session_id: &str, input: &Value) -> ToolOutcome {
        let Some(command) = str_param(input, "command") else {
            return ToolOutcome::err("Missing required parameter: command");
        };
        let timeout_s = int_param(input, "timeout")
            .map(|v| v.max(1) as u64)
            .unwrap_or(DEFAULT_BASH_TIMEOUT_S);

        let workdir = match self.workdir(session_id) {
            Ok(w) => w,
            Err(e) => return ToolOutcome::err(e),
        };

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolOutcome::err(format!("Failed to execute command: {e}")),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let wait_and_collect = async {
            // Drain both pipes before waiting so the child can't block on a
            // full pipe buffer.  Stderr is merged after stdout.
            let mut out = String::new();
            if let Some(mut pipe) = stdout {
                let _ = pipe.read_to_string(&mut out).await;
            }
            let mut err = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut err).await;
            }
            out.push_str(&err);
            (child.wait().await, out)
        };

        match tokio::time::timeout(Duration::from_secs(timeout_s), wait_and_collect).await {
            Ok((Ok(status), output)) => {
                let code = status.code().unwrap_or(-1);
                if code != 0 {
                    ToolOutcome::ok(format!("Command exited with code {code}\n{output}"))
                } else if output.is_empty() {
                    ToolOutcome::ok("(no output)".into())
                } else {
                    ToolOutcome::ok(output)
                }
            }
            Ok((Err(e), _)) => ToolOutcome::err(format!("Failed to execute command: {e}")),
            Err(_) => ToolOutcome::err(format!("Command timed out after {timeout_s}s")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a user-supplied path against the session workdir.
///
/// Absolute paths are kept, relative paths join the workdir; the result is
/// logically normalized (no filesystem access) and must equal the workdir
/// or live under it.
pub fn resolve_path(workdir: &Path, requested: &str) -> Result<PathBuf, String> {
    let requested_path = Path::new(requested);
    let workdir = normalize(workdir);
    let candidate = if requested_path.is_absolute() {
        normalize(requested_path)
    } else {
        normalize(&workdir.join(requested_path))
    };

    if candidate == workdir || candidate.starts_with(&workdir) {
        Ok(candidate)
    } else {
        Err(format!("Path escapes working directory: {requested}"))
    }
}

/// Component-wise path normalization: `.` removed, `..` pops, pops past the
/// root of an absolute path are dropped.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.is_absolute() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn str_param<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn int_param(input: &Value, key: &str) -> Option<i64> {
    input.get(key).and_then(Value::as_i64)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tether_domain::session::RepoRef;

    fn setup() -> (TempDir, Arc<SessionStore>, ToolExecutor, String) {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        let workdir = dir.path().join("repo");
        std::fs::create_dir_all(&workdir).unwrap();

        let store = Arc::new(SessionStore::new(&data_dir).unwrap());
        let session = store
            .create_session(RepoRef::path(workdir.to_string_lossy()))
            .unwrap();
        store.set_workdir(&session.id, &workdir.to_string_lossy(), false);

        let executor = ToolExecutor::new(store.clone());
        (dir, store, executor, session.id)
    }

    #[test]
    fn resolve_rejects_parent_traversal_with_exact_message() {
        let err = resolve_path(Path::new("/tmp/r"), "../../etc/passwd").unwrap_err();
        assert_eq!(err, "Path escapes working directory: ../../etc/passwd");
    }

    #[test]
    fn resolve_accepts_workdir_itself_and_children() {
        let w = Path::new("/tmp/r");
        assert_eq!(resolve_path(w, ".").unwrap(), PathBuf::from("/tmp/r"));
        assert_eq!(
            resolve_path(w, "sub/a.txt").unwrap(),
            PathBuf::from("/tmp/r/sub/a.txt")
        );
        // Absolute path inside the workdir is kept.
        assert_eq!(
            resolve_path(w, "/tmp/r/x").unwrap(),
            PathBuf::from("/tmp/r/x")
        );
    }

    #[test]
    fn resolve_rejects_sibling_prefix() {
        // "/tmp/rx" shares the string prefix but is not under "/tmp/r".
        assert!(resolve_path(Path::new("/tmp/r"), "/tmp/rx/a").is_err());
    }

    #[test]
    fn resolve_normalizes_dotdot_inside_workdir() {
        assert_eq!(
            resolve_path(Path::new("/tmp/r"), "a/../b.txt").unwrap(),
            PathBuf::from("/tmp/r/b.txt")
        );
    }

    #[tokio::test]
    async fn file_write_then_read_with_line_numbers() {
        let (_dir, _store, executor, sid) = setup();

        let write = executor
            .execute(&sid, "file_write", &json!({"path": "a.txt", "content": "x"}))
            .await;
        assert!(write.success);
        assert_eq!(
            write.result.as_deref(),
            Some("Successfully wrote 1 bytes to a.txt")
        );

        let read = executor
            .execute(&sid, "file_read", &json!({"path": "a.txt"}))
            .await;
        assert!(read.success);
        assert_eq!(read.result.as_deref(), Some("     1\tx"));
    }

    #[tokio::test]
    async fn file_read_honors_offset_and_limit() {
        let (_dir, _store, executor, sid) = setup();
        executor
            .execute(
                &sid,
                "file_write",
                &json!({"path": "lines.txt", "content": "l1\nl2\nl3\nl4\nl5\n"}),
            )
            .await;

        let read = executor
            .execute(
                &sid,
                "file_read",
                &json!({"path": "lines.txt", "offset": 2, "limit": 2}),
            )
            .await;
        assert_eq!(read.result.as_deref(), Some("     2\tl2\n     3\tl3"));
    }

    #[tokio::test]
    async fn file_read_traversal_is_rejected() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "file_read", &json!({"path": "../../etc/passwd"}))
            .await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Path escapes working directory: ../../etc/passwd")
        );
        assert!(outcome.content_for_model().starts_with("Error: "));
    }

    #[tokio::test]
    async fn file_read_missing_file() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "file_read", &json!({"path": "nope.txt"}))
            .await;
        assert_eq!(outcome.error.as_deref(), Some("File not found: nope.txt"));
    }

    #[tokio::test]
    async fn file_write_creates_parent_directories() {
        let (dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(
                &sid,
                "file_write",
                &json!({"path": "deep/nested/f.txt", "content": "data"}),
            )
            .await;
        assert!(outcome.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("repo/deep/nested/f.txt")).unwrap(),
            "data"
        );
    }

    #[tokio::test]
    async fn bash_returns_output() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "bash", &json!({"command": "echo hello"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.result.as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn bash_reports_nonzero_exit_code() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "bash", &json!({"command": "echo boom; exit 3"}))
            .await;
        assert!(outcome.success);
        assert_eq!(
            outcome.result.as_deref(),
            Some("Command exited with code 3\nboom\n")
        );
    }

    #[tokio::test]
    async fn bash_no_output_placeholder() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "bash", &json!({"command": "true"}))
            .await;
        assert_eq!(outcome.result.as_deref(), Some("(no output)"));
    }

    #[tokio::test]
    async fn bash_times_out_with_error_result() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "bash", &json!({"command": "sleep 30", "timeout": 1}))
            .await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Command timed out after 1s")
        );
    }

    #[tokio::test]
    async fn bash_runs_in_the_session_workdir() {
        let (dir, _store, executor, sid) = setup();
        let outcome = executor
            .execute(&sid, "bash", &json!({"command": "pwd"}))
            .await;
        let printed = outcome.result.unwrap();
        let expected = dir.path().join("repo");
        // Compare canonicalized paths; macOS tempdirs live behind /private.
        assert_eq!(
            std::fs::canonicalize(printed.trim()).unwrap(),
            std::fs::canonicalize(expected).unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let (_dir, _store, executor, sid) = setup();
        let outcome = executor.execute(&sid, "frobnicate", &json!({})).await;
        assert_eq!(outcome.error.as_deref(), Some("Unknown tool: frobnicate"));
    }

    #[tokio::test]
    async fn missing_workdir_is_an_error_outcome() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()).unwrap());
        let session = store.create_session(RepoRef::path("/tmp/none")).unwrap();
        let executor = ToolExecutor::new(store);
        let outcome = executor
            .execute(&session.id, "bash", &json!({"command": "true"}))
            .await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("No working directory set for session")
        );
    }
}
