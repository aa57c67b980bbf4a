//! One live subprocess speaking strict line-delimited JSON.
//!
//! The stdout reader task owns response decoding; writes go through the
//! send-and-await correlator, so the child sees one request line at a time.
//! stderr is logged verbatim, never parsed as protocol.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use apiary_core::{Correlator, HubError};

use crate::types::{McpServerRecord, RequestLine, StdioRequest, StdioResponse};

/// Grace period for the best-effort `shutdown` frame before `kill`.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a server is launched: the resolved program, args, and working dir.
pub(crate) fn launch_plan(
    record: &McpServerRecord,
) -> Result<(String, Vec<String>, Option<PathBuf>), HubError> {
    let cwd = record
        .path
        .as_deref()
        .and_then(|p| PathBuf::from(p).parent().map(|d| d.to_path_buf()))
        .filter(|d| !d.as_os_str().is_empty());

    if let Some(command) = &record.command {
        return Ok((command.clone(), record.args.clone(), cwd));
    }
    let path = record.path.clone().ok_or_else(|| {
        HubError::invalid(format!("MCP server '{}' has neither command nor path", record.name))
    })?;
    let program = match record.server_type.as_deref() {
        Some("python") => "python",
        // `node` is the default launch convention.
        _ => "node",
    };
    Ok((program.to_string(), vec![path], cwd))
}

pub struct StdioConnection {
    pub id: String,
    pub server_id: String,
    server_name: String,
    stdin: Mutex<ChildStdin>,
    correlator: Arc<Correlator<StdioResponse>>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for StdioConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioConnection")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("server_name", &self.server_name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl StdioConnection {
    /// Spawn the subprocess and start its reader/stderr/exit tasks.
    /// `exit_tx` fires once with the server id when the process is gone.
    pub fn spawn(
        record: &McpServerRecord,
        exit_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<Self>, HubError> {
        let (program, args, cwd) = launch_plan(record)?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        for (k, v) in &record.env {
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| {
            HubError::unavailable(format!(
                "failed to spawn '{}' for MCP server '{}': {}",
                program, record.name, e
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            HubError::unavailable(format!("no stdin pipe for MCP server '{}'", record.name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            HubError::unavailable(format!("no stdout pipe for MCP server '{}'", record.name))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            HubError::unavailable(format!("no stderr pipe for MCP server '{}'", record.name))
        })?;

        let correlator = Arc::new(Correlator::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();

        let connection = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            server_id: record.id.clone(),
            server_name: record.name.clone(),
            stdin: Mutex::new(stdin),
            correlator: correlator.clone(),
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            closed: closed.clone(),
        });

        // stdout reader: one JSON document per line, matched by id.
        let reader_correlator = correlator.clone();
        let reader_closed = closed.clone();
        let reader_name = record.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StdioResponse>(line) {
                    Ok(response) => match &response.id {
                        Some(id) => {
                            if !reader_correlator.resolve(id, &response) {
                                tracing::debug!(
                                    "MCP server '{}': reply for unknown id {}",
                                    reader_name,
                                    id
                                );
                            }
                        }
                        None => {
                            tracing::debug!("MCP server '{}': reply without id", reader_name)
                        }
                    },
                    Err(e) => {
                        tracing::warn!(
                            "MCP server '{}': non-protocol stdout line ({}): {}",
                            reader_name,
                            e,
                            line
                        );
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            reader_correlator.fail_all();
        });

        // stderr is diagnostics only.
        let stderr_name = record.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!("[mcp:{}] {}", stderr_name, line);
            }
        });

        // Exit watcher owns the child: waits for natural exit or a kill
        // request, then announces the death exactly once.
        let watcher_closed = closed;
        let watcher_correlator = correlator;
        let server_id = record.id.clone();
        let watcher_name = record.name.clone();
        tokio::spawn(async move {
            let kill_requested = tokio::select! {
                status = child.wait() => {
                    tracing::info!(
                        "MCP server '{}' exited: {:?}",
                        watcher_name,
                        status.map(|s| s.code()).unwrap_or(None)
                    );
                    false
                }
                _ = kill_rx => true,
            };
            if kill_requested {
                let _ = child.start_kill();
                let _ = child.wait().await;
                tracing::info!("MCP server '{}' killed", watcher_name);
            }
            watcher_closed.store(true, Ordering::SeqCst);
            watcher_correlator.fail_all();
            let _ = exit_tx.send(server_id);
        });

        Ok(connection)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// One request/response round trip with a fresh id.
    pub async fn request(
        &self,
        request: StdioRequest,
        timeout: Duration,
    ) -> Result<StdioResponse, HubError> {
        if self.is_closed() {
            return Err(HubError::unavailable(format!(
                "MCP server '{}' process is gone",
                self.server_name
            )));
        }
        let id = Uuid::new_v4().to_string();
        let mut line = serde_json::to_string(&RequestLine {
            id: &id,
            request: &request,
        })
        .map_err(|e| HubError::invalid(format!("request serialization: {}", e)))?;
        line.push('\n');

        let operation = request.name();
        let rx = self.correlator.register(id.clone(), None);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.correlator.remove(&id);
                return Err(HubError::unavailable(format!(
                    "stdin write to MCP server '{}' failed: {}",
                    self.server_name, e
                )));
            }
            if let Err(e) = stdin.flush().await {
                self.correlator.remove(&id);
                return Err(HubError::unavailable(format!(
                    "stdin flush to MCP server '{}' failed: {}",
                    self.server_name, e
                )));
            }
        }
        self.correlator.await_reply(&id, rx, operation, timeout).await
    }

    /// Best-effort `shutdown` dialog, then kill.
    pub async fn shutdown(&self) {
        let _ = self.request(StdioRequest::Shutdown, SHUTDOWN_TIMEOUT).await;
        self.kill();
    }

    /// Ask the exit watcher to kill the process. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;

    fn record(
        server_type: Option<&str>,
        path: Option<&str>,
        command: Option<&str>,
        args: &[&str],
    ) -> McpServerRecord {
        McpServerRecord {
            id: "m1".into(),
            name: "test".into(),
            server_type: server_type.map(String::from),
            path: path.map(String::from),
            command: command.map(String::from),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            capabilities: vec![],
            status: crate::types::McpServerStatus::Registered,
            connection_id: None,
            metadata: Value::Null,
            registered_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_launch_plan_explicit_command_wins() {
        let rec = record(Some("node"), Some("/srv/s.js"), Some("deno"), &["run", "/srv/s.js"]);
        let (program, args, cwd) = launch_plan(&rec).unwrap();
        assert_eq!(program, "deno");
        assert_eq!(args, vec!["run", "/srv/s.js"]);
        assert_eq!(cwd.unwrap(), PathBuf::from("/srv"));
    }

    #[test]
    fn test_launch_plan_node_convention() {
        let rec = record(Some("node"), Some("/srv/tools/s.js"), None, &[]);
        let (program, args, cwd) = launch_plan(&rec).unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, vec!["/srv/tools/s.js"]);
        assert_eq!(cwd.unwrap(), PathBuf::from("/srv/tools"));
    }

    #[test]
    fn test_launch_plan_python_convention() {
        let rec = record(Some("python"), Some("/srv/s.py"), None, &[]);
        let (program, args, _) = launch_plan(&rec).unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, vec!["/srv/s.py"]);
    }

    #[test]
    fn test_launch_plan_requires_path_or_command() {
        let rec = record(Some("node"), None, None, &[]);
        assert!(matches!(
            launch_plan(&rec).unwrap_err(),
            HubError::InvalidMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_spawn_error_is_unavailable() {
        let rec = record(None, None, Some("definitely-not-a-real-binary-xyz"), &[]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = StdioConnection::spawn(&rec, tx).unwrap_err();
        assert!(matches!(err, HubError::UnavailablePeer { .. }));
    }
}
