//! Child-process stdio transport
//!
//! Spawns the configured command and speaks line-delimited JSON-RPC over its
//! stdin/stdout. stderr is inherited so upstream diagnostics land in the
//! proxy's own stderr stream.

use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::JsonRpcMessage;
use crate::upstream::transport::{TransportEvent, TransportKind, UpstreamTransport};

/// Capacity of the inbound event channel per child process
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Stdio transport for a locally spawned MCP server process
pub struct ChildProcessTransport {
    command: String,
    args: Vec<String>,
    cwd: Option<String>,
    env: HashMap<String, String>,
    inherit_parent_env: bool,
    env_filter: Vec<String>,

    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl ChildProcessTransport {
    /// Create a transport for the given command; the process is spawned on
    /// `start`
    pub fn new(
        command: String,
        args: Vec<String>,
        cwd: Option<String>,
        env: HashMap<String, String>,
        inherit_parent_env: bool,
        env_filter: Vec<String>,
    ) -> Self {
        Self {
            command,
            args,
            cwd,
            env,
            inherit_parent_env,
            env_filter,
            child: None,
            stdin: None,
            reader_task: None,
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if !self.inherit_parent_env {
            cmd.env_clear();
            for key in &self.env_filter {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }
        }
        cmd.envs(&self.env);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    async fn reap(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = child.kill().await {
                        warn!(command = %self.command, "failed to kill child process: {}", e);
                    }
                    let _ = child.wait().await;
                }
                Err(e) => warn!(command = %self.command, "error checking child status: {}", e),
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for ChildProcessTransport {
    async fn start(&mut self) -> ProxyResult<mpsc::Receiver<TransportEvent>> {
        // A previous failed attempt may have left a dead child behind.
        self.reap().await;

        let mut child = self
            .build_command()
            .spawn()
            .map_err(|e| ProxyError::Transport {
                message: format!("failed to spawn '{}': {}", self.command, e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ProxyError::Transport {
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ProxyError::Transport {
            message: "child stdout unavailable".to_string(),
        })?;

        self.stdin = Some(BufWriter::new(stdin));
        self.child = Some(child);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let command = self.command.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::parse(line) {
                            Ok(message) => {
                                if tx.send(TransportEvent::Message(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(command = %command, "discarding unparseable frame: {}", e);
                                let _ = tx
                                    .send(TransportEvent::Error(format!("bad frame: {}", e)))
                                    .await;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(TransportEvent::Closed).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                        let _ = tx.send(TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        }));

        Ok(rx)
    }

    async fn send(&mut self, message: JsonRpcMessage) -> ProxyResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| ProxyError::Transport {
            message: "transport not started".to_string(),
        })?;

        let mut frame = serde_json::to_string(&message)?;
        frame.push('\n');
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| ProxyError::Transport {
                message: format!("write to child failed: {}", e),
            })?;
        stdin.flush().await.map_err(|e| ProxyError::Transport {
            message: format!("flush to child failed: {}", e),
        })?;
        Ok(())
    }

    async fn close(&mut self) -> ProxyResult<()> {
        self.reap().await;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for ChildProcessTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use serde_json::json;

    fn cat_transport() -> ChildProcessTransport {
        ChildProcessTransport::new(
            "cat".to_string(),
            vec![],
            None,
            HashMap::new(),
            true,
            vec![],
        )
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mut transport = cat_transport();
        let mut events = transport.start().await.unwrap();

        let request = JsonRpcRequest::new("ping", None, json!(1));
        transport
            .send(JsonRpcMessage::Request(request.clone()))
            .await
            .unwrap();

        // `cat` echoes the request frame straight back.
        match events.recv().await {
            Some(TransportEvent::Message(JsonRpcMessage::Request(echoed))) => {
                assert_eq!(echoed, request);
            }
            other => panic!("expected echoed request, got {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_emits_closed_event() {
        let mut transport = cat_transport();
        let mut events = transport.start().await.unwrap();
        transport.close().await.unwrap();

        // Either a Closed event or channel end is acceptable after teardown.
        match events.recv().await {
            Some(TransportEvent::Closed) | None => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let mut transport = ChildProcessTransport::new(
            "definitely-not-a-real-binary-3141".to_string(),
            vec![],
            None,
            HashMap::new(),
            true,
            vec![],
        );
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Transport { .. }));
    }
}
