//! In-memory fake agent for tests.
//!
//! [`FakeSpawner`] stands in for [`CommandSpawner`](crate::bridge::CommandSpawner).
//! In manual mode each spawned process is handed to the test as a
//! [`FakeProcess`] to drive by hand; in scripted mode a closure answers every
//! request automatically.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use crate::bridge::{BridgeConfig, ProcessHandle, ProcessSpawner};
use crate::error::BridgeError;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Produces the lines written back for one request.
pub type Script = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

/// Spawns fake agents connected through in-memory pipes.
pub struct FakeSpawner {
    script: Option<Script>,
    processes: Option<mpsc::UnboundedSender<FakeProcess>>,
    requests: Arc<Mutex<Vec<Value>>>,
    spawned: AtomicUsize,
    fail_spawn: AtomicBool,
}

impl FakeSpawner {
    /// Every spawned process is delivered on the returned channel.
    pub fn manual() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeProcess>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            script: None,
            processes: Some(tx),
            requests: Arc::new(Mutex::new(Vec::new())),
            spawned: AtomicUsize::new(0),
            fail_spawn: AtomicBool::new(false),
        });
        (spawner, rx)
    }

    /// Every request is answered with the lines `script` returns.
    pub fn scripted(script: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Some(Arc::new(script)),
            processes: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            spawned: AtomicUsize::new(0),
            fail_spawn: AtomicBool::new(false),
        })
    }

    /// A scripted agent that acknowledges every command and answers prompts
    /// with `reply`.
    pub fn echo(reply: &str) -> Arc<Self> {
        let reply = reply.to_string();
        Self::scripted(move |request| {
            if request["type"] == "prompt" {
                prompt_reply(request, &reply)
            } else {
                vec![respond_ok(request, Value::Null)]
            }
        })
    }

    /// Number of processes spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Make subsequent spawns fail.
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Every request received across all processes, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The `type` of every request received, in arrival order.
    pub fn request_types(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r["type"].as_str().map(String::from))
            .collect()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, config: &BridgeConfig) -> Result<ProcessHandle, BridgeError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(BridgeError::Spawn {
                name: config.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "fake spawn failure"),
            });
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let (daemon_stdin, agent_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut agent_stdout, daemon_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let log = Arc::clone(&self.requests);

        match (&self.script, &self.processes) {
            (Some(script), _) => {
                let script = Arc::clone(script);
                tokio::spawn(async move {
                    let mut lines = BufReader::new(agent_stdin).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        record(&log, &request);
                        for reply in script(&request) {
                            if write_line(&mut agent_stdout, &reply.to_string()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
            (None, Some(processes)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(agent_stdin).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        record(&log, &request);
                        if tx.send(request).is_err() {
                            break;
                        }
                    }
                });
                let _ = processes.send(FakeProcess {
                    requests: rx,
                    stdout: Some(agent_stdout),
                });
            }
            (None, None) => {}
        }

        Ok(ProcessHandle {
            stdin: Box::new(daemon_stdin),
            stdout: Box::new(daemon_stdout),
            child: None,
        })
    }
}

fn record(log: &Mutex<Vec<Value>>, request: &Value) {
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(request.clone());
}

async fn write_line(pipe: &mut DuplexStream, line: &str) -> std::io::Result<()> {
    pipe.write_all(line.as_bytes()).await?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await
}

/// The agent side of one manually driven fake process.
pub struct FakeProcess {
    requests: mpsc::UnboundedReceiver<Value>,
    stdout: Option<DuplexStream>,
}

impl FakeProcess {
    /// Next request written by the bridge, or `None` once stdin closed.
    pub async fn next_request(&mut self) -> Option<Value> {
        self.requests.recv().await
    }

    pub async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        if let Some(stdout) = self.stdout.as_mut() {
            let _ = write_line(stdout, line).await;
        }
    }

    pub async fn respond(&mut self, request: &Value, data: Value) {
        self.send(respond_ok(request, data)).await;
    }

    pub async fn fail(&mut self, request: &Value, error: &str) {
        self.send(json!({
            "id": request["id"],
            "type": "response",
            "command": request["type"],
            "success": false,
            "error": error,
        }))
        .await;
    }

    /// Simulate the process dying: its output closes.
    pub fn exit(&mut self) {
        self.stdout.take();
    }
}

/// A successful response to `request`.
pub fn respond_ok(request: &Value, data: Value) -> Value {
    json!({
        "id": request["id"],
        "type": "response",
        "command": request["type"],
        "success": true,
        "data": data,
    })
}

/// The full line sequence answering a prompt with `text`.
pub fn prompt_reply(request: &Value, text: &str) -> Vec<Value> {
    vec![
        respond_ok(request, Value::Null),
        agent_start(),
        text_delta(text),
        agent_end(),
    ]
}

pub fn agent_start() -> Value {
    json!({"type": "agent_start"})
}

pub fn agent_end() -> Value {
    json!({"type": "agent_end", "messages": []})
}

pub fn text_delta(delta: &str) -> Value {
    json!({
        "type": "message_update",
        "assistantMessageEvent": {"type": "text_delta", "delta": delta},
    })
}

pub fn tool_start(id: &str, name: &str) -> Value {
    json!({
        "type": "tool_execution_start",
        "toolCallId": id,
        "toolName": name,
        "args": {},
    })
}

pub fn tool_end(id: &str, name: &str) -> Value {
    json!({
        "type": "tool_execution_end",
        "toolCallId": id,
        "toolName": name,
        "isError": false,
    })
}
