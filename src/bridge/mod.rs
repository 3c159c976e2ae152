//! Agent bridge: one subprocess, one line-delimited JSON-RPC conversation.
//!
//! A single reader task demultiplexes the agent's stdout: correlated
//! responses resolve the waiting `command()` call by id, untagged events are
//! fanned out on a broadcast channel and fed to the prompt currently in
//! flight (if any).

pub mod process;
pub mod protocol;

pub use process::{CommandSpawner, ProcessHandle, ProcessSpawner};
pub use protocol::{AgentEvent, ModelInfo};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentCommand;
use crate::error::BridgeError;
use protocol::Incoming;

/// Broadcast capacity for raw agent events. Text deltas arrive in bursts.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long to wait for a process to exit once its output has closed.
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// Configuration for one bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name used in logs and errors (usually the session name).
    pub name: String,
    /// Working directory of the agent process.
    pub cwd: PathBuf,
    pub command: AgentCommand,
    /// How long `shutdown()` waits for an open prompt to finish before
    /// tearing the process down anyway.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            cwd: PathBuf::from("."),
            command: AgentCommand::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Event published on the bridge's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// An untagged line from the agent, exactly as received.
    Agent(Value),
    /// The agent's output closed unexpectedly.
    Exited,
}

/// A tool invocation announced by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Receives progress while a prompt is being answered.
pub trait TurnObserver: Send {
    /// Narration produced before a tool call.
    fn on_text(&mut self, _text: &str) {}
    fn on_tool_start(&mut self, _tool: &ToolCall) {}
}

struct Turn {
    id: u64,
    sink: mpsc::UnboundedSender<AgentEvent>,
}

struct PendingCommand {
    command: String,
    tx: oneshot::Sender<Result<Value, BridgeError>>,
}

struct RunningProcess {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    reader: JoinHandle<()>,
}

/// State shared between the bridge handle and its reader task.
struct Shared {
    name: String,
    process: tokio::sync::Mutex<Option<RunningProcess>>,
    pending: Mutex<HashMap<String, PendingCommand>>,
    /// Sink for the prompt currently in flight.
    turn: Mutex<Option<Turn>>,
    turns: AtomicU64,
    busy: watch::Sender<bool>,
    running: AtomicBool,
    /// Bumped on every start and stop so a stale reader can't tear down its
    /// successor.
    epoch: AtomicU64,
    events: broadcast::Sender<BridgeEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn dispatch_line(&self, line: &str) {
        let incoming = match protocol::parse_line(line) {
            Ok(Some(incoming)) => incoming,
            Ok(None) => return,
            Err(e) => {
                debug!(agent = %self.name, error = %e, "Dropping unparsable line");
                return;
            }
        };

        match incoming {
            Incoming::Response(response) => {
                let pending = lock(&self.pending).remove(&response.id);
                match pending {
                    Some(pending) => {
                        let result = response.into_result(&pending.command);
                        let _ = pending.tx.send(result);
                    }
                    None => {
                        debug!(agent = %self.name, id = %response.id, "Response for unknown command");
                    }
                }
            }
            Incoming::Event(value) => {
                let event = AgentEvent::from_value(&value);
                let ended = event == AgentEvent::AgentEnd;
                if let Some(turn) = lock(&self.turn).as_ref() {
                    let _ = turn.sink.send(event);
                }
                if ended {
                    self.busy.send_replace(false);
                }
                // Ok if no one is listening
                let _ = self.events.send(BridgeEvent::Agent(value));
            }
        }
    }

    /// Reject every in-flight command and close the open prompt.
    fn fail_in_flight(&self) {
        let pending: Vec<PendingCommand> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p.tx.send(Err(BridgeError::ProcessExited {
                name: self.name.clone(),
            }));
        }
        lock(&self.turn).take();
        self.busy.send_replace(false);
    }

    async fn handle_exit(&self, epoch: u64) {
        let process = {
            let mut slot = self.process.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            slot.take()
        };

        self.running.store(false, Ordering::SeqCst);
        self.fail_in_flight();
        warn!(agent = %self.name, "Agent process exited");
        let _ = self.events.send(BridgeEvent::Exited);

        if let Some(RunningProcess {
            child: Some(mut child),
            ..
        }) = process
        {
            match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => info!(agent = %self.name, %status, "Agent process reaped"),
                Ok(Err(e)) => warn!(agent = %self.name, error = %e, "Failed to reap agent process"),
                Err(_) => {
                    warn!(agent = %self.name, "Agent closed its output but kept running, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, stdout: Box<dyn AsyncRead + Send + Unpin>, epoch: u64) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => shared.dispatch_line(&String::from_utf8_lossy(&buf)),
            Err(e) => {
                warn!(agent = %shared.name, error = %e, "Error reading agent output");
                break;
            }
        }
    }
    shared.handle_exit(epoch).await;
}

/// Clears the turn sink when a prompt finishes or its caller goes away.
struct TurnGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut turn = lock(&self.shared.turn);
        if turn.as_ref().is_some_and(|t| t.id == self.id) {
            turn.take();
        }
    }
}

/// Owns one agent subprocess and the protocol spoken over its pipes.
pub struct Bridge {
    config: BridgeConfig,
    spawner: Arc<dyn ProcessSpawner>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl Bridge {
    /// Create a bridge. The process is not spawned until [`Bridge::start`].
    pub fn new(config: BridgeConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (busy, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            process: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            turn: Mutex::new(None),
            turns: AtomicU64::new(0),
            busy,
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            events,
        });
        Self {
            config,
            spawner,
            shared,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True between an issued prompt and its `agent_end`.
    pub fn is_busy(&self) -> bool {
        *self.shared.busy.borrow()
    }

    /// Subscribe to every raw event the agent emits.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    /// Spawn the agent process. No-op if already running.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut slot = self.shared.process.lock().await;
        if slot.is_some() {
            debug!(agent = %self.config.name, "Agent already running");
            return Ok(());
        }

        let handle = self.spawner.spawn(&self.config).await?;
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(read_loop(Arc::clone(&self.shared), handle.stdout, epoch));

        *slot = Some(RunningProcess {
            stdin: handle.stdin,
            child: handle.child,
            reader,
        });
        self.shared.running.store(true, Ordering::SeqCst);

        info!(
            agent = %self.config.name,
            cwd = %self.config.cwd.display(),
            "Agent started"
        );
        Ok(())
    }

    /// Stop the agent process once any open prompt has finished, then reject
    /// whatever is still in flight.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.wait_idle(None).await;
        self.teardown().await
    }

    /// Stop for daemon shutdown. An open prompt gets `shutdown_grace` to reach
    /// `agent_end`; if it doesn't, the process is torn down regardless and
    /// `StopTimeout` is returned.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let grace = self.config.shutdown_grace;
        let finished = self.wait_idle(Some(grace)).await;
        let result = self.teardown().await;
        if !finished {
            return Err(BridgeError::StopTimeout {
                name: self.config.name.clone(),
                grace,
            });
        }
        result
    }

    async fn teardown(&self) -> Result<(), BridgeError> {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let process = self.shared.process.lock().await.take();
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.fail_in_flight();

        let Some(process) = process else {
            return Ok(());
        };

        process.reader.abort();
        drop(process.stdin);

        let mut result = Ok(());
        if let Some(mut child) = process.child
            && let Err(e) = child.kill().await
        {
            warn!(agent = %self.config.name, error = %e, "Failed to kill agent process");
            result = Err(BridgeError::Io(e));
        }

        info!(agent = %self.config.name, "Agent stopped");
        result
    }

    /// Stop and start again with the same configuration.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        if let Err(e) = self.stop().await {
            warn!(agent = %self.config.name, error = %e, "Unclean stop during restart");
        }
        self.start().await
    }

    /// Wait until no prompt is open. Returns false if `limit` elapsed first.
    async fn wait_idle(&self, limit: Option<Duration>) -> bool {
        let mut busy = self.shared.busy.subscribe();
        if !*busy.borrow_and_update() {
            return true;
        }
        warn!(agent = %self.config.name, "Waiting for open prompt before stopping");
        let idle = busy.wait_for(|b| !*b);
        match limit {
            Some(limit) => matches!(tokio::time::timeout(limit, idle).await, Ok(Ok(_))),
            None => idle.await.is_ok(),
        }
    }

    /// Send a command and wait for its correlated response.
    ///
    /// Resolves with the response's `data` on success; rejects with the
    /// agent's error string otherwise.
    pub async fn command(&self, command: &str, args: Value) -> Result<Value, BridgeError> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let line = protocol::encode_request(&id, command, args)?;

        let rx = {
            let mut slot = self.shared.process.lock().await;
            let Some(process) = slot.as_mut() else {
                return Err(BridgeError::NotRunning {
                    name: self.config.name.clone(),
                });
            };

            let (tx, rx) = oneshot::channel();
            lock(&self.shared.pending).insert(
                id.clone(),
                PendingCommand {
                    command: command.to_string(),
                    tx,
                },
            );

            let written = async {
                process.stdin.write_all(line.as_bytes()).await?;
                process.stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                lock(&self.shared.pending).remove(&id);
                return Err(BridgeError::Io(e));
            }
            rx
        };

        debug!(agent = %self.config.name, id = %id, command, "Sent command");

        rx.await.unwrap_or_else(|_| {
            Err(BridgeError::ProcessExited {
                name: self.config.name.clone(),
            })
        })
    }

    /// Prompt the agent and return its final text once `agent_end` arrives.
    pub async fn send_message(&self, text: &str) -> Result<String, BridgeError> {
        self.send_message_with(text, None).await
    }

    /// Prompt the agent, reporting narration and tool calls as they stream.
    ///
    /// Without an observer the whole reply is accumulated and returned. With
    /// one, narration preceding a tool call is handed to `on_text` before the
    /// tool is announced, and only the text after the last tool is returned.
    pub async fn send_message_with(
        &self,
        text: &str,
        mut observer: Option<&mut dyn TurnObserver>,
    ) -> Result<String, BridgeError> {
        let claimed = self.shared.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !claimed {
            return Err(BridgeError::Busy {
                name: self.config.name.clone(),
            });
        }

        let (sink, mut events) = mpsc::unbounded_channel();
        let id = self.shared.turns.fetch_add(1, Ordering::SeqCst);
        *lock(&self.shared.turn) = Some(Turn { id, sink });
        let _guard = TurnGuard {
            shared: &self.shared,
            id,
        };

        if let Err(e) = self.command("prompt", json!({ "message": text })).await {
            self.shared.busy.send_replace(false);
            return Err(e);
        }

        let mut accumulated = String::new();
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::AgentStart => {
                    debug!(agent = %self.config.name, "Generation started");
                }
                AgentEvent::MessageUpdate { .. } => {
                    if let Some(delta) = event.text_delta() {
                        accumulated.push_str(delta);
                    }
                }
                AgentEvent::ToolExecutionStart {
                    tool_call_id,
                    tool_name,
                    args,
                } => {
                    if let Some(observer) = observer.as_deref_mut() {
                        if !accumulated.is_empty() {
                            observer.on_text(&accumulated);
                            accumulated.clear();
                        }
                        observer.on_tool_start(&ToolCall {
                            id: tool_call_id,
                            name: tool_name,
                            args,
                        });
                    }
                }
                AgentEvent::AgentEnd => return Ok(accumulated),
                AgentEvent::ToolExecutionEnd { .. } | AgentEvent::Other => {}
            }
        }

        Err(BridgeError::ProcessExited {
            name: self.config.name.clone(),
        })
    }

    /// Redirect the generation in flight. What the agent does with it is up
    /// to the agent; the original prompt still ends with its own `agent_end`.
    pub async fn steer(&self, text: &str) -> Result<Value, BridgeError> {
        self.command("steer", json!({ "message": text })).await
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.shared.process.try_lock()
            && let Some(process) = slot.take()
        {
            process.reader.abort();
        }
    }
}
