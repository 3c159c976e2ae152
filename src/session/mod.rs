//! Session manager: named bridges started on demand.
//!
//! Each configured session cycles idle → starting → running → idle. The
//! in-flight start is stored in the session itself, so concurrent callers
//! attach to the same spawn instead of racing a second one.

pub mod routing;

pub use routing::{RouteMatch, Router, RoutingRule};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeConfig, BridgeEvent, ProcessSpawner};
use crate::config::{AgentCommand, DaemonConfig};
use crate::error::{BridgeError, SessionError};

/// Upper bound on a single start attempt.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Static configuration of one session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub name: String,
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Stop the agent after this many minutes without activity.
    #[serde(default)]
    pub idle_timeout_minutes: Option<u64>,
    /// Overrides the daemon-wide agent command.
    #[serde(default)]
    pub command: Option<AgentCommand>,
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cwd: cwd.into(),
            idle_timeout_minutes: None,
            command: None,
        }
    }

    pub fn with_idle_timeout(mut self, minutes: u64) -> Self {
        self.idle_timeout_minutes = Some(minutes);
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_minutes
            .map(|minutes| Duration::from_secs(minutes * 60))
    }
}

/// Builds the bridge for a session.
#[async_trait]
pub trait BridgeFactory: Send + Sync {
    async fn create(&self, config: &SessionConfig) -> Result<Bridge, BridgeError>;
}

/// Factory producing bridges that spawn the configured agent command.
pub struct ProcessBridgeFactory {
    agent: AgentCommand,
    spawner: Arc<dyn ProcessSpawner>,
    shutdown_grace: Duration,
}

impl ProcessBridgeFactory {
    pub fn new(agent: AgentCommand, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            agent,
            spawner,
            shutdown_grace: BridgeConfig::default().shutdown_grace,
        }
    }

    /// How long [`SessionManager::stop_all`] lets an open prompt run on.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[async_trait]
impl BridgeFactory for ProcessBridgeFactory {
    async fn create(&self, config: &SessionConfig) -> Result<Bridge, BridgeError> {
        let bridge_config = BridgeConfig {
            name: config.name.clone(),
            cwd: config.cwd.clone(),
            command: config.command.clone().unwrap_or_else(|| self.agent.clone()),
            shutdown_grace: self.shutdown_grace,
        };
        Ok(Bridge::new(bridge_config, Arc::clone(&self.spawner)))
    }
}

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Starting,
    Running,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub status: SessionStatus,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A bridge event tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: String,
    pub event: BridgeEvent,
}

type StartResult = Result<Arc<Bridge>, SessionError>;
type StartFuture = Shared<BoxFuture<'static, StartResult>>;

enum SessionState {
    Idle,
    Starting(StartFuture),
    Running(Arc<Bridge>),
}

struct SessionSlot {
    config: SessionConfig,
    state: SessionState,
    last_activity: Instant,
    last_activity_at: Option<DateTime<Utc>>,
    idle_timer: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl SessionSlot {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            last_activity: Instant::now(),
            last_activity_at: None,
            idle_timer: None,
            forwarder: None,
        }
    }

    fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Starting(_) => SessionStatus::Starting,
            SessionState::Running(_) => SessionStatus::Running,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Some(Utc::now());
    }

    /// Cancel background tasks and return to idle, handing back the bridge
    /// that was running.
    fn reset(&mut self) -> Option<Arc<Bridge>> {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Running(bridge) => Some(bridge),
            SessionState::Starting(start) => {
                self.state = SessionState::Starting(start);
                None
            }
            SessionState::Idle => None,
        }
    }
}

/// Owns the configured sessions and their bridges.
pub struct SessionManager {
    slots: HashMap<String, Arc<Mutex<SessionSlot>>>,
    /// Declaration order.
    names: Vec<String>,
    router: Router,
    factory: Arc<dyn BridgeFactory>,
    events: broadcast::Sender<SessionEvent>,
    this: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        sessions: Vec<SessionConfig>,
        router: Router,
        factory: Arc<dyn BridgeFactory>,
    ) -> Arc<Self> {
        let mut slots = HashMap::new();
        let mut names = Vec::new();
        for config in sessions {
            if slots.contains_key(&config.name) {
                warn!(session = %config.name, "Duplicate session declaration ignored");
                continue;
            }
            names.push(config.name.clone());
            slots.insert(
                config.name.clone(),
                Arc::new(Mutex::new(SessionSlot::new(config))),
            );
        }

        for target in router.unknown_targets(&names) {
            warn!(session = %target, "Routing targets a session that is not declared");
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            slots,
            names,
            router,
            factory,
            events,
            this: this.clone(),
        })
    }

    /// Build from daemon configuration, synthesising `"main"` when no
    /// sessions are declared.
    pub fn from_config(config: &DaemonConfig, factory: Arc<dyn BridgeFactory>) -> Arc<Self> {
        let router = Router::new(config.routing.clone(), config.default_session.clone());
        Self::new(config.session_configs(), router, factory)
    }

    fn slot(&self, name: &str) -> Result<&Arc<Mutex<SessionSlot>>, SessionError> {
        self.slots
            .get(name)
            .ok_or_else(|| SessionError::UnknownSession(name.to_string()))
    }

    /// Session names in declaration order.
    pub fn session_names(&self) -> Vec<String> {
        self.names.clone()
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn default_session_name(&self) -> &str {
        self.router.default_session()
    }

    /// Session that should handle a message from `platform`/`channel`.
    pub fn resolve_session(&self, platform: &str, channel: &str) -> String {
        self.router.resolve(platform, channel).to_string()
    }

    /// Subscribe to events from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every session, in declaration order.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::with_capacity(self.names.len());
        for name in &self.names {
            if let Some(slot) = self.slots.get(name) {
                let slot = slot.lock().await;
                infos.push(SessionInfo {
                    name: name.clone(),
                    status: slot.status(),
                    last_activity: slot.last_activity_at,
                });
            }
        }
        infos
    }

    /// The running bridge for `name`, without starting it.
    pub async fn running_bridge(&self, name: &str) -> Option<Arc<Bridge>> {
        let slot = self.slots.get(name)?.lock().await;
        match &slot.state {
            SessionState::Running(bridge) => Some(Arc::clone(bridge)),
            _ => None,
        }
    }

    /// Return the session's bridge, starting it if necessary.
    pub async fn get_or_start_session(&self, name: &str) -> Result<Arc<Bridge>, SessionError> {
        let slot = self.slot(name)?;
        let start = {
            let mut slot = slot.lock().await;
            if let SessionState::Running(bridge) = &slot.state {
                if bridge.is_running() {
                    return Ok(Arc::clone(bridge));
                }
                warn!(session = %name, "Session bridge is gone, restarting");
                drop(slot.reset());
            }

            let in_flight = match &slot.state {
                SessionState::Starting(start) => Some(start.clone()),
                _ => None,
            };
            match in_flight {
                Some(start) => start,
                None => {
                    let start = self.begin_start(slot.config.clone());
                    slot.state = SessionState::Starting(start.clone());
                    start
                }
            }
        };
        start.await
    }

    /// Explicitly start a session. Same state machine as
    /// [`get_or_start_session`](Self::get_or_start_session).
    pub async fn start_session(&self, name: &str) -> Result<Arc<Bridge>, SessionError> {
        self.get_or_start_session(name).await
    }

    /// Kick off a start attempt in its own task and return a handle every
    /// waiter can share.
    fn begin_start(&self, config: SessionConfig) -> StartFuture {
        info!(session = %config.name, "Starting session");

        let factory = Arc::clone(&self.factory);
        let manager = self.this.clone();
        let name = config.name.clone();

        let task = tokio::spawn({
            let manager = manager.clone();
            async move {
                let result = match tokio::time::timeout(
                    START_TIMEOUT,
                    create_and_start(factory.as_ref(), &config),
                )
                .await
                {
                    Ok(Ok(bridge)) => Ok(Arc::new(bridge)),
                    Ok(Err(e)) => Err(SessionError::StartFailed {
                        name: config.name.clone(),
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(SessionError::StartTimeout {
                        name: config.name.clone(),
                        timeout: START_TIMEOUT,
                    }),
                };
                match manager.upgrade() {
                    Some(manager) => manager.finish_start(&config.name, result).await,
                    None => result,
                }
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let result = Err(SessionError::StartFailed {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                    match manager.upgrade() {
                        Some(manager) => manager.finish_start(&name, result).await,
                        None => result,
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn finish_start(&self, name: &str, result: StartResult) -> StartResult {
        let Some(slot) = self.slots.get(name) else {
            return result;
        };
        let mut slot = slot.lock().await;

        match result {
            Ok(bridge) => {
                slot.state = SessionState::Running(Arc::clone(&bridge));
                slot.touch();
                slot.forwarder = Some(self.spawn_forwarder(name, &bridge));
                self.arm_idle_timer(&mut slot);
                info!(session = %name, "Session running");
                Ok(bridge)
            }
            Err(e) => {
                slot.state = SessionState::Idle;
                warn!(session = %name, error = %e, "Session failed to start");
                Err(e)
            }
        }
    }

    /// Stop a session, letting an open prompt finish first. Idle sessions
    /// are left alone. A bridge that doesn't stop cleanly is logged and the
    /// session is returned to idle anyway.
    pub async fn stop_session(&self, name: &str) -> Result<(), SessionError> {
        let slot = self.slot(name)?;
        if let Err(e) = stop_slot(slot, StopMode::WaitForPrompt).await {
            warn!(session = %name, error = %e, "Session did not stop cleanly");
        }
        Ok(())
    }

    /// Stop every session for shutdown. Open prompts get the bridge's
    /// shutdown grace. Returns the sessions that failed to stop cleanly; they
    /// are idle regardless.
    pub async fn stop_all(&self) -> Vec<(String, BridgeError)> {
        let mut failures = Vec::new();
        for name in &self.names {
            let Some(slot) = self.slots.get(name) else {
                continue;
            };
            if let Err(e) = stop_slot(slot, StopMode::Shutdown).await {
                warn!(session = %name, error = %e, "Session did not stop cleanly");
                failures.push((name.clone(), e));
            }
        }
        failures
    }

    /// Note activity on a session, pushing back its idle deadline.
    pub async fn record_activity(&self, name: &str) -> Result<(), SessionError> {
        let mut slot = self.slot(name)?.lock().await;
        slot.touch();
        if matches!(slot.state, SessionState::Running(_)) {
            self.arm_idle_timer(&mut slot);
        }
        Ok(())
    }

    fn arm_idle_timer(&self, slot: &mut SessionSlot) {
        if let Some(timer) = slot.idle_timer.take() {
            timer.abort();
        }
        let Some(timeout) = slot.config.idle_timeout() else {
            return;
        };

        let manager = self.this.clone();
        let name = slot.config.name.clone();
        slot.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire_idle(&name, timeout).await;
            }
        }));
    }

    async fn expire_idle(&self, name: &str, timeout: Duration) {
        let Some(slot) = self.slots.get(name) else {
            return;
        };
        let bridge = {
            let mut slot = slot.lock().await;
            let busy = match &slot.state {
                SessionState::Running(bridge) => bridge.is_busy(),
                _ => return,
            };
            // This task is the timer; detach rather than abort ourselves.
            drop(slot.idle_timer.take());
            if busy {
                debug!(session = %name, "Session idle timer fired mid-prompt, re-arming");
                self.arm_idle_timer(&mut slot);
                return;
            }
            if slot.last_activity.elapsed() < timeout {
                self.arm_idle_timer(&mut slot);
                return;
            }

            info!(session = %name, ?timeout, "Session idle, stopping");
            slot.reset()
        };

        if let Some(bridge) = bridge
            && let Err(e) = bridge.stop().await
        {
            warn!(session = %name, error = %e, "Idle session did not stop cleanly");
        }
    }

    fn spawn_forwarder(&self, name: &str, bridge: &Arc<Bridge>) -> JoinHandle<()> {
        let mut rx = bridge.subscribe();
        let events = self.events.clone();
        let manager = self.this.clone();
        let bridge = Arc::downgrade(bridge);
        let name = name.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let exited = event == BridgeEvent::Exited;
                        let _ = events.send(SessionEvent {
                            session: name.clone(),
                            event,
                        });
                        if exited {
                            if let Some(manager) = manager.upgrade() {
                                manager.handle_exit(&name, &bridge).await;
                            }
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(session = %name, skipped, "Event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// The session's agent died on its own. Mark it idle so the next use
    /// respawns it.
    async fn handle_exit(&self, name: &str, exited: &Weak<Bridge>) {
        let Some(slot) = self.slots.get(name) else {
            return;
        };
        let mut slot = slot.lock().await;
        let current = match &slot.state {
            SessionState::Running(bridge) => Arc::as_ptr(bridge),
            _ => return,
        };
        if current != exited.as_ptr() {
            return;
        }

        // This task is the forwarder; detach rather than abort ourselves.
        drop(slot.forwarder.take());
        slot.reset();
        warn!(session = %name, "Session agent exited, marked idle");
    }
}

async fn create_and_start(
    factory: &dyn BridgeFactory,
    config: &SessionConfig,
) -> Result<Bridge, BridgeError> {
    let bridge = factory.create(config).await?;
    if let Err(e) = bridge.start().await {
        let _ = bridge.stop().await;
        return Err(e);
    }
    Ok(bridge)
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    /// Wait as long as an open prompt takes.
    WaitForPrompt,
    /// Bounded by the bridge's shutdown grace.
    Shutdown,
}

/// Drive a slot to idle, waiting out any start in progress. The slot is
/// unlocked while the bridge stops, so the session can be started again
/// meanwhile.
async fn stop_slot(slot: &Mutex<SessionSlot>, mode: StopMode) -> Result<(), BridgeError> {
    loop {
        let mut guard = slot.lock().await;
        let pending = match &guard.state {
            SessionState::Idle => return Ok(()),
            SessionState::Starting(start) => Some(start.clone()),
            SessionState::Running(_) => None,
        };

        if let Some(start) = pending {
            drop(guard);
            let _ = start.await;
            continue;
        }

        let Some(bridge) = guard.reset() else {
            return Ok(());
        };
        let name = guard.config.name.clone();
        drop(guard);

        let result = match mode {
            StopMode::WaitForPrompt => bridge.stop().await,
            StopMode::Shutdown => bridge.shutdown().await,
        };
        info!(session = %name, "Session stopped");
        return result;
    }
}
