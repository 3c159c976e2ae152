//! Cron scheduler for job files.
//!
//! Jobs are discovered under the configured directory and kept in sync with
//! it by a debounced watcher. Each enabled job gets a cron task; when it
//! fires, the run goes through a scheduler-wide run-lock and a series of
//! gates before its steps execute:
//! - a run already in progress skips this one (no queueing)
//! - the target session must exist
//! - the agent must not be busy
//! - the user must not have interacted within the grace period

pub mod discovery;
pub mod job;
pub mod probe;
pub mod steps;
pub mod watcher;

pub use job::{JobDefinition, Step};
pub use probe::{InteractionProbe, InteractionTracker};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{Local, Utc};
use notify::RecommendedWatcher;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bridge::Bridge;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SessionError};
use crate::session::SessionManager;

/// Grace period applied when neither the job nor the config sets one.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5 * 60 * 1000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a run did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another job held the run-lock.
    AlreadyRunning,
    /// No bridge or session manager attached.
    NoBridge,
    UnknownSession(String),
    Busy,
    GracePeriod { remaining_ms: u64 },
    /// The scheduler is shutting down.
    Stopped,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "another job is running"),
            Self::NoBridge => write!(f, "no agent attached"),
            Self::UnknownSession(name) => write!(f, "unknown session '{name}'"),
            Self::Busy => write!(f, "agent is busy"),
            Self::GracePeriod { remaining_ms } => {
                write!(f, "user active recently ({remaining_ms}ms of grace left)")
            }
            Self::Stopped => write!(f, "scheduler stopped"),
        }
    }
}

/// Result of one triggered run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { steps: usize },
    Skipped(SkipReason),
    /// `step` is the step that failed, or `None` when the session could not
    /// be started.
    Failed { step: Option<String>, reason: String },
}

/// Published on the scheduler's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A `prompt` step produced a non-blank reply.
    Response { job: String, response: String },
    RunFinished { job: String, outcome: RunOutcome },
}

/// What a reload changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub replaced: usize,
}

struct ScheduledJob {
    definition: Arc<JobDefinition>,
    /// Present iff the job is currently scheduled.
    task: Option<JoinHandle<()>>,
}

impl ScheduledJob {
    fn unschedule(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct WatchState {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The job scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    probe: Option<Arc<dyn InteractionProbe>>,
    /// Used when no session manager is attached.
    bridge: RwLock<Option<Arc<Bridge>>>,
    sessions: RwLock<Option<Arc<SessionManager>>>,
    jobs: tokio::sync::RwLock<HashMap<String, ScheduledJob>>,
    /// Held for the whole of a run.
    run_lock: tokio::sync::Mutex<()>,
    /// Serialises reloads with each other and with start/stop.
    reload_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    stopping: AtomicBool,
    watch: Mutex<Option<WatchState>>,
    events: broadcast::Sender<SchedulerEvent>,
    this: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, probe: Option<Arc<dyn InteractionProbe>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            config,
            probe,
            bridge: RwLock::new(None),
            sessions: RwLock::new(None),
            jobs: tokio::sync::RwLock::new(HashMap::new()),
            run_lock: tokio::sync::Mutex::new(()),
            reload_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            watch: Mutex::new(None),
            events,
            this: this.clone(),
        })
    }

    /// Run jobs on this bridge. Ignored while a session manager is attached.
    pub fn set_bridge(&self, bridge: Arc<Bridge>) {
        *write(&self.bridge) = Some(bridge);
    }

    /// Resolve each job's bridge through `manager`.
    pub fn set_session_manager(&self, manager: Arc<SessionManager>) {
        *write(&self.sessions) = Some(manager);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// All known jobs, enabled or not, sorted by name.
    pub async fn jobs(&self) -> Vec<JobDefinition> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<JobDefinition> =
            jobs.values().map(|j| j.definition.as_ref().clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn is_scheduled(&self, name: &str) -> bool {
        self.jobs
            .read()
            .await
            .get(name)
            .is_some_and(|j| j.task.is_some())
    }

    /// Load jobs, schedule them and start watching the job directory.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);

        self.reload().await;
        {
            let _reload = self.reload_lock.lock().await;
            let mut jobs = self.jobs.write().await;
            for job in jobs.values_mut() {
                if job.task.is_none() {
                    job.task = self.schedule(&job.definition);
                }
            }
        }

        let dir = &self.config.jobs_dir;
        if dir.is_dir() {
            match watcher::watch_jobs(dir, self.config.debounce()) {
                Ok((watcher, mut ticks)) => {
                    let scheduler = self.this.clone();
                    let task = tokio::spawn(async move {
                        while ticks.recv().await.is_some() {
                            let Some(scheduler) = scheduler.upgrade() else {
                                break;
                            };
                            scheduler.reload().await;
                        }
                    });
                    *self.watch.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(WatchState {
                            _watcher: watcher,
                            task,
                        });
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), "Hot reload unavailable: {}", e);
                }
            }
        } else {
            tracing::warn!(dir = %dir.display(), "Job directory not found, starting with no jobs");
        }

        let scheduled = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.task.is_some())
            .count();
        tracing::info!(jobs = scheduled, "Scheduler started");
    }

    /// Stop scheduling. Waits for a run in progress to finish first.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);

        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watch) = watch {
            watch.task.abort();
        }

        let _reload = self.reload_lock.lock().await;
        let _run = self.run_lock.lock().await;
        for job in self.jobs.write().await.values_mut() {
            job.unschedule();
        }
        tracing::info!("Scheduler stopped");
    }

    /// Reconcile the job map with the job directory.
    ///
    /// The directory is read and diffed without holding the job map; changes
    /// are then applied in one write. New and modified jobs are scheduled
    /// only while the scheduler is started.
    pub async fn reload(&self) -> ReloadSummary {
        let _reload = self.reload_lock.lock().await;

        let root = self.config.jobs_dir.clone();
        let discovered = match tokio::task::spawn_blocking(move || discovery::discover(&root)).await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Job discovery failed: {}", e);
                return ReloadSummary::default();
            }
        };

        let current: HashMap<String, Arc<JobDefinition>> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(name, job)| (name.clone(), Arc::clone(&job.definition)))
            .collect();

        let removed: Vec<String> = current
            .keys()
            .filter(|name| !discovered.contains_key(*name))
            .cloned()
            .collect();
        let mut changed = Vec::new();
        let mut summary = ReloadSummary {
            removed: removed.len(),
            ..Default::default()
        };
        for (name, definition) in discovered {
            match current.get(&name) {
                Some(existing) if **existing == definition => {}
                Some(_) => {
                    summary.replaced += 1;
                    changed.push(definition);
                }
                None => {
                    summary.added += 1;
                    changed.push(definition);
                }
            }
        }

        if summary == ReloadSummary::default() {
            return summary;
        }

        let started = self.is_started();
        let mut jobs = self.jobs.write().await;
        for name in removed {
            if let Some(mut job) = jobs.remove(&name) {
                job.unschedule();
                tracing::info!(job = %name, "Job removed");
            }
        }
        for definition in changed {
            let definition = Arc::new(definition);
            let task = if started {
                self.schedule(&definition)
            } else {
                None
            };
            let name = definition.name.clone();
            let previous = jobs.insert(name.clone(), ScheduledJob { definition, task });
            match previous {
                Some(mut old) => {
                    old.unschedule();
                    tracing::info!(job = %name, "Job updated");
                }
                None => tracing::info!(job = %name, "Job added"),
            }
        }

        tracing::debug!(
            added = summary.added,
            removed = summary.removed,
            replaced = summary.replaced,
            "Jobs reloaded"
        );
        summary
    }

    /// Run a job now, through the same lock and gates as a cron firing.
    pub async fn trigger(&self, name: &str) -> Result<RunOutcome, SchedulerError> {
        let job = self
            .jobs
            .read()
            .await
            .get(name)
            .map(|j| Arc::clone(&j.definition))
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        Ok(self.fire(&job).await)
    }

    /// Spawn the cron task for an enabled job.
    fn schedule(&self, job: &Arc<JobDefinition>) -> Option<JoinHandle<()>> {
        if !job.enabled {
            tracing::debug!(job = %job.name, "Job disabled, not scheduling");
            return None;
        }
        let schedule = match job.cron_schedule() {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(job = %job.name, "Not scheduling job: {}", e);
                return None;
            }
        };

        let scheduler = self.this.clone();
        let job = Arc::clone(job);
        Some(tokio::spawn(async move {
            let mut after = Local::now();
            loop {
                let Some(next) = schedule.after(&after).next() else {
                    break;
                };
                let wait = (next - Local::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                after = next.max(Local::now());

                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                // Runs live in their own task so unscheduling never cuts one short
                let job = Arc::clone(&job);
                tokio::spawn(async move {
                    scheduler.fire(&job).await;
                });
            }
        }))
    }

    async fn fire(&self, job: &JobDefinition) -> RunOutcome {
        let outcome = self.run(job).await;
        match &outcome {
            RunOutcome::Completed { steps } => {
                tracing::info!(job = %job.name, steps, "Job completed");
            }
            RunOutcome::Skipped(reason) => {
                tracing::debug!(job = %job.name, "Job skipped: {}", reason);
            }
            RunOutcome::Failed { step, reason } => {
                tracing::error!(
                    job = %job.name,
                    step = step.as_deref().unwrap_or("start"),
                    "Job failed: {}",
                    reason
                );
            }
        }
        let _ = self.events.send(SchedulerEvent::RunFinished {
            job: job.name.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run(&self, job: &JobDefinition) -> RunOutcome {
        let Ok(_run) = self.run_lock.try_lock() else {
            return RunOutcome::Skipped(SkipReason::AlreadyRunning);
        };
        if self.stopping.load(Ordering::SeqCst) {
            return RunOutcome::Skipped(SkipReason::Stopped);
        }

        let (bridge, session) = match self.resolve_bridge(job).await {
            Ok(resolved) => resolved,
            Err(outcome) => return outcome,
        };
        if bridge.is_busy() {
            return RunOutcome::Skipped(SkipReason::Busy);
        }
        if let Some(remaining_ms) = self.grace_remaining(job) {
            return RunOutcome::Skipped(SkipReason::GracePeriod { remaining_ms });
        }

        if let Some(session) = &session
            && let Some(manager) = self.session_manager()
        {
            let _ = manager.record_activity(session).await;
        }

        tracing::info!(job = %job.name, steps = job.steps.len(), "Running job");
        for step in &job.steps {
            match steps::execute_step(&bridge, job, step).await {
                Ok(Some(reply)) => {
                    let reply = reply.trim();
                    if !reply.is_empty() {
                        let _ = self.events.send(SchedulerEvent::Response {
                            job: job.name.clone(),
                            response: reply.to_string(),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    return RunOutcome::Failed {
                        step: Some(step.to_string()),
                        reason: e.to_string(),
                    };
                }
            }
        }
        RunOutcome::Completed {
            steps: job.steps.len(),
        }
    }

    fn session_manager(&self) -> Option<Arc<SessionManager>> {
        read(&self.sessions).clone()
    }

    /// The bridge a job runs on, and the session it belongs to when a
    /// session manager is attached.
    async fn resolve_bridge(
        &self,
        job: &JobDefinition,
    ) -> Result<(Arc<Bridge>, Option<String>), RunOutcome> {
        let Some(manager) = self.session_manager() else {
            return read(&self.bridge)
                .clone()
                .map(|bridge| (bridge, None))
                .ok_or(RunOutcome::Skipped(SkipReason::NoBridge));
        };

        let name = job
            .session
            .clone()
            .or_else(|| self.config.default_session.clone())
            .unwrap_or_else(|| manager.default_session_name().to_string());
        if !manager.has_session(&name) {
            tracing::warn!(job = %job.name, session = %name, "Job targets unknown session");
            return Err(RunOutcome::Skipped(SkipReason::UnknownSession(name)));
        }

        match manager.get_or_start_session(&name).await {
            Ok(bridge) => Ok((bridge, Some(name))),
            Err(SessionError::UnknownSession(_)) => {
                Err(RunOutcome::Skipped(SkipReason::UnknownSession(name)))
            }
            Err(e) => Err(RunOutcome::Failed {
                step: None,
                reason: e.to_string(),
            }),
        }
    }

    /// Milliseconds of grace left, if the user was active too recently.
    fn grace_remaining(&self, job: &JobDefinition) -> Option<u64> {
        let probe = self.probe.as_ref()?;
        let grace_ms = job
            .grace_period_ms
            .or(self.config.grace_period_ms)
            .unwrap_or(DEFAULT_GRACE_PERIOD_MS);
        if grace_ms == 0 {
            return None;
        }

        let last = probe.last_interaction()?;
        let elapsed_ms = u64::try_from((Utc::now() - last).num_milliseconds()).unwrap_or(0);
        (elapsed_ms < grace_ms).then(|| grace_ms - elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::config::AgentCommand;
    use crate::session::{ProcessBridgeFactory, Router, SessionConfig};
    use crate::testing::{self, FakeSpawner};
    use serde_json::{Value, json};
    use std::path::Path;
    use std::time::Duration;

    fn write_job(root: &Path, name: &str, frontmatter: &str, body: &str) {
        let path = root.join(format!("{name}.md"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, format!("---\n{frontmatter}\n---\n{body}\n")).unwrap();
    }

    fn config(root: &Path) -> SchedulerConfig {
        SchedulerConfig {
            jobs_dir: root.to_path_buf(),
            debounce_ms: 50,
            ..Default::default()
        }
    }

    async fn started_bridge(spawner: Arc<FakeSpawner>) -> Arc<Bridge> {
        let bridge = Arc::new(Bridge::new(BridgeConfig::default(), spawner));
        bridge.start().await.unwrap();
        bridge
    }

    async fn with_jobs(
        dir: &Path,
        probe: Option<Arc<dyn InteractionProbe>>,
        bridge: Arc<Bridge>,
    ) -> Arc<Scheduler> {
        let scheduler = Scheduler::new(config(dir), probe);
        scheduler.set_bridge(bridge);
        scheduler.reload().await;
        scheduler
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn second_trigger_is_skipped_while_one_runs() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "first", "schedule: \"0 7 * * *\"", "one");
        write_job(dir.path(), "second", "schedule: \"0 7 * * *\"\nsteps: [compact]", "two");

        let (spawner, mut processes) = FakeSpawner::manual();
        let bridge = started_bridge(spawner.clone()).await;
        let mut agent = processes.recv().await.unwrap();
        let scheduler = with_jobs(dir.path(), None, bridge).await;
        let mut events = scheduler.subscribe();

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger("first").await.unwrap() }
        });
        let prompt = agent.next_request().await.unwrap();
        assert_eq!(prompt["message"], "[CRON:first] one");

        let second = scheduler.trigger("second").await.unwrap();
        assert_eq!(second, RunOutcome::Skipped(SkipReason::AlreadyRunning));

        agent.respond(&prompt, Value::Null).await;
        agent.send(testing::agent_start()).await;
        agent.send(testing::text_delta("all done")).await;
        agent.send(testing::agent_end()).await;

        assert_eq!(first.await.unwrap(), RunOutcome::Completed { steps: 1 });
        assert_eq!(spawner.request_types(), vec!["prompt"]);

        let mut responses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::Response { job, response } = event {
                responses.push((job, response));
            }
        }
        assert_eq!(responses, vec![("first".to_string(), "all done".to_string())]);
    }

    #[tokio::test]
    async fn grace_period_gate() {
        let dir = tempfile::tempdir().unwrap();
        write_job(
            dir.path(),
            "always",
            "schedule: \"0 7 * * *\"\nsteps: [compact]\ngracePeriodMs: 0",
            "",
        );
        write_job(dir.path(), "polite", "schedule: \"0 7 * * *\"\nsteps: [compact]", "");

        let tracker = Arc::new(InteractionTracker::new());
        tracker.record();
        let bridge = started_bridge(FakeSpawner::echo("ok")).await;
        let probe: Arc<dyn InteractionProbe> = tracker.clone();
        let scheduler = with_jobs(dir.path(), Some(probe), bridge).await;

        let always = scheduler.trigger("always").await.unwrap();
        assert_eq!(always, RunOutcome::Completed { steps: 1 });

        let polite = scheduler.trigger("polite").await.unwrap();
        assert!(matches!(
            polite,
            RunOutcome::Skipped(SkipReason::GracePeriod { remaining_ms }) if remaining_ms <= DEFAULT_GRACE_PERIOD_MS
        ));

        // An interaction older than the default window no longer blocks
        tracker.record_at(Utc::now() - chrono::Duration::minutes(10));
        let polite = scheduler.trigger("polite").await.unwrap();
        assert_eq!(polite, RunOutcome::Completed { steps: 1 });
    }

    #[tokio::test]
    async fn no_probe_skips_grace_gate() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "job", "schedule: \"0 7 * * *\"\nsteps: [compact]", "");
        let bridge = started_bridge(FakeSpawner::echo("ok")).await;
        let scheduler = with_jobs(dir.path(), None, bridge).await;

        let outcome = scheduler.trigger("job").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { steps: 1 });
    }

    #[tokio::test]
    async fn unknown_session_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_job(
            dir.path(),
            "lost",
            "schedule: \"0 7 * * *\"\nsession: ghost\nsteps: [compact]",
            "",
        );
        let spawner = FakeSpawner::echo("ok");
        let factory = ProcessBridgeFactory::new(AgentCommand::default(), spawner.clone());
        let manager = SessionManager::new(
            vec![SessionConfig::new("main", ".")],
            Router::new(Vec::new(), None),
            Arc::new(factory),
        );

        let scheduler = Scheduler::new(config(dir.path()), None);
        scheduler.set_session_manager(manager);
        scheduler.reload().await;

        let outcome = scheduler.trigger("lost").await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Skipped(SkipReason::UnknownSession("ghost".into()))
        );
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn session_manager_starts_default_session() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "hello", "schedule: \"0 7 * * *\"", "say hi");
        let spawner = FakeSpawner::echo("hi there");
        let factory = ProcessBridgeFactory::new(AgentCommand::default(), spawner.clone());
        let manager = SessionManager::new(
            vec![SessionConfig::new("main", ".")],
            Router::new(Vec::new(), None),
            Arc::new(factory),
        );

        let scheduler = Scheduler::new(config(dir.path()), None);
        scheduler.set_session_manager(Arc::clone(&manager));
        scheduler.reload().await;
        let mut events = scheduler.subscribe();

        let outcome = scheduler.trigger("hello").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { steps: 1 });
        assert_eq!(spawner.spawn_count(), 1);
        assert!(manager.running_bridge("main").await.is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::Response {
                job: "hello".into(),
                response: "hi there".into(),
            }
        );
    }

    #[tokio::test]
    async fn busy_agent_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "job", "schedule: \"0 7 * * *\"\nsteps: [compact]", "");

        let (spawner, mut processes) = FakeSpawner::manual();
        let bridge = started_bridge(spawner.clone()).await;
        let mut agent = processes.recv().await.unwrap();
        let scheduler = with_jobs(dir.path(), None, Arc::clone(&bridge)).await;

        let _chat = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.send_message("user message").await }
        });
        let request = agent.next_request().await.unwrap();
        agent.respond(&request, Value::Null).await;

        let outcome = scheduler.trigger("job").await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped(SkipReason::Busy));
        assert_eq!(spawner.request_types(), vec!["prompt"]);
    }

    #[tokio::test]
    async fn failing_step_aborts_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        write_job(
            dir.path(),
            "job",
            "schedule: \"0 7 * * *\"\nsteps: [new-session, compact, prompt]",
            "body",
        );
        let spawner = FakeSpawner::scripted(|request| {
            if request["type"] == "compact" {
                vec![json!({
                    "id": request["id"],
                    "type": "response",
                    "command": "compact",
                    "success": false,
                    "error": "nothing to compact",
                })]
            } else {
                vec![testing::respond_ok(request, Value::Null)]
            }
        });
        let bridge = started_bridge(spawner.clone()).await;
        let scheduler = with_jobs(dir.path(), None, bridge).await;

        let outcome = scheduler.trigger("job").await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed { step: Some(ref step), ref reason } if step == "compact" && reason.contains("nothing to compact")
        ));
        assert_eq!(spawner.request_types(), vec!["new_session", "compact"]);

        // The run-lock was released
        let again = scheduler.trigger("job").await.unwrap();
        assert!(matches!(again, RunOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn reload_turn_ends_before_prompt_is_sent() {
        let dir = tempfile::tempdir().unwrap();
        write_job(
            dir.path(),
            "j",
            "schedule: \"0 7 * * *\"\nsteps: [reload, prompt]",
            "real question",
        );
        let (spawner, mut processes) = FakeSpawner::manual();
        let bridge = started_bridge(spawner).await;
        let mut agent = processes.recv().await.unwrap();
        let scheduler = with_jobs(dir.path(), None, Arc::clone(&bridge)).await;
        let mut events = scheduler.subscribe();

        let run = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger("j").await.unwrap() }
        });

        let reload = agent.next_request().await.unwrap();
        assert_eq!(reload["type"], "prompt");
        assert_eq!(reload["message"], steps::RELOAD_MESSAGE);
        assert!(bridge.is_busy());
        agent.respond(&reload, Value::Null).await;
        agent.send(testing::agent_start()).await;
        agent.send(testing::text_delta("runtime reloaded")).await;

        // Nothing else is written while the reload turn is open
        let early = tokio::time::timeout(Duration::from_millis(200), agent.next_request()).await;
        assert!(early.is_err());
        assert!(bridge.is_busy());

        agent.send(testing::agent_end()).await;
        let prompt = agent.next_request().await.unwrap();
        assert_eq!(prompt["message"], "[CRON:j] real question");
        agent.respond(&prompt, Value::Null).await;
        agent.send(testing::text_delta("the answer")).await;
        agent.send(testing::agent_end()).await;

        assert_eq!(run.await.unwrap(), RunOutcome::Completed { steps: 2 });
        assert!(!bridge.is_busy());

        let mut responses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::Response { response, .. } = event {
                responses.push(response);
            }
        }
        assert_eq!(responses, vec!["the answer".to_string()]);
    }

    #[tokio::test]
    async fn cron_task_fires_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "tick", "schedule: \"* * * * * *\"\nsteps: [compact]", "");
        let spawner = FakeSpawner::echo("ok");
        let bridge = started_bridge(spawner.clone()).await;
        let scheduler = Scheduler::new(config(dir.path()), None);
        scheduler.set_bridge(bridge);
        let mut events = scheduler.subscribe();
        scheduler.start().await;
        assert!(scheduler.is_scheduled("tick").await);

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SchedulerEvent::RunFinished { job, outcome }) = events.recv().await {
                    return (job, outcome);
                }
            }
        })
        .await
        .expect("cron job never fired");
        assert_eq!(
            finished,
            ("tick".to_string(), RunOutcome::Completed { steps: 1 })
        );

        scheduler.stop().await;
        assert!(!scheduler.is_scheduled("tick").await);
        let sent = spawner.request_types().len();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(spawner.request_types().len(), sent);
    }

    #[tokio::test]
    async fn unmatched_model_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        write_job(
            dir.path(),
            "job",
            "schedule: \"0 7 * * *\"\nsteps:\n  - model: llama\n  - compact",
            "",
        );
        let spawner = FakeSpawner::scripted(|request| {
            let data = if request["type"] == "get_available_models" {
                json!({"models": [{"provider": "anthropic", "id": "claude-haiku-4-5"}]})
            } else {
                Value::Null
            };
            vec![testing::respond_ok(request, data)]
        });
        let bridge = started_bridge(spawner.clone()).await;
        let scheduler = with_jobs(dir.path(), None, bridge).await;

        let outcome = scheduler.trigger("job").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { step: Some(ref s), .. } if s == "model:llama"));
        assert_eq!(spawner.request_types(), vec!["get_available_models"]);
    }

    #[tokio::test]
    async fn blank_reply_emits_no_response() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "quiet", "schedule: \"0 7 * * *\"", "anything?");
        let bridge = started_bridge(FakeSpawner::echo("   \n")).await;
        let scheduler = with_jobs(dir.path(), None, bridge).await;
        let mut events = scheduler.subscribe();

        let outcome = scheduler.trigger("quiet").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { steps: 1 });
        assert!(matches!(
            events.recv().await.unwrap(),
            SchedulerEvent::RunFinished { .. }
        ));
    }

    #[tokio::test]
    async fn trigger_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(config(dir.path()), None);
        let err = scheduler.trigger("nope").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn no_bridge_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "job", "schedule: \"0 7 * * *\"", "");
        let scheduler = Scheduler::new(config(dir.path()), None);
        scheduler.reload().await;
        let outcome = scheduler.trigger("job").await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped(SkipReason::NoBridge));
    }

    #[tokio::test]
    async fn reload_reconciles_with_disk() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "a", "schedule: \"0 7 * * *\"", "");
        write_job(dir.path(), "nested/b", "schedule: \"0 8 * * *\"", "");
        let scheduler = Scheduler::new(config(dir.path()), None);

        let summary = scheduler.reload().await;
        assert_eq!(summary.added, 2);
        let names: Vec<String> = scheduler.jobs().await.into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["a", "nested/b"]);
        // Not started, so nothing is scheduled
        assert!(!scheduler.is_scheduled("a").await);

        assert_eq!(scheduler.reload().await, ReloadSummary::default());

        std::fs::remove_file(dir.path().join("a.md")).unwrap();
        write_job(dir.path(), "nested/b", "schedule: \"0 9 * * *\"", "");
        write_job(dir.path(), "c", "schedule: \"0 7 * * *\"", "");
        let summary = scheduler.reload().await;
        assert_eq!(
            summary,
            ReloadSummary {
                added: 1,
                removed: 1,
                replaced: 1,
            }
        );
    }

    #[tokio::test]
    async fn disabled_jobs_are_loaded_but_not_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "on", "schedule: \"0 7 * * *\"", "");
        write_job(dir.path(), "off", "schedule: \"0 7 * * *\"\nenabled: false", "");
        let scheduler = Scheduler::new(config(dir.path()), None);
        scheduler.start().await;

        assert_eq!(scheduler.jobs().await.len(), 2);
        assert!(scheduler.is_scheduled("on").await);
        assert!(!scheduler.is_scheduled("off").await);

        scheduler.stop().await;
        assert!(!scheduler.is_scheduled("on").await);
    }

    #[tokio::test]
    async fn hot_reload_follows_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "existing", "schedule: \"0 7 * * *\"", "");
        let scheduler = Scheduler::new(config(dir.path()), None);
        scheduler.start().await;
        assert_eq!(scheduler.jobs().await.len(), 1);
        let s = &scheduler;

        write_job(dir.path(), "fresh", "schedule: \"0 7 * * *\"\nsteps: [compact]", "");
        eventually(|| async move { s.jobs().await.len() == 2 }).await;
        assert!(scheduler.is_scheduled("fresh").await);

        write_job(
            dir.path(),
            "fresh",
            "schedule: \"0 7 * * *\"\nsteps: [new-session, prompt]",
            "",
        );
        eventually(|| async move {
            s.jobs()
                .await
                .iter()
                .any(|j| j.name == "fresh" && j.steps == vec![Step::NewSession, Step::Prompt])
        })
        .await;
        assert!(scheduler.is_scheduled("fresh").await);

        std::fs::remove_file(dir.path().join("fresh.md")).unwrap();
        eventually(|| async move { s.jobs().await.len() == 1 }).await;

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn missing_job_directory_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(config(&dir.path().join("absent")), None);
        scheduler.start().await;
        assert!(scheduler.is_started());
        assert!(scheduler.jobs().await.is_empty());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_run_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "long", "schedule: \"0 7 * * *\"", "work");
        let (spawner, mut processes) = FakeSpawner::manual();
        let bridge = started_bridge(spawner).await;
        let mut agent = processes.recv().await.unwrap();
        let scheduler = with_jobs(dir.path(), None, bridge).await;

        let run = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger("long").await.unwrap() }
        });
        let prompt = agent.next_request().await.unwrap();

        let stop = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stop.is_finished());

        agent.respond(&prompt, Value::Null).await;
        agent.send(testing::agent_end()).await;

        assert_eq!(run.await.unwrap(), RunOutcome::Completed { steps: 1 });
        stop.await.unwrap();

        let after = scheduler.trigger("long").await.unwrap();
        assert_eq!(after, RunOutcome::Skipped(SkipReason::Stopped));
    }
}
