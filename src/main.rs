use std::sync::Arc;

use agent_daemon::bridge::CommandSpawner;
use agent_daemon::config::DaemonConfig;
use agent_daemon::scheduler::{InteractionProbe, InteractionTracker, Scheduler, SchedulerEvent};
use agent_daemon::session::{ProcessBridgeFactory, SessionManager};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DaemonConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        eprintln!("  Set AGENT_DAEMON_CONFIG=/path/to/daemon.yaml or AGENT_DAEMON_* variables");
        std::process::exit(1);
    });

    eprintln!("🤖 Agent Daemon v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Agent: {} {}",
        config.agent.program,
        config.agent.args.join(" ")
    );
    eprintln!("   Jobs: {}", config.scheduler.jobs_dir.display());

    // ── Sessions ────────────────────────────────────────────────────────
    let factory = ProcessBridgeFactory::new(config.agent.clone(), Arc::new(CommandSpawner));
    let sessions = SessionManager::from_config(&config, Arc::new(factory));
    eprintln!(
        "   Sessions: {} (default: {})\n",
        sessions.session_names().join(", "),
        sessions.default_session_name()
    );

    let mut session_events = sessions.subscribe();
    tokio::spawn(async move {
        loop {
            match session_events.recv().await {
                Ok(event) => tracing::trace!(session = %event.session, "{:?}", event.event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────────
    // The chat layer records interactions here; nothing feeds it yet in
    // headless mode, so the grace gate stays open.
    let interactions: Arc<dyn InteractionProbe> = Arc::new(InteractionTracker::new());
    let scheduler = Scheduler::new(config.scheduler.clone(), Some(interactions));
    scheduler.set_session_manager(Arc::clone(&sessions));

    let mut scheduler_events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match scheduler_events.recv().await {
                Ok(SchedulerEvent::Response { job, response }) => {
                    tracing::info!(job = %job, "Job response:\n{}", response);
                }
                Ok(SchedulerEvent::RunFinished { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped scheduler events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    scheduler.stop().await;
    for (session, e) in sessions.stop_all().await {
        tracing::warn!(session = %session, "Unclean shutdown: {}", e);
    }

    Ok(())
}
