//! Debounced filesystem watch over the job root.

use std::path::Path;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::SchedulerError;

/// Watch `root` recursively. A unit is sent on the returned channel once no
/// further change has been seen for `debounce`. Dropping the watcher closes
/// the channel.
pub fn watch_jobs(
    root: &Path,
    debounce: Duration,
) -> Result<(RecommendedWatcher, mpsc::Receiver<()>), SchedulerError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(e) => tracing::warn!("Job watcher error: {}", e),
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    let (tick_tx, tick_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut pending = false;
        let mut last_event = Instant::now();

        loop {
            let wait = debounce.saturating_sub(last_event.elapsed());
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        pending = true;
                        last_event = Instant::now();
                    }
                }
                _ = tokio::time::sleep(wait), if pending => {
                    pending = false;
                    // A full buffer already means a reload is queued
                    if let Err(mpsc::error::TrySendError::Closed(())) = tick_tx.try_send(()) {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Job watcher stopped");
    });

    tracing::info!(dir = %root.display(), ?debounce, "Watching job directory");
    Ok((watcher, tick_rx))
}
