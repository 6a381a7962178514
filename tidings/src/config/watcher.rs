//! Settings hot reload.
//!
//! A watcher task polls the settings file, parses and validates candidate
//! snapshots off the critical path, and publishes valid ones through a
//! `tokio::sync::watch` channel so readers swap atomically. Every
//! effective change emits exactly one `settings_reload` event carrying
//! the previous snapshot, the current snapshot and the changed keys;
//! an unchanged document emits nothing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::diff::compute_diff;
use super::Settings;

/// Default poll cadence for file changes.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Watches a settings file and publishes validated snapshots.
pub struct SettingsWatcher {
    path: PathBuf,
    tx: watch::Sender<Arc<Settings>>,
    last_mtime: Option<SystemTime>,
    poll_interval: Duration,
}

impl SettingsWatcher {
    /// Create a watcher seeded with the startup snapshot.
    ///
    /// Returns the watcher and the receiver handed to snapshot readers.
    pub fn new(
        path: impl Into<PathBuf>,
        initial: Arc<Settings>,
    ) -> (Self, watch::Receiver<Arc<Settings>>) {
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                path: path.into(),
                tx,
                last_mtime: None,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            rx,
        )
    }

    /// Override the poll cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Apply a candidate snapshot.
    ///
    /// Publishes the snapshot and emits one `settings_reload` event when it
    /// differs from the current one; suppresses the event otherwise.
    /// Returns whether a reload was published.
    pub fn apply(&self, candidate: Settings) -> bool {
        let current = self.tx.borrow().clone();
        if *current == candidate {
            debug!("settings unchanged, reload suppressed");
            return false;
        }

        // PartialEq can miss float-representation quirks; the JSON diff is
        // the contractual change set and decides whether to log.
        let previous_doc = serde_json::to_value(&*current).unwrap_or_default();
        let current_doc = serde_json::to_value(&candidate).unwrap_or_default();
        let changes = compute_diff(&previous_doc, &current_doc);
        if changes.is_empty() {
            debug!("settings unchanged, reload suppressed");
            return false;
        }

        let diff_doc = serde_json::to_value(&changes).unwrap_or_default();
        info!(
            event = "settings_reload",
            correlation_id = %Uuid::new_v4(),
            previous = %previous_doc,
            current = %current_doc,
            diff = %diff_doc,
            changed_keys = changes.len(),
            "settings reloaded"
        );
        self.tx.send_replace(Arc::new(candidate));
        true
    }

    /// Poll loop; runs until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("settings watcher shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.poll_once();
        }
    }

    fn poll_once(&mut self) {
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "settings file not readable");
                return;
            }
        };
        if self.last_mtime == Some(mtime) {
            return;
        }
        self.last_mtime = Some(mtime);

        match Settings::load(&self.path) {
            Ok(candidate) => {
                self.apply(candidate);
            }
            // An invalid document is rejected wholesale; the previous
            // snapshot stays in effect.
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "rejecting invalid settings snapshot"
            ),
        }
    }
}
