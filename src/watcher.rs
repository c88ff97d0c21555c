//! Reloads every theme when a stylesheet under the themes directory changes.

use crate::error::Result;
use crate::registry::ThemeRegistry;
use crate::transport::TabTransport;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fires at most once per `delay`, and never while a reload is running.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    pub fn should_fire(&mut self, now: Instant, busy: bool) -> bool {
        let ready = self.last.is_none_or(|last| last + self.delay < now);
        if !ready || busy {
            return false;
        }
        self.last = Some(now);
        true
    }
}

/// Only modifications of `.css` files count. Directories never do.
pub fn is_stylesheet_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.extension().is_some_and(|ext| ext == "css") && !p.is_dir())
}

pub struct FileWatchReactor<T> {
    registry: Arc<ThemeRegistry<T>>,
    debouncer: Debouncer,
}

impl<T: TabTransport> FileWatchReactor<T> {
    pub fn new(registry: Arc<ThemeRegistry<T>>, delay: Duration) -> Self {
        Self {
            registry,
            debouncer: Debouncer::new(delay),
        }
    }

    /// Schedules a reload if the event warrants one, returning its task.
    pub fn on_event(&mut self, event: &Event) -> Option<JoinHandle<()>> {
        debug!(?event, "FS Event");
        if !is_stylesheet_event(event) {
            debug!("FS Event is not on a CSS file. Ignoring!");
            return None;
        }
        if !self.debouncer.should_fire(Instant::now(), self.registry.is_busy()) {
            return None;
        }

        info!("Reloading themes due to FS event");
        let registry = self.registry.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = registry.reset().await {
                warn!(error = %e, "reload failed");
            }
        }))
    }

    pub async fn run(mut self, mut events: EventStream) {
        while let Some(event) = events.recv().await {
            match event {
                Ok(event) => {
                    self.on_event(&event);
                }
                Err(e) => warn!(error = %e, "file watch error"),
            }
        }
    }
}

pub type EventStream = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Starts watching `dir` recursively. Dropping the watcher stops the events.
pub fn watch(dir: &Path) -> Result<(RecommendedWatcher, EventStream)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::Recursive)?;
    info!(path = %dir.display(), "Observing themes folder for file changes");
    Ok((watcher, rx))
}
