use crate::error::{Error, Result};
use crate::transport::{InjectHandle, TabId, TabTransport};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Where a unit's stylesheet comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CssSource {
    File(PathBuf),
    /// Produced in memory (patch components) and handed over through `set_css`.
    Generated,
}

/// Outcome of a removal. Missed handles are expected after a tab reload and never fail the call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: usize,
    pub missed: usize,
}

impl Removal {
    pub fn is_clean(&self) -> bool {
        self.missed == 0
    }

    pub fn merge(&mut self, other: Removal) {
        self.removed += other.removed;
        self.missed += other.missed;
    }
}

#[derive(Default)]
struct UnitState {
    css: Option<String>,
    handles: HashMap<TabId, Vec<InjectHandle>>,
    enabled: bool,
}

/// One stylesheet and its injected state across a fixed set of tabs.
///
/// `inject` and `remove` are idempotent per tab: a tab never holds more than the
/// handles of a single live injection. The state lock is held across transport
/// calls so the watchdog and user mutations cannot interleave on the same unit.
pub struct InjectionUnit {
    source: CssSource,
    tabs: Vec<TabId>,
    state: Mutex<UnitState>,
}

/// Makes a stylesheet safe to embed inside a template literal.
pub fn escape_css(css: &str) -> String {
    css.replace('\\', "\\\\").replace('`', "\\`")
}

impl InjectionUnit {
    pub fn from_file(path: impl Into<PathBuf>, tabs: impl IntoIterator<Item = TabId>) -> Self {
        Self::new(CssSource::File(path.into()), None, tabs)
    }

    pub fn generated(css: &str, tabs: impl IntoIterator<Item = TabId>) -> Self {
        Self::new(CssSource::Generated, Some(escape_css(css)), tabs)
    }

    fn new(source: CssSource, css: Option<String>, tabs: impl IntoIterator<Item = TabId>) -> Self {
        let mut targets: Vec<TabId> = Vec::new();
        for tab in tabs {
            if !targets.contains(&tab) {
                targets.push(tab);
            }
        }
        Self {
            source,
            tabs: targets,
            state: Mutex::new(UnitState {
                css,
                ..UnitState::default()
            }),
        }
    }

    pub fn tabs(&self) -> &[TabId] {
        &self.tabs
    }

    pub fn targets(&self, tab: &str) -> bool {
        self.tabs.iter().any(|t| t == tab)
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Marks the unit as wanted without touching any tab; the watchdog injects it later.
    pub async fn arm(&self) {
        self.state.lock().await.enabled = true;
    }

    pub async fn handle_count(&self, tab: &str) -> usize {
        self.state.lock().await.handles.get(tab).map_or(0, Vec::len)
    }

    /// Reads the stylesheet once. Later calls return immediately.
    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.load_locked(&mut state).await.map(|_| ())
    }

    /// Replaces the payload. Live injections keep the old one until re-injected.
    pub async fn set_css(&self, css: &str) {
        self.state.lock().await.css = Some(escape_css(css));
    }

    async fn load_locked(&self, state: &mut UnitState) -> Result<String> {
        if let Some(css) = &state.css {
            return Ok(css.clone());
        }
        let css = match &self.source {
            CssSource::File(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    io::Error::new(e.kind(), format!("{}: {e}", path.display()))
                })?;
                info!(path = %path.display(), "Loaded css");
                escape_css(&raw)
            }
            CssSource::Generated => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "stylesheet has not been generated yet",
                )));
            }
        };
        state.css = Some(css.clone());
        Ok(css)
    }

    /// Injects into `tab`, or into every target tab when `None`, stopping at the first failure.
    pub async fn inject<T: TabTransport>(&self, transport: &T, tab: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        match tab {
            Some(tab) => self.inject_tab(transport, &mut state, tab).await,
            None => {
                for tab in &self.tabs {
                    self.inject_tab(transport, &mut state, tab).await?;
                }
                Ok(())
            }
        }
    }

    /// Re-injects into `tab` only if the unit is still wanted, checking and injecting
    /// under one lock so a concurrent removal cannot be undone. Returns whether it injected.
    pub async fn reinject_if_enabled<T: TabTransport>(
        &self,
        transport: &T,
        tab: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.enabled || !self.targets(tab) {
            return Ok(false);
        }
        self.inject_tab(transport, &mut state, tab).await?;
        Ok(true)
    }

    async fn inject_tab<T: TabTransport>(
        &self,
        transport: &T,
        state: &mut UnitState,
        tab: &str,
    ) -> Result<()> {
        if !self.targets(tab) {
            return Ok(());
        }
        if state.handles.get(tab).is_some_and(|h| !h.is_empty()) {
            self.remove_tab(transport, state, tab).await;
        }
        // Armed before anything can fail so the watchdog keeps retrying.
        state.enabled = true;

        let css = self.load_locked(state).await?;
        let handle = transport.inject_css(tab, &css).await?;
        debug!("+{handle} @ {tab}");
        state.handles.entry(tab.to_string()).or_default().push(handle);
        Ok(())
    }

    /// Removes from `tab`, or from every target tab when `None`.
    ///
    /// Removing everywhere also disarms the unit, even for tabs that held nothing.
    pub async fn remove<T: TabTransport>(&self, transport: &T, tab: Option<&str>) -> Removal {
        let mut state = self.state.lock().await;
        match tab {
            Some(tab) => self.remove_tab(transport, &mut state, tab).await,
            None => {
                let mut total = Removal::default();
                for tab in &self.tabs {
                    total.merge(self.remove_tab(transport, &mut state, tab).await);
                }
                state.enabled = false;
                total
            }
        }
    }

    async fn remove_tab<T: TabTransport>(
        &self,
        transport: &T,
        state: &mut UnitState,
        tab: &str,
    ) -> Removal {
        let mut report = Removal::default();
        let handles = match state.handles.get_mut(tab) {
            Some(handles) if !handles.is_empty() => std::mem::take(handles),
            _ => return report,
        };
        for handle in handles {
            debug!("-{handle} @ {tab}");
            match transport.remove_css(tab, &handle).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    debug!(tab = %tab, handle = %handle, error = %e, "style already gone");
                    report.missed += 1;
                }
            }
        }
        state.enabled = false;
        report
    }
}
