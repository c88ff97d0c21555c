//! Shared helpers for the unit tests: a recording in-memory transport and
//! a theme-directory builder.

use crate::error::{Error, Result};
use crate::transport::{InjectHandle, TabId, TabTransport};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Inject(TabId, String),
    Remove(TabId, InjectHandle),
    Script(TabId),
    Probe(TabId, String),
}

#[derive(Default)]
pub struct MockState {
    next_handle: u64,
    live: HashMap<TabId, Vec<(InjectHandle, String)>>,
    markers: HashMap<TabId, HashSet<String>>,
    closed: HashSet<TabId>,
    pub fail_inject: bool,
    pub fail_scripts: bool,
    /// Hand control back to the scheduler inside every stylesheet call.
    pub yielding: bool,
    pub calls: Vec<Call>,
}

/// Behaves like a browser holding stylesheets per tab.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Simulates a page reload: styles and markers are gone, stale handles stay with the caller.
    pub fn reload_tab(&self, tab: &str) {
        self.with(|s| {
            s.live.remove(tab);
            s.markers.remove(tab);
        });
    }

    pub fn close_tab(&self, tab: &str) {
        self.with(|s| {
            s.closed.insert(tab.to_string());
        });
    }

    pub fn set_marker(&self, tab: &str, element: &str) {
        self.with(|s| {
            s.markers
                .entry(tab.to_string())
                .or_default()
                .insert(element.to_string());
        });
    }

    pub fn has_marker(&self, tab: &str, element: &str) -> bool {
        self.with(|s| s.markers.get(tab).is_some_and(|m| m.contains(element)))
    }

    pub fn live_css(&self, tab: &str) -> Vec<String> {
        self.with(|s| {
            s.live
                .get(tab)
                .map(|v| v.iter().map(|(_, css)| css.clone()).collect())
                .unwrap_or_default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    async fn yield_if_asked(&self) {
        if self.with(|s| s.yielding) {
            tokio::task::yield_now().await;
        }
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.with(|s| s.calls.iter().filter(|&c| pred(c)).count())
    }
}

impl TabTransport for MockTransport {
    async fn inject_css(&self, tab: &str, css: &str) -> Result<InjectHandle> {
        self.yield_if_asked().await;
        self.with(|s| {
            s.calls.push(Call::Inject(tab.to_string(), css.to_string()));
            if s.fail_inject {
                return Err(Error::transport("injection refused"));
            }
            s.next_handle += 1;
            let handle = format!("h{}", s.next_handle);
            s.live
                .entry(tab.to_string())
                .or_default()
                .push((handle.clone(), css.to_string()));
            Ok(handle)
        })
    }

    async fn remove_css(&self, tab: &str, handle: &str) -> Result<()> {
        self.yield_if_asked().await;
        self.with(|s| {
            s.calls.push(Call::Remove(tab.to_string(), handle.to_string()));
            let styles = s.live.entry(tab.to_string()).or_default();
            match styles.iter().position(|(h, _)| h == handle) {
                Some(idx) => {
                    styles.remove(idx);
                    Ok(())
                }
                None => Err(Error::transport(format!("no style {handle} in {tab}"))),
            }
        })
    }

    async fn tab_exists(&self, tab: &str) -> bool {
        self.with(|s| !s.closed.contains(tab))
    }

    async fn tab_has_element(&self, tab: &str, element: &str) -> Result<bool> {
        self.with(|s| {
            s.calls.push(Call::Probe(tab.to_string(), element.to_string()));
            Ok(s.markers.get(tab).is_some_and(|m| m.contains(element)))
        })
    }

    async fn inject_script(&self, tab: &str, script: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Script(tab.to_string()));
            if s.fail_scripts {
                return Err(Error::transport("tab not ready"));
            }
            let id = script
                .split(".id = \"")
                .nth(1)
                .and_then(|rest| rest.split('"').next());
            if let Some(id) = id {
                s.markers
                    .entry(tab.to_string())
                    .or_default()
                    .insert(id.to_string());
            }
            Ok(())
        })
    }
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Writes `<root>/<dir>/theme.json` plus every listed stylesheet.
pub fn write_theme(root: &Path, dir: &str, manifest: &serde_json::Value, sheets: &[(&str, &str)]) {
    let theme_dir = root.join(dir);
    write_file(
        &theme_dir.join("theme.json"),
        &serde_json::to_string_pretty(manifest).unwrap(),
    );
    for (file, css) in sheets {
        write_file(&theme_dir.join(file), css);
    }
}
