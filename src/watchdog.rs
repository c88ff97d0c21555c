//! Keeps tabs styled after they reload behind our back.

use crate::error::{Error, Result};
use crate::registry::ThemeRegistry;
use crate::transport::TabTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Marker proving the stylesheets injected into a tab are still there.
pub const CSS_MARKER: &str = "test_css_loaded";
/// Marker the startup sequence waits for on the primary tab.
pub const UI_MARKER: &str = "test_ui_loaded";

async fn has_marker<T: TabTransport>(transport: &T, tab: &str, marker: &str) -> bool {
    transport.tab_has_element(tab, marker).await.unwrap_or(false)
}

fn marker_script(marker: &str) -> String {
    format!(
        r#"
(function() {{
    const elem = document.createElement('div');
    elem.id = "{marker}";
    document.head.append(elem);
}})()
"#
    )
}

/// Plants `marker` in `tab`, retrying once per `time_unit` for up to `attempts` tries.
pub async fn inject_test_element<T: TabTransport>(
    transport: &T,
    tab: &str,
    attempts: u32,
    marker: &str,
    time_unit: Duration,
) -> Result<()> {
    let script = marker_script(marker);
    let mut attempt = 0;
    loop {
        if has_marker(transport, tab, marker).await {
            return Ok(());
        }
        // The tab may not be ready for scripts yet.
        let _ = transport.inject_script(tab, &script).await;

        attempt += 1;
        if attempt >= attempts {
            return Err(Error::Timeout(format!(
                "Inject into tab '{tab}' was attempted {attempts} times, stopping"
            )));
        }
        tokio::time::sleep(time_unit).await;
    }
}

pub struct Watchdog<T> {
    registry: Arc<ThemeRegistry<T>>,
    interval: Duration,
    marker_attempts: u32,
    time_unit: Duration,
}

impl<T: TabTransport> Watchdog<T> {
    pub fn new(
        registry: Arc<ThemeRegistry<T>>,
        interval: Duration,
        marker_attempts: u32,
        time_unit: Duration,
    ) -> Self {
        Self {
            registry,
            interval,
            marker_attempts,
            time_unit,
        }
    }

    /// Runs until the process exits.
    pub async fn run(self) {
        loop {
            tokio::time::sleep(self.interval).await;
            self.tick().await;
        }
    }

    /// One pass over every known tab. A misbehaving tab is logged and skipped.
    pub async fn tick(&self) {
        let (units, tabs) = self.registry.snapshot().await;
        let transport = &**self.registry.transport();

        for tab in &tabs {
            if !transport.tab_exists(tab).await {
                continue;
            }
            if has_marker(transport, tab, CSS_MARKER).await {
                continue;
            }

            info!(tab = %tab, "Tab is not injected, reloading...");
            let marked = inject_test_element(
                transport,
                tab,
                self.marker_attempts,
                CSS_MARKER,
                self.time_unit,
            )
            .await;
            if let Err(e) = marked {
                warn!(tab = %tab, error = %e, "could not mark tab");
            }
            for unit in &units {
                if let Err(e) = unit.reinject_if_enabled(transport, tab).await {
                    warn!(tab = %tab, error = %e, "re-injection failed");
                    break;
                }
            }
        }
    }
}
