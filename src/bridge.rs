//! `TabTransport` over native messaging: every call becomes a request frame on
//! stdout, answered by the browser extension with a frame carrying the same id.

use crate::error::{Error, Result};
use crate::protocol::{read_message, write_message};
use crate::transport::{InjectHandle, TabTransport};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Deserialize, Debug)]
struct Reply {
    id: u64,
    success: bool,
    #[serde(default)]
    result: Value,
}

pub struct NativeBridge {
    outgoing: mpsc::UnboundedSender<Value>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    next_style: AtomicU64,
    timeout: Duration,
}

impl NativeBridge {
    pub fn new(outgoing: mpsc::UnboundedSender<Value>, timeout: Duration) -> Self {
        Self {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_style: AtomicU64::new(1),
            timeout,
        }
    }

    /// Wires the bridge to this process's stdin and stdout.
    pub fn spawn_stdio(timeout: Duration) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let bridge = Arc::new(Self::new(tx, timeout));

        // Only this task writes stdout so frames never interleave.
        tokio::task::spawn_blocking(move || {
            let mut stdout = io::stdout();
            while let Some(msg) = rx.blocking_recv() {
                if let Err(e) = write_message(&mut stdout, &msg) {
                    error!(error = %e, "Error writing message to stdout");
                    break;
                }
            }
        });

        let reader = bridge.clone();
        tokio::task::spawn_blocking(move || {
            let mut stdin = io::stdin();
            loop {
                match read_message(&mut stdin) {
                    Ok(msg) => reader.dispatch(msg),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        warn!(error = %e, "Error parsing JSON");
                    }
                    Err(e) => {
                        error!(error = %e, "Stdin closed or error reading length");
                        break;
                    }
                }
            }
            reader.fail_pending();
        });

        bridge
    }

    /// Routes a message from the browser to the request waiting on its id.
    pub fn dispatch(&self, msg: Value) {
        let reply = match serde_json::from_value::<Reply>(msg.clone()) {
            Ok(reply) => reply,
            Err(_) => {
                debug!(?msg, "Received from browser");
                return;
            }
        };
        let waiter = self.lock_pending().remove(&reply.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id = reply.id, "reply for unknown or expired request"),
        }
    }

    fn fail_pending(&self) {
        self.lock_pending().clear();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn request(&self, kind: &str, tab: &str, mut fields: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        fields["id"] = json!(id);
        fields["type"] = json!(kind);
        fields["tabId"] = json!(tab);
        if self.outgoing.send(fields).is_err() {
            self.lock_pending().remove(&id);
            return Err(Error::transport("browser connection closed"));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) if reply.success => Ok(reply.result),
            Ok(Ok(reply)) => Err(Error::Transport(match reply.result {
                Value::String(msg) => msg,
                other => other.to_string(),
            })),
            Ok(Err(_)) => Err(Error::transport("browser connection closed")),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(Error::transport(format!("{kind} on tab '{tab}' timed out")))
            }
        }
    }
}

/// Wraps an already escaped stylesheet in a script that appends it as a `<style>`
/// element with id `handle`. The payload sits in a template literal, which undoes
/// the escaping.
fn style_script(handle: &str, escaped_css: &str) -> String {
    format!(
        r#"
(function() {{
    const style = document.createElement('style');
    style.id = "{handle}";
    style.textContent = `{escaped_css}`;
    document.head.append(style);
}})()
"#
    )
}

fn unstyle_script(handle: &str) -> String {
    format!(
        r#"
(function() {{
    const style = document.getElementById("{handle}");
    if (!style) {{
        throw new Error("no style {handle}");
    }}
    style.remove();
}})()
"#
    )
}

impl TabTransport for NativeBridge {
    async fn inject_css(&self, tab: &str, css: &str) -> Result<InjectHandle> {
        let handle = format!("css-loader-{}", self.next_style.fetch_add(1, Ordering::Relaxed));
        self.inject_script(tab, &style_script(&handle, css)).await?;
        Ok(handle)
    }

    async fn remove_css(&self, tab: &str, handle: &str) -> Result<()> {
        self.inject_script(tab, &unstyle_script(handle)).await
    }

    async fn tab_exists(&self, tab: &str) -> bool {
        match self.request("tabExists", tab, json!({})).await {
            Ok(found) => found.as_bool().unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn tab_has_element(&self, tab: &str, element: &str) -> Result<bool> {
        let found = self
            .request("hasElement", tab, json!({ "element": element }))
            .await?;
        Ok(found.as_bool().unwrap_or(false))
    }

    async fn inject_script(&self, tab: &str, script: &str) -> Result<()> {
        self.request("inject", tab, json!({ "script": script }))
            .await
            .map(|_| ())
    }
}
