//! The host primitives the loader drives: CSS in, CSS out, and a few probes.

use crate::error::Result;
use std::future::Future;

/// Names a render target. Stable across reloads of the same logical tab.
pub type TabId = String;

/// Opaque id handed back by a successful CSS injection. Only useful for removal.
pub type InjectHandle = String;

pub trait TabTransport: Send + Sync + 'static {
    /// Inject a stylesheet into `tab`, returning the handle needed to remove it again.
    ///
    /// `css` arrives escaped for a JS template literal (see `inject::escape_css`);
    /// implementations embed it between backticks rather than sending it verbatim.
    fn inject_css(
        &self,
        tab: &str,
        css: &str,
    ) -> impl Future<Output = Result<InjectHandle>> + Send;

    fn remove_css(&self, tab: &str, handle: &str) -> impl Future<Output = Result<()>> + Send;

    fn tab_exists(&self, tab: &str) -> impl Future<Output = bool> + Send;

    /// Whether an element with id `element` currently lives in the tab's document.
    fn tab_has_element(
        &self,
        tab: &str,
        element: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn inject_script(&self, tab: &str, script: &str) -> impl Future<Output = Result<()>> + Send;
}
