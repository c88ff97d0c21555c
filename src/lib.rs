//! Keeps user themes (CSS bundles with configurable patches) injected into a
//! changing set of browser tabs.

pub mod bridge;
pub mod config;
pub mod error;
pub mod inject;
pub mod order;
pub mod patch;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;
pub mod theme;
pub mod transport;
pub mod watchdog;
pub mod watcher;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Outcome, Result};
pub use registry::{RegistrySettings, ThemeRegistry};
pub use transport::TabTransport;
