use crate::config::Config;
use crate::registry::ThemeRegistry;
use std::sync::Arc;

/// Everything a request handler can reach. Built once in `main` and passed down.
pub struct AppState<T> {
    pub registry: Arc<ThemeRegistry<T>>,
    pub config: Config,
}

pub type SharedState<T> = Arc<AppState<T>>;
