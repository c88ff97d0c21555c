use clap::Parser;
use css_loader::bridge::NativeBridge;
use css_loader::config::{load_config, load_config_from};
use css_loader::state::AppState;
use css_loader::watchdog::Watchdog;
use css_loader::watcher::{self, FileWatchReactor};
use css_loader::{RegistrySettings, ThemeRegistry, server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "css-loader", version, about = "Keeps CSS themes injected into browser tabs")]
struct Args {
    /// Config file to use instead of ~/.cssloader/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    themes_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so they don't interfere with stdout (Native Messaging)
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!(error = %e, "css loader stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> css_loader::Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.themes_dir {
        config.themes_dir = dir;
    }
    info!("Initializing css loader...");

    let bridge = NativeBridge::spawn_stdio(config.request_timeout());
    let registry = Arc::new(ThemeRegistry::new(
        bridge,
        RegistrySettings {
            themes_dir: config.themes_dir.clone(),
            default_themes_dir: config.default_themes_dir.clone(),
            primary_tab: config.primary_tab.clone(),
        },
    ));
    let state = Arc::new(AppState {
        registry: registry.clone(),
        config: config.clone(),
    });

    let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
    // Run the HTTP server in the background
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, server::router(state)).await {
            error!(error = %e, "HTTP server stopped");
        }
    });

    registry
        .start(config.startup_marker_attempts, config.time_unit())
        .await;

    let _watcher = if config.should_watch() {
        match watcher::watch(&config.themes_dir) {
            Ok((watcher, events)) => {
                let reactor = FileWatchReactor::new(registry.clone(), config.debounce());
                tokio::spawn(reactor.run(events));
                Some(watcher)
            }
            Err(e) => {
                warn!(error = %e, "Not observing themes folder for file changes");
                None
            }
        }
    } else {
        info!("Not observing themes folder for file changes");
        None
    };

    Watchdog::new(
        registry,
        config.watchdog_interval(),
        config.watchdog_marker_attempts,
        config.time_unit(),
    )
    .run()
    .await;
    Ok(())
}
