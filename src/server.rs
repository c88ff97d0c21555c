use crate::config::Config;
use crate::error::Outcome;
use crate::registry::Status;
use crate::state::SharedState;
use crate::theme::ThemeSummary;
use crate::transport::TabTransport;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Debug, Deserialize)]
struct StateRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ValueRequest {
    value: String,
}

pub fn router<T: TabTransport>(state: SharedState<T>) -> Router {
    Router::new()
        .route("/themes", get(get_themes::<T>))
        .route("/themes/:name", delete(delete_theme::<T>))
        .route("/themes/:name/state", post(set_theme_state::<T>))
        .route("/themes/:name/patches/:patch", post(set_patch_value::<T>))
        .route(
            "/themes/:name/patches/:patch/components/:component",
            post(set_component_value::<T>),
        )
        .route("/reset", post(reset::<T>))
        .route("/status", get(status::<T>))
        .route("/config", get(config::<T>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP Server listening");
    }
    axum::serve(listener, app).await
}

async fn get_themes<T: TabTransport>(
    State(state): State<SharedState<T>>,
) -> Json<Vec<ThemeSummary>> {
    Json(state.registry.get_themes().await)
}

async fn set_theme_state<T: TabTransport>(
    State(state): State<SharedState<T>>,
    Path(name): Path<String>,
    Json(req): Json<StateRequest>,
) -> Json<Outcome> {
    Json(state.registry.set_theme_state(&name, req.enabled).await.into())
}

async fn set_patch_value<T: TabTransport>(
    State(state): State<SharedState<T>>,
    Path((name, patch)): Path<(String, String)>,
    Json(req): Json<ValueRequest>,
) -> Json<Outcome> {
    Json(state.registry.set_patch_value(&name, &patch, &req.value).await.into())
}

async fn set_component_value<T: TabTransport>(
    State(state): State<SharedState<T>>,
    Path((name, patch, component)): Path<(String, String, String)>,
    Json(req): Json<ValueRequest>,
) -> Json<Outcome> {
    let result = state
        .registry
        .set_component_value(&name, &patch, &component, &req.value)
        .await;
    Json(result.into())
}

async fn delete_theme<T: TabTransport>(
    State(state): State<SharedState<T>>,
    Path(name): Path<String>,
) -> Json<Outcome> {
    Json(state.registry.delete_theme(&name).await.into())
}

async fn reset<T: TabTransport>(State(state): State<SharedState<T>>) -> Json<Outcome> {
    Json(state.registry.reset().await.into())
}

async fn status<T: TabTransport>(State(state): State<SharedState<T>>) -> Json<Status> {
    Json(state.registry.status().await)
}

async fn config<T: TabTransport>(State(state): State<SharedState<T>>) -> Json<Config> {
    Json(state.config.clone())
}
