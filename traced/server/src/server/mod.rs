pub mod error;
pub mod live;
pub mod query_api;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use traced_core::{QueryService, Tracer};

use live::Broadcaster;

#[derive(Debug, Clone)]
pub struct AppState {
    pub query: QueryService,
    pub live: Arc<Broadcaster>,
}

impl AppState {
    pub fn new(query: QueryService, live: Arc<Broadcaster>) -> Self {
        AppState { query, live }
    }

    /// Query service over the tracer's store plus a broadcaster attached to
    /// its buffer. Must be called inside a tokio runtime.
    pub fn from_tracer(tracer: &Tracer) -> anyhow::Result<Self> {
        let store = tracer
            .store()
            .context("the query API needs a tracer with a trace store")?;
        let mut query = QueryService::new(store)
            .with_duration_threshold(tracer.config().duration_threshold);
        if let Some(blobs) = tracer.blob_store() {
            query = query.with_blob_store(blobs);
        }
        let live = Broadcaster::spawn(tracer)?;
        Ok(AppState::new(query, live))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", get(query_api::list_runs))
        .route(
            "/runs/{id}",
            get(query_api::get_run).delete(query_api::delete_run),
        )
        .route("/runs/{id}/stats", get(query_api::run_stats))
        .route("/runs/{a}/diff/{b}", get(query_api::diff_runs))
        .route("/blobs/{key}", get(query_api::get_blob))
        .route("/ws", get(live::ws::live_handler))
        .with_state(state)
}

/// Serves the API on `addr` until the listener fails.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("traced server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
