//! Axum web front-end: a single page embedding the latest ban snapshot as
//! injected state, served from the render cache whenever the snapshot hash is
//! unchanged.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use banwatch_core::BanSnapshot;
use banwatch_store::{
    snapshot_hash, CachedRender, FileEntryStore, RenderCache,
};
use banwatch_sync::{ManifestClient, RefreshDriver, RefreshError, RefreshMode, SyncConfig};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "banwatch-web";

const NOT_READY_BODY: &str = "Ban data not yet loaded, please try again in a moment";

pub struct AppState {
    pub driver: Arc<RefreshDriver>,
    pub mode: RefreshMode,
    pub render_cache: RenderCache,
}

#[derive(Template)]
#[template(path = "banned.html")]
struct BannedPageTemplate {
    state_json: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(page_handler))
        .with_state(Arc::new(state))
}

/// Builds the full service from env config and serves it: file-backed entry
/// store in the cache dir, persistent render cache, and, in scheduled mode, a
/// background refresh task.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = Arc::new(FileEntryStore::open(&config.cache_dir).await?);
    let source = Arc::new(ManifestClient::new(&config)?);
    let driver = Arc::new(RefreshDriver::new(source, store));

    if config.mode == RefreshMode::Scheduled {
        driver.clone().spawn_scheduled(config.refresh_interval);
    }

    let state = AppState {
        driver,
        mode: config.mode,
        render_cache: RenderCache::persistent(&config.cache_dir).await,
    };

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, mode = ?config.mode, "banwatch listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn page_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.mode == RefreshMode::OnDemand {
        if let Err(err) = state.driver.run_once().await {
            warn!(error = %err, "on-demand refresh failed");
            return refresh_error(err);
        }
    }

    let (snapshot, last_fetch_ms) = {
        let shared = state.driver.state();
        let guard = shared.read().await;
        (guard.snapshot.clone(), guard.last_fetch_ms)
    };
    let Some(snapshot) = snapshot else {
        return (StatusCode::SERVICE_UNAVAILABLE, NOT_READY_BODY).into_response();
    };

    let (body, cache_status) = if state.render_cache.is_stale(&snapshot).await {
        match render_page(&snapshot) {
            Ok(body) => {
                state
                    .render_cache
                    .put(CachedRender {
                        body: body.clone(),
                        snapshot_hash: snapshot_hash(&snapshot),
                    })
                    .await;
                (body, "miss")
            }
            Err(err) => return server_error(err),
        }
    } else {
        match state.render_cache.get().await {
            Some(render) => (render.body, "hit"),
            // Slot emptied between the staleness check and the read; render
            // without the optimization.
            None => match render_page(&snapshot) {
                Ok(body) => (body, "miss"),
                Err(err) => return server_error(err),
            },
        }
    };

    let mut resp = Html(body).into_response();
    if let Some(value) = last_update_header(last_fetch_ms) {
        resp.headers_mut()
            .insert(header::HeaderName::from_static("x-last-update"), value);
    }
    resp.headers_mut().insert(
        header::HeaderName::from_static("x-render-cache"),
        HeaderValue::from_static(cache_status),
    );
    resp
}

fn render_page(snapshot: &BanSnapshot) -> anyhow::Result<String> {
    let state_json = serde_json::to_string(snapshot)?;
    let tpl = BannedPageTemplate { state_json };
    tpl.render().map_err(|err| anyhow::anyhow!(err.to_string()))
}

fn last_update_header(last_fetch_ms: i64) -> Option<HeaderValue> {
    let stamp: DateTime<Utc> = DateTime::from_timestamp_millis(last_fetch_ms)?;
    HeaderValue::from_str(&stamp.to_rfc3339()).ok()
}

fn refresh_error(err: RefreshError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Refresh failed: {err}"),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}
