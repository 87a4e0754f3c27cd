use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    config::{Config, ToolOverride},
    detect,
    error::{ScanError, StoreError},
    executor::Executor,
    hub::{BroadcastHub, ObserverId},
    specs::ToolKind,
    store::ScanStore,
    types::{LiveEvent, NewScan, ScanId},
};

const DEFAULT_RECENT: usize = 10;
const MAX_RECENT: usize = 100;
/// Close code 1013 (try again later) for an observer the hub dropped.
const LAGGED: (u16, &str) = (1013, "observer lagged, poll /api/scans/{id}");

#[derive(Clone)]
pub struct AppState {
    executor: Executor,
    store: Arc<dyn ScanStore>,
    hub: BroadcastHub,
    tools: Arc<HashMap<String, ToolOverride>>,
    observer_buffer: usize,
}

impl AppState {
    pub fn new(
        executor: Executor,
        store: Arc<dyn ScanStore>,
        hub: BroadcastHub,
        config: &Config,
    ) -> Self {
        Self {
            executor,
            store,
            hub,
            tools: Arc::new(config.tools.clone()),
            observer_buffer: config.executor.observer_buffer.max(1),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Subscribe to a scan's live events.
    ///
    /// The status check happens after subscribing: a scan that finished before
    /// the subscription yields a synthesized done event instead of a feed.
    pub async fn open_feed(&self, scan_id: ScanId) -> Result<Feed, StoreError> {
        let (observer, rx) = self.hub.subscribe_channel(scan_id, self.observer_buffer);
        match self.store.get_scan(scan_id).await {
            Ok(scan) if scan.status.is_terminal() => {
                self.hub.unsubscribe(scan_id, observer);
                Ok(Feed::Finished(LiveEvent::done(scan.status)))
            }
            Ok(_) => Ok(Feed::Live { observer, rx }),
            Err(e) => {
                self.hub.unsubscribe(scan_id, observer);
                Err(e)
            }
        }
    }

    /// The event owed to an observer whose feed the hub cut off.
    ///
    /// A scan that has finished yields its done event; one still running
    /// yields `None` and the observer has to poll.
    pub async fn after_eviction(&self, scan_id: ScanId) -> Result<Option<LiveEvent>, StoreError> {
        let scan = self.store.get_scan(scan_id).await?;
        Ok(scan
            .status
            .is_terminal()
            .then(|| LiveEvent::done(scan.status)))
    }
}

/// What one live observer receives.
#[derive(Debug)]
pub enum Feed {
    /// The scan is over; this event is the only one to deliver.
    Finished(LiveEvent),
    Live {
        observer: ObserverId,
        rx: mpsc::Receiver<LiveEvent>,
    },
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound("scan not found".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Validation(m) => ApiError::BadRequest(m),
            ScanError::Store(s) => ApiError::Internal(s.to_string()),
        }
    }
}

pub fn router(state: AppState, ui_dir: &str) -> Router {
    let api = Router::new()
        .route("/scans", axum::routing::post(create_scan))
        .route("/scans/recent", get(recent_scans))
        .route("/scans/{id}", get(get_scan).delete(cancel_scan))
        .route("/scans/{id}/results", get(scan_results))
        .route("/tools", get(list_tools))
        .route("/tools/status", get(tools_status));

    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws_handler))
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    config: &Config,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!("serving on http://{}", listener.local_addr()?);

    let app = router(state, &config.server.ui_dir);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn create_scan(
    State(app): State<AppState>,
    body: Result<Json<NewScan>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::BadRequest("invalid JSON".into()))?;
    if req.target.trim().is_empty() || req.tool.trim().is_empty() || req.scan_type.trim().is_empty()
    {
        return Err(ApiError::BadRequest(
            "target, tool, and scan_type are required".into(),
        ));
    }
    let scan = app.executor.start(req).await?;
    Ok((StatusCode::CREATED, Json(scan)))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_scans(
    State(app): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_RECENT).clamp(1, MAX_RECENT);
    Ok(Json(app.store.recent_scans(limit).await?))
}

async fn get_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.store.get_scan(id).await?))
}

#[derive(Serialize)]
struct CancelBody {
    status: &'static str,
}

/// Always succeeds, whether or not the scan is still running.
async fn cancel_scan(State(app): State<AppState>, Path(id): Path<ScanId>) -> impl IntoResponse {
    app.executor.cancel(id);
    Json(CancelBody {
        status: "cancelled",
    })
}

async fn scan_results(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.store.results_for_scan(id).await?))
}

#[derive(Serialize)]
struct ToolInfo {
    tool: &'static str,
    name: &'static str,
    builtin: bool,
}

async fn list_tools() -> impl IntoResponse {
    let tools: Vec<ToolInfo> = ToolKind::all()
        .map(|k| ToolInfo {
            tool: k.name(),
            name: k.display_name(),
            builtin: k.is_builtin(),
        })
        .collect();
    Json(tools)
}

async fn tools_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(detect::detect_all(&app.tools).await)
}

#[derive(Debug, Deserialize)]
struct Subscribe {
    scan_id: ScanId,
}

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(mut socket: WebSocket, app: AppState) {
    let scan_id = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Subscribe>(text.as_str()) {
            Ok(sub) => sub.scan_id,
            Err(_) => {
                close(socket, 1007, "invalid subscribe message").await;
                return;
            }
        },
        _ => return,
    };

    let (observer, mut rx) = match app.open_feed(scan_id).await {
        Ok(Feed::Live { observer, rx }) => (observer, rx),
        Ok(Feed::Finished(done)) => {
            let _ = send_event(&mut socket, &done).await;
            close(socket, 1000, "").await;
            return;
        }
        Err(StoreError::NotFound(_)) => {
            close(socket, 1008, "scan not found").await;
            return;
        }
        Err(e) => {
            tracing::error!(scan_id, error = %e, "scan lookup failed");
            close(socket, 1011, "internal error").await;
            return;
        }
    };

    let (code, reason) = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let done = event.is_done();
                    if send_event(&mut socket, &event).await.is_err() || done {
                        break (1000, "");
                    }
                }
                // The hub evicted this observer for lagging.
                None => break evicted(&app, &mut socket, scan_id).await,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break (1000, ""),
                Some(Ok(_)) => {}
            },
        }
    };

    app.hub.unsubscribe(scan_id, observer);
    close(socket, code, reason).await;
}

async fn evicted(app: &AppState, socket: &mut WebSocket, scan_id: ScanId) -> (u16, &'static str) {
    match app.after_eviction(scan_id).await {
        Ok(Some(done)) => {
            let _ = send_event(socket, &done).await;
            (1000, "")
        }
        Ok(None) => {
            tracing::debug!(scan_id, "lagging observer told to poll");
            LAGGED
        }
        Err(e) => {
            tracing::error!(scan_id, error = %e, "scan lookup failed");
            (1011, "internal error")
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &LiveEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode live event");
            Ok(())
        }
    }
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
