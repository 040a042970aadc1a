//! Control API served by Actix Web.
//!
//! The server runs on a dedicated thread with its own Actix system; handlers
//! talk to the background and the route engine through their channel-backed
//! handles, so nothing here touches the canonical state directly.

use std::{net::SocketAddr, thread};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use chrono::Utc;
use geo_core::{ChannelClosed, Message, Response, RuntimeSender, SpoofState, StatePatch};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::{
    background::{
        BackgroundHandle, BadgeStatus, RecentLocation, Store, StoreData, StoreKey, persist,
        spawn_background,
    },
    config::ServeConfig,
    route::{OsrmClient, RouteEngine, RouteError, RouteRequest, RouteStatus},
    telemetry,
};

pub(crate) type Engine = RouteEngine<OsrmClient, RuntimeSender>;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) background: BackgroundHandle,
    pub(crate) engine: Engine,
}

#[derive(Default)]
/// Handle for the control server thread.
pub(crate) struct ControlServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ControlServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// `relocate serve`: background, route engine and control API until Ctrl+C.
pub fn run(config: ServeConfig) -> Result<()> {
    let _telemetry = telemetry::init(&config.telemetry);
    telemetry::init_metrics_recorder()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("relocate-worker")
        .build()
        .context("failed to build tokio runtime")?;

    let (server, flush) = runtime.block_on(async {
        let (background, engine, flush) = start_background(&config)?;
        let sessions = background.bump_use_count().await?;
        let server = spawn_control_server(config.bind, background, engine.clone())?;
        info!(addr = %config.bind, sessions, "control API listening");

        let mut stop = shutdown_signal()?;
        let _ = stop.wait_for(|stop| *stop).await;
        info!("shutting down");
        engine.stop();
        anyhow::Ok((server, flush))
    })?;

    server.stop();
    shutdown_runtime(runtime, flush);
    Ok(())
}

/// Load the store, start the background and build the route engine. Must be
/// called from within the tokio runtime that will drive them. The returned
/// flush handle is only present with a state file; see [`shutdown_runtime`].
pub(crate) fn start_background(
    config: &ServeConfig,
) -> Result<(BackgroundHandle, Engine, Option<persist::StateFlush>)> {
    let (store, flush) = match &config.state_file {
        Some(path) => {
            let (writer, flush) = persist::StateWriter::spawn(path.clone())?;
            let store = Store::new(persist::load_or_default(path)).with_writer(writer);
            (store, Some(flush))
        }
        None => (Store::new(StoreData::default()), None),
    };
    let background = spawn_background(store);
    let routing = OsrmClient::new(&config.osrm_url);
    info!(osrm = routing.base_url(), "routing service configured");
    let engine = RouteEngine::new(routing, background.runtime());
    Ok((background, engine, flush))
}

/// Drop the runtime, which drops the background task and with it the store's
/// writer, then wait for the state file to be written.
pub(crate) fn shutdown_runtime(
    runtime: tokio::runtime::Runtime,
    flush: Option<persist::StateFlush>,
) {
    drop(runtime);
    if let Some(flush) = flush {
        flush.finish();
    }
}

/// Receiver flipped to `true` on Ctrl+C.
pub(crate) fn shutdown_signal() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = tx.send(true);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(rx)
}

/// Spawn the control server thread and return a handle that can stop it.
pub(crate) fn spawn_control_server(
    bind: SocketAddr,
    background: BackgroundHandle,
    engine: Engine,
) -> Result<ControlServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = web::Data::new(ServerState { background, engine });
    let handle = telemetry::spawn_thread("relocate-control-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(state.clone())
                    .app_data(web::JsonConfig::default().error_handler(|err, _| {
                        let message = err.to_string();
                        actix_web::error::InternalError::from_response(
                            err,
                            rejection(StatusCode::BAD_REQUEST, message),
                        )
                        .into()
                    }))
                    .configure(routes)
            })
            .bind(bind)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn control server thread")?;
    Ok(ControlServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/state", web::get().to(get_state))
        .route("/state", web::post().to(patch_state))
        .route("/apply", web::post().to(apply_location))
        .route("/toggle", web::post().to(toggle))
        .route("/reset", web::post().to(reset))
        .route("/status", web::get().to(status))
        .route("/store", web::get().to(store_values))
        .route("/consumers", web::get().to(consumers))
        .route("/recent", web::get().to(recent))
        .route("/recent", web::delete().to(clear_recent))
        .route("/recent/{index}", web::delete().to(remove_recent))
        .route("/events", web::get().to(events))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/route", web::get().to(route_status))
        .route("/route/start", web::post().to(route_start))
        .route("/route/pause", web::post().to(route_pause))
        .route("/route/resume", web::post().to(route_resume))
        .route("/route/stop", web::post().to(route_stop));
}

fn rejection(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(Response::Ack {
        ok: false,
        error: Some(message.into()),
    })
}

fn unavailable(_: ChannelClosed) -> HttpResponse {
    rejection(StatusCode::SERVICE_UNAVAILABLE, "background is not running")
}

/// Send a patch and map the verdict onto an HTTP status.
async fn commit(background: &BackgroundHandle, patch: StatePatch) -> HttpResponse {
    match background.apply(patch).await {
        Ok(response) if response.is_ok() => HttpResponse::Ok().json(response),
        Ok(response) => HttpResponse::BadRequest().json(response),
        Err(closed) => unavailable(closed),
    }
}

async fn get_state(state: web::Data<ServerState>) -> HttpResponse {
    match state.background.state().await {
        Ok(spoof) => HttpResponse::Ok().json(spoof),
        Err(closed) => unavailable(closed),
    }
}

async fn patch_state(
    state: web::Data<ServerState>,
    patch: web::Json<StatePatch>,
) -> HttpResponse {
    if patch.is_empty() {
        return rejection(StatusCode::BAD_REQUEST, "patch names no fields");
    }
    commit(&state.background, patch.into_inner()).await
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    latitude: f64,
    longitude: f64,
    accuracy: Option<f64>,
    name: Option<String>,
}

/// Enable spoofing at a fixed coordinate and remember it as a recent location.
async fn apply_location(
    state: web::Data<ServerState>,
    body: web::Json<ApplyRequest>,
) -> HttpResponse {
    let body = body.into_inner();
    let entry = RecentLocation::new(body.latitude, body.longitude, body.name, Utc::now());
    let patch = StatePatch {
        enabled: Some(true),
        latitude: Some(body.latitude),
        longitude: Some(body.longitude),
        accuracy: body.accuracy,
        preset_label: Some(entry.name.clone()),
    };
    let response = commit(&state.background, patch).await;
    if response.status().is_success() {
        state.background.record_recent(entry);
    }
    response
}

#[derive(Debug, Default, Deserialize)]
struct ToggleRequest {
    enabled: Option<bool>,
}

async fn toggle(
    state: web::Data<ServerState>,
    body: Option<web::Json<ToggleRequest>>,
) -> HttpResponse {
    let requested = body.map(|body| body.into_inner()).unwrap_or_default();
    let enabled = match requested.enabled {
        Some(enabled) => enabled,
        None => match state.background.state().await {
            Ok(current) => !current.enabled,
            Err(closed) => return unavailable(closed),
        },
    };
    commit(&state.background, StatePatch::enabled(enabled)).await
}

/// Restore the real sensor; coordinates are kept for the next enable.
async fn reset(state: web::Data<ServerState>) -> HttpResponse {
    commit(&state.background, StatePatch::enabled(false)).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    badge: BadgeStatus,
    title: &'static str,
    state: SpoofState,
    use_count: u64,
    route: RouteStatus,
}

async fn status(state: web::Data<ServerState>) -> HttpResponse {
    let data = match state.background.data().await {
        Ok(data) => data,
        Err(closed) => return unavailable(closed),
    };
    let badge = *state.background.badge().borrow();
    HttpResponse::Ok().json(StatusResponse {
        badge,
        title: badge.title(),
        state: data.spoof,
        use_count: data.use_count,
        route: state.engine.status(),
    })
}

#[derive(Debug, Deserialize)]
struct StoreQuery {
    /// Comma-separated store keys; all keys when absent.
    keys: Option<String>,
}

/// Raw store values by key. Unknown keys are ignored.
async fn store_values(
    state: web::Data<ServerState>,
    query: web::Query<StoreQuery>,
) -> HttpResponse {
    let keys: Vec<StoreKey> = match query.keys.as_deref() {
        Some(raw) => raw.split(',').filter_map(|key| StoreKey::parse(key.trim())).collect(),
        None => StoreKey::ALL.to_vec(),
    };
    match state.background.get(keys).await {
        Ok(values) => HttpResponse::Ok().json(values),
        Err(closed) => unavailable(closed),
    }
}

async fn consumers(state: web::Data<ServerState>) -> HttpResponse {
    match state
        .background
        .runtime()
        .send(Message::GetGeoConsumers)
        .await
    {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(closed) => unavailable(closed),
    }
}

async fn recent(state: web::Data<ServerState>) -> HttpResponse {
    match state.background.recent().await {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(closed) => unavailable(closed),
    }
}

async fn clear_recent(state: web::Data<ServerState>) -> HttpResponse {
    state.background.clear_recent();
    HttpResponse::Ok().json(Response::ok())
}

async fn remove_recent(state: web::Data<ServerState>, index: web::Path<usize>) -> HttpResponse {
    match state.background.remove_recent(index.into_inner()).await {
        Ok(true) => HttpResponse::Ok().json(Response::ok()),
        Ok(false) => rejection(StatusCode::NOT_FOUND, "no recent location at that index"),
        Err(closed) => unavailable(closed),
    }
}

/// Stream every committed state as Server-Sent Events.
async fn events(state: web::Data<ServerState>) -> HttpResponse {
    let mut states = state.background.subscribe_states();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 1000\n\n"));
        let mut sequence: u64 = 0;
        loop {
            let snapshot = states.borrow_and_update().clone();
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    sequence += 1;
                    let chunk = format!("id: {sequence}\nevent: state\ndata: {json}\n\n");
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                }
                Err(err) => {
                    let chunk = format!("event: error\ndata: {err}\n\n");
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                }
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((header::CONTENT_TYPE, "text/event-stream"))
        .streaming(stream)
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => rejection(StatusCode::NOT_FOUND, "metrics recorder not installed"),
    }
}

fn route_reply(result: Result<RouteStatus, RouteError>) -> HttpResponse {
    match result {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(err @ RouteError::Transition { .. }) => {
            rejection(StatusCode::CONFLICT, err.to_string())
        }
        Err(err) => {
            warn!(%err, "route request rejected");
            rejection(StatusCode::BAD_REQUEST, err.to_string())
        }
    }
}

async fn route_status(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.engine.status())
}

async fn route_start(
    state: web::Data<ServerState>,
    request: web::Json<RouteRequest>,
) -> HttpResponse {
    match state.engine.start(&request) {
        Ok(status) => HttpResponse::Accepted().json(status),
        Err(err) => route_reply(Err(err)),
    }
}

async fn route_pause(state: web::Data<ServerState>) -> HttpResponse {
    route_reply(state.engine.pause())
}

async fn route_resume(state: web::Data<ServerState>) -> HttpResponse {
    route_reply(state.engine.resume())
}

async fn route_stop(state: web::Data<ServerState>) -> HttpResponse {
    route_reply(Ok(state.engine.stop()))
}
