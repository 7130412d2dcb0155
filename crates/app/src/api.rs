//! Actix Web query and override API for the control server.
//!
//! Handlers only hold the handles passed in through [`ApiState`]; the server
//! runs them on a dedicated thread so the dispatch loop never touches the
//! Actix runtime.

use std::{sync::Arc, time::Instant};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Json, Path, Query},
};
use anyhow::{Context, Result};
use bus::{BusStats, MessageBus, PresenceStatus, Transport, unix_now};
use chrono::{DateTime, SecondsFormat, Utc};
use controller::{AdaptiveController, Phase, SignalStore, StoreError, valid_phases};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::telemetry;

const MAX_LIMIT: usize = 1000;

/// Read-only view of a bus connection for the status endpoint.
pub(crate) trait LinkStatus: Send + Sync {
    fn stats(&self) -> BusStats;
    fn presence(&self) -> Vec<PresenceStatus>;
}

impl<T: Transport> LinkStatus for MessageBus<T> {
    fn stats(&self) -> BusStats {
        MessageBus::stats(self)
    }

    fn presence(&self) -> Vec<PresenceStatus> {
        MessageBus::presence(self)
    }
}

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ApiState {
    pub(crate) controller: Arc<AdaptiveController>,
    pub(crate) store: Arc<dyn SignalStore>,
    pub(crate) detections: Arc<dyn LinkStatus>,
    pub(crate) commands: Arc<dyn LinkStatus>,
    pub(crate) prometheus: Option<&'static PrometheusHandle>,
    pub(crate) started_at: Instant,
}

/// Register every route on an Actix app.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/health", web::get().to(health))
        .route("/api/intersections", web::get().to(list_intersections))
        .route("/api/intersections/{id}", web::get().to(intersection_detail))
        .route("/api/detections", web::get().to(recent_detections))
        .route("/api/metrics/{id}", web::get().to(intersection_metrics))
        .route("/api/signals/{id}/history", web::get().to(signal_history))
        .route("/api/signals/{id}/override", web::post().to(apply_override))
        .route("/api/status", web::get().to(system_status))
        .route("/metrics", web::get().to(prometheus_metrics));
}

/// Handle for the API server thread.
pub(crate) struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bind the listener on a dedicated thread and wait until it is accepting.
pub(crate) fn spawn_api_server(addr: std::net::SocketAddr, state: ApiState) -> Result<ApiServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(1);
    let handle = telemetry::spawn_thread("api-server", move || {
        let outcome = actix_web::rt::System::new().block_on(async move {
            let data = web::Data::new(state);
            let bound = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
                .workers(2)
                .bind(addr);
            let server = match bound {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = outcome {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn API server thread")?;

    let server = ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    };
    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("API listening on http://{addr}");
            Ok(server)
        }
        Ok(Err(err)) => {
            server.stop();
            Err(err).with_context(|| format!("failed to bind API on {addr}"))
        }
        Err(_) => {
            server.stop();
            anyhow::bail!("API server thread exited before binding {addr}")
        }
    }
}

fn iso(timestamp: f64) -> String {
    DateTime::<Utc>::from_timestamp_micros((timestamp * 1_000_000.0) as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_default()
}

fn detail(message: impl Into<String>) -> serde_json::Value {
    json!({ "detail": message.into() })
}

fn store_failure(err: StoreError) -> HttpResponse {
    error!("store query failed: {err}");
    HttpResponse::InternalServerError().json(detail(err.to_string()))
}

async fn health(state: web::Data<ApiState>) -> HttpResponse {
    let uptime = state.started_at.elapsed().as_secs_f64();
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        "uptime_sec": (uptime * 10.0).round() / 10.0,
    }))
}

async fn list_intersections(state: web::Data<ApiState>) -> HttpResponse {
    match state.store.intersections() {
        Ok(records) => HttpResponse::Ok().json(records),
        Err(err) => store_failure(err),
    }
}

async fn intersection_detail(state: web::Data<ApiState>, id: Path<String>) -> HttpResponse {
    let id = id.into_inner();
    match state.store.intersection(&id) {
        Ok(Some(record)) => {
            let phase = state
                .controller
                .active_phase(&id)
                .map_or("UNKNOWN", Phase::as_str);
            HttpResponse::Ok().json(json!({ "intersection": record, "current_phase": phase }))
        }
        Ok(None) => HttpResponse::NotFound().json(detail("Intersection not found")),
        Err(err) => store_failure(err),
    }
}

#[derive(Deserialize)]
struct DetectionsQuery {
    intersection_id: Option<String>,
    #[serde(default = "default_detections_limit")]
    limit: usize,
}

fn default_detections_limit() -> usize {
    50
}

async fn recent_detections(state: web::Data<ApiState>, query: Query<DetectionsQuery>) -> HttpResponse {
    let limit = query.limit.min(MAX_LIMIT);
    match state.store.recent_detections(query.intersection_id.as_deref(), limit) {
        Ok(rows) => {
            let body: Vec<_> = rows
                .into_iter()
                .map(|d| {
                    json!({
                        "id": d.id,
                        "intersection_id": d.intersection_id,
                        "timestamp": iso(d.timestamp),
                        "total_vehicles": d.total_vehicles,
                        "vehicle_counts": d.vehicle_counts,
                        "inference_time_ms": d.inference_time_ms,
                        "frame_number": d.frame_number,
                    })
                })
                .collect();
            HttpResponse::Ok().json(body)
        }
        Err(err) => store_failure(err),
    }
}

#[derive(Deserialize)]
struct PeriodQuery {
    #[serde(default = "default_period_minutes")]
    period_minutes: u32,
}

fn default_period_minutes() -> u32 {
    60
}

async fn intersection_metrics(
    state: web::Data<ApiState>,
    id: Path<String>,
    query: Query<PeriodQuery>,
) -> HttpResponse {
    let since = unix_now() - f64::from(query.period_minutes) * 60.0;
    match state.store.detection_summary(&id, since) {
        Ok(summary) => HttpResponse::Ok().json(json!({
            "intersection_id": summary.intersection_id,
            "period_minutes": query.period_minutes,
            "avg_vehicle_count": summary.avg_vehicle_count,
            "max_vehicle_count": summary.max_vehicle_count,
            "total_detections": summary.total_detections,
            "avg_inference_ms": summary.avg_inference_ms,
        })),
        Err(err) => store_failure(err),
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn signal_history(state: web::Data<ApiState>, id: Path<String>, query: Query<HistoryQuery>) -> HttpResponse {
    match state.store.command_history(&id, query.limit.min(MAX_LIMIT)) {
        Ok(rows) => {
            let body: Vec<_> = rows
                .into_iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "phase": c.phase,
                        "duration_sec": c.duration_sec,
                        "reason": c.reason,
                        "vehicle_density": c.vehicle_density,
                        "is_override": c.is_override,
                        "timestamp": iso(c.timestamp),
                    })
                })
                .collect();
            HttpResponse::Ok().json(body)
        }
        Err(err) => store_failure(err),
    }
}

#[derive(Deserialize)]
struct OverrideRequest {
    phase: String,
    duration_sec: i64,
}

async fn apply_override(
    state: web::Data<ApiState>,
    id: Path<String>,
    body: Json<OverrideRequest>,
) -> HttpResponse {
    let Ok(phase) = body.phase.parse::<Phase>() else {
        return HttpResponse::BadRequest().json(detail(format!("Invalid phase. Valid: {:?}", valid_phases())));
    };
    let duration = match u32::try_from(body.duration_sec) {
        Ok(secs) if secs > 0 => secs,
        _ => {
            return HttpResponse::BadRequest().json(detail(format!(
                "duration_sec must be a positive number of seconds, got {}",
                body.duration_sec
            )));
        }
    };

    let command = state.controller.manual_override(&id, phase, duration);
    HttpResponse::Ok().json(json!({ "status": "override_applied", "command": command }))
}

async fn system_status(state: web::Data<ApiState>) -> HttpResponse {
    let counts = match state.store.counts() {
        Ok(counts) => counts,
        Err(err) => return store_failure(err),
    };
    let uptime = state.started_at.elapsed().as_secs_f64();
    HttpResponse::Ok().json(json!({
        "uptime_sec": (uptime * 10.0).round() / 10.0,
        "total_intersections": counts.intersections,
        "total_detections": counts.detections,
        "total_commands": counts.commands,
        "controller": state.controller.stats(),
        "broker": {
            "detections": state.detections.stats(),
            "commands": state.commands.stats(),
        },
        "edge_gateways": state.detections.presence(),
    }))
}

async fn prometheus_metrics(state: web::Data<ApiState>) -> HttpResponse {
    match state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, "text/plain; version=0.0.4"))
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().json(detail("metrics recorder not installed")),
    }
}
