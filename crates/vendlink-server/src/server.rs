//! `VendServer`: Axum HTTP + WebSocket front end over the device channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use vendlink_core::Clock;
use vendlink_core::status::{AuditEvent, DeviceStatus};
use vendlink_settings::{HeartbeatSettings, ServerSettings, VendlinkSettings};

use crate::channel::PeerChannel;
use crate::dispatch::{CommandDispatcher, DirectTransport, DispatchReport, DispenseRequest};
use crate::events::EventLog;
use crate::health::{self, HealthResponse};
use crate::heartbeat::HeartbeatScheduler;
use crate::observers::ObserverHub;
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::store::MachineStore;
use crate::websocket::run_peer_session;

/// Default number of events returned by `/api/events`.
const DEFAULT_EVENT_LIMIT: usize = 50;

/// The explicitly owned components of one deployment.
#[derive(Clone)]
pub struct Services {
    /// External record store.
    pub store: Arc<dyn MachineStore>,
    /// Audit sink.
    pub events: Arc<EventLog>,
    /// Observer fan-out.
    pub observers: Arc<ObserverHub>,
    /// Connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Command dispatcher.
    pub dispatcher: Arc<CommandDispatcher>,
}

impl Services {
    /// Wire every component from settings and the external collaborators.
    pub fn build(
        settings: &VendlinkSettings,
        store: Arc<dyn MachineStore>,
        transport: Arc<dyn DirectTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventLog::new(settings.events.capacity).with_store(Arc::clone(&store)));
        let observers = Arc::new(ObserverHub::new());
        let registry = Arc::new(
            ConnectionRegistry::new(
                Arc::clone(&observers),
                events.clone(),
                Arc::clone(&store),
                clock,
            )
            .with_ping_sampling(settings.heartbeat.ping_log_sample_every),
        );
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            transport,
        ));
        Self {
            store,
            events,
            observers,
            registry,
            dispatcher,
        }
    }

    /// Heartbeat scheduler over this deployment's registry.
    pub fn heartbeat(&self, settings: &HeartbeatSettings) -> HeartbeatScheduler {
        HeartbeatScheduler::new(
            Arc::clone(&self.registry),
            settings.interval(),
            settings.timeout(),
        )
    }
}

/// Shared state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Command dispatcher.
    pub dispatcher: Arc<CommandDispatcher>,
    /// Audit tail.
    pub events: Arc<EventLog>,
    /// Prometheus exposition.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    /// Outbound queue size per peer.
    pub send_queue_capacity: usize,
    /// Largest accepted inbound WebSocket message.
    pub max_message_size: usize,
}

/// The vendlink server.
pub struct VendServer {
    settings: ServerSettings,
    services: Services,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl VendServer {
    /// Create a server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(settings: ServerSettings, services: Services, metrics: PrometheusHandle) -> Self {
        Self {
            settings,
            services,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the router with every route.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.services.registry),
            dispatcher: Arc::clone(&self.services.dispatcher),
            events: Arc::clone(&self.services.events),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            send_queue_capacity: self.settings.send_queue_capacity,
            max_message_size: self.settings.max_message_size,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/api/machines/status", get(all_status_handler))
            .route("/api/machines/{id}/status", get(status_handler))
            .route("/api/machines/{id}/dispense", post(dispense_handler))
            .route("/api/events", get(events_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve until shutdown is signalled.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, "vendlink server listening");
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// The wired components.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.len(),
        state.registry.observers().len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        vendlink_telemetry::metrics::render(&state.metrics),
    )
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            let (channel, rx) = PeerChannel::pair(state.send_queue_capacity);
            run_peer_session(socket, channel, rx, state.registry)
        })
}

/// GET /api/machines/status
async fn all_status_handler(State(state): State<AppState>) -> Json<Vec<DeviceStatus>> {
    Json(state.registry.status_of_all())
}

/// GET /api/machines/{id}/status
async fn status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<DeviceStatus> {
    Json(state.registry.status_of(&id))
}

/// POST /api/machines/{id}/dispense
///
/// Always answers with a report; an empty item list yields `success: false`.
async fn dispense_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DispenseRequest>,
) -> Json<DispatchReport> {
    Json(state.dispatcher.dispatch(&id, request.items).await)
}

/// Query string for `/api/events`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    limit: Option<usize>,
    machine_id: Option<String>,
}

/// GET /api/events
async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<AuditEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.events.recent(limit, query.machine_id.as_deref()))
}
