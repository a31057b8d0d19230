use std::{sync::Arc, time::Instant};

use actix::Addr;
use actix_web::{
    error::ErrorServiceUnavailable,
    web::{self, Data},
    HttpRequest, HttpResponse,
};
use actix_web_actors::ws;
use qrcode::{render::svg, QrCode};
use serde_json::json;

use crate::{
    config::Config,
    error::Error,
    signaling::{
        actor::{GetStatus, GetStreams},
        RelayActor, WebSocketSession,
    },
};

/// Shared by every HTTP worker.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Addr<RelayActor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, relay: Addr<RelayActor>) -> Self {
        Self {
            config,
            relay,
            started_at: Instant::now(),
        }
    }
}

/// Registers the REST endpoints and the signaling socket.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/api/config", web::get().to(client_config))
        .route("/api/streams", web::get().to(streams))
        .route("/api/qr/mobile", web::get().to(mobile_qr))
        .route("/api/bandwidth", web::get().to(bandwidth))
        .route("/socket", web::get().to(socket));
}

async fn health(state: Data<AppState>) -> Result<HttpResponse, actix_web::Error> {
    let streams = state
        .relay
        .send(GetStreams)
        .await
        .map_err(ErrorServiceUnavailable)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "streams": streams.len(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    })))
}

async fn client_config(state: Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "webrtc": state.config.webrtc,
        "video": state.config.video,
        "serverURL": state.config.server.server_url(),
    }))
}

async fn streams(state: Data<AppState>) -> Result<HttpResponse, actix_web::Error> {
    let streams = state
        .relay
        .send(GetStreams)
        .await
        .map_err(ErrorServiceUnavailable)?;
    Ok(HttpResponse::Ok().json(streams))
}

async fn bandwidth(state: Data<AppState>) -> Result<HttpResponse, actix_web::Error> {
    let status = state
        .relay
        .send(GetStatus)
        .await
        .map_err(ErrorServiceUnavailable)?;
    Ok(HttpResponse::Ok().json(status))
}

async fn mobile_qr(state: Data<AppState>) -> Result<HttpResponse, Error> {
    let url = format!("{}/mobile", state.config.server.server_url());
    let code = QrCode::new(url.as_bytes())?;
    let qr = code
        .render::<svg::Color>()
        .min_dimensions(300, 300)
        .quiet_zone(true)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(HttpResponse::Ok().json(json!({ "qr": qr, "url": url })))
}

async fn socket(
    req: HttpRequest,
    state: Data<AppState>,
    stream: web::Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let session = WebSocketSession::new(state.relay.clone());
    tracing::debug!("upgrading {} to signaling socket", session.connection());
    ws::start(session, &req, stream)
}
