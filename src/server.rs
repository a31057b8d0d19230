use std::sync::Arc;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{web::Data, App, HttpServer};
use tracing_actix_web::TracingLogger;

use crate::{
    config::Config,
    error::Error,
    http::{self, AppState},
    signaling::{RelayActor, SignalingRelay},
};

/// Starts the relay actor and serves HTTP and signaling until the process is interrupted.
/// Stopping the system stops the relay, which drops every stream and allocation.
pub async fn run(config: Config) -> Result<(), Error> {
    let config = Arc::new(config);
    let relay = RelayActor::new(SignalingRelay::new(config.clone())?).start();
    let state = Data::new(AppState::new(config.clone(), relay));

    let server_url = config.server.server_url();
    tracing::info!(
        "Signaling server listening on {}:{}",
        config.server.host,
        config.server.port
    );
    tracing::info!("Desktop: {}/desktop", server_url);
    tracing::info!("Mobile: {}/mobile", server_url);

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(http::configure)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    tracing::info!("Signaling server stopped");
    Ok(())
}
