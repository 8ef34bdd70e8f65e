use std::{future::Future, net::SocketAddr};

use axum::{http::StatusCode, response::IntoResponse, routing::get, Extension, Router};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config,
    endpoint::{Endpoint, EndpointId},
    error::Error,
    mock::MockBuilder,
    relay::RelayHandle,
    serial::serial_port::SerialPortBuilder,
    websocket,
};

async fn open_line(config: &Config) -> Result<Box<dyn Endpoint + Send + Sync>, Error> {
    match config.endpoint_id()? {
        EndpointId::Mock(name) => Ok(Box::new(MockBuilder::new(&name).build())),
        EndpointId::Tty(_) => {
            let port = SerialPortBuilder::new(config.line_config()?)
                .with_timing(&config.serial)
                .build()
                .await?;

            Ok(Box::new(port))
        }
    }
}

async fn serve<F>(
    config: Config,
    shutdown: F,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;

    let line = open_line(&config).await?;

    // The relay owns the line from here on, stopping it releases the line.
    let stop = CancellationToken::new();
    let (relay_handle, relay_task) =
        RelayHandle::new(line, config.relay.echo_to_peers, stop.clone());

    let app = Router::new()
        .route("/", get(websocket::ws_handler))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each websocket needs to be able to reach the relay
                .layer(Extension(relay_handle))
                // The config should be known to the web server
                .layer(Extension(config.clone())),
        );

    let addr = config.relay.address();
    let server = match axum::Server::try_bind(&addr) {
        Ok(builder) => builder.serve(app.into_make_service_with_connect_info::<SocketAddr>()),
        Err(e) => {
            stop.cancel();
            if let Err(e) = relay_task.await {
                warn!(?e, "Relay task join error");
            }

            return Err(Error::InternalIssue(format!(
                "Could not listen on {addr}: {e}"
            )));
        }
    };
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            warn!("Nobody wanted to know the allocated port");
        }
    }

    info!("listening on {}", addr);

    let stop_server = stop.clone();
    let served = server
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => info!("Shutdown requested"),
                _ = stop_server.cancelled() => {}
            }
        })
        .await;

    stop.cancel();

    let relayed = relay_task
        .await
        .map_err(|e| Error::InternalIssue(format!("Relay task join error: {e}")))?;

    served.map_err(|e| Error::InternalIssue(format!("Server error: {e}")))?;

    relayed
}

/// Run the relay on the address in the config until `shutdown` resolves.
///
/// Returns an error if the line cannot be opened, or if it fails while relaying.
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve(config, shutdown, None).await
}

/// Start the relay on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    mut config: Config,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    config.relay.port = 0;

    serve(config, std::future::pending(), Some(allocated_port)).await
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    config
        .serialize_pretty()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Relay v{}\n", env!("CARGO_PKG_VERSION"))
}
