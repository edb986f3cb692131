use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use airbridge::config::Config;
use airbridge::mdns::{self, Responder};
use airbridge::net;
use airbridge::protocols::airdrop::AirDropService;
use airbridge::protocols::channel;
use airbridge::protocols::http_server::HttpServer;
use airbridge::protocols::registry::Registry;
use airbridge::utils;

#[tokio::main]
async fn main() -> Result<()> {
    utils::setup_logging();
    let config = Config::parse();

    let interfaces = net::select_interfaces(&config.interfaces);
    if interfaces.is_empty() {
        bail!("no usable network interface; check --interface or connectivity");
    }
    if config.interfaces.is_empty() && !net::has_awdl(&interfaces) {
        bail!(
            "no {} interface found; AirDrop senders are only reachable over AWDL \
             (pass --interface to override for testing)",
            net::AWDL_INTERFACE
        );
    }

    let cancel = CancellationToken::new();
    let responder = Arc::new(Responder::new(&interfaces));
    mdns::require_units(&responder).context("binding mdns sockets")?;
    responder.clone().spawn(&cancel);

    let registry = Arc::new(Registry::new(
        responder.clone(),
        &interfaces,
        config.listen_port,
    ));
    registry.publish_proxy().await;

    tokio::fs::create_dir_all(&config.upload_path)
        .await
        .with_context(|| format!("creating upload directory {}", config.upload_path.display()))?;

    let service = Arc::new(AirDropService::new(
        registry.clone(),
        config.upload_path.clone(),
    ));
    let https = Arc::new(HttpServer::new(service).context("building https server")?);
    let https_listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("binding https port {}", config.listen_port))?;
    tokio::spawn(https.serve(https_listener, cancel.clone()));

    let peer_listener = TcpListener::bind(("0.0.0.0", config.peer_port))
        .await
        .with_context(|| format!("binding peer port {}", config.peer_port))?;
    tokio::spawn(channel::serve_peers(
        peer_listener,
        registry.clone(),
        config.listen_port,
        config.upload_path.clone(),
        cancel.clone(),
    ));

    info!(
        listen_port = config.listen_port,
        peer_port = config.peer_port,
        "bridge up"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down");
    registry.unpublish_proxy().await;
    cancel.cancel();
    // Let goodbyes and listener teardown hit the wire before exiting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
