use std::time::Duration;
use surge_core::transport::UdpTransport;
use surge_core::Server;
use tokio::time::{interval, Instant};
use tracing::{error, info, Level};

pub mod config;

const TICK_INTERVAL: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let start_time = Instant::now();

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let bind_addr = config.bind_addr();
    let (transport, inbound_rx) = match UdpTransport::bind(bind_addr).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, %bind_addr, "failed to bind UDP socket");
            std::process::exit(1);
        }
    };

    let mut server = Server::new(std::sync::Arc::new(transport), inbound_rx, config.server_config());

    server
        .on_client_connected
        .subscribe(|e| info!(client_id = e.client_id, "client connected"));
    server.on_client_disconnected.subscribe(|e| {
        info!(client_id = e.client_id, reason = ?e.reason, "client disconnected");
    });
    server.on_message_received.subscribe(|e| {
        info!(client_id = e.client_id, message_id = e.message_id, len = e.payload.len(), "message received");
    });

    info!(
        server_name = %config.server.name,
        %bind_addr,
        max_clients = config.server.max_clients,
        load_time_secs = start_time.elapsed().as_secs_f64(),
        "server started"
    );

    let mut ticker = interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => server.tick(),
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }
}
