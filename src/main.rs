use pairlink::config::ServerConfig;
use pairlink::signaling::{RelayServer, SignalingServer};
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();

    println!("   Pairlink Rendezvous Server");
    println!("   Signaling on ws://{}", config.signaling_addr());
    println!("   Relay on     ws://{}", config.relay_addr());
    println!("   Press Ctrl+C to stop\n");

    let signaling = SignalingServer::bind(&config.signaling_addr(), config.room_capacity).await?;
    let relay = RelayServer::bind(&config.relay_addr(), config.room_capacity).await?;

    tokio::select! {
        result = signaling.run() => result,
        result = relay.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
