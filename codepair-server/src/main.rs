use codepair_collab::server::{CollabServer, ServerConfig};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let store = config.open_store()?;
    if let Some(app_url) = &config.public_app_url {
        info!("Serving collaborators of {app_url}");
    }

    let server = CollabServer::new(config, store);
    let handle = server.start().await?;
    info!("Listening on ws://{}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    let stats = handle.stats();
    handle.stop().await;
    info!(
        "Served {} connection(s), {} frame(s) ({} bytes) received",
        stats.total_connections, stats.frames_received, stats.bytes_received
    );
    Ok(())
}
