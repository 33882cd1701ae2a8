use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ipd_core::config::IpdConfig;
use ipd_core::sshkey::ManagerKey;
use ipd_hypervisor::LibvirtConnector;
use ipd_metadata::manager::MetadataManager;
use ipd_metadata::server::{self, AppState};
use ipd_store::RedisStore;

#[derive(Parser)]
#[command(name = "metaserver", version, about = "ipd instance metadata service")]
struct Cli {
    /// Listen port. Overrides the [metadata] section of the config.
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the ipd configuration file.
    #[arg(short, long, default_value = "ipd.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = IpdConfig::from_file(&cli.config)?;
    ipd_core::logging::init(config.log.filter.as_deref());

    let port = cli.port.unwrap_or(config.metadata.port);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(serve(config, port))
}

async fn serve(config: IpdConfig, port: u16) -> Result<()> {
    let key = ManagerKey::load(&config.scheduler.manager_key_path())?;
    let store = Arc::new(RedisStore::connect(&config.store.url).await?);

    let manager = Arc::new(MetadataManager::new(
        config.hypervisors.clone(),
        Arc::new(LibvirtConnector::default()),
        store,
        key.public_openssh().to_string(),
    ));

    let app = server::router(AppState::new(manager));
    let listen = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind metadata service on {}", listen))?;
    info!(listen = %listen, "Metadata service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .with_context(|| "Metadata server failed")?;

    info!("Metadata service stopped");
    Ok(())
}
