// ipd-scheduler: pairs build requests with hypervisors from a bounded
// pool and drives each build through its instance lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

pub mod api;
pub mod builder;
pub mod error;
pub mod fetch;
pub mod poller;
pub mod projects;

mod lifecycle;

pub use builder::Builder;
pub use error::SchedulerError;
pub use projects::ProjectRegistry;

use ipd_core::config::IpdConfig;
use ipd_core::sshkey::ManagerKey;
use ipd_hypervisor::LibvirtConnector;
use ipd_ssh::OpensshConnector;
use ipd_store::{RedisStore, Store};

/// Run the scheduler service: project registry, build scheduler, and the
/// admin JSON API, until ctrl-c.
pub async fn serve(config: IpdConfig) -> Result<()> {
    let key = ManagerKey::load(&config.scheduler.manager_key_path())?;
    let store = Arc::new(RedisStore::connect(&config.store.url).await?);

    let registry = Arc::new(ProjectRegistry::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(poller::LogPoller::new()),
        config.scheduler.clone(),
    ));
    registry.start_polling().await?;

    let ssh = Arc::new(OpensshConnector::new(
        key.private_key_path(),
        Duration::from_secs(config.scheduler.ssh_connect_timeout_secs),
    ));
    let builder = Builder::new(
        Arc::clone(&registry),
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(LibvirtConnector::default()),
        ssh,
        Arc::new(fetch::HttpFetcher::new()),
        config.scheduler.clone(),
        config.hypervisors.clone(),
    );
    let pairing = builder.start();

    let app = api::router(api::AppState {
        registry: Arc::clone(&registry),
        builder: Arc::clone(&builder),
    });
    let listener = TcpListener::bind(&config.scheduler.listen)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", config.scheduler.listen))?;
    info!(listen = %config.scheduler.listen, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .with_context(|| "Admin API server failed")?;

    builder.stop_building().await;
    registry.stop_polling();
    let _ = pairing.await;
    info!("Scheduler stopped");
    Ok(())
}
