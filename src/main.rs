#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use directory_sync_lib::application::{
    GroupSyncOptions, GroupSyncService, InstitutionSyncService, Scheduler, SyncJobs, UserSyncOptions, UserSyncService,
};
use directory_sync_lib::domain::DirectoryApi;
use directory_sync_lib::infrastructure::logging::{init_logging_with_config, log_system_info};
use directory_sync_lib::infrastructure::{
    ConfigManager, DatabaseConnection, HttpDirectoryClient, PageFetcher, SqliteSyncStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigManager::new().load_config().context("Failed to load configuration")?;

    init_logging_with_config(&config.logging, config.schedule.utc_offset_hours)
        .context("Failed to initialize logging")?;
    log_system_info();

    let db = DatabaseConnection::with_max_connections(&config.database.url, config.database.max_connections).await?;
    db.migrate().await.context("Failed to apply database schema")?;
    let store = Arc::new(SqliteSyncStore::new(db.pool().clone()));

    let directory: Arc<dyn DirectoryApi> = Arc::new(
        HttpDirectoryClient::from_config(&config.directory, config.retry.clone())
            .context("Failed to build directory client")?,
    );
    let fetcher = PageFetcher::new(config.directory.page_length, config.sync.page_concurrency);

    let groups = GroupSyncService::new(
        directory.clone(),
        store.clone(),
        GroupSyncOptions {
            default_pool_id: config.sync.default_pool_id,
            protected_codes: config.sync.external_group_code.iter().cloned().collect(),
        },
    );
    let users = UserSyncService::new(
        directory.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        fetcher.clone(),
        UserSyncOptions {
            reserved_username: config.sync.reserved_username.clone(),
            external_group_code: config.sync.external_group_code.clone(),
        },
    );
    let institutions = InstitutionSyncService::new(directory, store, fetcher, config.sync.attachment_concurrency);

    let scheduler = Scheduler::from_config(Arc::new(SyncJobs::new(groups, users, institutions)), &config.schedule)
        .context("Invalid schedule")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("🛑 Ctrl-C received, finishing current job");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        });
    }

    scheduler.run(shutdown).await;
    db.close().await;
    info!("👋 directory-sync stopped");
    Ok(())
}
