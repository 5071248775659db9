use std::sync::Arc;

use notification_service::config::NotificationServiceConfig;
use notification_service::database;
use notification_service::database::models::Channel;
use notification_service::logging;
use notification_service::notification::NotificationService;
use notification_service::notification::channels::{GatewayChannel, InAppChannel};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (.env + NOTIFY_* variables)
    let config = NotificationServiceConfig::from_env()?;

    // Initialize logging
    let (logging_config, _log_guard) = logging::init_logging(config.log_dir.as_deref())?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let service = Arc::new(NotificationService::from_pool(config.clone(), pool));

    // Register channel handlers
    if config.channels.in_app {
        service.register_channel(Arc::new(InAppChannel::default()));
    }
    for (channel, gateway) in [
        (Channel::Email, &config.channels.email),
        (Channel::Sms, &config.channels.sms),
        (Channel::Push, &config.channels.push),
    ] {
        if gateway.enabled {
            service.register_channel(Arc::new(GatewayChannel::new(channel, gateway.clone())?));
            info!(%channel, url = %gateway.url, "Registered gateway channel");
        }
    }

    service.start().await;
    info!("notification-service initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    service.stop().await;

    Ok(())
}
