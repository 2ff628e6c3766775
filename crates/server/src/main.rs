use std::{
    net::SocketAddr,
    sync::Arc,
};

use audit::{
    AuditLogSink,
    AuditQueue,
    AuditQueueConfig,
    MemoryAuditLog,
    PostgresAuditLog,
};
use clap::Parser;
use engine::SyncEngine;
use gateway::{
    FanoutGateway,
    GatewayConfig,
};
use server::{
    router,
    AppState,
    RateLimitConfig,
    RateLimiter,
    ServerConfig,
};
use state_manager::StateManager;
use store::{
    KeySpace,
    RedisStore,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    tracing::info!(?config.listen_addr, "starting synckairos");

    // Wire components leaf to root: store, audit, state manager, engine,
    // gateway, router. The gateway's subscriptions are live before the
    // listener binds, so no update can slip past an accepted connection.
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let keys = KeySpace::production();

    let sink: Arc<dyn AuditLogSink> = match &config.postgres_url {
        Some(url) => Arc::new(PostgresAuditLog::connect(url, config.audit_workers as u32).await?),
        None => {
            tracing::warn!("no audit log configured; audit events will not be durable");
            Arc::new(MemoryAuditLog::new())
        },
    };
    let audit_queue = Arc::new(AuditQueue::new(
        sink,
        AuditQueueConfig {
            worker_count: config.audit_workers,
            max_attempts: config.audit_max_attempts,
            retry_initial_backoff: config.audit_retry_base(),
            ..AuditQueueConfig::default()
        },
    ));

    let manager = Arc::new(StateManager::new(
        store.clone(),
        audit_queue,
        keys.clone(),
        config.session_ttl(),
    ));
    let engine = Arc::new(SyncEngine::new(manager.clone()));
    let fanout = FanoutGateway::start(
        manager.clone(),
        GatewayConfig {
            heartbeat_interval: config.heartbeat_interval(),
            send_queue_depth: config.ws_send_queue_depth,
        },
    )
    .await?;
    let rate_limiter = Arc::new(RateLimiter::new(
        store,
        keys,
        RateLimitConfig {
            switch_per_second: config.switch_rate_per_second,
            ip_per_minute: config.ip_rate_per_minute,
        },
    ));

    let app = router(AppState {
        engine,
        gateway: fanout.clone(),
        rate_limiter,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop accepting already happened; close sockets with 1001, then drain
    // the audit queue and drop subscriptions.
    tracing::info!("shutting down");
    fanout.shutdown().await;
    manager.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
