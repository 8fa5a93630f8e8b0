// ABOUTME: Invoker entrypoint: wire construction leaf-first, crash recovery, graceful shutdown
// ABOUTME: Substrate-level failures exit non-zero so a supervisor restarts the process

use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use penguinwhisk_invoker::config::Config;
use penguinwhisk_invoker::executor::{ActivationHandler, Executor};
use penguinwhisk_invoker::recovery::remove_leftover_sandboxes;
use penguinwhisk_messaging::{HeartbeatPublisher, HeartbeatSnapshot, QueueConsumer, ResultPublisher};
use penguinwhisk_sandbox::{
    DockerSubstrate, LogCollector, PoolConfig, ResourceLimits, RuntimeProxy, SandboxPool, Substrate,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        error!(error = %e, "invoker terminated");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    info!(invoker_id = %config.invoker.id, "starting invoker");

    // Queue client first: without it nothing can be acked or published.
    let redis_client = redis::Client::open(config.redis.url())?;
    let conn = ConnectionManager::new(redis_client).await?;
    info!(url = %config.redis.url(), "connected to Redis");

    let substrate = Arc::new(
        DockerSubstrate::connect(
            &config.docker.host,
            &config.docker.network_name,
            &config.docker.container_prefix,
            &config.invoker.id,
            ResourceLimits {
                memory_mb: config.resources.memory_mb,
                cpu_shares: config.resources.cpu_shares,
            },
        )
        .await?,
    );
    substrate.ensure_network().await?;

    // A previous run of this invoker may have died with sandboxes still
    // on the daemon; remove them before accepting work.
    remove_leftover_sandboxes(substrate.as_ref()).await?;

    // Leaf-first construction; teardown runs in reverse.
    let pool = SandboxPool::new(
        substrate.clone(),
        PoolConfig {
            max_size: config.pool.max_size,
            idle_timeout: config.pool.idle_timeout,
            cleanup_interval: config.pool.cleanup_interval,
        },
    );
    let proxy = Arc::new(RuntimeProxy::new()?);
    let collector = Arc::new(LogCollector::new(substrate.clone()));
    let publisher = Arc::new(ResultPublisher::new(conn.clone()));
    let executor = Arc::new(Executor::new(pool.clone(), proxy, collector)?);
    let handler = Arc::new(ActivationHandler::new(executor, publisher));
    let consumer = Arc::new(
        QueueConsumer::new(
            conn.clone(),
            &config.invoker.id,
            handler,
            config.invoker.max_concurrent,
        )
        .await?,
    );
    let heartbeat = HeartbeatPublisher::new(
        conn.clone(),
        config.invoker.id.clone(),
        config.invoker.heartbeat_interval,
    );

    for (kind, count) in &config.pool.prewarm {
        info!(runtime = %kind, count, "prewarming stem cells");
        if let Err(e) = pool.prewarm(kind, *count).await {
            warn!(runtime = %kind, error = %e, "prewarm failed");
        }
    }

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_task = tokio::spawn({
        let cancel = heartbeat_cancel.clone();
        let consumer = consumer.clone();
        let pool = pool.clone();
        async move {
            let snapshot = move || HeartbeatSnapshot {
                active_count: consumer.active_count(),
                pool_stats: serde_json::to_value(pool.stats())
                    .unwrap_or(serde_json::Value::Null),
            };
            if let Err(e) = heartbeat.run(cancel, snapshot).await {
                warn!(error = %e, "heartbeat loop failed");
            }
        }
    });

    let consumer_cancel = CancellationToken::new();
    let mut consumer_task = tokio::spawn({
        let consumer = consumer.clone();
        let cancel = consumer_cancel.clone();
        let drain_deadline = config.invoker.drain_deadline;
        async move { consumer.run(cancel, drain_deadline).await }
    });

    info!("invoker ready");

    // Shutdown ordering: stop reading, drain in-flight, stop heartbeat,
    // destroy sandboxes, drop the queue client.
    let mut fatal: Option<Box<dyn std::error::Error>> = None;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            consumer_cancel.cancel();
            match (&mut consumer_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => fatal = Some(Box::new(e)),
                Err(e) => fatal = Some(Box::new(e)),
            }
        }
        result = &mut consumer_task => {
            match result {
                Ok(Ok(())) => info!("consumer finished"),
                Ok(Err(e)) => fatal = Some(Box::new(e)),
                Err(e) => fatal = Some(Box::new(e)),
            }
        }
    }

    heartbeat_cancel.cancel();
    let _ = heartbeat_task.await;

    pool.drain().await;

    info!("invoker shutdown complete");
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
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
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
