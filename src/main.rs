use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;

use mailblast::campaign::{Core, CoreOptions};
use mailblast::clock::{Clock, SystemClock};
use mailblast::config::Config;
use mailblast::kv::{Kv, MemoryKv, RedisKv};
use mailblast::mail::{LogMailer, Mailer, SmtpMailer};
use mailblast::store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("could not read configuration")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn Store> = match &config.database_url {
        Some(dsn) => Arc::new(
            PgStore::connect(dsn)
                .await
                .context("could not connect to DATABASE_URL")?,
        ),
        None => {
            tracing::warn!("DATABASE_URL not set, campaigns will not survive a restart");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let kv: Arc<dyn Kv> = match &config.redis_url {
        Some(url) => Arc::new(RedisKv::connect(url).context("could not open REDIS_URL")?),
        None => {
            tracing::warn!("REDIS_URL not set, rate counters are process-local");
            Arc::new(MemoryKv::new(clock.clone()))
        }
    };

    let mailer: Arc<dyn Mailer> = match SmtpMailer::from_env() {
        Ok(mailer) => Arc::new(mailer),
        Err(e) => {
            tracing::warn!(error = %e, "SMTP not configured, messages will be logged instead");
            Arc::new(LogMailer)
        }
    };

    let core = Arc::new(Core::new(
        CoreOptions::from(&config),
        store,
        kv,
        mailer,
        clock,
    ));
    let handle = core.start().await.context("core startup failed")?;

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
        .await
        .with_context(|| format!("could not bind port {}", config.port))?;
    tracing::info!(
        port = config.port,
        workers = config.worker_concurrency,
        sender = %config.mailer_from,
        hourly_limit = config.max_emails_per_hour,
        "accepting campaigns"
    );

    axum::serve(listener, mailblast::http::router(core.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("error running HTTP server")?;

    // The listener is closed; drain the worker pool so in-flight sends are
    // recorded before the process exits.
    handle.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. Stopping the HTTP listener first means no
/// new campaigns arrive while the worker pool drains.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight sends");
}
