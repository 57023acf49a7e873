use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use slotwise::clock::SystemClock;
use slotwise::config::Config;
use slotwise::engine::Engine;
use slotwise::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use slotwise::{reaper, tls, wire};

/// How often the compactor checks the WAL append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Grace period for open sessions after the listener closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    slotwise::observability::init(config.metrics_port)?;

    let tls_acceptor = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => Some(tls::load_tls_acceptor(Path::new(cert), Path::new(key))?),
        _ => None,
    };

    let started = std::time::Instant::now();
    let engine = Arc::new(Engine::new(&config.wal_path(), config.policy.clone(), Arc::new(SystemClock))?);
    info!(
        wal = %config.wal_path().display(),
        staff = engine.list_staff().await.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "state restored"
    );

    tokio::spawn(reaper::run_reaper(engine.clone(), config.reaper_interval));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold, COMPACT_CHECK_INTERVAL));

    let factory = Arc::new(wire::SlotwiseFactory::new(engine.clone(), config.password.clone()));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        zone = config.policy.zone.name(),
        max_connections,
        tls = tls_acceptor.is_some(),
        "slotwise listening"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!(%peer, "connection limit reached, rejecting");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!(%peer, "connection accepted");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        error!(%peer, error = %e, "connection error");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, max_connections).await;
    info!("slotwise stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM where the platform has it.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c only"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Wait until every connection permit is back, or give up after `DRAIN_TIMEOUT`.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    let in_flight = max_connections - semaphore.available_permits();
    if in_flight == 0 {
        return;
    }
    info!(in_flight, "draining connections");
    let all = u32::try_from(max_connections).unwrap_or(u32::MAX);
    match tokio::time::timeout(DRAIN_TIMEOUT, semaphore.acquire_many(all)).await {
        Ok(_) => info!("all connections drained"),
        Err(_) => {
            let remaining = max_connections - semaphore.available_permits();
            warn!(remaining, "drain timeout, closing with connections still open");
        }
    }
}
