//! Worker - the proxy service
//!
//! Wires the store, entity cache, REST client and dispatcher together, then
//! runs the event consumer, the expired-row sweeper and the health server until
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::api::{HealthServer, Readiness};
use crate::cache::EntityCache;
use crate::db::{self, DbPool, EventQueue};
use crate::discord::{DiscordApi, DiscordHttp};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::ingest::Ingest;
use crate::{Config, Result};

/// Acknowledged stream entries older than this are trimmed
const STREAM_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// The proxy worker
pub struct Worker {
    config: Config,
    port: u16,
    db: DbPool,
}

impl Worker {
    /// Open the database and prepare the worker
    ///
    /// `port` overrides the configured health port when set.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened
    pub fn new(config: Config, port: Option<u16>) -> Result<Self> {
        let db = db::init(&config.database_path)?;
        tracing::info!(path = %config.database_path.display(), "database ready");

        let port = port.unwrap_or(config.server.health_port);
        Ok(Self { config, port, db })
    }

    /// Run until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if the REST client or the consumer group cannot be set up
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        });

        let ready = Readiness::new();
        let health = HealthServer::new(self.port, ready.clone()).spawn(shutdown_rx.clone());

        let api: Arc<dyn DiscordApi> = Arc::new(DiscordHttp::new(&self.config.discord)?);
        tracing::info!(application = %api.application_id(), "discord client ready");

        let cache = EntityCache::new(self.db.clone());
        let options = DispatchOptions::from_config(&self.config);
        let dispatcher = Arc::new(Dispatcher::new(api, &self.db, cache, &options));

        let queue = EventQueue::new(self.db.clone());
        let ingest = Ingest::new(queue.clone(), dispatcher, self.config.queue.clone());
        ingest.init()?;

        let sweeper = spawn_sweeper(
            self.db.clone(),
            queue,
            self.config.queue.stream.clone(),
            self.config.server.sweep_interval,
            shutdown_rx.clone(),
        );

        ready.set_ready(true);
        tracing::info!("proxy worker ready");

        let result = ingest.run(shutdown_rx).await;
        ready.set_ready(false);

        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "sweeper task failed");
        }
        match health.await {
            Ok(Err(e)) => tracing::error!(error = %e, "health server failed"),
            Err(e) => tracing::warn!(error = %e, "health server task failed"),
            Ok(Ok(())) => {}
        }

        tracing::info!("proxy worker stopped");
        result
    }
}

/// Periodically remove expired rows and old stream entries
fn spawn_sweeper(
    pool: DbPool,
    queue: EventQueue,
    stream: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => sweep(&pool, &queue, &stream),
            }
        }
    })
}

fn sweep(pool: &DbPool, queue: &EventQueue, stream: &str) {
    match db::purge_expired(pool) {
        Ok(0) => {}
        Ok(removed) => tracing::debug!(removed, "purged expired rows"),
        Err(e) => tracing::warn!(error = %e, "failed to purge expired rows"),
    }

    match queue.trim(stream, STREAM_RETENTION) {
        Ok(0) => {}
        Ok(trimmed) => tracing::debug!(trimmed, "trimmed event stream"),
        Err(e) => tracing::warn!(error = %e, "failed to trim event stream"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_tolerates_empty_store() {
        let pool = db::init_memory().unwrap();
        let queue = EventQueue::new(pool.clone());
        sweep(&pool, &queue, "discord_events");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_shutdown() {
        let pool = db::init_memory().unwrap();
        let queue = EventQueue::new(pool.clone());
        let (tx, rx) = watch::channel(false);

        let handle = spawn_sweeper(pool, queue, "discord_events".into(), Duration::from_secs(60), rx);
        tokio::time::sleep(Duration::from_secs(150)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
