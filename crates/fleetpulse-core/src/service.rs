//! The assembled alert pipeline
//!
//! Wires the ingestor, the connection hub, the broker subscriber and the
//! HTTP server together and runs them until shutdown.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alerting::{RedisAlertPublisher, RuleEvaluator};
use crate::api::HttpServer;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::hub::{BrokerSubscriber, ConnectionHub, HubHandle};
use crate::ingest::{RedisStreamQueue, TelemetryIngestor};

/// The main service
pub struct Service {
    config: Config,
    db: Database,
    shutdown: CancellationToken,
}

impl Service {
    /// Connect to Redis and Postgres. An unreachable backend is fatal here.
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(&config).await?;
        Ok(Self {
            config,
            db,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run until Ctrl+C or until a component fails fatally, then stop every
    /// component and wait for it.
    pub async fn run(self) -> Result<()> {
        info!("Starting FleetPulse...");

        let (hub, hub_task) = ConnectionHub::spawn(self.shutdown.child_token());
        let mut tasks = vec![("hub", hub_task)];
        tasks.push(("subscriber", self.spawn_subscriber(&hub)));

        match self.spawn_ingestor().await {
            Ok(task) => tasks.push(("ingestor", task)),
            Err(e) => {
                error!(error = %e, "Failed to start telemetry ingestor");
                wind_down(&self.shutdown, &hub, tasks).await;
                return Err(e);
            }
        }
        tasks.push(("http", self.spawn_http(hub.clone())));

        tokio::select! {
            () = self.shutdown.cancelled() => info!("Shutdown requested"),
            _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down..."),
        }

        wind_down(&self.shutdown, &hub, tasks).await;
        info!("FleetPulse stopped");
        Ok(())
    }

    fn spawn_subscriber(&self, hub: &HubHandle) -> JoinHandle<()> {
        let subscriber = BrokerSubscriber::new(
            self.db.redis.client().clone(),
            hub.clone(),
            self.shutdown.clone(),
        );
        tokio::spawn(subscriber.run())
    }

    async fn spawn_ingestor(&self) -> Result<JoinHandle<()>> {
        let queue = RedisStreamQueue::connect(&self.db.redis, self.config.queue.clone()).await?;
        let store = Arc::new(self.db.postgres.clone());
        let evaluator = RuleEvaluator::new(
            store.clone(),
            Arc::new(RedisAlertPublisher::new(&self.db.redis)),
        );

        let ingestor = TelemetryIngestor::new(
            queue,
            store.clone(),
            store,
            evaluator,
            self.config.queue.ack_policy,
        );
        Ok(tokio::spawn(ingestor.run(self.shutdown.clone())))
    }

    fn spawn_http(&self, hub: HubHandle) -> JoinHandle<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.http_port);
        let server = HttpServer::new(hub, Some(self.db.clone()));
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = server.serve(&addr, shutdown.clone()).await {
                error!(error = %e, "HTTP server error");
                shutdown.cancel();
            }
        })
    }
}

/// Cancel every component and wait for each spawned task to finish
async fn wind_down(
    shutdown: &CancellationToken,
    hub: &HubHandle,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
) {
    shutdown.cancel();
    hub.shutdown();

    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Connection;
    use crate::models::OwnerId;

    #[tokio::test]
    async fn test_wind_down_stops_started_tasks() {
        let shutdown = CancellationToken::new();
        let (hub, hub_task) = ConnectionHub::spawn(shutdown.child_token());

        let (conn, _rx) = Connection::new(OwnerId::parse("3").unwrap());
        hub.register(conn.clone()).await.unwrap();

        let token = shutdown.clone();
        let worker = tokio::spawn(async move { token.cancelled().await });

        wind_down(&shutdown, &hub, vec![("hub", hub_task), ("worker", worker)]).await;

        assert!(shutdown.is_cancelled());
        assert!(hub.is_shut_down());
        assert_eq!(hub.connection_count(), 0);
        assert!(conn.is_closed());
    }
}
