//! Broker subscription feeding the hub

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::TOPIC_PATTERN;
use crate::error::Result;

use super::{Delivery, HubHandle};

/// Wait before retrying a subscription that could not be established
const SUBSCRIBE_RETRY: Duration = Duration::from_secs(5);

/// Wait before resubscribing after the message stream ended
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Pattern subscription over every owner topic. Each received payload is
/// handed to the hub for routing.
pub struct BrokerSubscriber {
    client: redis::Client,
    hub: HubHandle,
    shutdown: CancellationToken,
}

impl BrokerSubscriber {
    /// Create a subscriber; nothing happens until [`run`](Self::run)
    pub fn new(client: redis::Client, hub: HubHandle, shutdown: CancellationToken) -> Self {
        Self {
            client,
            hub,
            shutdown,
        }
    }

    /// Subscribe and forward until shutdown, resubscribing whenever the
    /// subscription fails or its stream ends.
    pub async fn run(self) {
        info!(pattern = TOPIC_PATTERN, "Starting broker subscriber");

        loop {
            let delay = tokio::select! {
                () = self.shutdown.cancelled() => break,
                outcome = self.subscribe_once() => match outcome {
                    Ok(()) => {
                        warn!("Broker subscription ended, resubscribing");
                        RESUBSCRIBE_DELAY
                    }
                    Err(e) => {
                        error!(error = %e, "Broker subscription failed");
                        SUBSCRIBE_RETRY
                    }
                },
            };

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!("Broker subscriber stopped");
    }

    /// One subscription: returns `Ok` when the stream ends, `Err` when it
    /// could not be established.
    async fn subscribe_once(&self) -> Result<()> {
        #[allow(deprecated)]
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.psubscribe(TOPIC_PATTERN).await?;
        info!(pattern = TOPIC_PATTERN, "Subscribed to alert topics");

        let payloads = pubsub.on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "Skipping non-text payload");
                    None
                }
            }
        });
        forward(&self.hub, payloads).await;
        Ok(())
    }
}

/// Hand every payload of `payloads` to the hub. Returns the number routed
/// to a connection.
pub async fn forward<S>(hub: &HubHandle, payloads: S) -> usize
where
    S: Stream<Item = String>,
{
    let mut delivered = 0;
    futures::pin_mut!(payloads);

    while let Some(payload) = payloads.next().await {
        metrics::counter!("fleetpulse_alerts_received_total").increment(1);
        if let Delivery::Delivered(owner) = hub.deliver(&payload).await {
            debug!(owner = %owner, "Alert routed");
            delivered += 1;
        }
    }
    delivered
}
