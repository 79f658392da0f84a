// NATS JetStream client for the job command feed
//
// Connection events are mirrored into a watch channel so the reconciler can
// switch between reactive and polling operation.

use crate::config::NatsConfig;
use crate::errors::QueueError;
use async_nats::jetstream::{
    consumer::PullConsumer,
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use async_nats::{ConnectOptions, Event};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Maximum age of unconsumed commands
const MAX_AGE: Duration = Duration::from_secs(86400);
/// Deliveries of one command before JetStream gives up
const MAX_DELIVER: i64 = 10;
const ACK_WAIT: Duration = Duration::from_secs(60);

/// Whether a connection event means the feed can deliver commands
fn connectivity(event: &Event) -> Option<bool> {
    match event {
        Event::Connected => Some(true),
        Event::Disconnected => Some(false),
        _ => None,
    }
}

/// NATS JetStream client
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: JetStreamContext,
    config: NatsConfig,
    connected_rx: watch::Receiver<bool>,
}

impl NatsClient {
    /// Connect to the server and start tracking connectivity
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let (connected_tx, connected_rx) = watch::channel(false);
        let events_tx = connected_tx.clone();

        let client = ConnectOptions::new()
            .event_callback(move |event| {
                let events_tx = events_tx.clone();
                async move {
                    match connectivity(&event) {
                        Some(connected) => {
                            if connected {
                                info!("NATS connection established");
                            } else {
                                warn!("NATS connection lost");
                            }
                            events_tx.send_replace(connected);
                        }
                        None => info!(event = %event, "NATS event"),
                    }
                }
            })
            .connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        connected_tx.send_replace(true);
        info!("Connected to NATS server successfully");

        let jetstream = async_nats::jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            config,
            connected_rx,
        })
    }

    /// Create the command stream if it does not exist
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        info!(
            stream_name = %self.config.stream_name,
            subject = %self.config.command_subject,
            "Initializing JetStream stream"
        );

        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![self.config.command_subject.clone()],
            retention: RetentionPolicy::WorkQueue,
            max_age: MAX_AGE,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(stream_name = %self.config.stream_name, "Stream initialized successfully");
        Ok(stream)
    }

    /// Create or get the durable command consumer
    #[instrument(skip(self))]
    pub async fn get_or_create_consumer(&self) -> Result<PullConsumer, QueueError> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::StreamNotFound(format!("Stream not found: {}", e)))?;

        let consumer_config = async_nats::jetstream::consumer::pull::Config {
            durable_name: Some(self.config.consumer_name.clone()),
            ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
            max_deliver: MAX_DELIVER,
            ack_wait: ACK_WAIT,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&self.config.consumer_name, consumer_config)
            .await
            .map_err(|e| {
                QueueError::ConsumerCreation(format!("Failed to create consumer: {}", e))
            })?;

        info!(consumer_name = %self.config.consumer_name, "Consumer created successfully");
        Ok(consumer)
    }

    /// Core NATS client, used by the event sink
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Receiver of connectivity changes; `true` while connected
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Health check - verify the command stream is reachable
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::HealthCheck(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_events() {
        assert_eq!(connectivity(&Event::Connected), Some(true));
        assert_eq!(connectivity(&Event::Disconnected), Some(false));
        assert_eq!(connectivity(&Event::LameDuckMode), None);
    }

    #[tokio::test]
    #[ignore] // Requires NATS with JetStream to be running
    async fn test_connect_and_initialize_stream() {
        let config = crate::config::Settings::default().nats;
        let client = NatsClient::new(config).await.unwrap();
        assert!(*client.connection_status().borrow());

        client.initialize_stream().await.unwrap();
        client.health_check().await.unwrap();
    }
}
