//! Broker connection and one-time topology declaration.

use crate::config::BrokerConfig;
use crate::error::ServerError;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};

/// Exchange, queue and binding declared before devices are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            queue: config.queue.clone(),
            routing_key: config.routing_key.clone(),
        }
    }

    /// Durable fanout exchange that survives broker restarts and is never
    /// removed automatically.
    pub fn exchange_options() -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            durable: true,
            auto_delete: false,
            ..Default::default()
        }
    }

    /// Non-durable, non-exclusive queue.
    pub fn queue_options() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: false,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        }
    }

    /// Declares the exchange and queue and binds them. Any failure aborts.
    pub async fn declare(&self, channel: &Channel) -> Result<(), ServerError> {
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Fanout,
                Self::exchange_options(),
                FieldTable::default(),
            )
            .await?;
        tracing::info!("  Exchange '{}' declared (fanout, durable)", self.exchange);

        if self.queue.is_empty() {
            return Ok(());
        }

        channel
            .queue_declare(&self.queue, Self::queue_options(), FieldTable::default())
            .await?;
        tracing::info!("  Queue '{}' declared", self.queue);

        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::info!("  Queue '{}' bound to '{}'", self.queue, self.exchange);

        Ok(())
    }
}

/// Dials the broker and opens the channel shared by all publishes.
pub async fn connect(config: &BrokerConfig) -> Result<(Connection, Channel), ServerError> {
    let connection = Connection::connect(&config.url, ConnectionProperties::default()).await?;
    tracing::info!("Connected to broker");

    let channel = connection.create_channel().await?;
    tracing::debug!("Broker channel {} opened", channel.id());

    Ok((connection, channel))
}
