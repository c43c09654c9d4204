// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes envelopes to the bus exchange. Every publish opens its own
//! short-lived channel, serializes the envelope once, and sends it as a
//! persistent, mandatory message. Transient broker failures are retried with
//! exponential backoff (2s, 4s, 8s, 16s, 32s) before the last error is returned.
//!
//! The current OpenTelemetry context is injected into the message headers so
//! consumers can continue the trace.

use crate::{
    channel::ChannelBase,
    client::{BrokerChannel, DeliveryMode, PublishProperties},
    config::RabbitMQConfigs,
    connection::PersistentConnection,
    envelope::Envelope,
    errors::AmqpError,
    otel,
    retry::{RetryPolicy, PUBLISH_RETRY_COUNT},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message` to the bus exchange with routing key `route`.
    async fn publish(&self, route: &str, message: &Envelope) -> Result<(), AmqpError>;
}

/// Publisher of the bus, sharing the connection and exchange of its [`ChannelBase`].
pub struct RabbitMQPublisher {
    base: Arc<ChannelBase>,
    policy: RetryPolicy,
}

impl RabbitMQPublisher {
    /// Creates a publisher on an existing channel base.
    ///
    /// # Parameters
    /// * `base` - Channel base providing the connection and the exchange name
    ///
    /// # Returns
    /// The publisher, retrying each publish up to five times
    pub fn new(base: Arc<ChannelBase>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            base,
            policy: RetryPolicy::exponential(PUBLISH_RETRY_COUNT),
        })
    }

    /// Connects to the broker described by `cfg` and publishes to `cfg.exchange`.
    ///
    /// # Parameters
    /// * `cfg` - RabbitMQ settings
    ///
    /// # Returns
    /// The publisher, or the error that prevented building its channel base
    pub async fn from_configs(cfg: &RabbitMQConfigs) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        Self::with_connection(cfg, PersistentConnection::from_configs(cfg)).await
    }

    /// Like [`from_configs`](RabbitMQPublisher::from_configs) over a caller-supplied connection.
    pub async fn with_connection(
        cfg: &RabbitMQConfigs,
        connection: Arc<PersistentConnection>,
    ) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        let base = ChannelBase::new(&cfg.exchange, connection).await?;
        Ok(Self::new(base))
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, route: &str, message: &Envelope) -> Result<(), AmqpError> {
        let connection = self.base.connection();
        if !connection.is_connected() {
            connection.try_connect().await;
        }

        debug!(
            payload_type = message.payload_type(),
            "creating rabbitmq channel to publish"
        );
        let channel = connection.open_channel().await?;

        let result = self.send(channel.as_ref(), route, message).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close publishing channel");
        }

        result
    }
}

impl RabbitMQPublisher {
    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        route: &str,
        message: &Envelope,
    ) -> Result<(), AmqpError> {
        let body = message.encode()?;
        let properties = PublishProperties {
            delivery_mode: DeliveryMode::Persistent,
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            message_id: Some(message.id().to_string()),
            kind: Some(message.payload_type().to_owned()),
            headers: otel::inject(&Context::current()),
        };

        let exchange = self.base.exchange();
        let (body, properties) = (&body, &properties);

        self.policy
            .execute("rabbitmq publish", move || async move {
                info!(id = %message.id(), route, "publishing event...");
                let published = channel
                    .publish(exchange, route, true, properties, body)
                    .await;
                if published.is_ok() {
                    info!(id = %message.id(), route, "event published");
                }
                published
            })
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    id = %message.id(),
                    route,
                    "error publishing message"
                )
            })
    }
}
