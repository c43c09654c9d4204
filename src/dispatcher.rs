// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Subscriber
//!
//! [`RabbitMQSubscriber`] registers handlers per `(queue, payload type)` and
//! runs one consumer per distinct queue on the consumer channel owned by its
//! [`ChannelBase`]. Consumers follow channel replacements: whenever the base
//! rebuilds its channel the consumer is started again on the new one, so
//! registered handlers keep receiving messages across reconnects.
//!
//! Every delivery is processed in its own task; see [`crate::consumer`] for how
//! a delivery is settled.

use crate::{
    channel::{ChannelBase, ConsumerChannel},
    client::DeliveryStream,
    config::RabbitMQConfigs,
    connection::PersistentConnection,
    consumer::consume,
    envelope::Payload,
    errors::AmqpError,
    handler::ConsumerHandler,
    subscription::SubscriptionRegistry,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

/// Default wait before an unprocessed delivery is returned to its queue.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(5);

pub struct RabbitMQSubscriber {
    base: Arc<ChannelBase>,
    registry: Arc<SubscriptionRegistry>,
    requeue_delay: Duration,
    /// Queues a consumer was started for.
    consuming: Mutex<HashSet<String>>,
}

impl RabbitMQSubscriber {
    /// Creates a subscriber on `base` with the default requeue delay.
    ///
    /// # Parameters
    /// * `base` - Channel base owning the consumer channel
    ///
    /// # Returns
    /// A subscriber without any subscription
    pub fn new(base: Arc<ChannelBase>) -> Arc<RabbitMQSubscriber> {
        Self::with_requeue_delay(base, DEFAULT_REQUEUE_DELAY)
    }

    /// Connects to the broker described by `cfg` and consumes from queues bound
    /// to `cfg.exchange`, returning unprocessed deliveries after `cfg.requeue_delay()`.
    ///
    /// # Parameters
    /// * `cfg` - RabbitMQ settings
    ///
    /// # Returns
    /// The subscriber, or the error that prevented building its channel base
    pub async fn from_configs(
        cfg: &RabbitMQConfigs,
    ) -> Result<Arc<RabbitMQSubscriber>, AmqpError> {
        Self::with_connection(cfg, PersistentConnection::from_configs(cfg)).await
    }

    /// Like [`from_configs`](RabbitMQSubscriber::from_configs) over a caller-supplied connection.
    pub async fn with_connection(
        cfg: &RabbitMQConfigs,
        connection: Arc<PersistentConnection>,
    ) -> Result<Arc<RabbitMQSubscriber>, AmqpError> {
        let base = ChannelBase::new(&cfg.exchange, connection).await?;
        Ok(Self::with_requeue_delay(base, cfg.requeue_delay()))
    }

    pub fn with_requeue_delay(
        base: Arc<ChannelBase>,
        requeue_delay: Duration,
    ) -> Arc<RabbitMQSubscriber> {
        Arc::new(RabbitMQSubscriber {
            base,
            registry: SubscriptionRegistry::new(),
            requeue_delay,
            consuming: Mutex::new(HashSet::new()),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Subscribes `handler` to messages of type `T` arriving on `queue`.
    pub async fn subscribe<T: Payload>(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        self.subscribe_type(queue, &T::payload_type(), handler)
            .await
    }

    /// Declares `queue`, registers `handler` for `payload_type` on it and starts
    /// consuming the queue unless a consumer already runs for it.
    pub async fn subscribe_type(
        &self,
        queue: &str,
        payload_type: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        info!(queue, payload_type, "subscribing to queue...");

        self.base.declare(queue).await?;
        self.registry.register(queue, payload_type, handler).await;

        let mut consuming = self.consuming.lock().await;
        if consuming.insert(queue.to_owned()) {
            tokio::spawn(drive(
                queue.to_owned(),
                self.base.watch(),
                self.registry.clone(),
                self.requeue_delay,
            ));
        }

        info!(queue, payload_type, "subscribed to queue");
        Ok(())
    }

    /// Closes the consumer channel; every consumer of this subscriber stops.
    pub async fn close(&self) {
        self.base.close().await;
    }
}

/// Keeps one consumer of `queue` attached to the current consumer channel.
/// Returns once the channel base is closed or dropped.
async fn drive(
    queue: String,
    mut channels: watch::Receiver<Option<ConsumerChannel>>,
    registry: Arc<SubscriptionRegistry>,
    requeue_delay: Duration,
) {
    let consumer_tag = format!("{}-consumer", queue);

    loop {
        let current = channels.borrow_and_update().clone();
        let Some(current) = current else {
            debug!(queue = %queue, "consumer channel closed, consumer stopped");
            return;
        };

        let replaced = match current.channel.consume(&queue, &consumer_tag).await {
            Ok(stream) => {
                debug!(queue = %queue, epoch = current.epoch, "consumer started");
                tokio::select! {
                    _ = pump(stream, &current, &registry, requeue_delay) => {
                        debug!(queue = %queue, epoch = current.epoch, "consumer stream ended");
                        false
                    }
                    changed = channels.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        true
                    }
                }
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = %queue,
                    "failure to create the consumer"
                );
                false
            }
        };

        // Wait for the replacement channel; returns at once if it is already there.
        if !replaced && channels.changed().await.is_err() {
            return;
        }
    }
}

async fn pump(
    mut stream: DeliveryStream,
    current: &ConsumerChannel,
    registry: &Arc<SubscriptionRegistry>,
    requeue_delay: Duration,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(delivery) => {
                let channel = current.channel.clone();
                let registry = registry.clone();

                tokio::spawn(async move {
                    if let Err(err) = consume(
                        &global::tracer("amqp consumer"),
                        &delivery,
                        &registry,
                        channel.as_ref(),
                        requeue_delay,
                    )
                    .await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                });
            }
            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }
}
