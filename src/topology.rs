// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! Every route used by the bus maps to one queue with the same name, bound to
//! the bus exchange under that same routing key. Declarations are idempotent on
//! the broker side, so the topology is simply declared again whenever a channel
//! is rebuilt.

use crate::{
    client::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Declares the bus exchange on `channel`.
pub async fn declare_exchange(
    channel: &dyn BrokerChannel,
    exchange: &str,
) -> Result<(), AmqpError> {
    debug!("declaring exchange: {}", exchange);

    channel
        .declare_exchange(&ExchangeDefinition::new(exchange))
        .await
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                name = exchange,
                "error to declare the exchange"
            )
        })
}

/// Declares the exchange, the queue named `route` and the binding between them.
///
/// The queue is non-durable, non-exclusive and not auto-deleted.
pub async fn declare_topology(
    channel: &dyn BrokerChannel,
    exchange: &str,
    route: &str,
) -> Result<(), AmqpError> {
    if route.trim().is_empty() {
        return Err(AmqpError::ArgumentError(
            "route must not be empty".to_owned(),
        ));
    }

    declare_exchange(channel, exchange).await?;

    debug!("declaring queue: {}", route);
    channel
        .declare_queue(&QueueDefinition::new(route))
        .await
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                queue = route,
                "error to declare the queue"
            )
        })?;

    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        route, exchange, route
    );
    channel
        .bind_queue(
            &QueueBinding::new(route)
                .exchange(exchange)
                .routing_key(route),
        )
        .await
        .inspect_err(|err| error!(error = err.to_string(), "error to bind queue to exchange"))
}
