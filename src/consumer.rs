// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Handles a single delivery: decode the envelope, find the subscription for
//! `(routing key, payload type)`, run its handlers, then settle the delivery.
//! A delivery is acknowledged only when a handler marked it received; in every
//! other case (undecodable body, no subscription, no handler marked it) it is
//! returned to its queue after the requeue delay. There is no attempt limit.

use crate::{
    client::{BrokerChannel, Delivery},
    envelope::Envelope,
    errors::AmqpError,
    handler::Receipt,
    otel,
    subscription::SubscriptionRegistry,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, time::Duration};
use tracing::{debug, error, info, warn};

pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    registry: &SubscriptionRegistry,
    channel: &dyn BrokerChannel,
    requeue_delay: Duration,
) -> Result<(), AmqpError> {
    let queue = delivery.routing_key.as_str();
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, queue);

    debug!(
        queue,
        redelivered = delivery.redelivered,
        "received message - exchange: {}",
        delivery.exchange
    );

    let received = match Envelope::decode(&delivery.data) {
        Ok(message) => process(&ctx, queue, message, registry).await,
        Err(err) => {
            warn!(error = err.to_string(), queue, "failure to decode message");
            span.record_error(&err);
            false
        }
    };

    if received {
        return match channel.ack(delivery.delivery_tag).await {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
        };
    }

    warn!(
        queue,
        "returning message to the queue after {:.1}s",
        requeue_delay.as_secs_f64()
    );
    tokio::time::sleep(requeue_delay).await;

    match channel.nack(delivery.delivery_tag, true).await {
        Ok(()) => {
            debug!(queue, "message returned to the queue");
            span.set_status(Status::Error {
                description: Cow::from("message requeued"),
            });
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "error whiling requeuing");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to requeuing msg"),
            });
            Err(AmqpError::RequeuingMessageError)
        }
    }
}

/// Runs the handlers registered for the message; `true` when it was received.
async fn process(
    ctx: &Context,
    queue: &str,
    message: Envelope,
    registry: &SubscriptionRegistry,
) -> bool {
    let id = message.id();
    info!(queue, %id, payload_type = message.payload_type(), "processing event...");

    let Some(subscription) = registry.get(queue, message.payload_type()).await else {
        info!(queue, %id, "no subscribers for the event, it will not be processed");
        return false;
    };

    let receipt = Receipt::new(message);
    let received = subscription.dispatch(ctx, &receipt).await;

    if received {
        info!(subscription = %subscription.key(), %id, "event processed");
    } else {
        warn!(subscription = %subscription.key(), %id, "no handler accepted the event");
    }

    received
}
