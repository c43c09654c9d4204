// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient publish/subscribe over RabbitMQ.
//!
//! A [`PersistentConnection`] keeps the broker connection alive, a
//! [`ChannelBase`] owns the consumer channel and re-declares topology after
//! recovery, [`RabbitMQPublisher`] sends [`Envelope`]s with bounded retries and
//! [`RabbitMQSubscriber`] routes deliveries to registered handlers.

mod consumer;
mod otel;

pub mod amqp;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod subscription;
pub mod topology;

#[cfg(test)]
mod test_support;

pub use channel::ChannelBase;
pub use config::RabbitMQConfigs;
pub use connection::{ConnectionState, PersistentConnection};
pub use dispatcher::RabbitMQSubscriber;
pub use envelope::{Envelope, Payload};
pub use errors::AmqpError;
pub use handler::{ConsumerHandler, FnHandler, Receipt};
pub use publisher::{Publisher, RabbitMQPublisher};
