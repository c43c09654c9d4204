// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Surface
//!
//! The supervisor, publisher and subscriber only ever talk to the broker through
//! the traits in this module. [`crate::amqp`] implements them on top of `lapin`;
//! tests implement them in memory.
//!
//! Broker callbacks are not delivered as closures into the bus. A connection is
//! handed an [`EventSink`] and a channel a [`FaultSink`], and they push messages
//! into those; the owning component drains them on its own task.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// AMQP delivery mode property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

/// Message properties attached to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub delivery_mode: DeliveryMode,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for PublishProperties {
    fn default() -> Self {
        PublishProperties {
            delivery_mode: DeliveryMode::Transient,
            content_type: None,
            message_id: None,
            kind: None,
            headers: BTreeMap::new(),
        }
    }
}

/// A message handed to a consumer. `delivery_tag` is scoped to the channel
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Connection-level notifications raised by the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Shutdown(String),
    CallbackException(String),
    Blocked(String),
    Unblocked,
}

/// A connection notification tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: UnboundedSender<ConnectionEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: UnboundedSender<ConnectionEvent>) -> Self {
        EventSink { generation, tx }
    }

    /// Reports an event. Events sent after the supervisor is gone are dropped.
    pub fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.tx.send(ConnectionEvent {
            generation: self.generation,
            kind,
        });
    }
}

/// A channel-level error tagged with the channel epoch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFault {
    pub epoch: u64,
    pub reason: String,
}

/// Where a channel reports its errors.
#[derive(Debug, Clone)]
pub struct FaultSink {
    epoch: u64,
    tx: UnboundedSender<ChannelFault>,
}

impl FaultSink {
    pub fn new(epoch: u64, tx: UnboundedSender<ChannelFault>) -> Self {
        FaultSink { epoch, tx }
    }

    pub fn report(&self, reason: String) {
        let _ = self.tx.send(ChannelFault {
            epoch: self.epoch,
            reason,
        });
    }
}

/// Establishes broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Routes shutdown / blocked / unblocked / callback-exception events to `sink`.
    fn register_events(&self, sink: EventSink);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &PublishProperties,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn register_faults(&self, sink: FaultSink);

    async fn close(&self) -> Result<(), AmqpError>;
}
