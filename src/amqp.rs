// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Client
//!
//! This module implements the broker client surface on top of `lapin`. It is the
//! only place in the crate that knows about lapin types: connections, channels,
//! field tables and lapin's error enum are all translated here.

use crate::{
    client::{
        BrokerChannel, BrokerConnection, BrokerConnector, ConnectionEventKind, Delivery,
        DeliveryStream, EventSink, FaultSink, PublishProperties,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Maps a lapin error onto the bus taxonomy. I/O failures and connections that
/// are not (yet) usable are transient; everything else is reported through
/// `fallback`.
fn classify(err: lapin::Error, fallback: impl FnOnce(String) -> AmqpError) -> AmqpError {
    match err {
        lapin::Error::IOError(io) => AmqpError::SocketError(io.to_string()),
        lapin::Error::InvalidConnectionState(state) => {
            AmqpError::BrokerUnreachable(format!("connection state {:?}", state))
        }
        other => fallback(other.to_string()),
    }
}

/// Opens lapin connections.
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> Arc<LapinConnector> {
        Arc::new(LapinConnector {
            connection_name: connection_name.to_owned(),
        })
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = Connection::connect(uri, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            classify(err, |_| AmqpError::ConnectionError)
        })?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(classify(err, AmqpError::ChannelError))
            }
        }
    }

    fn register_events(&self, sink: EventSink) {
        // lapin reports every connection-level failure (socket closed, heartbeat
        // missed, broker close) through a single error callback.
        self.conn.on_error(move |err| {
            sink.emit(ConnectionEventKind::Shutdown(err.to_string()));
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| classify(err, |_| AmqpError::ConnectionError))
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                classify(err, AmqpError::DeclareExchangeError)
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(classify(err, |_| AmqpError::DeclareQueueError(def.name.clone())))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify(err, |_| {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                }))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &PublishProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_delivery_mode(properties.delivery_mode as u8)
            .with_headers(to_field_table(&properties.headers));

        if let Some(content_type) = &properties.content_type {
            props = props.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(message_id) = &properties.message_id {
            props = props.with_message_id(ShortString::from(message_id.clone()));
        }
        if let Some(kind) = &properties.kind {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory,
                },
                body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(classify(err, AmqpError::PublishingError))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                classify(err, AmqpError::ConsumerError)
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    headers: headers_of(&delivery.properties),
                    data: delivery.data,
                }),
                Err(err) => Err(classify(err, AmqpError::ConsumerError)),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::RequeuingMessageError
            })
    }

    fn register_faults(&self, sink: FaultSink) {
        self.channel.on_error(move |err| sink.report(err.to_string()));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| classify(err, AmqpError::ChannelError))
    }
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.to_lowercase()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    FieldTable::from(btree)
}

/// Extracts the string valued headers of a delivery. Other header types carry
/// nothing the bus reads.
fn headers_of(props: &AMQPProperties) -> BTreeMap<String, String> {
    let Some(table) = props.headers() else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok()
                .map(|value| (key.to_string(), value.to_owned())),
            _ => None,
        })
        .collect()
}
