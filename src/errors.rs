// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Bus
//!
//! This module provides the error type shared by every layer of the bus: the
//! connection supervisor, topology declaration, publishing and the consume path.
//! The `AmqpError` enum also classifies which failures are worth retrying.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carrying a `String` keep the broker client's own description of the
/// failure so it can be logged at the point where the error is finally handled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker could not be reached (refused, unresolvable, not ready)
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// A socket level failure while talking to the broker
    #[error("socket failure: {0}")]
    SocketError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The connection supervisor was shut down
    #[error("connection closed")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// A required argument was missing or empty
    #[error("invalid argument `{0}`")]
    ArgumentError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error encoding or decoding an envelope or its payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// A consumer handler failed to process a message
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the failure is a connectivity blip worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::BrokerUnreachable(_) | AmqpError::SocketError(_)
        )
    }
}
