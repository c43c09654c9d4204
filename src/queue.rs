// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing the queues the bus declares and how they are bound to the
//! exchange. Each route gets one queue of the same name, bound with the route as
//! its binding key.

/// Definition of a RabbitMQ queue.
///
/// The bus declares its queues non-durable, non-exclusive and without
/// auto-delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
