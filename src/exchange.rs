// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The bus routes every message through a single direct exchange: a message
//! published with routing key `R` reaches only the queues bound with key `R`.
//! This module describes that exchange for the broker client.

/// Definition of the direct exchange of the bus. It is always declared
/// non-durable and without auto-delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
}

impl ExchangeDefinition {
    /// Creates a direct exchange definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
