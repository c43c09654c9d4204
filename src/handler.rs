// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Application code receives messages through [`ConsumerHandler`]. Every handler
//! registered for a delivery is given the same [`Receipt`]; the delivery is
//! acknowledged when at least one of them calls [`Receipt::mark_received`].
//! Returning `Ok(())` alone does not acknowledge anything.

use crate::{envelope::Envelope, errors::AmqpError};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, receipt: &Receipt) -> Result<(), AmqpError>;
}

/// A delivered envelope plus the "processed" flag shared by its handlers.
#[derive(Debug)]
pub struct Receipt {
    message: Envelope,
    received: AtomicBool,
}

impl Receipt {
    pub fn new(message: Envelope) -> Self {
        Receipt {
            message,
            received: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &Envelope {
        &self.message
    }

    pub fn get_payload<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        self.message.get_payload()
    }

    pub fn payload_json(&self) -> &str {
        self.message.payload_json()
    }

    /// Marks the message as processed; it will be acknowledged.
    pub fn mark_received(&self) {
        self.received.store(true, Ordering::SeqCst);
    }

    pub fn is_received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }
}

/// Adapts a plain closure into a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = FnHandler::arc(|receipt: &Receipt| {
///     let order: Order = receipt.get_payload()?;
///     store(order);
///     receipt.mark_received();
///     Ok(())
/// });
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Receipt) -> Result<(), AmqpError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }

    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(&Receipt) -> Result<(), AmqpError> + Send + Sync + 'static,
{
    async fn exec(&self, _ctx: &Context, receipt: &Receipt) -> Result<(), AmqpError> {
        (self.f)(receipt)
    }
}
