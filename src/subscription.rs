// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Maps a `(queue, payload type)` pair to the handlers registered for it. The
//! registry is a plain in-memory table owned by one subscriber; it performs no
//! I/O and survives any number of reconnects.

use crate::handler::{ConsumerHandler, Receipt};
use futures_util::FutureExt;
use opentelemetry::Context;
use std::{collections::HashMap, fmt, panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::RwLock;
use tracing::warn;

/// Routing identity of a subscription: `queue-payload_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(queue: &str, payload_type: &str) -> Self {
        SubscriptionKey(format!("{}-{}", queue, payload_type))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The handlers registered under one key, in registration order.
#[derive(Clone)]
pub struct Subscription {
    key: SubscriptionKey,
    handlers: Vec<Arc<dyn ConsumerHandler>>,
}

impl Subscription {
    fn new(key: SubscriptionKey, handler: Arc<dyn ConsumerHandler>) -> Self {
        Subscription {
            key,
            handlers: vec![handler],
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Hands `receipt` to every handler in turn and reports whether any of them
    /// marked it received. A failing or panicking handler is logged and skipped.
    pub async fn dispatch(&self, ctx: &Context, receipt: &Receipt) -> bool {
        for (index, handler) in self.handlers.iter().enumerate() {
            match AssertUnwindSafe(handler.exec(ctx, receipt))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    error = err.to_string(),
                    subscription = %self.key,
                    handler = index,
                    "handler failed to process message"
                ),
                Err(_) => warn!(
                    subscription = %self.key,
                    handler = index,
                    "handler panicked while processing message"
                ),
            }
        }

        receipt.is_received()
    }
}

/// Subscription table of a single subscriber.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionKey, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::default())
    }

    /// Adds `handler` under `(queue, payload_type)`. Returns `true` when the key
    /// was not registered before.
    pub async fn register(
        &self,
        queue: &str,
        payload_type: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> bool {
        let key = SubscriptionKey::new(queue, payload_type);
        let mut subscriptions = self.subscriptions.write().await;

        match subscriptions.get_mut(&key) {
            Some(existing) => {
                existing.handlers.push(handler);
                false
            }
            None => {
                subscriptions.insert(key.clone(), Subscription::new(key, handler));
                true
            }
        }
    }

    /// Snapshot of the subscription for `(queue, payload_type)`, if any.
    pub async fn get(&self, queue: &str, payload_type: &str) -> Option<Subscription> {
        self.subscriptions
            .read()
            .await
            .get(&SubscriptionKey::new(queue, payload_type))
            .cloned()
    }
}
