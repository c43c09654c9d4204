// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Channel Management
//!
//! [`ChannelBase`] owns the long-lived consumer channel shared by a subscriber.
//! The channel is never repaired: after a broker-reported channel error, or
//! after the connection comes back from a failure, it is closed and replaced
//! by a fresh one on which the exchange and every route declared so far are
//! declared again.
//!
//! Each replacement gets a new epoch. Consumers watch [`ChannelBase::watch`]
//! and re-attach whenever the epoch changes.

use crate::{
    client::{BrokerChannel, ChannelFault, FaultSink},
    connection::PersistentConnection,
    errors::AmqpError,
    topology::{declare_exchange, declare_topology},
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch, Mutex,
};
use tracing::{debug, error, info, warn};

/// The consumer channel together with the epoch it was created in.
#[derive(Clone)]
pub struct ConsumerChannel {
    pub epoch: u64,
    pub channel: Arc<dyn BrokerChannel>,
}

/// Owner of the consumer channel and of the routes declared on it.
pub struct ChannelBase {
    exchange: String,
    connection: Arc<PersistentConnection>,
    /// Held while the channel is replaced or a route is declared on it.
    rebuild: Mutex<()>,
    routes: Mutex<Vec<String>>,
    current: watch::Sender<Option<ConsumerChannel>>,
    /// Connection generation the current channel was opened on.
    built_on: AtomicU64,
    epochs: AtomicU64,
    closed: AtomicBool,
    faults: mpsc::UnboundedSender<ChannelFault>,
}

impl ChannelBase {
    /// Opens the consumer channel and declares `exchange` on it. Connects
    /// first when `connection` is not connected yet.
    ///
    /// # Parameters
    /// * `exchange` - Name of the direct exchange every route is bound to
    /// * `connection` - Supervisor providing the connection
    ///
    /// # Returns
    /// The base with its first channel (epoch 1), or `ArgumentError` for a
    /// blank exchange name
    pub async fn new(
        exchange: &str,
        connection: Arc<PersistentConnection>,
    ) -> Result<Arc<ChannelBase>, AmqpError> {
        if exchange.trim().is_empty() {
            return Err(AmqpError::ArgumentError(
                "exchange name must not be empty".to_owned(),
            ));
        }

        let recovered = connection.on_recovered();
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let (current, _) = watch::channel(None);

        let base = Arc::new(ChannelBase {
            exchange: exchange.to_owned(),
            connection,
            rebuild: Mutex::new(()),
            routes: Mutex::new(vec![]),
            current,
            built_on: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            faults,
        });

        {
            let _rebuild = base.rebuild.lock().await;
            base.recreate().await?;
        }

        tokio::spawn(supervise(Arc::downgrade(&base), recovered, faults_rx));

        Ok(base)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn connection(&self) -> &Arc<PersistentConnection> {
        &self.connection
    }

    /// The current consumer channel, if one is open.
    pub fn channel(&self) -> Option<ConsumerChannel> {
        self.current.borrow().clone()
    }

    /// Follows channel replacements. `None` once the base is closed.
    pub fn watch(&self) -> watch::Receiver<Option<ConsumerChannel>> {
        self.current.subscribe()
    }

    /// Declares the queue and binding for `route` on the consumer channel and
    /// remembers the route so it is declared again on every new channel.
    pub async fn declare(&self, route: &str) -> Result<(), AmqpError> {
        let _rebuild = self.rebuild.lock().await;

        let Some(current) = self.channel() else {
            return Err(AmqpError::ChannelError(
                "consumer channel is not available".to_owned(),
            ));
        };

        declare_topology(current.channel.as_ref(), &self.exchange, route).await?;

        let mut routes = self.routes.lock().await;
        if !routes.iter().any(|known| known == route) {
            routes.push(route.to_owned());
        }

        Ok(())
    }

    /// Closes the consumer channel. The base does not rebuild it afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _rebuild = self.rebuild.lock().await;
        if let Some(old) = self.current.send_replace(None) {
            if let Err(err) = old.channel.close().await {
                error!(error = err.to_string(), "failure to close consumer channel");
            }
        }
    }

    /// Replaces the consumer channel. Callers hold `rebuild`.
    async fn recreate(&self) -> Result<(), AmqpError> {
        debug!("creating rabbitmq consumer channel...");

        let channel = self.connection.open_channel().await?;
        let generation = self.connection.generation();

        if let Err(err) = self.declare_all(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                debug!(error = close_err.to_string(), "closing a half-built channel failed");
            }
            return Err(err);
        }

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        channel.register_faults(FaultSink::new(epoch, self.faults.clone()));
        self.built_on.store(generation, Ordering::SeqCst);

        let old = self
            .current
            .send_replace(Some(ConsumerChannel { epoch, channel }));
        if let Some(old) = old {
            if let Err(err) = old.channel.close().await {
                debug!(error = err.to_string(), "closing the replaced channel failed");
            }
        }

        debug!(epoch, "rabbitmq consumer channel created");
        Ok(())
    }

    async fn declare_all(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        declare_exchange(channel, &self.exchange).await?;

        let routes = self.routes.lock().await.clone();
        for route in &routes {
            declare_topology(channel, &self.exchange, route).await?;
        }

        Ok(())
    }

    async fn handle_recovered(&self) {
        let _rebuild = self.rebuild.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if self.channel().is_some()
            && self.built_on.load(Ordering::SeqCst) == self.connection.generation()
        {
            debug!("consumer channel already lives on the recovered connection");
            return;
        }

        info!("rabbitmq connection recovered, recreating consumer channel...");
        if let Err(err) = self.recreate().await {
            error!(error = err.to_string(), "failure to recreate consumer channel");
        }
    }

    async fn handle_fault(&self, fault: ChannelFault) {
        let _rebuild = self.rebuild.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let current = self.channel().map(|current| current.epoch);
        if current != Some(fault.epoch) {
            debug!(epoch = fault.epoch, "ignoring fault of a superseded channel");
            return;
        }

        warn!(
            reason = %fault.reason,
            "rabbitmq consumer channel failed, recreating..."
        );

        if !self.connection.is_connected() {
            debug!("connection is down, the channel is rebuilt once it recovers");
            return;
        }

        if let Err(err) = self.recreate().await {
            error!(error = err.to_string(), "failure to recreate consumer channel");
        }
    }
}

/// Rebuilds the channel on recovery and on faults while the base is alive.
async fn supervise(
    base: Weak<ChannelBase>,
    mut recovered: broadcast::Receiver<()>,
    mut faults: mpsc::UnboundedReceiver<ChannelFault>,
) {
    loop {
        tokio::select! {
            signal = recovered.recv() => {
                if let Err(RecvError::Closed) = signal {
                    break;
                }
                let Some(base) = base.upgrade() else {
                    break;
                };
                base.handle_recovered().await;
            }
            fault = faults.recv() => {
                let (Some(fault), Some(base)) = (fault, base.upgrade()) else {
                    break;
                };
                base.handle_fault(fault).await;
            }
        }
    }
}
