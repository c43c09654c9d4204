// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Connection
//!
//! [`PersistentConnection`] owns the single broker connection of a publisher or
//! subscriber and keeps it alive:
//!
//! - connection attempts are serialized by one lock; a caller that waited for an
//!   attempt in flight reuses its outcome instead of connecting again,
//! - transient failures are retried forever with a fixed wait,
//! - every connection reports its events into an [`EventSink`]; a supervisor task
//!   drains them and re-enters the retry loop,
//! - reconnecting after a failure broadcasts a "recovered" notification so
//!   channel owners can rebuild whatever was bound to the old connection.

use crate::{
    amqp::LapinConnector,
    client::{
        BrokerChannel, BrokerConnection, BrokerConnector, ConnectionEvent, ConnectionEventKind,
        EventSink,
    },
    config::RabbitMQConfigs,
    errors::AmqpError,
    retry::RetryPolicy,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Default wait between two connection attempts.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(15);

/// Observable state of a [`PersistentConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been established yet, or it was closed
    NotConnected,
    Connected,
    /// The last connection was lost, or the last attempt failed for good
    Failed,
}

/// Connection supervisor shared by every publisher and subscriber built on it.
pub struct PersistentConnection {
    uri: String,
    connector: Arc<dyn BrokerConnector>,
    policy: RetryPolicy,
    /// Serializes every connection state transition.
    transition: Mutex<()>,
    current: watch::Sender<Option<Arc<dyn BrokerConnection>>>,
    generation: AtomicU64,
    failed: AtomicBool,
    disposed: AtomicBool,
    recovered: broadcast::Sender<()>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl PersistentConnection {
    /// Creates the supervisor without connecting. Must be called inside a tokio
    /// runtime: the event supervisor task is spawned here.
    ///
    /// # Parameters
    /// * `uri` - AMQP URI of the broker
    /// * `connector` - Broker client used for every connection attempt
    /// * `reconnect_wait` - Fixed wait between two connection attempts
    ///
    /// # Returns
    /// The supervisor, in [`ConnectionState::NotConnected`]
    pub fn new(
        uri: &str,
        connector: Arc<dyn BrokerConnector>,
        reconnect_wait: Duration,
    ) -> Arc<PersistentConnection> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (recovered, _) = broadcast::channel(16);
        let (current, _) = watch::channel(None);

        let conn = Arc::new(PersistentConnection {
            uri: uri.to_owned(),
            connector,
            policy: RetryPolicy::forever(reconnect_wait),
            transition: Mutex::new(()),
            current,
            generation: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            recovered,
            events,
        });

        tokio::spawn(supervise(Arc::downgrade(&conn), events_rx));

        conn
    }

    /// Supervisor for the broker described by `cfg`, connecting through lapin.
    pub fn from_configs(cfg: &RabbitMQConfigs) -> Arc<PersistentConnection> {
        PersistentConnection::new(
            &cfg.uri(),
            LapinConnector::new(&cfg.connection_name),
            cfg.reconnect_wait(),
        )
    }

    pub fn is_connected(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
            && self
                .current
                .borrow()
                .as_ref()
                .is_some_and(|conn| conn.is_open())
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.failed.load(Ordering::SeqCst) {
            ConnectionState::Failed
        } else {
            ConnectionState::NotConnected
        }
    }

    /// Increments with every connection established; `0` before the first one.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Notified once every time a connection is re-established after a failure.
    pub fn on_recovered(&self) -> broadcast::Receiver<()> {
        self.recovered.subscribe()
    }

    /// Connects to the broker, waiting out transient failures for as long as it
    /// takes. Returns `false` on a non-retriable failure or after [`close`].
    ///
    /// [`close`]: PersistentConnection::close
    pub async fn try_connect(&self) -> bool {
        info!("trying to connect to rabbitmq...");
        let _transition = self.transition.lock().await;

        if self.disposed.load(Ordering::SeqCst) {
            info!("rabbitmq client was closed, no further action will be taken");
            return false;
        }

        if self.is_connected() {
            return true;
        }

        // A handle that is still installed but no longer open died before the
        // supervisor got to its event; this attempt is the recovery.
        if let Some(stale) = self.current.send_replace(None) {
            warn!("rabbitmq connection lost, reconnecting...");
            self.failed.store(true, Ordering::SeqCst);
            release(stale).await;
        }

        let this = self;
        let result = self
            .policy
            .execute("rabbitmq connect", move || async move {
                if this.disposed.load(Ordering::SeqCst) {
                    return Err(AmqpError::ConnectionClosed);
                }
                this.connector.connect(&this.uri).await
            })
            .await;

        let conn = match result {
            Ok(conn) => conn,
            Err(AmqpError::ConnectionClosed) => {
                info!("rabbitmq client was closed, no further action will be taken");
                return false;
            }
            Err(err) => {
                error!(error = err.to_string(), "could not connect to rabbitmq");
                self.failed.store(true, Ordering::SeqCst);
                return false;
            }
        };

        if self.disposed.load(Ordering::SeqCst) {
            release(conn).await;
            return false;
        }

        if !conn.is_open() {
            error!("could not connect to rabbitmq");
            self.failed.store(true, Ordering::SeqCst);
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        conn.register_events(EventSink::new(generation, self.events.clone()));
        self.current.send_replace(Some(conn));

        // `close` may have run between the check above and the install.
        if self.disposed.load(Ordering::SeqCst) {
            if let Some(conn) = self.current.send_replace(None) {
                release(conn).await;
            }
            return false;
        }

        info!(generation, "rabbitmq client acquired a persistent connection");

        if self.failed.load(Ordering::SeqCst) {
            info!("rabbitmq connection recovered after failure");
            let _ = self.recovered.send(());
            self.failed.store(false, Ordering::SeqCst);
        }

        true
    }

    /// Opens a channel on the live connection, connecting first if needed.
    ///
    /// # Returns
    /// The new channel, or `ConnectionError` when no connection could be made
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            self.try_connect().await;
        }

        let conn = self.current.borrow().clone();
        match conn {
            Some(conn) if self.is_connected() => conn.create_channel().await,
            _ => {
                error!("no rabbitmq connection available to open a channel");
                Err(AmqpError::ConnectionError)
            }
        }
    }

    /// Releases the connection. Only the first call has an effect; afterwards
    /// broker events no longer trigger reconnects.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(conn) = self.current.send_replace(None) {
            if let Err(err) = conn.close().await {
                error!(error = err.to_string(), "failure to close rabbitmq connection");
            }
        }
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match &event.kind {
            ConnectionEventKind::Shutdown(reason) => {
                warn!(reason = %reason, "rabbitmq connection shut down, trying to reconnect...")
            }
            ConnectionEventKind::CallbackException(reason) => {
                warn!(reason = %reason, "rabbitmq connection error, trying to reconnect...")
            }
            ConnectionEventKind::Blocked(reason) => {
                warn!(reason = %reason, "rabbitmq connection blocked, trying to reconnect...")
            }
            ConnectionEventKind::Unblocked => {
                warn!("rabbitmq connection unblocked, trying to reconnect...")
            }
        }

        if self.disposed.load(Ordering::SeqCst) {
            info!("rabbitmq client was closed, no further action will be taken");
            return;
        }

        {
            let _transition = self.transition.lock().await;

            if event.generation != self.generation.load(Ordering::SeqCst) {
                debug!(
                    generation = event.generation,
                    "ignoring event of a superseded connection"
                );
                return;
            }

            self.failed.store(true, Ordering::SeqCst);
            if let Some(old) = self.current.send_replace(None) {
                release(old).await;
            }
        }

        self.try_connect().await;
    }
}

async fn release(conn: Arc<dyn BrokerConnection>) {
    if let Err(err) = conn.close().await {
        debug!(error = err.to_string(), "closing a dropped connection failed");
    }
}

/// Drains broker events for as long as the supervisor is alive.
async fn supervise(
    conn: Weak<PersistentConnection>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(conn) = conn.upgrade() else {
            break;
        };
        conn.handle_event(event).await;
    }
}
