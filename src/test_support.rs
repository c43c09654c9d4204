// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the client surface for unit tests.
//!
//! It models just enough of a direct exchange: bindings route by exact key,
//! queues hold messages until a consumer exists, delivery tags are checked
//! against the channel that delivered them, and closing a channel (or losing
//! its connection) returns its unacked messages to their queues.

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
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    headers: BTreeMap<String, String>,
    data: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel: usize,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct State {
    connect_failures: usize,
    publish_failures: usize,
    connections: Vec<Arc<FakeConnection>>,
    channels: Vec<Arc<FakeChannel>>,
    exchanges: Vec<String>,
    queues: Vec<String>,
    bindings: HashSet<(String, String, String)>,
    bind_calls: usize,
    pending: HashMap<String, VecDeque<Message>>,
    consumers: HashMap<String, Vec<Consumer>>,
    consume_calls: Vec<(String, usize)>,
    unacked: HashMap<u64, (usize, String, Message)>,
    next_tag: u64,
    published: Vec<Published>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
}

impl State {
    fn enqueue(&mut self, queue: &str, message: Message) {
        let consumers = self.consumers.entry(queue.to_owned()).or_default();
        consumers.retain(|consumer| !consumer.tx.is_closed());

        let Some(consumer) = consumers.first() else {
            self.pending
                .entry(queue.to_owned())
                .or_default()
                .push_back(message);
            return;
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            delivery_tag: tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            headers: message.headers.clone(),
            data: message.data.clone(),
        };
        let channel = consumer.channel;
        let _ = consumer.tx.send(Ok(delivery));
        self.unacked.insert(tag, (channel, queue.to_owned(), message));
    }

    fn owns(&self, channel: usize, delivery_tag: u64) -> bool {
        self.unacked
            .get(&delivery_tag)
            .is_some_and(|(owner, _, _)| *owner == channel)
    }

    fn close_channel(&mut self, channel: usize) {
        for consumers in self.consumers.values_mut() {
            consumers.retain(|consumer| consumer.channel != channel);
        }

        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _, _))| *owner == channel)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in orphaned {
            if let Some((_, queue, mut message)) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.pending.entry(queue).or_default().push_back(message);
            }
        }
    }
}

pub(crate) struct FakeBroker {
    me: Weak<FakeBroker>,
    state: Mutex<State>,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new_cyclic(|me| FakeBroker {
            me: me.clone(),
            state: Mutex::new(State::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// A channel that is not tied to any connection.
    pub fn channel(self: &Arc<Self>) -> Arc<dyn BrokerChannel> {
        self.open_channel(None)
    }

    fn open_channel(self: &Arc<Self>, connection: Option<usize>) -> Arc<FakeChannel> {
        let mut state = self.state();
        let channel = Arc::new(FakeChannel {
            id: state.channels.len(),
            connection,
            broker: self.clone(),
            closed: AtomicBool::new(false),
            faults: Mutex::new(None),
        });
        state.channels.push(channel.clone());
        channel
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.state().publish_failures = count;
    }

    /// Kills the newest connection the way a broker outage would.
    pub fn drop_connection(&self, kind: ConnectionEventKind) {
        let conn = {
            let mut state = self.state();
            let Some(conn) = state.connections.last().cloned() else {
                return;
            };
            let index = state.connections.len() - 1;
            let channels: Vec<usize> = state
                .channels
                .iter()
                .filter(|channel| channel.connection == Some(index))
                .map(|channel| channel.id)
                .collect();
            for id in channels {
                state.channels[id].closed.store(true, Ordering::SeqCst);
                state.close_channel(id);
            }
            conn
        };

        conn.open.store(false, Ordering::SeqCst);
        if let Some(sink) = conn.sink.lock().unwrap().as_ref() {
            sink.emit(kind);
        };
    }

    /// Reports a channel-level error on channel `id` and closes it.
    pub fn fault_channel(&self, id: usize, reason: &str) {
        let channel = {
            let mut state = self.state();
            let channel = state.channels[id].clone();
            channel.closed.store(true, Ordering::SeqCst);
            state.close_channel(id);
            channel
        };

        if let Some(sink) = channel.faults.lock().unwrap().as_ref() {
            sink.report(reason.to_owned());
        };
    }

    pub fn connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels.len()
    }

    pub fn open_channels(&self) -> Vec<usize> {
        self.state()
            .channels
            .iter()
            .filter(|channel| !channel.closed.load(Ordering::SeqCst))
            .map(|channel| channel.id)
            .collect()
    }

    pub fn exchanges_declared(&self) -> Vec<String> {
        self.state().exchanges.clone()
    }

    pub fn queues_declared(&self) -> Vec<String> {
        self.state().queues.clone()
    }

    pub fn bind_calls(&self) -> usize {
        self.state().bind_calls
    }

    pub fn is_bound(&self, exchange: &str, key: &str, queue: &str) -> bool {
        self.state()
            .bindings
            .contains(&(exchange.to_owned(), key.to_owned(), queue.to_owned()))
    }

    /// `(queue, channel)` for every consumer ever started.
    pub fn consume_calls(&self) -> Vec<(String, usize)> {
        self.state().consume_calls.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state().nacks.clone()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.state().pending.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    /// Pushes raw bytes to `queue` as if they had been routed there.
    pub fn inject(&self, queue: &str, routing_key: &str, data: &[u8]) {
        self.state().enqueue(
            queue,
            Message {
                exchange: String::new(),
                routing_key: routing_key.to_owned(),
                headers: BTreeMap::new(),
                data: data.to_vec(),
                redelivered: false,
            },
        );
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(AmqpError::BrokerUnreachable("connection refused".into()));
        }

        let conn = Arc::new(FakeConnection {
            index: state.connections.len(),
            broker: self.me.clone(),
            open: AtomicBool::new(true),
            sink: Mutex::new(None),
        });
        state.connections.push(conn.clone());
        Ok(conn)
    }
}

pub(crate) struct FakeConnection {
    index: usize,
    broker: Weak<FakeBroker>,
    open: AtomicBool,
    sink: Mutex<Option<EventSink>>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.broker.upgrade() {
            Some(broker) if self.is_open() => Ok(broker.open_channel(Some(self.index))),
            _ => Err(AmqpError::ChannelError("connection closed".into())),
        }
    }

    fn register_events(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    id: usize,
    connection: Option<usize>,
    broker: Arc<FakeBroker>,
    closed: AtomicBool,
    faults: Mutex<Option<FaultSink>>,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError(format!("channel {} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state().exchanges.push(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state().queues.push(def.name().to_owned());
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.bind_calls += 1;
        state.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
            binding.queue_name().to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &PublishProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(AmqpError::SocketError("connection reset by peer".into()));
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            properties: properties.clone(),
            body: body.to_vec(),
        });

        let queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, key, _)| ex == exchange && key == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for queue in queues {
            state.enqueue(
                &queue,
                Message {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    headers: properties.headers.clone(),
                    data: body.to_vec(),
                    redelivered: false,
                },
            );
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.broker.state();
        state.consume_calls.push((queue.to_owned(), self.id));
        state
            .consumers
            .entry(queue.to_owned())
            .or_default()
            .push(Consumer { channel: self.id, tx });

        let backlog: Vec<Message> = state
            .pending
            .get_mut(queue)
            .map(|pending| pending.drain(..).collect())
            .unwrap_or_default();
        for message in backlog {
            state.enqueue(queue, message);
        }

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::AckMessageError)?;
        let mut state = self.broker.state();
        if !state.owns(self.id, delivery_tag) {
            return Err(AmqpError::AckMessageError);
        }

        state.unacked.remove(&delivery_tag);
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()
            .map_err(|_| AmqpError::RequeuingMessageError)?;
        let mut state = self.broker.state();
        if !state.owns(self.id, delivery_tag) {
            return Err(AmqpError::RequeuingMessageError);
        }

        state.nacks.push((delivery_tag, requeue));
        if let Some((_, queue, mut message)) = state.unacked.remove(&delivery_tag) {
            if requeue {
                message.redelivered = true;
                state.enqueue(&queue, message);
            }
        }
        Ok(())
    }

    fn register_faults(&self, sink: FaultSink) {
        *self.faults.lock().unwrap() = Some(sink);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}
