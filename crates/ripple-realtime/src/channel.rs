//! A channel: one topic, one socket, many subscriptions.
//!
//! Subscriptions and listeners live in a registry shared with the caller.
//! The socket itself is owned by a background task that is driven through a
//! command queue. The task replays the registry on every successful
//! (re)connect, so subscriptions outlive the connection they were made on.

use anyhow::anyhow;
use ripple_core::RealtimeConfig;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

use crate::connector::{Connector, Transport};
use crate::error::RealtimeError;
use crate::event::{LifecycleEvent, RealtimeEvent};
use crate::frame::{
    Frame, FrameType, PRESENCE_TRACK_EVENT, PRESENCE_UNTRACK_EVENT, socket_url,
};
use crate::subscription::{ChangeFilter, ColumnFilter, Subscription, SubscriptionKind};

pub type EventListener = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;
pub type RawListener = Arc<dyn Fn(&Frame) + Send + Sync>;
pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
        }
    }
}

enum Command {
    Subscribe(Subscription),
    Unsubscribe(Vec<Subscription>),
    Send {
        frame: Frame,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

struct Registered {
    subscription: Subscription,
    listener: EventListener,
}

#[derive(Default)]
struct Registry {
    /// Registration order is replay order.
    subscriptions: Vec<Registered>,
    raw: Vec<(String, RawListener)>,
    lifecycle: Vec<LifecycleListener>,
}

struct ChannelInner {
    topic: String,
    url: Url,
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ChannelState>,
    registry: Mutex<Registry>,
    /// Command queue of the running connection task, if any.
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    reconnect_attempts: AtomicU32,
    next_subscription: AtomicU64,
    next_ref: AtomicU64,
}

/// Handle to a topic. Clones share the same subscriptions and connection.
///
/// Dropping the handle does not close the socket; call
/// [`Channel::disconnect`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .field("subscriptions", &self.inner.registry().subscriptions.len())
            .finish()
    }
}

impl Channel {
    pub fn new(
        topic: impl Into<String>,
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RealtimeError> {
        let topic = topic.into();
        let url = socket_url(&config.url, &topic, config.api_key.as_deref())?;
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Ok(Self {
            inner: Arc::new(ChannelInner {
                topic,
                url,
                config,
                connector,
                state,
                registry: Mutex::new(Registry::default()),
                commands: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                next_subscription: AtomicU64::new(0),
                next_ref: AtomicU64::new(0),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Consecutive failed reconnects since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Registered subscriptions, in registration order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscription_snapshot()
    }

    /// Receive row changes on `table`. `filter` is a `column=op.value`
    /// expression such as `status=eq.open`.
    pub fn on_table_changes<F>(
        &self,
        table: &str,
        change: ChangeFilter,
        filter: Option<&str>,
        listener: F,
    ) -> Result<String, RealtimeError>
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let filter = filter.map(ColumnFilter::parse).transpose()?;
        let kind = SubscriptionKind::TableChanges {
            table: table.to_string(),
            change,
            filter,
        };
        Ok(self.subscribe(kind, Arc::new(listener)))
    }

    pub fn on_stream<F>(&self, stream: &str, listener: F) -> String
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let kind = SubscriptionKind::Stream {
            stream: stream.to_string(),
        };
        self.subscribe(kind, Arc::new(listener))
    }

    /// Receive broadcasts named `event`, or every broadcast for `"*"`.
    pub fn on_broadcast<F>(&self, event: &str, listener: F) -> String
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let kind = SubscriptionKind::Broadcast {
            event: event.to_string(),
        };
        self.subscribe(kind, Arc::new(listener))
    }

    /// Receive every frame whose event name is `event` (`"*"` for all),
    /// whether or not a subscription matched it.
    pub fn on_raw<F>(&self, event: &str, listener: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner
            .registry()
            .raw
            .push((event.to_string(), Arc::new(listener)));
    }

    pub fn on_lifecycle<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.registry().lifecycle.push(Arc::new(listener));
    }

    pub fn presence(&self) -> Presence<'_> {
        Presence { channel: self }
    }

    /// Send a one-off broadcast. No subscription is created.
    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<(), RealtimeError> {
        let frame = Frame::broadcast(&self.inner.topic, self.inner.next_ref(), event, payload);
        self.send_frame(frame).await
    }

    /// Remove one subscription, or all of them when `id` is `None`.
    /// Returns how many were removed.
    pub fn unsubscribe(&self, id: Option<&str>) -> usize {
        let removed: Vec<Subscription> = {
            let mut registry = self.inner.registry();
            match id {
                Some(id) => registry
                    .subscriptions
                    .iter()
                    .position(|r| r.subscription.id == id)
                    .map(|pos| vec![registry.subscriptions.remove(pos).subscription])
                    .unwrap_or_default(),
                None => registry
                    .subscriptions
                    .drain(..)
                    .map(|r| r.subscription)
                    .collect(),
            }
        };

        let count = removed.len();
        if count > 0 {
            tracing::debug!(topic = %self.inner.topic, count, "Subscriptions removed");
            self.inner.notify(Command::Unsubscribe(removed));
        }
        count
    }

    /// Open the socket and replay every registered subscription. Resolves
    /// once the replay has been sent.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let ready = {
            let mut commands = self.inner.commands();
            if commands.as_ref().is_some_and(|tx| !tx.is_closed()) {
                None
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                let (ready_tx, ready_rx) = oneshot::channel();
                *commands = Some(tx);
                self.inner.set_state(ChannelState::Connecting);
                tokio::spawn(run(self.inner.clone(), rx, ready_tx));
                Some(ready_rx)
            }
        };

        match ready {
            Some(ready) => ready
                .await
                .map_err(|_| RealtimeError::Internal(anyhow!("channel task stopped before connecting")))?,
            // Already running, possibly reconnecting.
            None => {
                let mut state = self.inner.state.subscribe();
                let settled = state
                    .wait_for(|s| *s != ChannelState::Connecting)
                    .await
                    .map(|s| *s)
                    .unwrap_or(ChannelState::Disconnected);
                if settled == ChannelState::Connected {
                    Ok(())
                } else {
                    Err(RealtimeError::NotConnected(self.inner.topic.clone()))
                }
            }
        }
    }

    /// Close the socket. Subscriptions are kept for the next `connect()`.
    pub async fn disconnect(&self) {
        let (done, wait) = oneshot::channel();
        if self.inner.notify(Command::Disconnect { done }) {
            let _ = wait.await;
        }
        self.inner.set_state(ChannelState::Disconnected);
    }

    fn subscribe(&self, kind: SubscriptionKind, listener: EventListener) -> String {
        let seq = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription = Subscription::new(format!("sub-{}", seq), kind);
        let id = subscription.id.clone();

        self.inner.registry().subscriptions.push(Registered {
            subscription: subscription.clone(),
            listener,
        });
        tracing::debug!(
            topic = %self.inner.topic,
            subscription = %id,
            event = subscription.kind.event_name(),
            "Subscription registered"
        );

        // Sent now if connected, otherwise replayed on connect.
        self.inner.notify(Command::Subscribe(subscription));
        id
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), RealtimeError> {
        let (reply, result) = oneshot::channel();
        if !self.inner.notify(Command::Send { frame, reply }) {
            return Err(RealtimeError::NotConnected(self.inner.topic.clone()));
        }
        result
            .await
            .map_err(|_| RealtimeError::NotConnected(self.inner.topic.clone()))?
    }
}

/// Presence operations on a channel.
pub struct Presence<'a> {
    channel: &'a Channel,
}

impl Presence<'_> {
    /// Publish this client's presence state.
    pub async fn track(&self, state: Value) -> Result<(), RealtimeError> {
        let inner = &self.channel.inner;
        let frame = Frame::new(
            &inner.topic,
            inner.next_ref(),
            FrameType::Presence,
            PRESENCE_TRACK_EVENT,
            state,
        );
        self.channel.send_frame(frame).await
    }

    pub async fn untrack(&self) -> Result<(), RealtimeError> {
        let inner = &self.channel.inner;
        let frame = Frame::new(
            &inner.topic,
            inner.next_ref(),
            FrameType::Presence,
            PRESENCE_UNTRACK_EVENT,
            json!({}),
        );
        self.channel.send_frame(frame).await
    }

    /// Subscribe to presence-state changes.
    pub fn on_change<F>(&self, listener: F) -> String
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.channel
            .subscribe(SubscriptionKind::Presence, Arc::new(listener))
    }
}

impl ChannelInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commands(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a command for the connection task. False when no task runs.
    fn notify(&self, command: Command) -> bool {
        match self.commands().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    fn next_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn subscription_snapshot(&self) -> Vec<Subscription> {
        self.registry()
            .subscriptions
            .iter()
            .map(|r| r.subscription.clone())
            .collect()
    }

    fn emit(&self, event: &LifecycleEvent) {
        let listeners: Vec<LifecycleListener> = self.registry().lifecycle.clone();
        for listener in &listeners {
            listener(event);
        }
    }

    fn connected(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ChannelState::Connected);
        tracing::info!(topic = %self.topic, "Channel connected");
        self.emit(&LifecycleEvent::Connected);
    }

    fn finish(&self, reason: &str) {
        self.set_state(ChannelState::Disconnected);
        tracing::info!(topic = %self.topic, reason, "Channel disconnected");
        self.emit(&LifecycleEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Route one incoming message to matching subscriptions and raw
    /// listeners.
    fn dispatch(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "Skipping malformed frame");
                return;
            }
        };
        if frame.topic != self.topic {
            tracing::debug!(topic = %self.topic, frame_topic = %frame.topic, "Ignoring frame for another topic");
            return;
        }

        let event = RealtimeEvent::from_frame(&frame);
        let (listeners, raw) = {
            let registry = self.registry();
            let listeners: Vec<EventListener> = match &event {
                Some(event) => registry
                    .subscriptions
                    .iter()
                    .filter(|r| r.subscription.matches(event))
                    .map(|r| r.listener.clone())
                    .collect(),
                None => Vec::new(),
            };
            let raw: Vec<RawListener> = registry
                .raw
                .iter()
                .filter(|(name, _)| name == "*" || *name == frame.event)
                .map(|(_, listener)| listener.clone())
                .collect();
            (listeners, raw)
        };

        if let Some(event) = &event {
            if let RealtimeEvent::Error { message } = event {
                tracing::warn!(topic = %self.topic, message = %message, "Server reported an error");
                self.emit(&LifecycleEvent::Error {
                    message: message.clone(),
                    terminal: false,
                });
            }
            for listener in &listeners {
                listener(event);
            }
        }
        for listener in &raw {
            listener(&frame);
        }
    }
}

enum Attempt {
    Open(Box<dyn Transport>, HashSet<String>),
    Failed(RealtimeError),
    Stopped,
}

enum Exit {
    Stopped,
    Lost(String),
}

/// Connection task. Owns the socket and the set of subscription ids
/// announced on it.
async fn run(
    inner: Arc<ChannelInner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<(), RealtimeError>>,
) {
    let (mut transport, mut sent) = match open(&inner, &mut commands).await {
        Attempt::Open(transport, sent) => (transport, sent),
        Attempt::Failed(err) => {
            tracing::warn!(topic = %inner.topic, error = %err, "Channel failed to connect");
            commands.close();
            inner.set_state(ChannelState::Disconnected);
            inner.emit(&LifecycleEvent::Error {
                message: err.to_string(),
                terminal: false,
            });
            let _ = ready.send(Err(err));
            return;
        }
        Attempt::Stopped => {
            let _ = ready.send(Err(RealtimeError::NotConnected(inner.topic.clone())));
            return;
        }
    };
    inner.connected();
    let _ = ready.send(Ok(()));

    loop {
        match serve(&inner, &mut transport, &mut commands, &mut sent).await {
            Exit::Stopped => return,
            Exit::Lost(reason) => {
                tracing::warn!(topic = %inner.topic, reason = %reason, "Channel connection lost");
                inner.emit(&LifecycleEvent::Disconnected { reason });
                if !inner.config.auto_reconnect {
                    commands.close();
                    inner.set_state(ChannelState::Disconnected);
                    return;
                }
                match reconnect(&inner, &mut commands).await {
                    Some((reopened, announced)) => {
                        transport = reopened;
                        sent = announced;
                        inner.connected();
                    }
                    None => return,
                }
            }
        }
    }
}

/// One connection attempt followed by the subscription replay. Commands
/// arriving meanwhile are answered as if offline.
async fn open(inner: &ChannelInner, commands: &mut mpsc::UnboundedReceiver<Command>) -> Attempt {
    let connecting = inner.connector.connect(&inner.url);
    tokio::pin!(connecting);

    let mut transport = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok(transport) => break transport,
                Err(err) => return Attempt::Failed(err),
            },
            command = commands.recv() => {
                if handle_offline(inner, commands, command) {
                    return Attempt::Stopped;
                }
            }
        }
    };

    let subscriptions = inner.subscription_snapshot();
    let mut sent = HashSet::with_capacity(subscriptions.len());
    for subscription in &subscriptions {
        if let Err(err) = send_subscribe(inner, &mut transport, subscription).await {
            let _ = transport.close().await;
            return Attempt::Failed(err);
        }
        sent.insert(subscription.id.clone());
    }
    tracing::debug!(topic = %inner.topic, count = sent.len(), "Subscriptions replayed");
    Attempt::Open(transport, sent)
}

/// Answer a command while no socket is open. Returns true when the task
/// should stop.
fn handle_offline(
    inner: &ChannelInner,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    command: Option<Command>,
) -> bool {
    match command {
        // Replayed from the registry once connected.
        Some(Command::Subscribe(_)) | Some(Command::Unsubscribe(_)) => false,
        Some(Command::Send { reply, .. }) => {
            let _ = reply.send(Err(RealtimeError::NotConnected(inner.topic.clone())));
            false
        }
        Some(Command::Disconnect { done }) => {
            commands.close();
            inner.finish("client disconnect");
            let _ = done.send(());
            true
        }
        None => {
            inner.set_state(ChannelState::Disconnected);
            true
        }
    }
}

async fn serve(
    inner: &ChannelInner,
    transport: &mut Box<dyn Transport>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    sent: &mut HashSet<String>,
) -> Exit {
    let mut heartbeat = inner.config.heartbeat_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = transport.close().await;
                    inner.finish("channel dropped");
                    return Exit::Stopped;
                };
                match command {
                    Command::Subscribe(subscription) => {
                        if sent.contains(&subscription.id) {
                            continue;
                        }
                        if let Err(err) = send_subscribe(inner, transport, &subscription).await {
                            return Exit::Lost(err.to_string());
                        }
                        sent.insert(subscription.id);
                    }
                    Command::Unsubscribe(removed) => {
                        for subscription in removed {
                            if !sent.remove(&subscription.id) {
                                continue;
                            }
                            let frame = Frame::new(
                                &inner.topic,
                                inner.next_ref(),
                                FrameType::Unsubscribe,
                                subscription.kind.event_name(),
                                json!({"id": subscription.id}),
                            );
                            if let Err(err) = send(transport, &frame).await {
                                return Exit::Lost(err.to_string());
                            }
                        }
                    }
                    Command::Send { frame, reply } => {
                        let result = send(transport, &frame).await;
                        let failure = result.as_ref().err().map(ToString::to_string);
                        let _ = reply.send(result);
                        if let Some(reason) = failure {
                            return Exit::Lost(reason);
                        }
                    }
                    Command::Disconnect { done } => {
                        commands.close();
                        if let Err(err) = transport.close().await {
                            tracing::debug!(topic = %inner.topic, error = %err, "Error while closing socket");
                        }
                        inner.finish("client disconnect");
                        let _ = done.send(());
                        return Exit::Stopped;
                    }
                }
            }

            message = transport.recv() => match message {
                Some(Ok(text)) => inner.dispatch(&text),
                Some(Err(err)) => return Exit::Lost(err.to_string()),
                None => return Exit::Lost("connection closed by server".to_string()),
            },

            _ = tick(&mut heartbeat) => {
                let frame = Frame::heartbeat(&inner.topic, inner.next_ref());
                if let Err(err) = send(transport, &frame).await {
                    return Exit::Lost(err.to_string());
                }
                tracing::trace!(topic = %inner.topic, "Heartbeat sent");
            }
        }
    }
}

/// Retry at a fixed interval until connected, stopped, or out of attempts.
async fn reconnect(
    inner: &ChannelInner,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<(Box<dyn Transport>, HashSet<String>)> {
    let max_attempts = inner.config.max_reconnect_attempts;
    let mut attempt = 0;

    loop {
        if attempt >= max_attempts {
            tracing::error!(topic = %inner.topic, attempts = attempt, "Giving up reconnecting");
            commands.close();
            inner.set_state(ChannelState::Disconnected);
            inner.emit(&LifecycleEvent::Error {
                message: format!("gave up reconnecting after {} attempts", attempt),
                terminal: true,
            });
            return None;
        }

        attempt += 1;
        inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
        inner.set_state(ChannelState::Connecting);
        tracing::info!(topic = %inner.topic, attempt, max_attempts, "Reconnecting");
        inner.emit(&LifecycleEvent::Reconnecting { attempt });

        let delay = tokio::time::sleep(inner.config.reconnect_interval());
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                command = commands.recv() => {
                    if handle_offline(inner, commands, command) {
                        return None;
                    }
                }
            }
        }

        match open(inner, commands).await {
            Attempt::Open(transport, sent) => return Some((transport, sent)),
            Attempt::Failed(err) => {
                tracing::warn!(topic = %inner.topic, attempt, error = %err, "Reconnect attempt failed");
                inner.emit(&LifecycleEvent::Error {
                    message: err.to_string(),
                    terminal: false,
                });
            }
            Attempt::Stopped => return None,
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_subscribe(
    inner: &ChannelInner,
    transport: &mut Box<dyn Transport>,
    subscription: &Subscription,
) -> Result<(), RealtimeError> {
    let frame = Frame::new(
        &inner.topic,
        inner.next_ref(),
        FrameType::Subscribe,
        subscription.kind.event_name(),
        subscription.to_payload(),
    );
    send(transport, &frame).await
}

async fn send(transport: &mut Box<dyn Transport>, frame: &Frame) -> Result<(), RealtimeError> {
    transport.send(frame.to_text()?).await
}
