// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Connection Core
//!
//! One [`ConnectionCore`] per broker URI, shared by every consumer and
//! producer talking to that broker. It owns the connection state machine,
//! the reconnection loop with full-jitter exponential backoff, the
//! registered-channel set whose setup functions re-run after each reconnect,
//! and the lifecycle event bus.
//!
//! Concurrent `get_connection` callers park on a watch channel and all
//! observe the same connection (or the same terminal error); state
//! transitions are serialized behind one mutex that is never held across an
//! await point.

use crate::amqp::AmqpTransport;
use crate::classify::{classify, severity, Severity};
use crate::errors::ClientError;
use crate::events::{ClientEvent, EventBus};
use crate::transport::{BrokerChannel, BrokerConnection, ConnectOptions, Transport};
use futures_util::future::BoxFuture;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Governs the reconnection loop and the per-attempt connect timer.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// `None` means unbounded.
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: true,
            max_attempts: None,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        ReconnectPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }
}

/// Options for a [`ConnectionCore`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub connection_name: Option<String>,
    pub heartbeat: Option<u16>,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionOptions {
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    pub fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = Some(seconds);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Connection state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Channel setup closure re-invoked after every reconnection. Must be
/// idempotent over broker state.
pub type ChannelSetup =
    Arc<dyn Fn(Arc<dyn BrokerChannel>) -> BoxFuture<'static, Result<(), ClientError>> + Send + Sync>;

pub(crate) struct RegisteredChannel {
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    setup: Option<ChannelSetup>,
}

/// Handle to a registered channel. The underlying channel reference is
/// swapped transparently when the core rebuilds it after a reconnect.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<RegisteredChannel>,
}

impl ChannelHandle {
    /// The live channel, or `None` while it is being rebuilt.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.inner.channel.lock().unwrap().clone()
    }

    /// The live channel, or [`ClientError::NotConnected`].
    pub fn require(&self) -> Result<Arc<dyn BrokerChannel>, ClientError> {
        self.channel().ok_or(ClientError::NotConnected)
    }
}

struct Inner {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    attempts: u32,
    last_error: Option<ClientError>,
    reconnect_task: Option<JoinHandle<()>>,
}

/// The per-URI connection singleton.
pub struct ConnectionCore {
    uri: String,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    channels: Mutex<Vec<Arc<RegisteredChannel>>>,
    closing: AtomicBool,
    close_notify: Notify,
    state_tx: watch::Sender<u32>,
    events: EventBus,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<ConnectionCore>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<ConnectionCore>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

impl ConnectionCore {
    /// Builds an unregistered core over an explicit transport.
    pub fn new(
        uri: &str,
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
    ) -> Arc<ConnectionCore> {
        let (state_tx, _) = watch::channel(0);
        Arc::new(ConnectionCore {
            uri: uri.to_owned(),
            options,
            transport,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                connection: None,
                attempts: 0,
                last_error: None,
                reconnect_task: None,
            }),
            channels: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
            state_tx,
            events: EventBus::new(),
        })
    }

    /// The shared core for `uri`, created over the lapin transport on first
    /// use. Options are honored only by the call that creates the instance.
    pub fn get(uri: &str, options: ConnectionOptions) -> Arc<ConnectionCore> {
        Self::get_with_transport(uri, options, Arc::new(AmqpTransport::new()))
    }

    /// Like [`ConnectionCore::get`] with an explicit transport.
    pub fn get_with_transport(
        uri: &str,
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
    ) -> Arc<ConnectionCore> {
        let mut map = registry().lock().unwrap();
        map.entry(uri.to_owned())
            .or_insert_with(|| ConnectionCore::new(uri, options, transport))
            .clone()
    }

    /// Closes and drops the shared core for `uri`, if any.
    pub async fn reset(uri: &str) {
        let core = registry().lock().unwrap().remove(uri);
        if let Some(core) = core {
            core.close().await;
        }
    }

    /// Closes and drops every shared core.
    pub async fn reset_all() {
        let cores: Vec<_> = registry().lock().unwrap().drain().map(|(_, c)| c).collect();
        for core in cores {
            core.close().await;
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// Reconnection attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn bump(&self) {
        self.state_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn closed_error(&self) -> ClientError {
        ClientError::ConnectionError {
            message: "connection core is closed".to_owned(),
            code: None,
        }
    }

    /// Waits until the core is connected and returns the live connection.
    ///
    /// Callers arriving while a connect or reconnect is in flight park until
    /// the next transition; they all see the same connection, or the error
    /// that ended the attempt.
    pub async fn get_connection(
        self: &Arc<Self>,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        enum Step {
            Ready(Arc<dyn BrokerConnection>),
            Dial,
            Wait,
        }

        loop {
            if self.is_closing() {
                return Err(self.closed_error());
            }
            let mut rx = self.state_tx.subscribe();
            let step = {
                let mut inner = self.inner.lock().unwrap();
                match inner.state {
                    ConnectionState::Connected => match inner.connection.clone() {
                        Some(conn) => Step::Ready(conn),
                        None => Step::Wait,
                    },
                    ConnectionState::Connecting | ConnectionState::Reconnecting => Step::Wait,
                    ConnectionState::Disconnected => {
                        inner.state = ConnectionState::Connecting;
                        inner.last_error = None;
                        Step::Dial
                    }
                }
            };
            match step {
                Step::Ready(conn) => return Ok(conn),
                Step::Dial => {
                    self.bump();
                    if let Some(conn) = self.dial().await? {
                        return Ok(conn);
                    }
                }
                Step::Wait => {
                    if rx.changed().await.is_err() {
                        return Err(self.closed_error());
                    }
                    let woke_error = {
                        let inner = self.inner.lock().unwrap();
                        if inner.state == ConnectionState::Disconnected {
                            inner.last_error.clone()
                        } else {
                            None
                        }
                    };
                    if let Some(err) = woke_error {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Runs one initial connect attempt. Returns `Ok(None)` when the failure
    /// was handed to the reconnect loop and the caller should keep waiting.
    async fn dial(self: &Arc<Self>) -> Result<Option<Arc<dyn BrokerConnection>>, ClientError> {
        match self.connect_with_timeout().await {
            Ok(conn) => {
                self.install_connection_watch(&conn);
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.state = ConnectionState::Connected;
                    inner.connection = Some(conn.clone());
                    inner.attempts = 0;
                    inner.last_error = None;
                }
                self.bump();
                info!(uri = self.uri.as_str(), "connected");
                self.events.emit(ClientEvent::Connected);
                Ok(Some(conn))
            }
            Err(err) => {
                let terminal = severity(&err).is_terminal();
                if !terminal && self.options.reconnect.enabled && !self.is_closing() {
                    warn!(
                        uri = self.uri.as_str(),
                        error = err.to_string(),
                        "connect failed; scheduling reconnection"
                    );
                    {
                        let mut inner = self.inner.lock().unwrap();
                        inner.state = ConnectionState::Reconnecting;
                    }
                    self.bump();
                    self.spawn_reconnect_loop();
                    Ok(None)
                } else {
                    error!(
                        uri = self.uri.as_str(),
                        error = err.to_string(),
                        "connect failed"
                    );
                    {
                        let mut inner = self.inner.lock().unwrap();
                        inner.state = ConnectionState::Disconnected;
                        inner.last_error = Some(err.clone());
                    }
                    self.bump();
                    if terminal {
                        self.events.emit(ClientEvent::Error(err.clone()));
                    }
                    Err(err)
                }
            }
        }
    }

    /// One connect attempt bounded by the policy's connect timer.
    ///
    /// If the timer fires first the caller gets [`ClientError::ConnectionTimeout`],
    /// and a reaper awaits the in-flight attempt so a late success is closed
    /// instead of leaked. A late failure is discarded.
    async fn connect_with_timeout(&self) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        let transport = self.transport.clone();
        let uri = self.uri.clone();
        let options = ConnectOptions {
            heartbeat: self.options.heartbeat.unwrap_or(60),
            connection_name: self.options.connection_name.clone(),
        };
        let mut attempt = tokio::spawn(async move { transport.connect(&uri, &options).await });

        let limit = Duration::from_millis(self.options.reconnect.connect_timeout_ms);
        match tokio::time::timeout(limit, &mut attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ClientError::InternalError(join_err.to_string())),
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(Ok(conn)) = attempt.await {
                        debug!("closing connection that resolved after the connect timer");
                        let _ = conn.close().await;
                    }
                });
                Err(ClientError::ConnectionTimeout)
            }
        }
    }

    fn install_connection_watch(self: &Arc<Self>, conn: &Arc<dyn BrokerConnection>) {
        let core = Arc::downgrade(self);
        conn.on_close(Box::new(move |reason| {
            if let Some(core) = core.upgrade() {
                tokio::spawn(async move {
                    core.handle_connection_loss(reason).await;
                });
            }
        }));
    }

    async fn handle_connection_loss(self: Arc<Self>, reason: Option<String>) {
        if self.is_closing() {
            return;
        }
        let lost = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ConnectionState::Connected {
                false
            } else {
                inner.state = ConnectionState::Disconnected;
                inner.connection = None;
                true
            }
        };
        if !lost {
            return;
        }
        for rc in self.channels.lock().unwrap().iter() {
            *rc.channel.lock().unwrap() = None;
        }
        self.bump();
        warn!(
            uri = self.uri.as_str(),
            reason = reason.as_deref().unwrap_or("unknown"),
            "connection lost"
        );
        self.events.emit(ClientEvent::Disconnected {
            reason: reason.clone(),
        });

        let recoverable = classify(None, reason.as_deref().unwrap_or("")) == Severity::Recoverable;
        if recoverable && self.options.reconnect.enabled {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.state = ConnectionState::Reconnecting;
            }
            self.bump();
            self.spawn_reconnect_loop();
        } else if !recoverable {
            let err = ClientError::ConnectionError {
                message: reason.unwrap_or_else(|| "connection closed".to_owned()),
                code: None,
            };
            {
                let mut inner = self.inner.lock().unwrap();
                inner.last_error = Some(err.clone());
            }
            self.bump();
            self.events.emit(ClientEvent::Error(err));
        }
    }

    fn spawn_reconnect_loop(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        let running = inner
            .reconnect_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }
        let core = self.clone();
        inner.reconnect_task = Some(tokio::spawn(async move {
            core.reconnect_loop().await;
        }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        enum Plan {
            GiveUp(ClientError),
            Attempt { attempt: u32, delay: Duration },
        }

        loop {
            if self.is_closing() {
                return;
            }
            let plan = {
                let mut inner = self.inner.lock().unwrap();
                match self.options.reconnect.max_attempts {
                    Some(max) if inner.attempts >= max => {
                        inner.state = ConnectionState::Disconnected;
                        let err = ClientError::MaxReconnectAttempts(max);
                        inner.last_error = Some(err.clone());
                        Plan::GiveUp(err)
                    }
                    _ => {
                        let exponent = inner.attempts;
                        inner.attempts += 1;
                        Plan::Attempt {
                            attempt: inner.attempts,
                            delay: full_jitter(&self.options.reconnect, exponent),
                        }
                    }
                }
            };

            match plan {
                Plan::GiveUp(err) => {
                    self.bump();
                    error!(uri = self.uri.as_str(), error = err.to_string(), "giving up");
                    self.events.emit(ClientEvent::Error(err));
                    return;
                }
                Plan::Attempt { attempt, delay } => {
                    info!(
                        uri = self.uri.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect attempt"
                    );
                    self.events.emit(ClientEvent::Reconnecting { attempt, delay });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.close_notify.notified() => return,
                    }
                    if self.is_closing() {
                        return;
                    }
                    {
                        let mut inner = self.inner.lock().unwrap();
                        inner.state = ConnectionState::Connecting;
                    }
                    self.bump();

                    match self.connect_with_timeout().await {
                        Ok(conn) => {
                            self.install_connection_watch(&conn);
                            self.restore_channels(&conn).await;
                            {
                                let mut inner = self.inner.lock().unwrap();
                                inner.state = ConnectionState::Connected;
                                inner.connection = Some(conn);
                                inner.attempts = 0;
                                inner.last_error = None;
                            }
                            self.bump();
                            info!(uri = self.uri.as_str(), "reconnected");
                            self.events.emit(ClientEvent::Reconnected);
                            return;
                        }
                        Err(err) if severity(&err).is_terminal() => {
                            {
                                let mut inner = self.inner.lock().unwrap();
                                inner.state = ConnectionState::Disconnected;
                                inner.last_error = Some(err.clone());
                            }
                            self.bump();
                            error!(
                                uri = self.uri.as_str(),
                                error = err.to_string(),
                                "reconnect failed terminally"
                            );
                            self.events.emit(ClientEvent::Error(err));
                            return;
                        }
                        Err(err) => {
                            warn!(
                                uri = self.uri.as_str(),
                                error = err.to_string(),
                                "reconnect attempt failed"
                            );
                            {
                                let mut inner = self.inner.lock().unwrap();
                                inner.state = ConnectionState::Reconnecting;
                            }
                            self.bump();
                        }
                    }
                }
            }
        }
    }

    /// Reopens every registered channel on the fresh connection and re-runs
    /// its setup. A failing setup is logged; the remaining channels are still
    /// attempted.
    async fn restore_channels(self: &Arc<Self>, conn: &Arc<dyn BrokerConnection>) {
        let channels: Vec<Arc<RegisteredChannel>> =
            self.channels.lock().unwrap().iter().cloned().collect();
        for rc in channels {
            match conn.create_channel().await {
                Ok(channel) => {
                    self.install_channel_watch(&rc, &channel);
                    if let Some(setup) = &rc.setup {
                        if let Err(err) = setup(channel.clone()).await {
                            error!(
                                error = err.to_string(),
                                "channel setup failed after reconnect"
                            );
                            let _ = channel.close().await;
                            continue;
                        }
                    }
                    *rc.channel.lock().unwrap() = Some(channel);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        "failed to reopen channel after reconnect"
                    );
                }
            }
        }
    }

    /// Opens a channel, runs `setup` on it, and registers the pair so the
    /// same setup re-runs automatically after every reconnection.
    pub async fn create_channel(
        self: &Arc<Self>,
        setup: Option<ChannelSetup>,
    ) -> Result<ChannelHandle, ClientError> {
        let conn = self.get_connection().await?;
        let channel = conn.create_channel().await?;
        let rc = Arc::new(RegisteredChannel {
            channel: Mutex::new(Some(channel.clone())),
            setup,
        });
        self.install_channel_watch(&rc, &channel);
        if let Some(setup) = &rc.setup {
            if let Err(err) = setup(channel.clone()).await {
                let _ = channel.close().await;
                return Err(err);
            }
        }
        self.channels.lock().unwrap().push(rc.clone());
        Ok(ChannelHandle { inner: rc })
    }

    /// Removes a channel registration so it is not resurrected on reconnect.
    pub fn unregister_channel(&self, handle: &ChannelHandle) {
        self.channels
            .lock()
            .unwrap()
            .retain(|rc| !Arc::ptr_eq(rc, &handle.inner));
    }

    fn install_channel_watch(
        self: &Arc<Self>,
        rc: &Arc<RegisteredChannel>,
        channel: &Arc<dyn BrokerChannel>,
    ) {
        let core = Arc::downgrade(self);
        let rc = Arc::downgrade(rc);
        channel.on_close(Box::new(move |reason| {
            if let (Some(core), Some(rc)) = (core.upgrade(), rc.upgrade()) {
                tokio::spawn(async move {
                    core.recover_channel(rc, reason).await;
                });
            }
        }));
    }

    /// Channel-level fault while the connection stays up: recreate that one
    /// channel. A single attempt per close event; failures wait for the next
    /// connection-level recovery.
    async fn recover_channel(self: Arc<Self>, rc: Arc<RegisteredChannel>, reason: Option<String>) {
        if self.is_closing() {
            return;
        }
        let registered = self
            .channels
            .lock()
            .unwrap()
            .iter()
            .any(|c| Arc::ptr_eq(c, &rc));
        if !registered {
            return;
        }
        let conn = {
            let inner = self.inner.lock().unwrap();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.connection.clone()
        };
        let Some(conn) = conn else { return };
        warn!(
            reason = reason.as_deref().unwrap_or("unknown"),
            "channel closed unexpectedly; recreating"
        );
        *rc.channel.lock().unwrap() = None;
        match conn.create_channel().await {
            Ok(channel) => {
                self.install_channel_watch(&rc, &channel);
                if let Some(setup) = &rc.setup {
                    if let Err(err) = setup(channel.clone()).await {
                        error!(error = err.to_string(), "channel setup failed on recreation");
                        let _ = channel.close().await;
                        return;
                    }
                }
                *rc.channel.lock().unwrap() = Some(channel);
            }
            Err(err) => {
                error!(error = err.to_string(), "failed to recreate channel");
            }
        }
    }

    /// Marks closing, cancels any pending reconnect timer, closes all
    /// registered channels and the connection, and leaves the core
    /// disconnected. Subsequent `get_connection` calls fail.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        let task = self.inner.lock().unwrap().reconnect_task.take();
        if let Some(task) = task {
            task.abort();
        }
        let channels: Vec<Arc<RegisteredChannel>> =
            self.channels.lock().unwrap().drain(..).collect();
        for rc in channels {
            let channel = rc.channel.lock().unwrap().take();
            if let Some(channel) = channel {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "ignoring channel close failure");
                }
            }
        }
        let conn = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnectionState::Disconnected;
            inner.last_error = None;
            inner.connection.take()
        };
        self.bump();
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                debug!(error = err.to_string(), "ignoring connection close failure");
            }
        }
        info!(uri = self.uri.as_str(), "connection core closed");
    }
}

/// Full jitter: uniform in `[0, min(max_delay, initial * multiplier^n)]`.
fn full_jitter(policy: &ReconnectPolicy, exponent: u32) -> Duration {
    let cap = policy.max_delay_ms as f64;
    let raw = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent as i32);
    let ceiling = raw.min(cap).max(0.0);
    let ms: f64 = rand::thread_rng().gen_range(0.0..=ceiling);
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jitter_stays_under_the_exponential_ceiling() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        for exponent in 0..10 {
            let ceiling = (100.0 * 2.0_f64.powi(exponent)).min(10_000.0) as u128;
            for _ in 0..25 {
                let delay = full_jitter(&policy, exponent as u32);
                assert!(delay.as_millis() <= ceiling, "exponent {exponent}");
            }
        }
    }

    #[test]
    fn full_jitter_caps_at_max_delay() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 2_000,
            backoff_multiplier: 10.0,
            ..Default::default()
        };
        for _ in 0..50 {
            assert!(full_jitter(&policy, 8).as_millis() <= 2_000);
        }
    }

    #[test]
    fn policy_builders_compose() {
        let policy = ReconnectPolicy::default()
            .with_max_attempts(7)
            .with_initial_delay(50)
            .with_max_delay(500)
            .with_multiplier(3.0)
            .with_connect_timeout(250);
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, Some(7));
        assert_eq!(policy.initial_delay_ms, 50);
        assert_eq!(policy.max_delay_ms, 500);
        assert_eq!(policy.backoff_multiplier, 3.0);
        assert_eq!(policy.connect_timeout_ms, 250);
        assert!(!ReconnectPolicy::disabled().enabled);
    }
}
