// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::codec::{ChainTemplate, CodecRegistry, Message};
use crate::network::{
    ConnectionHandler, ConnectionSetup, EventSink, LifecycleEvent, ReconnectEvent,
    ReconnectOutcome,
};
use crate::session::{Session, SessionRegistry};
use crate::strategy::DispatcherBuilder;
use crate::{AppError, AppResult};

use super::{ClientConfig, RateLimitConfig, Shutdown};

/// Opens the outbound TCP stream.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        address: &str,
    ) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'static>>;
}

/// Plain `TcpStream::connect` bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        TcpConnector { timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &str,
    ) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'static>> {
        let address = address.to_string();
        let timeout = self.timeout;
        Box::pin(async move {
            match time::timeout(timeout, TcpStream::connect(&address)).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", address, timeout),
                )),
            }
        })
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    codecs: CodecRegistry,
    handlers: DispatcherBuilder,
    registry: SessionRegistry,
    events: EventSink,
    connector: Option<Arc<dyn Connector>>,
    io_handle: Option<Handle>,
}

impl ClientBuilder {
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn handlers(mut self, handlers: DispatcherBuilder) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn connector<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn io_handle(mut self, handle: Handle) -> Self {
        self.io_handle = Some(handle);
        self
    }

    /// Resolves the codec chain once; an empty or unknown chain is an error.
    pub fn build(self) -> AppResult<Client> {
        if self.config.codecs.is_empty() {
            return Err(AppError::ConfigurationMissing(format!(
                "no codec configured for client of {}",
                self.config.address()
            )));
        }
        let template = self.codecs.resolve(&self.config.codecs, &self.config.codec)?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.config.connect_timeout())));
        let setup = ConnectionSetup {
            port: None,
            dispatcher: Arc::new(self.handlers.build()),
            registry: self.registry,
            events: self.events,
            rate_limit: RateLimitConfig::default(),
            heartbeat: self.config.heartbeat.clone(),
            outbound_capacity: self.config.outbound_capacity,
            close_on_decode_error: self.config.close_on_decode_error,
        };
        let (notify_shutdown, _) = broadcast::channel(1);
        Ok(Client {
            inner: Arc::new(ClientInner {
                address: self.config.address(),
                reconnect_interval: self.config.reconnect_interval(),
                template,
                setup,
                connector,
                io_handle: self.io_handle,
                notify_shutdown,
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
                retry_generation: AtomicU64::new(0),
                retry: Mutex::new(None),
                session: Mutex::new(None),
            }),
        })
    }
}

struct ClientInner {
    address: String,
    reconnect_interval: Duration,
    template: ChainTemplate,
    setup: ConnectionSetup,
    connector: Arc<dyn Connector>,
    io_handle: Option<Handle>,
    notify_shutdown: broadcast::Sender<()>,
    connected: AtomicBool,
    /// held by whichever connect attempt is in flight, initial or retry
    connecting: AtomicBool,
    reconnecting: AtomicBool,
    shutting_down: AtomicBool,
    attempts: AtomicU64,
    retry_generation: AtomicU64,
    /// the single pending retry, tagged with its generation
    retry: Mutex<Option<(u64, JoinHandle<()>)>>,
    session: Mutex<Option<Arc<Session>>>,
}

/// Outbound connection with fixed-interval reconnect.
///
/// At most one retry is scheduled and at most one connection attempt runs
/// at a time. Connecting cancels the pending retry; losing the connection
/// schedules a new one until `shutdown`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            codecs: CodecRegistry::with_builtins(),
            handlers: DispatcherBuilder::new(),
            registry: SessionRegistry::new(),
            events: EventSink::discard(),
            connector: None,
            io_handle: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    /// Reconnect attempts made so far; the initial connect is not counted.
    pub fn attempt_count(&self) -> u64 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .retry
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.lock().clone()
    }

    /// Queues `message` on the current connection.
    pub fn send(&self, message: Message) -> AppResult<()> {
        let session = self.session().ok_or_else(|| {
            AppError::IllegalStateError(format!("client of {} is not connected", self.address()))
        })?;
        session.send(message)
    }

    /// Connects once. A failure is logged and schedules a retry, it is never
    /// returned to the caller.
    #[tracing::instrument(skip(self), fields(address = %self.inner.address))]
    pub async fn run(&self) {
        let Some(_attempt) = self.begin_attempt() else {
            debug!("connect to {} already in flight or established", self.inner.address);
            return;
        };
        if let Err(e) = self.connect_once().await {
            warn!("connect to {} failed: {}", self.inner.address, e);
            self.schedule_reconnect();
        }
    }

    /// Runs a reconnect attempt now, unless connected or already reconnecting.
    pub async fn trigger_reconnect(&self) {
        self.reconnect_attempt().await;
    }

    /// Cancels the pending retry, then closes the connection.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("client of {} shutting down", self.inner.address);
        self.cancel_retry();
        // no receiver left only means no connection is running
        let _ = self.inner.notify_shutdown.send(());
        if let Some(session) = self.inner.session.lock().take() {
            session.close();
        }
        self.inner.connected.store(false, Ordering::Release);
    }

    /// Claims the single connect slot, unless connected or another attempt
    /// holds it. The slot is released when the guard drops.
    fn begin_attempt(&self) -> Option<FlagGuard<'_>> {
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let guard = FlagGuard(&self.inner.connecting);
        if self.is_connected() {
            return None;
        }
        Some(guard)
    }

    async fn connect_once(&self) -> AppResult<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(AppError::IllegalStateError("client is shut down".to_string()));
        }
        let socket = self
            .inner
            .connector
            .connect(&self.inner.address)
            .await
            .map_err(|e| AppError::ConnectFailure(format!("{}: {}", self.inner.address, e)))?;
        let chain = self.inner.template.instantiate()?;
        let shutdown = Shutdown::subscribe(&self.inner.notify_shutdown);
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(AppError::IllegalStateError("client is shut down".to_string()));
        }
        let handler =
            ConnectionHandler::open(socket, chain, self.inner.setup.clone(), shutdown, None)?;
        let session = handler.session().clone();
        *self.inner.session.lock() = Some(session.clone());
        self.inner.connected.store(true, Ordering::Release);
        self.cancel_retry();
        info!("connected to {} as session {}", self.inner.address, session);

        let client = self.clone();
        let task = async move {
            handler.run().await;
            client.on_disconnected(&session);
        };
        match &self.inner.io_handle {
            Some(handle) => handle.spawn(task),
            None => tokio::spawn(task),
        };
        Ok(())
    }

    fn on_disconnected(&self, session: &Arc<Session>) {
        {
            let mut current = self.inner.session.lock();
            if !current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                debug!("stale connection {} to {} closed", session, self.inner.address);
                return;
            }
            current.take();
            self.inner.connected.store(false, Ordering::Release);
        }
        if self.inner.shutting_down.load(Ordering::Acquire) {
            debug!("connection to {} closed on shutdown", self.inner.address);
            return;
        }
        warn!("connection to {} lost", self.inner.address);
        self.schedule_reconnect();
    }

    /// Schedules the retry task unless one is already pending.
    fn schedule_reconnect(&self) {
        if self.inner.shutting_down.load(Ordering::Acquire) || self.is_connected() {
            return;
        }
        let mut retry = self.inner.retry.lock();
        if retry.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            debug!("reconnect to {} already scheduled", self.inner.address);
            return;
        }
        let generation = self.inner.retry_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let interval = self.inner.reconnect_interval;
        info!("reconnect to {} in {:?}", self.inner.address, interval);
        let client = self.clone();
        let task = async move {
            time::sleep(interval).await;
            // leave the slot once fired; a cancelled or superseded retry stops here
            {
                let mut retry = client.inner.retry.lock();
                if !retry.as_ref().is_some_and(|(current, _)| *current == generation) {
                    return;
                }
                retry.take();
            }
            client.reconnect_attempt().await;
        };
        let handle = match &self.inner.io_handle {
            Some(handle) => handle.spawn(task),
            None => tokio::spawn(task),
        };
        *retry = Some((generation, handle));
    }

    async fn reconnect_attempt(&self) {
        if self.is_connected() {
            self.cancel_retry();
            return;
        }
        let Some(attempt_guard) = self.begin_attempt() else {
            debug!("connect to {} already in flight", self.inner.address);
            return;
        };
        self.inner.reconnecting.store(true, Ordering::Release);
        let reconnecting = FlagGuard(&self.inner.reconnecting);
        let attempt = self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        info!("reconnect attempt {} to {}", attempt, self.inner.address);
        let result = self.connect_once().await;
        drop(reconnecting);
        drop(attempt_guard);

        let outcome = match &result {
            Ok(()) => ReconnectOutcome::Connected,
            Err(_) => ReconnectOutcome::Failed,
        };
        self.inner
            .setup
            .events
            .publish(LifecycleEvent::Reconnect(ReconnectEvent {
                address: self.inner.address.clone(),
                attempt,
                outcome,
                at: Local::now(),
            }));
        if let Err(e) = result {
            error!("reconnect attempt {} to {} failed: {}", attempt, self.inner.address, e);
            self.schedule_reconnect();
        }
    }

    fn cancel_retry(&self) {
        if let Some((_, handle)) = self.inner.retry.lock().take() {
            handle.abort();
            debug!("pending reconnect to {} cancelled", self.inner.address);
        }
    }
}

/// Clears its flag when dropped, so a cancelled attempt never leaves it set.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.inner.address)
            .field("connected", &self.is_connected())
            .field("reconnecting", &self.is_reconnecting())
            .field("attempts", &self.attempt_count())
            .finish()
    }
}
