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

use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::BytesMut;
use chrono::Local;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecChain, Message};
use crate::filter::RateLimiter;
use crate::service::{HeartbeatConfig, RateLimitConfig, Shutdown};
use crate::session::{Session, SessionLink, SessionRegistry};
use crate::strategy::StrategyDispatcher;
use crate::{AppError, AppResult};

use super::{EventSink, IdleEvent, IdleSupervisor, LifecycleEvent};

/// A TCP stream with its inbound accumulation buffer.
#[derive(Debug)]
struct Connection {
    writer: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    fn new(socket: TcpStream) -> Connection {
        Connection {
            writer: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads whatever is available into the buffer.
    ///
    /// Returns false when the peer closed the connection gracefully, an error
    /// when it closed in the middle of a frame.
    async fn read_more(&mut self) -> AppResult<bool> {
        if 0 == self.writer.read_buf(&mut self.buffer).await? {
            return if self.buffer.is_empty() {
                Ok(false)
            } else {
                Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer").into())
            };
        }
        Ok(true)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("write error: {}", e)))
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("flush error: {}", e)))
    }
}

/// Everything a connection task needs besides its socket, shared by every
/// connection of one listener (or by one client).
#[derive(Clone)]
pub(crate) struct ConnectionSetup {
    pub port: Option<u16>,
    pub dispatcher: Arc<StrategyDispatcher>,
    pub registry: SessionRegistry,
    pub events: EventSink,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub outbound_capacity: usize,
    pub close_on_decode_error: bool,
}

/// Drives one connection: decode, filter, dispatch, write replies and queued
/// outbound messages, supervise idleness.
///
/// Every inbound message runs to completion before the next read, so messages
/// of one connection are dispatched in arrival order.
pub(crate) struct ConnectionHandler {
    session: Arc<Session>,
    link: SessionLink,
    connection: Connection,
    chain: CodecChain,
    setup: ConnectionSetup,
    limiter: Option<RateLimiter>,
    idle: IdleSupervisor,
    shutdown: Shutdown,
    _shutdown_complete_tx: Option<mpsc::Sender<()>>,
}

impl ConnectionHandler {
    /// Creates the session for `socket`, registers it and starts its
    /// connection-owned timers.
    pub fn open(
        socket: TcpStream,
        chain: CodecChain,
        setup: ConnectionSetup,
        shutdown: Shutdown,
        shutdown_complete_tx: Option<mpsc::Sender<()>>,
    ) -> AppResult<ConnectionHandler> {
        socket.set_nodelay(true)?;
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;
        let (session, link) =
            Session::new(setup.port, local_addr, peer_addr, setup.outbound_capacity);
        setup.registry.put(session.clone());
        info!(
            session = %session,
            port = ?setup.port,
            "connection active, codecs: {:?}",
            chain.names()
        );
        setup.events.publish(LifecycleEvent::Opened {
            session_id: session.id().to_string(),
            peer: peer_addr,
            port: setup.port,
        });
        let limiter = RateLimiter::start(&setup.rate_limit);
        let idle = IdleSupervisor::new(&setup.heartbeat, Instant::now());
        Ok(ConnectionHandler {
            session,
            link,
            connection: Connection::new(socket),
            chain,
            setup,
            limiter,
            idle,
            shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Runs the connection to its end and releases everything it owns.
    pub async fn run(mut self) {
        if let Err(e) = self.handle_connection().await {
            match &e {
                AppError::RateExceeded { .. } | AppError::ConnectionRejected(_) => {
                    warn!(session = %self.session, "closing connection: {}", e);
                    self.setup.events.publish(LifecycleEvent::Rejected {
                        peer: self.session.peer_addr(),
                        port: self.setup.port,
                        reason: e.to_string(),
                    });
                }
                AppError::ProtocolDecode(_) => {
                    warn!(session = %self.session, "closing connection on decode error: {}", e);
                }
                _ => error!(session = %self.session, "connection error: {:?}", e),
            }
        }
        self.teardown();
    }

    async fn handle_connection(&mut self) -> AppResult<()> {
        loop {
            let idle_deadline = self.idle.next_deadline();
            tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!(session = %self.session, "connection exit after shutdown signal");
                    return Ok(());
                }
                _ = self.link.closer.cancelled() => {
                    debug!(session = %self.session, "connection closed on request");
                    return Ok(());
                }
                read = self.connection.read_more() => {
                    if !read? {
                        debug!(session = %self.session, "peer closed the connection");
                        return Ok(());
                    }
                    self.idle.touch_read(Instant::now());
                    self.on_inbound().await?;
                }
                Some(message) = self.link.outbound.recv() => {
                    self.write_message(message).await?;
                    self.connection.flush().await?;
                }
                _ = idle_tick(idle_deadline) => {
                    self.on_idle();
                }
            }
        }
    }

    async fn on_inbound(&mut self) -> AppResult<()> {
        let batch = self.chain.decode_batch(&mut self.connection.buffer);
        for message in batch.messages {
            self.on_message(message).await?;
        }
        if let Some(e) = batch.error {
            if self.setup.close_on_decode_error {
                self.connection.flush().await?;
                return Err(e);
            }
            warn!(session = %self.session, "discard undecodable input: {}", e);
            self.chain.reset();
            self.connection.buffer.clear();
        }
        self.connection.flush().await
    }

    async fn on_message(&mut self, message: Message) -> AppResult<()> {
        if let Some(limiter) = &self.limiter {
            limiter.on_message()?;
        }
        if self.session.device_id().is_none() {
            if let Some(device_id) = message.device_id() {
                self.setup.registry.bind_device(&self.session, device_id);
            }
        }
        match self.setup.dispatcher.dispatch(&self.session, message) {
            Ok(Some(reply)) => self.write_message(reply).await?,
            Ok(None) => {}
            // already logged by the dispatcher
            Err(AppError::DispatchMiss(_)) => {}
            Err(e) if e.is_fatal_for_connection() => return Err(e),
            Err(e) => warn!(session = %self.session, "handler failed: {}", e),
        }
        Ok(())
    }

    async fn write_message(&mut self, message: Message) -> AppResult<()> {
        let bytes = self.chain.encode(message)?;
        self.connection.write_all(&bytes).await?;
        self.idle.touch_write(Instant::now());
        Ok(())
    }

    fn on_idle(&mut self) {
        for (state, consecutive) in self.idle.check(Instant::now()) {
            debug!(session = %self.session, "{} x{}", state, consecutive);
            self.setup.events.publish(LifecycleEvent::Idle(IdleEvent {
                session_id: self.session.id().to_string(),
                device_id: self.session.device_id().map(str::to_string),
                state,
                consecutive,
                at: Local::now(),
            }));
        }
    }

    fn teardown(&mut self) {
        // stops the reset task with the connection
        self.limiter.take();
        self.session.close();
        self.setup.registry.remove(&self.session);
        info!(session = %self.session, "connection inactive");
        self.setup.events.publish(LifecycleEvent::Closed {
            session_id: self.session.id().to_string(),
            device_id: self.session.device_id().map(str::to_string),
            client_ip: self.session.client_ip(),
        });
    }
}

async fn idle_tick(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("connection handler dropped");
    }
}
