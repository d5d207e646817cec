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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::codec::{ChainTemplate, CodecRegistry};
use crate::filter::IpFilter;
use crate::network::{ConnectionHandler, ConnectionSetup, EventSink, LifecycleEvent};
use crate::session::SessionRegistry;
use crate::strategy::DispatcherBuilder;
use crate::{AppError, AppResult};

use super::{ListenerConfig, ServerConfig, Shutdown};

/// Multi-port server. Every configured port gets its own codec chain and its
/// own view of the registered handlers.
pub struct Server {
    config: ServerConfig,
    codecs: CodecRegistry,
    handlers: DispatcherBuilder,
    registry: SessionRegistry,
    events: EventSink,
    ip_filter: Arc<IpFilter>,
    io_handle: Option<Handle>,
}

impl Server {
    /// Compiles the ip rules; a malformed rule fails here, not at accept time.
    pub fn new(
        config: ServerConfig,
        codecs: CodecRegistry,
        handlers: DispatcherBuilder,
    ) -> AppResult<Server> {
        let ip_filter = Arc::new(IpFilter::from_config(&config.ip_filter)?);
        Ok(Server {
            config,
            codecs,
            handlers,
            registry: SessionRegistry::new(),
            events: EventSink::discard(),
            ip_filter,
            io_handle: None,
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Runs connection I/O on `handle` instead of the runtime that accepts.
    pub fn with_io_handle(mut self, handle: Handle) -> Self {
        self.io_handle = Some(handle);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn ip_filter(&self) -> &Arc<IpFilter> {
        &self.ip_filter
    }

    /// Binds every listener that has codecs and starts accepting.
    ///
    /// Ports without a usable codec chain are skipped with a warning. Having
    /// no port left is an error.
    #[tracing::instrument(skip(self))]
    pub async fn bind(&self) -> AppResult<RunningServer> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let limit_connections = Arc::new(Semaphore::new(self.config.max_connection.max(1)));

        let mut listeners = Vec::new();
        let mut skipped = Vec::new();
        for listener_config in &self.config.listeners {
            let template = match self.resolve_codecs(listener_config) {
                Ok(template) => template,
                Err(e) => {
                    warn!("port {} skipped: {}", listener_config.port, e);
                    skipped.push(listener_config.port);
                    continue;
                }
            };
            let listener = self.listen(listener_config.port).await?;
            let local_addr = listener.local_addr()?;
            info!(
                "tcp server binding to {} for listening, codecs: {:?}",
                local_addr,
                template.names()
            );
            listeners.push((listener, local_addr, template));
        }
        if listeners.is_empty() {
            return Err(AppError::ConfigurationMissing(
                "no listener port has a codec chain".to_string(),
            ));
        }

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (listener, local_addr, template) in listeners {
            let port = local_addr.port();
            let dispatcher = Arc::new(self.handlers.build_for_port(port));
            debug!("port {} dispatches commands {:?}", port, dispatcher.commands());
            let mut acceptor = Acceptor {
                listener,
                port,
                template,
                setup: ConnectionSetup {
                    port: Some(port),
                    dispatcher,
                    registry: self.registry.clone(),
                    events: self.events.clone(),
                    rate_limit: self.config.rate_limit.clone(),
                    heartbeat: self.config.heartbeat.clone(),
                    outbound_capacity: self.config.outbound_capacity,
                    close_on_decode_error: self.config.close_on_decode_error,
                },
                ip_filter: self.ip_filter.clone(),
                limit_connections: limit_connections.clone(),
                notify_shutdown: notify_shutdown.clone(),
                shutdown_complete_tx: shutdown_complete_tx.clone(),
                io_handle: self.io_handle.clone(),
            };
            let mut shutdown = Shutdown::subscribe(&notify_shutdown);
            accept_tasks.push(tokio::spawn(async move {
                tokio::select! {
                    res = acceptor.run() => {
                        if let Err(err) = res {
                            error!(cause = %err, "port {} failed to accept", port);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("port {} stops accepting", port);
                    }
                }
            }));
            local_addrs.push(local_addr);
        }

        Ok(RunningServer {
            local_addrs,
            skipped,
            registry: self.registry.clone(),
            ip_filter: self.ip_filter.clone(),
            notify_shutdown,
            shutdown_complete_tx: Some(shutdown_complete_tx),
            shutdown_complete_rx,
            accept_tasks,
        })
    }

    fn resolve_codecs(&self, listener: &ListenerConfig) -> AppResult<ChainTemplate> {
        if listener.codecs.is_empty() {
            return Err(AppError::ConfigurationMissing(format!(
                "no codec configured for port {}",
                listener.port
            )));
        }
        self.codecs.resolve(&listener.codecs, &self.config.codec)
    }

    async fn listen(&self, port: u16) -> AppResult<TcpListener> {
        let address = format!("{}:{}", self.config.host, port);
        let addr = lookup_host(&address).await?.next().ok_or_else(|| {
            AppError::InvalidValue(format!("listen address {} resolves to nothing", address))
        })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr).map_err(|e| {
            let error_msg = format!("Failed to bind server to address: {} - Error: {}", addr, e);
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        Ok(socket.listen(self.config.effective_backlog())?)
    }
}

/// Accept loop of one listener port.
struct Acceptor {
    listener: TcpListener,
    port: u16,
    template: ChainTemplate,
    setup: ConnectionSetup,
    ip_filter: Arc<IpFilter>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    io_handle: Option<Handle>,
}

impl Acceptor {
    async fn run(&mut self) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limit: {}", e)))?;
            // subscribe before accepting so a signal sent meanwhile is not missed
            let shutdown = Shutdown::subscribe(&self.notify_shutdown);

            let (socket, peer) = self.accept().await?;
            if let Err(e) = self.ip_filter.check(peer.ip().to_canonical()) {
                warn!(port = self.port, "close connection from {}: {}", peer, e);
                self.setup.events.publish(LifecycleEvent::Rejected {
                    peer,
                    port: Some(self.port),
                    reason: e.to_string(),
                });
                continue;
            }
            let chain = match self.template.instantiate() {
                Ok(chain) => chain,
                Err(e) => {
                    error!(port = self.port, "codec chain setup failed: {}", e);
                    continue;
                }
            };

            let setup = self.setup.clone();
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            let task = async move {
                let handler = ConnectionHandler::open(
                    socket,
                    chain,
                    setup,
                    shutdown,
                    Some(shutdown_complete_tx),
                );
                match handler {
                    Ok(handler) => handler.run().await,
                    Err(e) => error!("connection setup failed for {}: {}", peer, e),
                }
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
            };
            match &self.io_handle {
                Some(handle) => handle.spawn(task),
                None => tokio::spawn(task),
            };
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!(port = self.port, "accept error: {}, retry in {}s", err, backoff);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Handle to a bound server.
#[derive(Debug)]
pub struct RunningServer {
    local_addrs: Vec<SocketAddr>,
    skipped: Vec<u16>,
    registry: SessionRegistry,
    ip_filter: Arc<IpFilter>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Bound addresses, in listener configuration order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Configured ports that were skipped for lack of a codec chain.
    pub fn skipped_ports(&self) -> &[u16] {
        &self.skipped
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn ip_filter(&self) -> &Arc<IpFilter> {
        &self.ip_filter
    }

    /// Stops every listener, closes every connection and waits until all
    /// connection tasks have released their resources.
    pub async fn shutdown(mut self) {
        info!("server shutting down");
        // no receiver left only means nothing is running
        let _ = self.notify_shutdown.send(());
        for task in self.accept_tasks.drain(..) {
            if let Err(e) = task.await {
                error!("accept task ended abnormally: {}", e);
            }
        }
        drop(self.shutdown_complete_tx.take());
        self.shutdown_complete_rx.recv().await;
        info!("server shutdown complete");
    }
}
