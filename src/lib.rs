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

//! Duplex TCP client/server framework.
//!
//! Bytes read from a connection pass the ingress filters, a per-connection
//! [`CodecChain`] turns them into [`Message`]s, and a [`StrategyDispatcher`]
//! hands each message to the business handler registered for its command.
//! Replies travel back through the same chain. [`Server`] binds several
//! ports, each with its own chain; [`Client`] keeps one outbound connection
//! alive with fixed-interval reconnects.

pub mod codec;
pub mod filter;
pub mod network;
pub mod session;
pub mod strategy;

mod service;

pub use codec::{CodecChain, CodecRegistry, Message};
pub use network::{EventSink, IdleClosePolicy, LifecycleEvent};
pub use service::{
    setup_local_tracing, setup_tracing, AppConfig, AppError, AppResult, Client, ClientBuilder,
    ClientConfig, CodecConfig, Connector, HeartbeatConfig, IpFilterConfig, ListenerConfig,
    LogGuard, RateLimitConfig, RunningServer, Server, ServerConfig, Shutdown, TcpConnector,
};
pub use session::{Session, SessionRegistry};
pub use strategy::{DispatcherBuilder, GlobalStrategy, StrategyDispatcher, StrategyHandler};
