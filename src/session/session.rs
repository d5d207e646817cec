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

use std::any::Any;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Local};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::codec::Message;
use crate::{AppError, AppResult};

type Attribute = Arc<dyn Any + Send + Sync>;

/// One live connection.
///
/// The session is the only way to write to its peer: `send` queues a message
/// for the connection task, which encodes and writes it. Code that needs a
/// peer later should keep the id and look the session up in the registry
/// again rather than hold the `Arc` past disconnect.
pub struct Session {
    id: String,
    supported_port: Option<u16>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    created_at: DateTime<Local>,
    device_id: OnceLock<String>,
    attributes: DashMap<String, Attribute>,
    outbound: mpsc::Sender<Message>,
    closer: CancellationToken,
}

/// The connection task's end of a session.
pub(crate) struct SessionLink {
    pub outbound: mpsc::Receiver<Message>,
    pub closer: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        supported_port: Option<u16>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        outbound_capacity: usize,
    ) -> (Arc<Session>, SessionLink) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let closer = CancellationToken::new();
        let session = Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            supported_port,
            local_addr,
            peer_addr,
            created_at: Local::now(),
            device_id: OnceLock::new(),
            attributes: DashMap::new(),
            outbound: tx,
            closer: closer.clone(),
        };
        (
            Arc::new(session),
            SessionLink {
                outbound: rx,
                closer,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The listener port this connection was accepted on, `None` on the client side.
    pub fn supported_port(&self) -> Option<u16> {
        self.supported_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn client_ip(&self) -> IpAddr {
        self.peer_addr.ip().to_canonical()
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.get().map(String::as_str)
    }

    /// Binds a device id once; later calls return false and keep the first id.
    pub(crate) fn bind_device(&self, device_id: &str) -> bool {
        self.device_id.set(device_id.to_string()).is_ok()
    }

    pub fn is_active(&self) -> bool {
        !self.closer.is_cancelled()
    }

    /// Queues `message` for the peer without waiting.
    pub fn send(&self, message: Message) -> AppResult<()> {
        if !self.is_active() {
            return Err(AppError::IllegalStateError(format!(
                "session {} is closed",
                self.id
            )));
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => {
                AppError::ChannelSendError(format!("outbound queue of session {} is full", self.id))
            }
            TrySendError::Closed(_) => {
                AppError::ChannelSendError(format!("session {} connection is gone", self.id))
            }
        })
    }

    /// Asks the owning connection task to close the connection.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }

    pub fn set_attr<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Arc::new(value));
    }

    /// Returns a clone of the attribute if it exists and has type `T`.
    pub fn attr<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Atomically inserts the value built by `init` when `key` is absent.
    ///
    /// Returns `None` only when an existing value has another type.
    pub fn attr_or_insert_with<T, F>(&self, key: &str, init: F) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce() -> T,
    {
        let entry = self
            .attributes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()));
        entry.value().downcast_ref::<T>().cloned()
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn remove_attr(&self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device_id", &self.device_id.get())
            .field("port", &self.supported_port)
            .field("peer", &self.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.peer_addr)
    }
}
