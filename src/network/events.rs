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

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_channel::TrySendError;
use chrono::{DateTime, Local};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleState {
    /// nothing read within the read timeout
    Reader,
    /// nothing written within the write timeout
    Writer,
    /// neither read nor written within the all-idle timeout
    All,
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdleState::Reader => "READER_IDLE",
            IdleState::Writer => "WRITER_IDLE",
            IdleState::All => "ALL_IDLE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct IdleEvent {
    pub session_id: String,
    pub device_id: Option<String>,
    pub state: IdleState,
    /// idle firings since the last inbound message, starting at 1
    pub consecutive: u64,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReconnectEvent {
    pub address: String,
    pub attempt: u64,
    pub outcome: ReconnectOutcome,
    pub at: DateTime<Local>,
}

/// Connection lifecycle notifications. The core only publishes them.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Opened {
        session_id: String,
        peer: SocketAddr,
        port: Option<u16>,
    },
    Closed {
        session_id: String,
        device_id: Option<String>,
        client_ip: IpAddr,
    },
    Idle(IdleEvent),
    Rejected {
        peer: SocketAddr,
        port: Option<u16>,
        reason: String,
    },
    Reconnect(ReconnectEvent),
}

/// Publishing end of the lifecycle event bus.
///
/// Publishing never waits: when the bus is full or nobody listens the event
/// is logged and dropped so a slow consumer cannot stall a connection.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<async_channel::Sender<LifecycleEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (EventSink, async_channel::Receiver<LifecycleEvent>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (EventSink { sender: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn discard() -> EventSink {
        EventSink::default()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("lifecycle event bus is full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(event)) => {
                debug!("lifecycle event bus is closed, dropping {:?}", event);
            }
        }
    }
}

/// Closes sessions that stay idle for too many consecutive checks.
pub struct IdleClosePolicy;

impl IdleClosePolicy {
    /// Consumes `events` until the bus closes. `timeout_total == 0` only drains.
    pub fn spawn(
        events: async_channel::Receiver<LifecycleEvent>,
        registry: SessionRegistry,
        timeout_total: u64,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let LifecycleEvent::Idle(idle) = event else {
                    continue;
                };
                if timeout_total == 0 || idle.consecutive <= timeout_total {
                    continue;
                }
                if let Some(session) = registry.get(&idle.session_id) {
                    info!(
                        "session {} (device {:?}) {} {} times, closing",
                        session,
                        idle.device_id,
                        idle.state,
                        idle.consecutive
                    );
                    session.close();
                }
            }
            debug!("idle close policy exit, event bus closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session::tests::test_session;

    fn idle(session_id: &str, consecutive: u64) -> LifecycleEvent {
        LifecycleEvent::Idle(IdleEvent {
            session_id: session_id.to_string(),
            device_id: None,
            state: IdleState::All,
            consecutive,
            at: Local::now(),
        })
    }

    #[tokio::test]
    async fn test_policy_closes_after_threshold() {
        let registry = SessionRegistry::new();
        let (session, _link) = test_session(Some(9001));
        registry.put(session.clone());

        let (sink, rx) = EventSink::channel(8);
        let policy = IdleClosePolicy::spawn(rx, registry.clone(), 2);

        sink.publish(idle(session.id(), 1));
        sink.publish(idle(session.id(), 2));
        sink.publish(idle("unknown", 10));
        tokio::task::yield_now().await;
        assert!(session.is_active());

        sink.publish(idle(session.id(), 3));
        session.closed().await;
        assert!(!session.is_active());

        drop(sink);
        policy.await.unwrap();
    }

    #[test]
    fn test_full_or_absent_bus_never_blocks() {
        let (sink, rx) = EventSink::channel(1);
        sink.publish(idle("a", 1));
        sink.publish(idle("b", 1));
        assert_eq!(rx.len(), 1);

        EventSink::discard().publish(idle("c", 1));
        drop(rx);
        sink.publish(idle("d", 1));
    }
}
