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

//! Per-connection machinery shared by the server and the client.
//!
//! A connection task owns its socket and is the only writer to it. Business
//! code reaches the peer through the connection's [`Session`](crate::Session).
//! Idle detection publishes [`LifecycleEvent`]s and leaves the decision to
//! close to a policy such as [`IdleClosePolicy`].

pub(crate) use connection::{ConnectionHandler, ConnectionSetup};
pub use events::{
    EventSink, IdleClosePolicy, IdleEvent, IdleState, LifecycleEvent, ReconnectEvent,
    ReconnectOutcome,
};
pub use idle::IdleSupervisor;

mod connection;
mod events;
mod idle;
