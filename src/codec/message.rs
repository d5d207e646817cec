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

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A decoded application unit.
///
/// `command` selects the strategy handler, `payload` is opaque to the framework.
/// Messages are immutable once built; replies are new messages.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default)]
    payload: Bytes,
}

impl Message {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            command: command.into(),
            device_id: None,
            payload: payload.into(),
        }
    }

    /// Tags the message with the peer's device id, the first tagged message of
    /// a connection binds that id to its session.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command)
            .field("device_id", &self.device_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// What travels between codec stages: a raw frame or a structured message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Frame(Bytes),
    Message(Message),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Frame(_) => "frame",
            Packet::Message(_) => "message",
        }
    }
}

impl From<Message> for Packet {
    fn from(value: Message) -> Self {
        Packet::Message(value)
    }
}

impl From<Bytes> for Packet {
    fn from(value: Bytes) -> Self {
        Packet::Frame(value)
    }
}
