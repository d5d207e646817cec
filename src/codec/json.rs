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

use crate::{AppError, AppResult};

use super::{MessageToMessageDecoder, MessageToMessageEncoder, Packet};

/// Frame to [`Message`](super::Message) through `serde_json`. Empty frames are skipped.
#[derive(Debug, Clone, Default)]
pub struct JsonDecoder;

impl MessageToMessageDecoder for JsonDecoder {
    fn decode(&mut self, packet: Packet) -> AppResult<Option<Packet>> {
        match packet {
            Packet::Frame(frame) if frame.is_empty() => Ok(None),
            Packet::Frame(frame) => Ok(Some(Packet::Message(serde_json::from_slice(&frame)?))),
            other => Err(AppError::ProtocolDecode(format!(
                "json decoder expects a frame, got a {}",
                other.kind()
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsonEncoder;

impl MessageToMessageEncoder for JsonEncoder {
    fn encode(&mut self, packet: Packet) -> AppResult<Packet> {
        match packet {
            Packet::Message(message) => Ok(Packet::Frame(serde_json::to_vec(&message)
                .map_err(|e| AppError::InvalidValue(e.to_string()))?
                .into())),
            other => Err(AppError::InvalidValue(format!(
                "json encoder expects a message, got a {}",
                other.kind()
            ))),
        }
    }
}
