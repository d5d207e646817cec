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

use bytes::BytesMut;

use crate::AppResult;

use super::Packet;

/// Cuts units out of an accumulated byte buffer.
///
/// Returns `Ok(None)` when more bytes are needed. Called repeatedly until it
/// does, every call yields at most one unit.
pub trait ByteToMessageDecoder: Send {
    fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Option<Packet>>;
}

/// Turns one upstream unit into zero or one downstream unit.
pub trait MessageToMessageDecoder: Send {
    fn decode(&mut self, packet: Packet) -> AppResult<Option<Packet>>;
}

/// Writes a unit as bytes into `dst`.
pub trait MessageToByteEncoder: Send {
    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> AppResult<()>;
}

/// Converts a unit into another representation (compression, envelopes, serialization).
pub trait MessageToMessageEncoder: Send {
    fn encode(&mut self, packet: Packet) -> AppResult<Packet>;
}

pub enum Decoder {
    Bytes(Box<dyn ByteToMessageDecoder>),
    Message(Box<dyn MessageToMessageDecoder>),
}

pub enum Encoder {
    Bytes(Box<dyn MessageToByteEncoder>),
    Message(Box<dyn MessageToMessageEncoder>),
}

impl Decoder {
    pub fn bytes<D: ByteToMessageDecoder + 'static>(decoder: D) -> Self {
        Decoder::Bytes(Box::new(decoder))
    }
    pub fn message<D: MessageToMessageDecoder + 'static>(decoder: D) -> Self {
        Decoder::Message(Box::new(decoder))
    }
}

impl Encoder {
    pub fn bytes<E: MessageToByteEncoder + 'static>(encoder: E) -> Self {
        Encoder::Bytes(Box::new(encoder))
    }
    pub fn message<E: MessageToMessageEncoder + 'static>(encoder: E) -> Self {
        Encoder::Message(Box::new(encoder))
    }
}

/// One pipeline stage. A `Combined` stage binds a decoder and an encoder that
/// share the same position in the chain.
pub enum CodecStage {
    Inbound(Decoder),
    Outbound(Encoder),
    Combined { decoder: Decoder, encoder: Encoder },
}

impl CodecStage {
    pub fn combined(decoder: Decoder, encoder: Encoder) -> Self {
        CodecStage::Combined { decoder, encoder }
    }

    pub(crate) fn split(self) -> (Option<Decoder>, Option<Encoder>) {
        match self {
            CodecStage::Inbound(decoder) => (Some(decoder), None),
            CodecStage::Outbound(encoder) => (None, Some(encoder)),
            CodecStage::Combined { decoder, encoder } => (Some(decoder), Some(encoder)),
        }
    }
}
