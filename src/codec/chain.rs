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

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::{AppError, AppResult};

use super::{CodecStage, Decoder, Encoder, Message, Packet};

struct InboundStage {
    name: String,
    decoder: Decoder,
    cumulation: BytesMut,
}

impl InboundStage {
    fn push(&mut self, packet: Packet, out: &mut Vec<Packet>) -> AppResult<()> {
        match &mut self.decoder {
            Decoder::Bytes(decoder) => {
                let bytes = match packet {
                    Packet::Frame(bytes) => bytes,
                    other => {
                        return Err(AppError::ProtocolDecode(format!(
                            "stage {} expects a frame, got a {}",
                            self.name,
                            other.kind()
                        )))
                    }
                };
                self.cumulation.extend_from_slice(&bytes);
                while let Some(decoded) = decoder.decode(&mut self.cumulation)? {
                    out.push(decoded);
                }
            }
            Decoder::Message(decoder) => {
                if let Some(decoded) = decoder.decode(packet)? {
                    out.push(decoded);
                }
            }
        }
        Ok(())
    }
}

/// Messages decoded from one read, plus the error that stopped decoding.
#[derive(Debug, Default)]
pub struct DecodeBatch {
    pub messages: Vec<Message>,
    pub error: Option<AppError>,
}

impl DecodeBatch {
    pub fn into_result(self) -> AppResult<Vec<Message>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.messages),
        }
    }
}

struct OutboundStage {
    name: String,
    encoder: Encoder,
}

/// Ordered decode/encode stages bound to one connection.
///
/// Inbound data flows first-to-last through the decoders, outbound messages
/// flow last-to-first through the encoders. A chain is built once per
/// connection and never reconfigured.
pub struct CodecChain {
    names: Vec<String>,
    inbound: Vec<InboundStage>,
    outbound: Vec<OutboundStage>,
}

impl CodecChain {
    pub fn new(stages: Vec<(String, CodecStage)>) -> AppResult<CodecChain> {
        let mut names = Vec::with_capacity(stages.len());
        let mut inbound = Vec::new();
        let mut outbound = Vec::new();
        for (name, stage) in stages {
            let (decoder, encoder) = stage.split();
            if let Some(decoder) = decoder {
                inbound.push(InboundStage {
                    name: name.clone(),
                    decoder,
                    cumulation: BytesMut::new(),
                });
            }
            if let Some(encoder) = encoder {
                outbound.push(OutboundStage {
                    name: name.clone(),
                    encoder,
                });
            }
            names.push(name);
        }
        if inbound.is_empty() || outbound.is_empty() {
            return Err(AppError::ConfigurationMissing(format!(
                "codec chain [{}] needs at least one decoder and one encoder",
                names.join(",")
            )));
        }
        Ok(CodecChain {
            names,
            inbound,
            outbound,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Decodes every complete message available in `buffer`, failing on the
    /// first undecodable unit.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Vec<Message>> {
        self.decode_batch(buffer).into_result()
    }

    /// Decodes every complete message available in `buffer`.
    ///
    /// Bytes that do not yet form a complete unit stay in `buffer` (or in the
    /// owning stage's cumulation) for the next read. Decoding stops at the
    /// first malformed unit; messages decoded ahead of it are kept in the
    /// batch next to the error.
    pub fn decode_batch(&mut self, buffer: &mut BytesMut) -> DecodeBatch {
        let mut packets: Vec<Packet> = Vec::new();
        let mut error = None;
        let (first, rest) = match self.inbound.split_first_mut() {
            Some(split) => split,
            None => return DecodeBatch::default(),
        };
        match &mut first.decoder {
            Decoder::Bytes(decoder) => loop {
                match decoder.decode(buffer) {
                    Ok(Some(decoded)) => packets.push(decoded),
                    Ok(None) => break,
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            },
            Decoder::Message(decoder) => {
                if !buffer.is_empty() {
                    let frame = Packet::Frame(buffer.split().freeze());
                    match decoder.decode(frame) {
                        Ok(Some(decoded)) => packets.push(decoded),
                        Ok(None) => {}
                        Err(e) => error = Some(e),
                    }
                }
            }
        }

        for stage in rest {
            // a stage that produced nothing ends the walk
            if packets.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(packets.len());
            for packet in packets.drain(..) {
                if let Err(e) = stage.push(packet, &mut next) {
                    // earlier in arrival order than anything the first stage rejected
                    error = Some(e);
                    break;
                }
            }
            packets = next;
        }

        let mut messages = Vec::with_capacity(packets.len());
        for packet in packets {
            match packet {
                Packet::Message(message) => messages.push(message),
                Packet::Frame(frame) => {
                    error = Some(AppError::ProtocolDecode(format!(
                        "codec chain [{}] ended with an undecoded frame of {} bytes",
                        self.names.join(","),
                        frame.len()
                    )));
                    break;
                }
            }
        }
        DecodeBatch { messages, error }
    }

    /// Runs `message` through the encoders and returns the bytes to write.
    pub fn encode(&mut self, message: Message) -> AppResult<Bytes> {
        let mut packet = Packet::Message(message);
        for stage in self.outbound.iter_mut().rev() {
            trace!("encoding {} through stage {}", packet.kind(), stage.name);
            packet = match &mut stage.encoder {
                Encoder::Message(encoder) => encoder.encode(packet)?,
                Encoder::Bytes(encoder) => {
                    let mut dst = BytesMut::new();
                    encoder.encode(packet, &mut dst)?;
                    Packet::Frame(dst.freeze())
                }
            };
        }
        match packet {
            Packet::Frame(bytes) => Ok(bytes),
            Packet::Message(message) => Err(AppError::InvalidValue(format!(
                "codec chain [{}] did not serialize command {}",
                self.names.join(","),
                message.command()
            ))),
        }
    }

    /// Drops partially accumulated input, used when a decode error is tolerated.
    pub fn reset(&mut self) {
        for stage in self.inbound.iter_mut() {
            stage.cumulation.clear();
        }
    }
}

impl std::fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecChain").field("stages", &self.names).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::BufMut;

    use super::*;
    use crate::codec::{
        JsonDecoder, JsonEncoder, LengthFieldDecoder, LengthFieldPrepender, LineDecoder,
        LineEncoder, MessageToMessageDecoder,
    };

    fn framed_json_chain() -> CodecChain {
        CodecChain::new(vec![
            (
                "length_field".to_string(),
                CodecStage::combined(
                    Decoder::bytes(LengthFieldDecoder::new(1024)),
                    Encoder::bytes(LengthFieldPrepender),
                ),
            ),
            (
                "json".to_string(),
                CodecStage::combined(Decoder::message(JsonDecoder), Encoder::message(JsonEncoder)),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_round_trip_through_same_chain() -> AppResult<()> {
        let mut chain = framed_json_chain();
        let original = Message::new("login", Bytes::from_static(b"\x00\x01binary"))
            .with_device_id("dev-1");
        let encoded = chain.encode(original.clone())?;

        let mut buffer = BytesMut::from(&encoded[..]);
        let decoded = chain.decode(&mut buffer)?;
        assert_eq!(decoded, vec![original]);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() -> AppResult<()> {
        let mut chain = framed_json_chain();
        let first = chain.encode(Message::new("a", "1"))?;
        let second = chain.encode(Message::new("b", "2"))?;

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first);
        wire.extend_from_slice(&second);
        let split_at = first.len() + 3;

        let mut buffer = BytesMut::from(&wire[..split_at]);
        let decoded = chain.decode(&mut buffer)?;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].command(), "a");

        buffer.extend_from_slice(&wire[split_at..]);
        let decoded = chain.decode(&mut buffer)?;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].command(), "b");
        Ok(())
    }

    #[test]
    fn test_line_chain_decodes_multiple_messages_per_read() -> AppResult<()> {
        let mut chain = CodecChain::new(vec![
            (
                "line".to_string(),
                CodecStage::combined(
                    Decoder::bytes(LineDecoder::new(1024)),
                    Encoder::bytes(LineEncoder),
                ),
            ),
            (
                "json".to_string(),
                CodecStage::combined(Decoder::message(JsonDecoder), Encoder::message(JsonEncoder)),
            ),
        ])?;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&chain.encode(Message::new("x", "1"))?);
        buffer.extend_from_slice(&chain.encode(Message::new("y", "2"))?);
        let commands: Vec<String> = chain
            .decode(&mut buffer)?
            .iter()
            .map(|m| m.command().to_string())
            .collect();
        assert_eq!(commands, vec!["x", "y"]);
        Ok(())
    }

    struct CountingDecoder(Arc<AtomicUsize>);

    impl MessageToMessageDecoder for CountingDecoder {
        fn decode(&mut self, packet: Packet) -> AppResult<Option<Packet>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(packet))
        }
    }

    #[test]
    fn test_no_result_stops_the_walk() -> AppResult<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = CodecChain::new(vec![
            (
                "length_field".to_string(),
                CodecStage::combined(
                    Decoder::bytes(LengthFieldDecoder::new(1024)),
                    Encoder::bytes(LengthFieldPrepender),
                ),
            ),
            (
                "counting".to_string(),
                CodecStage::Inbound(Decoder::message(CountingDecoder(calls.clone()))),
            ),
        ])?;
        let mut buffer = BytesMut::new();
        buffer.put_i32(10);
        buffer.put_slice(b"abc");
        assert!(chain.decode(&mut buffer)?.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_undecoded_frame_is_a_protocol_error() {
        let mut chain = CodecChain::new(vec![(
            "length_field".to_string(),
            CodecStage::combined(
                Decoder::bytes(LengthFieldDecoder::new(1024)),
                Encoder::bytes(LengthFieldPrepender),
            ),
        )])
        .unwrap();
        let mut buffer = BytesMut::new();
        buffer.put_i32(3);
        buffer.put_slice(b"abc");
        assert!(matches!(
            chain.decode(&mut buffer),
            Err(AppError::ProtocolDecode(_))
        ));
    }

    #[test]
    fn test_messages_ahead_of_a_malformed_unit_are_kept() {
        let mut chain = framed_json_chain();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&chain.encode(Message::new("ping", "1")).unwrap());
        buffer.put_i32(4);
        buffer.put_slice(b"{bad");

        let batch = chain.decode_batch(&mut buffer);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].command(), "ping");
        assert!(matches!(batch.error, Some(AppError::ProtocolDecode(_))));
    }

    #[test]
    fn test_chain_without_encoder_is_rejected() {
        let result = CodecChain::new(vec![(
            "json".to_string(),
            CodecStage::Inbound(Decoder::message(JsonDecoder)),
        )]);
        assert!(matches!(result, Err(AppError::ConfigurationMissing(_))));
    }
}
