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

use bytes::{Buf, BufMut, BytesMut};

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

use super::{ByteToMessageDecoder, MessageToByteEncoder, Packet};

const LENGTH_FIELD_SIZE: usize = 4;

/// Splits a stream into frames prefixed by a big-endian `i32` body length.
#[derive(Debug, Clone)]
pub struct LengthFieldDecoder {
    max_frame_size: usize,
}

impl LengthFieldDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        LengthFieldDecoder { max_frame_size }
    }

    /// Returns the body size of the next frame once it is fully buffered.
    fn check(&self, buffer: &mut BytesMut) -> AppResult<usize> {
        if buffer.remaining() < LENGTH_FIELD_SIZE {
            return Err(Incomplete);
        }
        let body_size = i32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        if body_size < 0 {
            return Err(AppError::ProtocolDecode(format!(
                "frame size {} less than 0",
                body_size
            )));
        }
        let body_size = body_size as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::ProtocolDecode(format!(
                "Frame of length {} is too large.",
                body_size
            )));
        }
        if buffer.remaining() < body_size + LENGTH_FIELD_SIZE {
            buffer.reserve(body_size + LENGTH_FIELD_SIZE - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(body_size)
    }
}

impl ByteToMessageDecoder for LengthFieldDecoder {
    fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Option<Packet>> {
        match self.check(buffer) {
            Ok(body_size) => {
                buffer.advance(LENGTH_FIELD_SIZE);
                let body = buffer.split_to(body_size);
                Ok(Some(Packet::Frame(body.freeze())))
            }
            Err(Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Writes the frame's length before its bytes.
#[derive(Debug, Clone, Default)]
pub struct LengthFieldPrepender;

impl MessageToByteEncoder for LengthFieldPrepender {
    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> AppResult<()> {
        let frame = match packet {
            Packet::Frame(frame) => frame,
            other => {
                return Err(AppError::InvalidValue(format!(
                    "length field prepender expects a frame, got a {}",
                    other.kind()
                )))
            }
        };
        let len = i32::try_from(frame.len()).map_err(|_| {
            AppError::InvalidValue(format!("frame of {} bytes exceeds i32", frame.len()))
        })?;
        dst.reserve(LENGTH_FIELD_SIZE + frame.len());
        dst.put_i32(len);
        dst.put_slice(&frame);
        Ok(())
    }
}
