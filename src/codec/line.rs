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

use crate::{AppError, AppResult};

use super::{ByteToMessageDecoder, MessageToByteEncoder, Packet};

/// Newline-delimited frames; a trailing `\r` is stripped.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    max_length: usize,
}

impl LineDecoder {
    pub fn new(max_length: usize) -> Self {
        LineDecoder { max_length }
    }
}

impl ByteToMessageDecoder for LineDecoder {
    fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Option<Packet>> {
        match buffer.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                if pos > self.max_length {
                    return Err(AppError::ProtocolDecode(format!(
                        "line of length {} exceeds {}",
                        pos, self.max_length
                    )));
                }
                let mut line = buffer.split_to(pos);
                buffer.advance(1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(Packet::Frame(line.freeze())))
            }
            None if buffer.len() > self.max_length => Err(AppError::ProtocolDecode(format!(
                "no line delimiter within {} bytes",
                self.max_length
            ))),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineEncoder;

impl MessageToByteEncoder for LineEncoder {
    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> AppResult<()> {
        match packet {
            Packet::Frame(frame) => {
                if frame.contains(&b'\n') {
                    return Err(AppError::InvalidValue(
                        "line frame must not contain a newline".to_string(),
                    ));
                }
                dst.reserve(frame.len() + 1);
                dst.put_slice(&frame);
                dst.put_u8(b'\n');
                Ok(())
            }
            other => Err(AppError::InvalidValue(format!(
                "line encoder expects a frame, got a {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_split_lines() -> AppResult<()> {
        let mut buffer = BytesMut::from(&b"one\r\ntwo\nthr"[..]);
        let mut decoder = LineDecoder::new(16);
        assert_eq!(
            decoder.decode(&mut buffer)?,
            Some(Packet::Frame(Bytes::from_static(b"one")))
        );
        assert_eq!(
            decoder.decode(&mut buffer)?,
            Some(Packet::Frame(Bytes::from_static(b"two")))
        );
        assert_eq!(decoder.decode(&mut buffer)?, None);
        assert_eq!(&buffer[..], b"thr");
        Ok(())
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let mut buffer = BytesMut::from(&b"0123456789"[..]);
        let mut decoder = LineDecoder::new(4);
        assert!(matches!(
            decoder.decode(&mut buffer),
            Err(AppError::ProtocolDecode(_))
        ));
    }
}
