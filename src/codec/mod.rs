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

//! Message & codec abstraction.
//!
//! A connection's bytes pass through a [`CodecChain`]: an ordered list of
//! [`CodecStage`]s, each a decoder, an encoder, or a combined pair. Four stage
//! shapes exist, matching how framing stacks with serialization:
//!
//! - [`ByteToMessageDecoder`]: accumulated bytes to one unit (framing)
//! - [`MessageToMessageDecoder`]: unit to unit (deserialization, decompression)
//! - [`MessageToMessageEncoder`]: unit to unit on the way out
//! - [`MessageToByteEncoder`]: unit to bytes (length prefixing, delimiters)
//!
//! Chains are looked up by stage name in a [`CodecRegistry`] once per listener
//! or client and instantiated once per connection.

pub use chain::{CodecChain, DecodeBatch};
pub use json::{JsonDecoder, JsonEncoder};
pub use length_field::{LengthFieldDecoder, LengthFieldPrepender};
pub use line::{LineDecoder, LineEncoder};
pub use message::{Message, Packet};
pub use registry::{ChainTemplate, CodecRegistry, StageFactory, JSON, LENGTH_FIELD, LINE};
pub use stage::{
    ByteToMessageDecoder, CodecStage, Decoder, Encoder, MessageToByteEncoder,
    MessageToMessageDecoder, MessageToMessageEncoder,
};

mod chain;
mod json;
mod length_field;
mod line;
mod message;
mod registry;
mod stage;
