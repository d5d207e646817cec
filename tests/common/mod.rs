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

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use duplexnet::{
    setup_local_tracing, AppResult, CodecChain, CodecConfig, CodecRegistry, Message, Session,
    StrategyHandler,
};
use rstest::fixture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

#[fixture]
#[once]
pub fn setup() {
    // another test binary may have installed a subscriber in this process
    let _ = setup_local_tracing();
}

pub fn codecs(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

pub fn chain(names: &[&str]) -> CodecChain {
    CodecRegistry::with_builtins()
        .resolve(&codecs(names), &CodecConfig::default())
        .unwrap()
        .instantiate()
        .unwrap()
}

/// A raw peer speaking through its own codec chain.
pub struct Peer {
    pub stream: TcpStream,
    pub chain: CodecChain,
    buffer: BytesMut,
    pending: VecDeque<Message>,
}

impl Peer {
    pub async fn connect(addr: std::net::SocketAddr, names: &[&str]) -> Peer {
        Peer {
            stream: TcpStream::connect(addr).await.unwrap(),
            chain: chain(names),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
        }
    }

    pub async fn send(&mut self, messages: Vec<Message>) {
        let mut out = Vec::new();
        for message in messages {
            out.extend_from_slice(&self.chain.encode(message).unwrap());
        }
        self.stream.write_all(&out).await.unwrap();
    }

    /// Next decoded message, `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            self.pending.extend(self.chain.decode(&mut self.buffer).unwrap());
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            match self.stream.read_buf(&mut self.buffer).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Reads until the server closes, returning how many messages came first.
    pub async fn drain_until_closed(&mut self, within: Duration) -> Option<usize> {
        let mut received = 0;
        time::timeout(within, async {
            while self.recv().await.is_some() {
                received += 1;
            }
        })
        .await
        .ok()?;
        Some(received)
    }
}

/// Answers `ping` with `pong`.
pub struct PingHandler;

impl StrategyHandler for PingHandler {
    fn command(&self) -> &str {
        "ping"
    }

    fn process(&self, _session: &Arc<Session>, message: Message) -> AppResult<Option<Message>> {
        Ok(Some(Message::new("pong", message.into_payload())))
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    time::timeout(within, async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
