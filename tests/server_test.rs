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

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use common::{codecs, setup, wait_until, Peer, PingHandler};
use duplexnet::{
    AppError, AppResult, CodecRegistry, DispatcherBuilder, EventSink, IdleClosePolicy, LifecycleEvent,
    ListenerConfig, Message, RunningServer, Server, ServerConfig, Session, StrategyHandler,
};
use rstest::rstest;
use tokio::io::AsyncWriteExt;
use tokio::time;

const FRAMED_JSON: &[&str] = &["length_field", "json"];

fn listener(names: &[&str]) -> ListenerConfig {
    ListenerConfig {
        port: 0,
        codecs: codecs(names),
    }
}

fn server_config(listeners: Vec<ListenerConfig>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        listeners,
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig, events: EventSink) -> RunningServer {
    start_with(config, events, DispatcherBuilder::new().handler(PingHandler)).await
}

async fn start_with(
    config: ServerConfig,
    events: EventSink,
    handlers: DispatcherBuilder,
) -> RunningServer {
    Server::new(config, CodecRegistry::with_builtins(), handlers)
        .unwrap()
        .with_events(events)
        .bind()
        .await
        .unwrap()
}

#[rstest]
#[tokio::test]
async fn test_port_without_codec_is_skipped(_setup: ()) {
    let config = server_config(vec![
        listener(FRAMED_JSON),
        listener(&["line", "json"]),
        listener(&[]),
        listener(&["no_such_codec"]),
    ]);
    let server = start(config, EventSink::discard()).await;
    assert_eq!(server.local_addrs().len(), 2);
    assert_eq!(server.skipped_ports(), &[0, 0]);

    // both bound ports serve with their own chain
    let mut framed = Peer::connect(server.local_addrs()[0], FRAMED_JSON).await;
    framed.send(vec![Message::new("ping", "a")]).await;
    assert_eq!(framed.recv().await.unwrap().command(), "pong");

    let mut lines = Peer::connect(server.local_addrs()[1], &["line", "json"]).await;
    lines.send(vec![Message::new("ping", "b")]).await;
    let reply = lines.recv().await.unwrap();
    assert_eq!(reply.command(), "pong");
    assert_eq!(reply.payload().as_ref(), b"b");

    server.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn test_no_usable_port_fails_startup(_setup: ()) {
    let server = Server::new(
        server_config(vec![listener(&[])]),
        CodecRegistry::with_builtins(),
        DispatcherBuilder::new().handler(PingHandler),
    )
    .unwrap();
    assert!(matches!(
        server.bind().await,
        Err(AppError::ConfigurationMissing(_))
    ));
}

#[rstest]
#[tokio::test]
async fn test_dispatch_miss_keeps_connection_and_binds_device(_setup: ()) {
    let server = start(server_config(vec![listener(FRAMED_JSON)]), EventSink::discard()).await;
    let addr = server.local_addrs()[0];
    let mut peer = Peer::connect(addr, FRAMED_JSON).await;

    peer.send(vec![
        Message::new("unknown", "x").with_device_id("dev-1"),
        Message::new("ping", "y"),
    ])
    .await;
    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.command(), "pong");
    assert_eq!(reply.payload().as_ref(), b"y");

    let session = server.registry().get_by_device("dev-1").unwrap();
    assert_eq!(session.supported_port(), Some(addr.port()));
    assert_eq!(server.registry().len(), 1);

    drop(peer);
    assert!(wait_until(|| server.registry().is_empty(), Duration::from_secs(2)).await);
    assert!(server.registry().get_by_device("dev-1").is_none());
    server.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn test_rate_limit_closes_only_above_max(_setup: ()) {
    let mut config = server_config(vec![listener(FRAMED_JSON)]);
    config.rate_limit.max = 3;
    config.rate_limit.delay_ms = 60_000;
    let server = start(config, EventSink::discard()).await;
    let addr = server.local_addrs()[0];

    let mut within = Peer::connect(addr, FRAMED_JSON).await;
    within
        .send((0..3).map(|i| Message::new("ping", i.to_string())).collect())
        .await;
    for _ in 0..3 {
        assert_eq!(within.recv().await.unwrap().command(), "pong");
    }
    // still open: nothing more arrives and no close is observed
    assert!(time::timeout(Duration::from_millis(200), within.recv())
        .await
        .is_err());

    let mut above = Peer::connect(addr, FRAMED_JSON).await;
    above
        .send((0..4).map(|i| Message::new("ping", i.to_string())).collect())
        .await;
    assert!(above
        .drain_until_closed(Duration::from_secs(2))
        .await
        .is_some());

    assert!(wait_until(|| server.registry().len() == 1, Duration::from_secs(2)).await);
    server.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn test_black_list_rejects_until_removed(_setup: ()) {
    let mut config = server_config(vec![listener(FRAMED_JSON)]);
    config.ip_filter.black_list = vec!["127.0.0.0/8".to_string()];
    config.ip_filter.white_list = vec!["127.0.0.1".to_string()];
    let (events, event_rx) = EventSink::channel(16);
    let server = start(config, events).await;
    let addr = server.local_addrs()[0];

    let mut rejected = Peer::connect(addr, FRAMED_JSON).await;
    assert_eq!(
        rejected.drain_until_closed(Duration::from_secs(2)).await,
        Some(0)
    );
    let event = time::timeout(Duration::from_secs(2), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, LifecycleEvent::Rejected { .. }));
    assert!(server.registry().is_empty());

    assert!(server.ip_filter().remove_black_list("127.0.0.0/8").unwrap());
    let mut accepted = Peer::connect(addr, FRAMED_JSON).await;
    accepted.send(vec![Message::new("ping", "")]).await;
    assert_eq!(accepted.recv().await.unwrap().command(), "pong");

    server.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn test_idle_policy_closes_silent_connection(_setup: ()) {
    let mut config = server_config(vec![listener(FRAMED_JSON)]);
    config.heartbeat.all_idle_ms = 50;
    config.heartbeat.timeout_total = 2;
    let (events, event_rx) = EventSink::channel(64);
    let server = start(config, events).await;
    let _policy = IdleClosePolicy::spawn(event_rx, server.registry().clone(), 2);

    let mut silent = Peer::connect(server.local_addrs()[0], FRAMED_JSON).await;
    assert_eq!(silent.drain_until_closed(Duration::from_secs(3)).await, Some(0));
    assert!(wait_until(|| server.registry().is_empty(), Duration::from_secs(2)).await);
    server.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn test_shutdown_closes_connections(_setup: ()) {
    let server = start(server_config(vec![listener(FRAMED_JSON)]), EventSink::discard()).await;
    let mut peer = Peer::connect(server.local_addrs()[0], FRAMED_JSON).await;
    peer.send(vec![Message::new("ping", "")]).await;
    assert!(peer.recv().await.is_some());
    let registry = server.registry().clone();

    time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap();
    assert!(registry.is_empty());
    assert!(peer.recv().await.is_none());
}

/// Encoded `ping` immediately followed by a length-prefixed frame that is not json.
fn ping_then_garbage(peer: &mut Peer) -> Vec<u8> {
    let mut wire = bytes::BytesMut::new();
    wire.extend_from_slice(&peer.chain.encode(Message::new("ping", "first")).unwrap());
    wire.put_i32(4);
    wire.put_slice(b"{bad");
    wire.to_vec()
}

#[rstest]
#[tokio::test]
async fn test_decode_error_closes_after_earlier_messages(_setup: ()) {
    let server = start(server_config(vec![listener(FRAMED_JSON)]), EventSink::discard()).await;
    let mut peer = Peer::connect(server.local_addrs()[0], FRAMED_JSON).await;

    let wire = ping_then_garbage(&mut peer);
    peer.stream.write_all(&wire).await.unwrap();
    assert_eq!(
        peer.drain_until_closed(Duration::from_secs(2)).await,
        Some(1)
    );
    assert!(wait_until(|| server.registry().is_empty(), Duration::from_secs(2)).await);
    server.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn test_tolerated_decode_error_keeps_connection(_setup: ()) {
    let mut config = server_config(vec![listener(FRAMED_JSON)]);
    config.close_on_decode_error = false;
    let server = start(config, EventSink::discard()).await;
    let mut peer = Peer::connect(server.local_addrs()[0], FRAMED_JSON).await;

    let wire = ping_then_garbage(&mut peer);
    peer.stream.write_all(&wire).await.unwrap();
    let reply = time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().as_ref(), b"first");

    peer.send(vec![Message::new("ping", "second")]).await;
    let reply = time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().as_ref(), b"second");
    assert_eq!(server.registry().len(), 1);
    server.shutdown().await;
}

/// Fails every message with a non-handler error kind.
struct FailingHandler;

impl StrategyHandler for FailingHandler {
    fn command(&self) -> &str {
        "fail"
    }

    fn process(&self, _session: &Arc<Session>, _message: Message) -> AppResult<Option<Message>> {
        Err(AppError::InvalidValue("missing field user".to_string()))
    }
}

#[rstest]
#[tokio::test]
async fn test_handler_error_keeps_connection(_setup: ()) {
    let server = start_with(
        server_config(vec![listener(FRAMED_JSON)]),
        EventSink::discard(),
        DispatcherBuilder::new()
            .handler(PingHandler)
            .handler(FailingHandler),
    )
    .await;
    let mut peer = Peer::connect(server.local_addrs()[0], FRAMED_JSON).await;

    peer.send(vec![Message::new("fail", ""), Message::new("ping", "after")]).await;
    let reply = time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload().as_ref(), b"after");
    assert_eq!(server.registry().len(), 1);
    server.shutdown().await;
}
