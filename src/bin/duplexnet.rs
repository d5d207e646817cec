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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::runtime::{self, Runtime};
use tokio::signal;
use tracing::{debug, info, warn};

use duplexnet::{
    setup_tracing, AppConfig, AppError, AppResult, Client, CodecRegistry, DispatcherBuilder,
    EventSink, IdleClosePolicy, LogGuard, Message, Server, Session, SessionRegistry,
    StrategyHandler,
};

#[derive(Parser)]
#[command(version, about = "duplex tcp server and client")]
pub struct CommandLine {
    /// config file path, defaults to ./conf.toml
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// listen on every configured port
    Server,
    /// connect to the configured server and ping it
    Client,
    PrintConfig,
}

/// Answers `ping` with `pong`, same payload.
struct PingHandler;

impl StrategyHandler for PingHandler {
    fn command(&self) -> &str {
        "ping"
    }

    fn process(&self, session: &Arc<Session>, message: Message) -> AppResult<Option<Message>> {
        debug!(session = %session, "ping");
        Ok(Some(Message::new("pong", message.into_payload())))
    }
}

struct EchoHandler;

impl StrategyHandler for EchoHandler {
    fn command(&self) -> &str {
        "echo"
    }

    fn process(&self, _session: &Arc<Session>, message: Message) -> AppResult<Option<Message>> {
        Ok(Some(message))
    }
}

struct PongHandler;

impl StrategyHandler for PongHandler {
    fn command(&self) -> &str {
        "pong"
    }

    fn process(&self, session: &Arc<Session>, message: Message) -> AppResult<Option<Message>> {
        info!(session = %session, "pong: {} bytes", message.payload().len());
        Ok(None)
    }
}

fn apply_verbosity(verbose: u8) {
    let level = match verbose {
        0 => return,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", level);
    }
}

fn build_runtime(name: &str, worker_threads: usize) -> AppResult<Runtime> {
    Ok(runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name(name)
        .enable_all()
        .build()?)
}

fn run_server(config: AppConfig) -> AppResult<()> {
    let boss = build_runtime("duplexnet-boss", num_cpus::get())?;
    let io = build_runtime("duplexnet-io", num_cpus::get() * 2)?;

    let registry = SessionRegistry::new();
    let (events, event_rx) = EventSink::channel(1024);
    let timeout_total = config.server.heartbeat.timeout_total;
    let handlers = DispatcherBuilder::new()
        .handler(PingHandler)
        .handler(EchoHandler);
    let server = Server::new(config.server, CodecRegistry::with_builtins(), handlers)?
        .with_registry(registry.clone())
        .with_events(events)
        .with_io_handle(io.handle().clone());

    boss.block_on(async move {
        let _policy = IdleClosePolicy::spawn(event_rx, registry, timeout_total);
        let running = server.bind().await?;
        info!(
            "server listening on {:?}, skipped ports {:?}",
            running.local_addrs(),
            running.skipped_ports()
        );
        signal::ctrl_c().await?;
        info!("get shutdown signal");
        running.shutdown().await;
        Ok::<(), AppError>(())
    })?;
    io.shutdown_timeout(Duration::from_secs(5));
    Ok(())
}

fn run_client(config: AppConfig) -> AppResult<()> {
    let io = build_runtime("duplexnet-io", num_cpus::get())?;
    let ping_interval = config
        .client
        .heartbeat
        .write_idle()
        .unwrap_or(Duration::from_secs(5));

    io.block_on(async move {
        let client = Client::builder(config.client)
            .handlers(DispatcherBuilder::new().handler(PongHandler))
            .build()?;
        client.run().await;

        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = client.send(Message::new("ping", "hello")) {
                        warn!("ping not sent: {}", e);
                    }
                }
                res = signal::ctrl_c() => {
                    res?;
                    info!("get shutdown signal");
                    break;
                }
            }
        }
        client.shutdown();
        Ok::<(), AppError>(())
    })
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();
    apply_verbosity(commandline.verbose);

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = AppConfig::load(config_path)?;

    let log_dir = config.log_dir.clone().unwrap_or_else(|| "./logs".to_string());
    let _log_guard: LogGuard = setup_tracing(&log_dir)?;

    match commandline.command {
        Some(Command::PrintConfig) => {
            println!("{:#?}", config);
            Ok(())
        }
        Some(Command::Client) => run_client(config),
        Some(Command::Server) | None => run_server(config),
    }
}
