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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Prefix of environment variables overriding file values, e.g.
/// `DUPLEXNET__CLIENT__PORT=9001`.
const ENV_PREFIX: &str = "DUPLEXNET";

/// Idle detection timeouts; a zero value disables that idle state.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub read_idle_ms: u64,
    pub write_idle_ms: u64,
    pub all_idle_ms: u64,
    /// consecutive idle events tolerated by the close-on-idle policy, 0 disables it
    pub timeout_total: u64,
}

impl HeartbeatConfig {
    pub fn read_idle(&self) -> Option<Duration> {
        non_zero_millis(self.read_idle_ms)
    }
    pub fn write_idle(&self) -> Option<Duration> {
        non_zero_millis(self.write_idle_ms)
    }
    pub fn all_idle(&self) -> Option<Duration> {
        non_zero_millis(self.all_idle_ms)
    }
    pub fn is_enabled(&self) -> bool {
        self.read_idle_ms > 0 || self.write_idle_ms > 0 || self.all_idle_ms > 0
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// largest frame body accepted by the length-field framer
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            max_frame_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IpFilterConfig {
    pub black_list: Vec<String>,
    pub white_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// messages allowed per window, 0 disables the limiter
    pub max: u64,
    pub delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max: 0,
            delay_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn is_enabled(&self) -> bool {
        self.max > 0 && self.delay_ms > 0
    }
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// One listening port and the ordered names of its codec stages.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub port: u16,
    pub codecs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub backlog: u32,
    pub max_connection: usize,
    pub outbound_capacity: usize,
    pub close_on_decode_error: bool,
    pub listeners: Vec<ListenerConfig>,
    pub ip_filter: IpFilterConfig,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub codec: CodecConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            backlog: 1024,
            max_connection: 10_000,
            outbound_capacity: 1024,
            close_on_decode_error: true,
            listeners: Vec::new(),
            ip_filter: IpFilterConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Listen backlog, never below 50.
    pub fn effective_backlog(&self) -> u32 {
        self.backlog.max(50)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub codecs: Vec<String>,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub outbound_capacity: usize,
    pub close_on_decode_error: bool,
    pub heartbeat: HeartbeatConfig,
    pub codec: CodecConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            codecs: Vec::new(),
            reconnect_interval_ms: 5000,
            connect_timeout_ms: 3000,
            outbound_capacity: 1024,
            close_on_decode_error: true,
            heartbeat: HeartbeatConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: Option<String>,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }
}
