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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, more bytes are needed before a frame can be produced
    #[error("incomplete frame")]
    Incomplete,

    /// ingress and protocol errors
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("request rate exceeded: {count} requests within {window_ms}ms (max {max})")]
    RateExceeded { count: u64, max: u64, window_ms: u64 },

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("no strategy handler for command: {0}")]
    DispatchMiss(String),

    #[error("connect failure: {0}")]
    ConnectFailure(String),

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("handler error: {0}")]
    Handler(String),
}

impl AppError {
    /// Whether the connection that produced this error has to be closed.
    ///
    /// Only ingress rejections close it; anything a handler returns is logged
    /// and the connection keeps serving. Decode errors are left to the
    /// connection's policy.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            AppError::ConnectionRejected(_) | AppError::RateExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::ProtocolDecode(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AppError::ConnectionRejected("1.2.3.4".into()).is_fatal_for_connection());
        assert!(AppError::RateExceeded {
            count: 11,
            max: 10,
            window_ms: 1000
        }
        .is_fatal_for_connection());
        assert!(!AppError::DispatchMiss("login".into()).is_fatal_for_connection());
        assert!(!AppError::ProtocolDecode("bad json".into()).is_fatal_for_connection());
        assert!(!AppError::InvalidValue("missing field".into()).is_fatal_for_connection());
        assert!(!AppError::IllegalStateError("not logged in".into()).is_fatal_for_connection());
    }
}
