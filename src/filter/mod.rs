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

//! Ingress protection applied before any message reaches a handler.
//!
//! - `IpFilter`: black/white list check when a connection becomes active
//! - `RateLimiter`: per-connection message budget per time window

pub use ip_filter::{IpFilter, IpRule};
pub use rate_limit::RateLimiter;

mod ip_filter;
mod rate_limit;
