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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use crate::service::RateLimitConfig;
use crate::{AppError, AppResult};

/// Per-connection request counter with a fixed reset window.
///
/// The read path only increments and compares. Zeroing happens solely in the
/// reset task, which lives exactly as long as the limiter: dropping the
/// limiter (connection closed or pipeline torn down) aborts it.
#[derive(Debug)]
pub struct RateLimiter {
    max: u64,
    window: Duration,
    count: Arc<AtomicU64>,
    reset_task: JoinHandle<()>,
}

impl RateLimiter {
    /// Starts the reset task on the current runtime, `None` when limiting is disabled.
    pub fn start(config: &RateLimitConfig) -> Option<RateLimiter> {
        if !config.is_enabled() {
            return None;
        }
        let window = config.delay();
        let count = Arc::new(AtomicU64::new(0));
        let reset_count = count.clone();
        let reset_task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + window, window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let previous = reset_count.swap(0, Ordering::AcqRel);
                trace!("rate limit window reset, {} requests counted", previous);
            }
        });
        Some(RateLimiter {
            max: config.max,
            window,
            count,
            reset_task,
        })
    }

    /// Counts one inbound message, failing once the window holds more than `max`.
    pub fn on_message(&self) -> AppResult<u64> {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(if count == u64::MAX { 0 } else { count + 1 })
            })
            .unwrap_or_default();
        let count = if previous == u64::MAX { 0 } else { previous + 1 };
        if self.max > 0 && count > self.max {
            return Err(AppError::RateExceeded {
                count,
                max: self.max,
                window_ms: self.window.as_millis() as u64,
            });
        }
        Ok(count)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.reset_task.abort();
    }
}
