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

use std::time::Duration;

use tokio::time::Instant;

use crate::service::HeartbeatConfig;

use super::IdleState;

#[derive(Debug)]
struct IdleTimer {
    state: IdleState,
    timeout: Duration,
    /// last activity or last firing, whichever is later
    mark: Instant,
}

impl IdleTimer {
    fn deadline(&self) -> Instant {
        self.mark + self.timeout
    }
}

/// Tracks read/write activity of one connection and reports idle states.
///
/// Detection only: firing returns the idle states to the caller, which
/// publishes them. A timer that fired re-arms from the firing time, so a
/// silent peer produces one event per timeout period.
#[derive(Debug)]
pub struct IdleSupervisor {
    timers: Vec<IdleTimer>,
    consecutive: u64,
}

impl IdleSupervisor {
    pub fn new(config: &HeartbeatConfig, now: Instant) -> Self {
        let timers = [
            (IdleState::Reader, config.read_idle()),
            (IdleState::Writer, config.write_idle()),
            (IdleState::All, config.all_idle()),
        ]
        .into_iter()
        .filter_map(|(state, timeout)| {
            timeout.map(|timeout| IdleTimer {
                state,
                timeout,
                mark: now,
            })
        })
        .collect();
        IdleSupervisor {
            timers,
            consecutive: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.timers.is_empty()
    }

    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }

    /// The earliest instant at which some idle state fires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(IdleTimer::deadline).min()
    }

    /// Bytes arrived; also resets the consecutive idle count.
    pub fn touch_read(&mut self, now: Instant) {
        self.consecutive = 0;
        self.touch(now, IdleState::Reader);
    }

    pub fn touch_write(&mut self, now: Instant) {
        self.touch(now, IdleState::Writer);
    }

    fn touch(&mut self, now: Instant, state: IdleState) {
        for timer in self.timers.iter_mut() {
            if timer.state == state || timer.state == IdleState::All {
                timer.mark = now;
            }
        }
    }

    /// Fires every timer whose deadline has passed, returning each fired
    /// state with the consecutive count after that firing.
    pub fn check(&mut self, now: Instant) -> Vec<(IdleState, u64)> {
        let mut fired = Vec::new();
        for timer in self.timers.iter_mut() {
            if timer.deadline() <= now {
                timer.mark = now;
                self.consecutive = self.consecutive.saturating_add(1);
                fired.push((timer.state, self.consecutive));
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(read: u64, write: u64, all: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            read_idle_ms: read,
            write_idle_ms: write,
            all_idle_ms: all,
            timeout_total: 0,
        }
    }

    #[test]
    fn test_disabled_has_no_deadline() {
        let supervisor = IdleSupervisor::new(&HeartbeatConfig::default(), Instant::now());
        assert!(!supervisor.is_enabled());
        assert!(supervisor.next_deadline().is_none());
    }

    #[test]
    fn test_fires_and_rearms() {
        let start = Instant::now();
        let mut supervisor = IdleSupervisor::new(&heartbeat(0, 0, 100), start);
        assert_eq!(supervisor.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(supervisor.check(start + Duration::from_millis(50)).is_empty());

        let first = start + Duration::from_millis(100);
        assert_eq!(supervisor.check(first), vec![(IdleState::All, 1)]);
        assert_eq!(supervisor.next_deadline(), Some(first + Duration::from_millis(100)));
        assert_eq!(
            supervisor.check(first + Duration::from_millis(100)),
            vec![(IdleState::All, 2)]
        );
    }

    #[test]
    fn test_read_resets_count_and_write_keeps_it() {
        let start = Instant::now();
        let mut supervisor = IdleSupervisor::new(&heartbeat(100, 0, 200), start);
        supervisor.check(start + Duration::from_millis(100));
        assert_eq!(supervisor.consecutive(), 1);

        // a write delays all-idle but not reader-idle
        let write_at = start + Duration::from_millis(150);
        supervisor.touch_write(write_at);
        assert_eq!(supervisor.consecutive(), 1);
        assert_eq!(
            supervisor.check(start + Duration::from_millis(200)),
            vec![(IdleState::Reader, 2)]
        );

        supervisor.touch_read(start + Duration::from_millis(210));
        assert_eq!(supervisor.consecutive(), 0);
        assert_eq!(
            supervisor.next_deadline(),
            Some(start + Duration::from_millis(310))
        );
    }
}
