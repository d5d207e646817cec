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

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::service::IpFilterConfig;
use crate::{AppError, AppResult};

const RULE_SEPARATOR: char = ',';

/// An address or CIDR subnet, e.g. `192.168.1.7`, `10.0.0.0/8`, `fd00::/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRule {
    network: IpAddr,
    prefix_len: u8,
}

impl IpRule {
    pub fn matches(&self, addr: IpAddr) -> bool {
        match (self.network, addr.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                mask_v4(u32::from(addr), self.prefix_len) == u32::from(network)
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                mask_v6(u128::from(addr), self.prefix_len) == u128::from(network)
            }
            _ => false,
        }
    }
}

fn mask_v4(bits: u32, prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len => bits & (u32::MAX << (32 - u32::from(len))),
    }
}

fn mask_v6(bits: u128, prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len => bits & (u128::MAX << (128 - u32::from(len))),
    }
}

impl FromStr for IpRule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| AppError::InvalidValue(format!("ip rule address: {}", s)))?;
        let addr = addr.to_canonical();
        let max_len = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(prefix) => prefix
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max_len)
                .ok_or_else(|| AppError::InvalidValue(format!("ip rule prefix: {}", s)))?,
            None => max_len,
        };
        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4(mask_v4(u32::from(v4), prefix_len).into()),
            IpAddr::V6(v6) => IpAddr::V6(mask_v6(u128::from(v6), prefix_len).into()),
        };
        Ok(IpRule {
            network,
            prefix_len,
        })
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Entries may themselves hold comma separated rules.
fn compile_rules(entries: &[String]) -> AppResult<Vec<IpRule>> {
    let mut rules: Vec<IpRule> = Vec::new();
    for part in entries
        .iter()
        .flat_map(|entry| entry.split(RULE_SEPARATOR))
        .map(str::trim)
        .filter(|part| !part.is_empty())
    {
        let rule = part.parse()?;
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    Ok(rules)
}

/// Deny-overrides-allow address filter applied when a connection becomes active.
///
/// With both lists empty every address passes. A black-list match always
/// rejects; otherwise a non-empty white list must match.
#[derive(Debug, Default)]
pub struct IpFilter {
    black_rules: RwLock<Vec<IpRule>>,
    white_rules: Vec<IpRule>,
}

impl IpFilter {
    pub fn from_config(config: &IpFilterConfig) -> AppResult<IpFilter> {
        let black_rules = compile_rules(&config.black_list)?;
        let white_rules = compile_rules(&config.white_list)?;
        info!(
            "ip filter compiled: {} black rules, {} white rules",
            black_rules.len(),
            white_rules.len()
        );
        Ok(IpFilter {
            black_rules: RwLock::new(black_rules),
            white_rules,
        })
    }

    pub fn check(&self, addr: IpAddr) -> AppResult<()> {
        let black_rules = self.black_rules.read();
        if black_rules.is_empty() && self.white_rules.is_empty() {
            return Ok(());
        }
        if let Some(rule) = black_rules.iter().find(|rule| rule.matches(addr)) {
            return Err(AppError::ConnectionRejected(format!(
                "ip {} is black listed by {}",
                addr, rule
            )));
        }
        if self.white_rules.is_empty() || self.white_rules.iter().any(|rule| rule.matches(addr)) {
            return Ok(());
        }
        Err(AppError::ConnectionRejected(format!(
            "ip {} is not in the white list",
            addr
        )))
    }

    /// Adds a deny rule at runtime, returns false if it was already present.
    pub fn add_black_list(&self, rule: &str) -> AppResult<bool> {
        let rule: IpRule = rule.parse()?;
        let mut black_rules = self.black_rules.write();
        if black_rules.contains(&rule) {
            return Ok(false);
        }
        warn!("black list rule added: {}", rule);
        black_rules.push(rule);
        Ok(true)
    }

    pub fn remove_black_list(&self, rule: &str) -> AppResult<bool> {
        let rule: IpRule = rule.parse()?;
        let mut black_rules = self.black_rules.write();
        let before = black_rules.len();
        black_rules.retain(|existing| *existing != rule);
        Ok(black_rules.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn filter(black: &[&str], white: &[&str]) -> IpFilter {
        IpFilter::from_config(&IpFilterConfig {
            black_list: black.iter().map(|s| s.to_string()).collect(),
            white_list: white.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("10.0.0.0/8", "10.200.3.4", true)]
    #[case("10.0.0.0/8", "11.0.0.1", false)]
    #[case("192.168.1.7", "192.168.1.7", true)]
    #[case("192.168.1.7", "192.168.1.8", false)]
    #[case("0.0.0.0/0", "8.8.8.8", true)]
    #[case("127.0.0.1", "::ffff:127.0.0.1", true)]
    #[case("fd00::/8", "fd12::1", true)]
    #[case("fd00::/8", "10.0.0.1", false)]
    fn test_rule_matching(#[case] rule: &str, #[case] addr: &str, #[case] expected: bool) {
        let rule: IpRule = rule.parse().unwrap();
        assert_eq!(rule.matches(ip(addr)), expected);
    }

    #[rstest]
    #[case("not-an-ip")]
    #[case("10.0.0.0/33")]
    #[case("10.0.0.0/x")]
    fn test_invalid_rules(#[case] rule: &str) {
        assert!(rule.parse::<IpRule>().is_err());
    }

    #[test]
    fn test_empty_lists_allow_everything() {
        assert!(filter(&[], &[]).check(ip("1.2.3.4")).is_ok());
    }

    #[test]
    fn test_deny_overrides_allow() {
        let filter = filter(&["10.1.0.0/16"], &["10.0.0.0/8"]);
        assert!(matches!(
            filter.check(ip("10.1.2.3")),
            Err(AppError::ConnectionRejected(_))
        ));
        assert!(filter.check(ip("10.2.0.1")).is_ok());
    }

    #[test]
    fn test_white_list_must_match_when_present() {
        let filter = filter(&[], &["192.168.0.0/16, 127.0.0.1"]);
        assert!(filter.check(ip("127.0.0.1")).is_ok());
        assert!(filter.check(ip("192.168.9.9")).is_ok());
        assert!(filter.check(ip("8.8.8.8")).is_err());
    }

    #[test]
    fn test_black_list_only_allows_others() {
        let filter = filter(&["8.8.8.8"], &[]);
        assert!(filter.check(ip("8.8.8.8")).is_err());
        assert!(filter.check(ip("8.8.4.4")).is_ok());
    }

    #[test]
    fn test_runtime_black_list_updates() -> AppResult<()> {
        let filter = filter(&[], &[]);
        assert!(filter.add_black_list("172.16.0.0/12")?);
        assert!(!filter.add_black_list("172.16.0.0/12")?);
        assert!(filter.check(ip("172.20.1.1")).is_err());
        assert!(filter.remove_black_list("172.16.0.0/12")?);
        assert!(filter.check(ip("172.20.1.1")).is_ok());
        Ok(())
    }
}
