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

use std::sync::Arc;

use crate::codec::Message;
use crate::session::Session;
use crate::AppResult;

/// Separator between several command names in one `command()` value.
pub const COMMAND_SEPARATOR: char = ',';

/// Business logic selected by a message's command.
///
/// `process` runs inside the connection's turn, so it must not block; slow
/// work belongs on a spawned task that answers later through
/// [`Session::send`]. Returning `Ok(None)` means no reply.
pub trait StrategyHandler: Send + Sync {
    /// One command or several separated by commas, e.g. `"login,relogin"`.
    fn command(&self) -> &str;

    fn commands(&self) -> Vec<String> {
        split_commands(self.command())
    }

    /// Higher runs first among handlers of the same command.
    fn priority(&self) -> i32 {
        0
    }

    fn supports(&self, _message: &Message) -> bool {
        true
    }

    /// Server side only: whether connections on `port` get this handler.
    fn supports_port(&self, _port: u16) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn process(&self, session: &Arc<Session>, message: Message) -> AppResult<Option<Message>>;
}

/// Consulted before command routing; a returned reply short-circuits it.
pub trait GlobalStrategy: Send + Sync {
    fn intercept(&self, session: &Arc<Session>, message: &Message) -> Option<Message>;
}

pub fn split_commands(command: &str) -> Vec<String> {
    let mut commands: Vec<String> = Vec::new();
    for part in command
        .split(COMMAND_SEPARATOR)
        .map(str::trim)
        .filter(|part| !part.is_empty())
    {
        if !commands.iter().any(|existing| existing == part) {
            commands.push(part.to_string());
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_commands() {
        assert_eq!(split_commands("login"), vec!["login"]);
        assert_eq!(
            split_commands(" login, relogin ,,login"),
            vec!["login", "relogin"]
        );
        assert!(split_commands(" , ").is_empty());
    }
}
