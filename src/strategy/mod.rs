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

//! Command strategy dispatch.
//!
//! Handlers register by command name. For each decoded message the dispatcher
//! walks the command's handlers by descending priority and runs the first
//! whose `supports` accepts the message.

pub use dispatcher::{DispatcherBuilder, StrategyDispatcher};
pub use handler::{split_commands, GlobalStrategy, StrategyHandler, COMMAND_SEPARATOR};

mod dispatcher;
mod handler;
