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

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::service::CodecConfig;
use crate::{AppError, AppResult};

use super::{
    CodecChain, CodecStage, Decoder, Encoder, JsonDecoder, JsonEncoder, LengthFieldDecoder,
    LengthFieldPrepender, LineDecoder, LineEncoder,
};

pub const LENGTH_FIELD: &str = "length_field";
pub const LINE: &str = "line";
pub const JSON: &str = "json";

/// Produces a fresh stage for every connection, stages carry per-connection state.
pub type StageFactory = Arc<dyn Fn(&CodecConfig) -> CodecStage + Send + Sync>;

/// Name to codec-stage lookup supplied by the hosting application.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<String, StageFactory>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        CodecRegistry::default()
    }

    /// A registry holding `length_field`, `line` and `json`.
    pub fn with_builtins() -> Self {
        let mut registry = CodecRegistry::new();
        registry.register(LENGTH_FIELD, |config: &CodecConfig| {
            CodecStage::combined(
                Decoder::bytes(LengthFieldDecoder::new(config.max_frame_size)),
                Encoder::bytes(LengthFieldPrepender),
            )
        });
        registry.register(LINE, |config: &CodecConfig| {
            CodecStage::combined(
                Decoder::bytes(LineDecoder::new(config.max_frame_size)),
                Encoder::bytes(LineEncoder),
            )
        });
        registry.register(JSON, |_: &CodecConfig| {
            CodecStage::combined(Decoder::message(JsonDecoder), Encoder::message(JsonEncoder))
        });
        registry
    }

    /// Registers or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&CodecConfig) -> CodecStage + Send + Sync + 'static,
    {
        let name = name.into();
        info!("register codec stage: {}", name);
        self.factories.insert(name, Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Resolves `names` once, the returned template builds one chain per connection.
    pub fn resolve(&self, names: &[String], config: &CodecConfig) -> AppResult<ChainTemplate> {
        if names.is_empty() {
            return Err(AppError::ConfigurationMissing(
                "no codec stage configured".to_string(),
            ));
        }
        let mut stages = Vec::with_capacity(names.len());
        for name in names {
            let factory = self.factories.get(name).ok_or_else(|| {
                AppError::ConfigurationMissing(format!("unknown codec stage: {}", name))
            })?;
            stages.push((name.clone(), factory.clone()));
        }
        let template = ChainTemplate {
            stages,
            config: config.clone(),
        };
        // fail at setup time instead of on the first connection
        template.instantiate()?;
        Ok(template)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("CodecRegistry").field("stages", &names).finish()
    }
}

/// Resolved stage factories for one listener or client.
#[derive(Clone)]
pub struct ChainTemplate {
    stages: Vec<(String, StageFactory)>,
    config: CodecConfig,
}

impl ChainTemplate {
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn instantiate(&self) -> AppResult<CodecChain> {
        CodecChain::new(
            self.stages
                .iter()
                .map(|(name, factory)| (name.clone(), factory(&self.config)))
                .collect(),
        )
    }
}

impl fmt::Debug for ChainTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainTemplate")
            .field("stages", &self.names())
            .finish()
    }
}
