//! Chainable prompt builder over the environment.
//!
//! ```ignore
//! let reply = ctx
//!     .builder()
//!     .system("You are terse.")
//!     .user(&question)
//!     .run(RunOptions::default())
//!     .await?;
//! ```
//!
//! The chain is kept after `run` unless the builder was created with
//! [`ChainPolicy::ClearAfterRun`]; a kept chain is sent again on the next run.

pub mod handles;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::api::{ChatMessage, Role};
use crate::environment::{CompletionParams, Environment};
use crate::error::ApiError;

pub use handles::{Completions, Files, Messages, Vectors};

/// What happens to the accumulated chain after a successful `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChainPolicy {
    #[default]
    Keep,
    ClearAfterRun,
}

/// Completion options; unset fields take the environment defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Option<Vec<Value>>,
    pub stream: Option<bool>,
}

impl RunOptions {
    pub fn to_params(&self) -> CompletionParams {
        let defaults = CompletionParams::default();
        CompletionParams {
            model: self.model.clone().unwrap_or(defaults.model),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            tools: self.tools.clone(),
            stream: self.stream.unwrap_or(defaults.stream),
        }
    }
}

/// Accumulates a chain of messages and runs it as one completion.
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    env: Arc<Environment>,
    chain: Vec<ChatMessage>,
    policy: ChainPolicy,
}

impl AgentBuilder {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            chain: Vec::new(),
            policy: ChainPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ChainPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn chain(&self) -> &[ChatMessage] {
        &self.chain
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) -> &mut Self {
        self.chain.push(ChatMessage::new(role, content));
        self
    }

    pub fn system(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Role::System, content)
    }

    pub fn user(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Role::User, content)
    }

    pub fn assistant(&mut self, content: impl Into<String>) -> &mut Self {
        self.push(Role::Assistant, content)
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> &mut Self {
        self.chain.extend(messages);
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.chain.clear();
        self
    }

    /// Run the chain as one completion.
    ///
    /// A non-empty reply is posted to the thread unless the run is local.
    pub async fn run(&mut self, options: RunOptions) -> Result<Option<String>, ApiError> {
        let reply = self
            .env
            .generate_completion(&self.chain, &options.to_params())
            .await?;
        if self.policy == ChainPolicy::ClearAfterRun {
            self.chain.clear();
        }

        match reply.as_deref() {
            Some(text) if !text.is_empty() && !self.env.is_local() => {
                self.env.add_reply(text, None).await?;
            }
            Some(_) => tracing::debug!(local = self.env.is_local(), "Reply not posted"),
            None => tracing::debug!("Completion returned no choices"),
        }
        Ok(reply)
    }

    /// Thread messages; `thread_id` overrides the configured thread for listing.
    pub fn messages<'a>(&'a self, thread_id: Option<&'a str>) -> Messages<'a> {
        Messages::new(&self.env, thread_id)
    }

    pub fn completions(&self) -> Completions<'_> {
        Completions::new(&self.env)
    }

    pub fn files(&self) -> Files<'_> {
        Files::new(&self.env)
    }

    pub fn vectors(&self) -> Vectors<'_> {
        Vectors::new(&self.env)
    }
}
