//! The capability surface handed to agent code.
//!
//! An [`Environment`] wraps the remote transport plus an in-process buffer of
//! locally registered user messages. Where messages come from is decided once,
//! at construction, by [`MessageSource`]:
//! - `Local`: the thread id is the local sentinel; nothing is read remotely.
//! - `Remote`: messages are listed from the configured thread.
//!
//! The buffer is consulted first for `user` lookups in either mode.
//!
//! Agents normally receive the environment explicitly. [`init_env`] / [`env`]
//! keep a process-wide slot for agent code that expects an ambient lookup;
//! initializing it twice is an error.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::api::{
    ChatCompletionRequest, ChatMessage, CreateVectorStore, FileObject, HubClient, MessageCreate,
    Order, Role, ThreadMessage,
};
use crate::config::{AgentConfig, LOCAL_THREAD_ID};
use crate::error::{ApiError, EnvError};

/// Model used when the caller passes an empty or blank model name.
pub const DEFAULT_MODEL: &str = "llama-v3p1-70b-instruct";

pub const DEFAULT_MAX_TOKENS: u32 = 4000;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Where `fetch_last_message` looks once the local buffer has been consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    Local,
    Remote { thread_id: String },
}

impl MessageSource {
    pub fn from_thread_id(thread_id: &str) -> Self {
        if thread_id == LOCAL_THREAD_ID {
            Self::Local
        } else {
            Self::Remote {
                thread_id: thread_id.to_string(),
            }
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            Self::Local => LOCAL_THREAD_ID,
            Self::Remote { thread_id } => thread_id,
        }
    }
}

/// A user message registered in-process. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMessage {
    pub role: Role,
    pub content: String,
}

/// Options for a single completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub tools: Option<Vec<Value>>,
    pub stream: bool,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            tools: None,
            stream: false,
        }
    }
}

/// The facade agent code talks to.
#[derive(Debug)]
pub struct Environment {
    hub: HubClient,
    source: MessageSource,
    env_vars: BTreeMap<String, String>,
    local_messages: RwLock<Vec<LocalMessage>>,
}

impl Environment {
    /// Build the facade for a resolved config. Fails without a usable credential.
    pub fn new(config: &AgentConfig, request_timeout: Duration) -> Result<Self, EnvError> {
        let auth = config.auth.as_ref().ok_or(EnvError::MissingAuth)?;
        if auth.is_empty() {
            return Err(EnvError::InvalidAuth(
                "credential is empty; expected { \"auth\": { ... } } in the config".to_string(),
            ));
        }

        Ok(Self {
            hub: HubClient::new(config.base_url.clone(), auth, request_timeout),
            source: MessageSource::from_thread_id(&config.thread_id),
            env_vars: config.env_vars.clone(),
            local_messages: RwLock::new(Vec::new()),
        })
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn thread_id(&self) -> &str {
        self.source.thread_id()
    }

    pub fn is_local(&self) -> bool {
        self.source == MessageSource::Local
    }

    pub fn base_url(&self) -> &str {
        self.hub.base_url()
    }

    /// Look up a resolved environment variable. Never touches the network.
    pub fn get_env_var(&self, key: &str) -> Option<&str> {
        self.env_vars.get(key).map(String::as_str)
    }

    // ── Local buffer ─────────────────────────────────────────────────

    /// Register a user message for this session.
    pub async fn set_local_user_message(&self, content: impl Into<String>) {
        self.local_messages.write().await.push(LocalMessage {
            role: Role::User,
            content: content.into(),
        });
    }

    pub async fn local_messages(&self) -> Vec<LocalMessage> {
        self.local_messages.read().await.clone()
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// List thread messages. Without an explicit thread in local mode the
    /// local buffer is returned instead.
    pub async fn list_messages(
        &self,
        thread_id: Option<&str>,
        limit: Option<u32>,
        order: Order,
    ) -> Result<Vec<ThreadMessage>, ApiError> {
        let thread_id = match (thread_id, &self.source) {
            (Some(id), _) => id,
            (None, MessageSource::Remote { thread_id }) => thread_id.as_str(),
            (None, MessageSource::Local) => {
                let mut messages: Vec<ThreadMessage> = self
                    .local_messages
                    .read()
                    .await
                    .iter()
                    .map(|m| ThreadMessage::local_user(&m.content))
                    .collect();
                if order == Order::Desc {
                    messages.reverse();
                }
                if let Some(limit) = limit {
                    messages.truncate(limit as usize);
                }
                return Ok(messages);
            }
        };
        self.hub.list_messages(thread_id, limit, order).await
    }

    /// The most recent message with `role`, or `None`.
    ///
    /// For `user`, the latest locally registered message wins and stays in the
    /// buffer, so repeated calls see the same message.
    pub async fn fetch_last_message(&self, role: &str) -> Result<Option<ThreadMessage>, ApiError> {
        if role == Role::User.as_str()
            && let Some(last) = self.local_messages.read().await.last()
        {
            return Ok(Some(ThreadMessage::local_user(&last.content)));
        }

        match &self.source {
            MessageSource::Local => Ok(None),
            MessageSource::Remote { thread_id } => {
                let messages = self.hub.list_messages(thread_id, None, Order::Asc).await?;
                Ok(messages.into_iter().rev().find(|m| m.role == role))
            }
        }
    }

    /// Text of the most recent message with `role`; empty when there is none
    /// or its content has an unexpected shape.
    pub async fn fetch_last_message_content(&self, role: &str) -> Result<String, ApiError> {
        Ok(self
            .fetch_last_message(role)
            .await?
            .map(|m| m.text())
            .unwrap_or_default())
    }

    /// Post an assistant message to the configured thread.
    ///
    /// Does not check for local mode; callers skip this when `is_local()`.
    pub async fn add_reply(
        &self,
        content: &str,
        message_type: Option<&str>,
    ) -> Result<ThreadMessage, ApiError> {
        let body = MessageCreate {
            role: Role::Assistant,
            content: content.to_string(),
            metadata: message_type
                .filter(|t| !t.is_empty())
                .map(|t| serde_json::json!({ "message_type": t })),
        };
        self.hub.create_message(self.thread_id(), &body).await
    }

    // ── Completions ──────────────────────────────────────────────────

    /// Run a chat completion and return the first choice's content.
    pub async fn generate_completion(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Option<String>, ApiError> {
        let model = match params.model.trim() {
            "" => DEFAULT_MODEL,
            model => model,
        };
        if params.stream {
            tracing::debug!("Streaming requested; completion is fetched in one response");
        }

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            tools: params.tools.clone(),
        };
        tracing::debug!(model, turns = messages.len(), "Requesting completion");
        let response = self.hub.chat_completion(&request).await?;
        Ok(response.first_content())
    }

    // ── Files ────────────────────────────────────────────────────────

    /// Upload `content` as a text file for assistants.
    pub async fn write_file(&self, filename: &str, content: &str) -> Result<FileObject, ApiError> {
        self.upload_file(content, "assistants", filename, "text/plain")
            .await
    }

    pub async fn upload_file(
        &self,
        content: &str,
        purpose: &str,
        file_name: &str,
        file_type: &str,
    ) -> Result<FileObject, ApiError> {
        let purpose = if purpose.is_empty() { "assistants" } else { purpose };
        self.hub
            .upload_file(content.as_bytes().to_vec(), file_name, file_type, purpose)
            .await
    }

    /// Files attached to the thread's messages. Files that cannot be
    /// retrieved are skipped.
    pub async fn list_files_from_thread(&self, order: Order) -> Result<Vec<FileObject>, ApiError> {
        let messages = self.list_messages(None, None, order).await?;
        let mut files = Vec::new();
        for file_id in messages
            .iter()
            .flat_map(|m| m.attachments.iter())
            .filter_map(|a| a.file_id.as_deref())
        {
            match self.hub.retrieve_file(file_id).await {
                Ok(file) => files.push(file),
                Err(e) => tracing::warn!(file_id, "Skipping unretrievable attachment: {}", e),
            }
        }
        Ok(files)
    }

    /// Content of the thread attachment named `filename`.
    pub async fn read_file(&self, filename: &str) -> Result<String, ApiError> {
        let files = self.list_files_from_thread(Order::Asc).await?;
        let file = files
            .iter()
            .find(|f| f.filename.as_deref() == Some(filename))
            .ok_or_else(|| ApiError::FileNotFound(filename.to_string()))?;
        self.hub.file_content(&file.id).await
    }

    // ── Vector stores ────────────────────────────────────────────────

    pub async fn query_vector_store(
        &self,
        vector_store_id: &str,
        query: &str,
        full_files: bool,
    ) -> Result<Value, ApiError> {
        self.hub
            .query_vector_store(vector_store_id, query, full_files)
            .await
    }

    pub async fn create_vector_store(
        &self,
        request: &CreateVectorStore,
    ) -> Result<Value, ApiError> {
        self.hub.create_vector_store(request).await
    }

    pub async fn add_file_to_vector_store(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<Value, ApiError> {
        self.hub
            .add_file_to_vector_store(vector_store_id, file_id)
            .await
    }

    /// Look a store up by id (`vs_` prefix) or else by name.
    pub async fn find_vector_store(&self, id_or_name: &str) -> Result<Option<Value>, ApiError> {
        if id_or_name.starts_with("vs_") {
            self.hub.get_vector_store(id_or_name).await.map(Some)
        } else {
            self.hub.find_vector_store_by_name(id_or_name).await
        }
    }
}

/// A write-once holder for the process-wide environment.
#[derive(Debug, Default)]
pub struct EnvSlot {
    cell: OnceLock<Arc<Environment>>,
}

impl EnvSlot {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Build the environment for `config`, store it and point `config.env` at it.
    pub fn init(
        &self,
        config: &mut AgentConfig,
        request_timeout: Duration,
    ) -> Result<Arc<Environment>, EnvError> {
        if self.cell.get().is_some() {
            return Err(EnvError::AlreadyInitialized);
        }
        let env = Arc::new(Environment::new(config, request_timeout)?);
        self.cell
            .set(Arc::clone(&env))
            .map_err(|_| EnvError::AlreadyInitialized)?;
        config.env = Some(Arc::clone(&env));
        tracing::info!(
            thread_id = env.thread_id(),
            local = env.is_local(),
            "Environment initialized"
        );
        Ok(env)
    }

    pub fn get(&self) -> Result<Arc<Environment>, EnvError> {
        self.cell.get().cloned().ok_or(EnvError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

static GLOBAL_ENV: EnvSlot = EnvSlot::new();

/// The process-wide slot.
pub fn global() -> &'static EnvSlot {
    &GLOBAL_ENV
}

/// Initialize the process-wide environment. A second call fails.
pub fn init_env(
    config: &mut AgentConfig,
    request_timeout: Duration,
) -> Result<Arc<Environment>, EnvError> {
    GLOBAL_ENV.init(config, request_timeout)
}

/// The process-wide environment, for agent code without an explicit handle.
pub fn env() -> Result<Arc<Environment>, EnvError> {
    GLOBAL_ENV.get()
}
