//! Grouped views of the environment handed out by [`AgentBuilder`](super::AgentBuilder).

use serde_json::Value;

use crate::api::{ChatMessage, CreateVectorStore, FileObject, Order, ThreadMessage};
use crate::environment::Environment;
use crate::error::ApiError;

use super::RunOptions;

/// Thread message access.
#[derive(Debug, Clone, Copy)]
pub struct Messages<'a> {
    env: &'a Environment,
    thread_id: Option<&'a str>,
}

impl<'a> Messages<'a> {
    pub(crate) fn new(env: &'a Environment, thread_id: Option<&'a str>) -> Self {
        Self { env, thread_id }
    }

    pub async fn list(
        &self,
        limit: Option<u32>,
        order: Order,
    ) -> Result<Vec<ThreadMessage>, ApiError> {
        self.env.list_messages(self.thread_id, limit, order).await
    }

    /// Post an assistant message to the configured thread.
    pub async fn add(
        &self,
        content: &str,
        message_type: Option<&str>,
    ) -> Result<ThreadMessage, ApiError> {
        self.env.add_reply(content, message_type).await
    }

    pub async fn last_user(&self) -> Result<String, ApiError> {
        self.env.fetch_last_message_content("user").await
    }

    pub async fn last_assistant(&self) -> Result<String, ApiError> {
        self.env.fetch_last_message_content("assistant").await
    }
}

/// One-off completions that bypass the builder chain and never post replies.
#[derive(Debug, Clone, Copy)]
pub struct Completions<'a> {
    env: &'a Environment,
}

impl<'a> Completions<'a> {
    pub(crate) fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &RunOptions,
    ) -> Result<Option<String>, ApiError> {
        self.env
            .generate_completion(messages, &options.to_params())
            .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Files<'a> {
    env: &'a Environment,
}

impl<'a> Files<'a> {
    pub(crate) fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    pub async fn read(&self, filename: &str) -> Result<String, ApiError> {
        self.env.read_file(filename).await
    }

    pub async fn write(&self, filename: &str, content: &str) -> Result<FileObject, ApiError> {
        self.env.write_file(filename, content).await
    }

    pub async fn upload(
        &self,
        content: &str,
        purpose: &str,
        file_name: &str,
        file_type: &str,
    ) -> Result<FileObject, ApiError> {
        self.env
            .upload_file(content, purpose, file_name, file_type)
            .await
    }

    pub async fn list(&self, order: Order) -> Result<Vec<FileObject>, ApiError> {
        self.env.list_files_from_thread(order).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Vectors<'a> {
    env: &'a Environment,
}

impl<'a> Vectors<'a> {
    pub(crate) fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    pub async fn query(
        &self,
        vector_store_id: &str,
        query: &str,
        full_files: bool,
    ) -> Result<Value, ApiError> {
        self.env
            .query_vector_store(vector_store_id, query, full_files)
            .await
    }

    pub async fn add_file(&self, vector_store_id: &str, file_id: &str) -> Result<Value, ApiError> {
        self.env
            .add_file_to_vector_store(vector_store_id, file_id)
            .await
    }

    pub async fn create(&self, request: &CreateVectorStore) -> Result<Value, ApiError> {
        self.env.create_vector_store(request).await
    }

    pub async fn find(&self, id_or_name: &str) -> Result<Option<Value>, ApiError> {
        self.env.find_vector_store(id_or_name).await
    }
}
