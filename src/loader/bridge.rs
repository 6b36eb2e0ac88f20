//! Out-of-process execution of lowered script agents.
//!
//! The interpreter is spawned per invocation. Host and agent exchange one
//! JSON object per line:
//!
//! ```text
//! host  -> agent  {"type":"init","entry":"/out/agent.js","export":"default","config":{...}}
//! agent -> host   {"type":"call","id":1,"method":"fetchLastMessageContent","params":{"role":"user"}}
//! host  -> agent  {"type":"result","id":1,"value":"Hello"}
//! agent -> host   {"type":"done","reply":"Hi!"}
//! ```
//!
//! A failing call is answered with `{"type":"result","id":N,"error":"..."}`.
//! The agent ends with `done` or `{"type":"error","phase":"import"|"invoke"}`.
//! Lines on stdout that are not protocol messages are logged and skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::agent::{AgentBuilder, RunOptions};
use crate::api::{ChatMessage, CreateVectorStore, Order};
use crate::config::CommandTemplate;
use crate::environment::Environment;
use crate::error::{LoaderError, Result};
use crate::loader::module::{AgentContext, AgentModule, EntryPoint};

/// Maximum stderr kept for error reports (16KB).
const MAX_STDERR_SIZE: usize = 16 * 1024;

/// How long a finished agent gets to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AgentMessage {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Done {
        #[serde(default)]
        reply: Value,
    },
    Error {
        #[serde(default)]
        phase: Phase,
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Phase {
    Import,
    #[default]
    Invoke,
}

enum Terminal {
    Done(Value),
    Failed(Phase, String),
}

/// A lowered module executed by an external interpreter.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    path: PathBuf,
    entry: EntryPoint,
    interpreter: CommandTemplate,
    bootstrap: Option<PathBuf>,
    timeout: Duration,
}

impl ScriptModule {
    pub fn new(
        path: PathBuf,
        entry: EntryPoint,
        interpreter: CommandTemplate,
        bootstrap: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            path,
            entry,
            interpreter,
            bootstrap,
            timeout,
        }
    }

    fn command(&self) -> Command {
        let entry = self.path.to_string_lossy().into_owned();
        let bootstrap = self
            .bootstrap
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut command = Command::new(&self.interpreter.program);
        command
            .args(self.interpreter.render_args(&[
                ("entry", entry.as_str()),
                ("bootstrap", bootstrap.as_str()),
            ]))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        command
    }

    fn invocation_error(&self, reason: impl Into<String>) -> LoaderError {
        LoaderError::Invocation {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    async fn converse(
        &self,
        ctx: &AgentContext,
        child: &mut Child,
        mut stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> std::result::Result<Option<Terminal>, LoaderError> {
        let init = json!({
            "type": "init",
            "entry": self.path.to_string_lossy(),
            "export": self.entry.export_name(),
            "config": ctx.config.to_agent_json(),
        });
        if let Err(e) = write_line(&mut stdin, &init).await {
            tracing::debug!(path = %self.path.display(), "Agent did not accept init: {}", e);
        }

        let mut lines = BufReader::new(stdout).lines();
        let terminal = loop {
            let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| LoaderError::io(&self.path, e))?
            else {
                break None;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<AgentMessage>(line) {
                Ok(message) => message,
                Err(_) => {
                    tracing::debug!(path = %self.path.display(), "agent: {}", line);
                    continue;
                }
            };
            match message {
                AgentMessage::Call { id, method, params } => {
                    tracing::debug!(id, method = %method, "Agent call");
                    let reply = match dispatch(&ctx.env, &method, params).await {
                        Ok(value) => json!({ "type": "result", "id": id, "value": value }),
                        Err(error) => {
                            tracing::debug!(id, method = %method, "Agent call failed: {}", error);
                            json!({ "type": "result", "id": id, "error": error })
                        }
                    };
                    write_line(&mut stdin, &reply)
                        .await
                        .map_err(|e| LoaderError::Protocol {
                            path: self.path.clone(),
                            reason: format!("agent stopped reading results: {}", e),
                        })?;
                }
                AgentMessage::Done { reply } => break Some(Terminal::Done(reply)),
                AgentMessage::Error { phase, message } => {
                    break Some(Terminal::Failed(phase, message));
                }
            }
        };
        drop(stdin);

        if terminal.is_some() && tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
        }
        Ok(terminal)
    }
}

#[async_trait]
impl AgentModule for ScriptModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn entry(&self) -> EntryPoint {
        self.entry
    }

    /// Evaluate the module through the bootstrap without calling its entry.
    /// Interpreters run without the bootstrap have no evaluate-only mode.
    async fn verify(&self) -> std::result::Result<(), LoaderError> {
        if self.bootstrap.is_none() {
            return Ok(());
        }

        let mut child = self.command().spawn().map_err(|e| {
            self.invocation_error(format!(
                "failed to start {}: {}",
                self.interpreter.program, e
            ))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.invocation_error("agent stdin is unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.invocation_error("agent stdout is unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.invocation_error("agent stderr is unavailable"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            stderr.read_to_end(&mut buffer).await.map(|_| buffer)
        });

        let init = json!({
            "type": "init",
            "entry": self.path.to_string_lossy(),
            "export": self.entry.export_name(),
            "config": {},
            "check": true,
        });
        if let Err(e) = write_line(&mut stdin, &init).await {
            tracing::debug!(path = %self.path.display(), "Agent did not accept init: {}", e);
        }

        let first = tokio::time::timeout(self.timeout, async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Ok(message) = serde_json::from_str::<AgentMessage>(line.trim()) {
                    return Ok(Some(message));
                }
            }
            Ok::<_, std::io::Error>(None)
        })
        .await;
        drop(stdin);

        let message = match first {
            Ok(result) => result.map_err(|e| LoaderError::io(&self.path, e))?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(LoaderError::Timeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                });
            }
        };
        let status = tokio::time::timeout(EXIT_GRACE, child.wait()).await;

        match message {
            Some(AgentMessage::Done { .. }) => {
                tracing::debug!(path = %self.path.display(), "Agent module evaluated");
                Ok(())
            }
            Some(AgentMessage::Error { message, .. }) => Err(LoaderError::Import {
                path: self.path.clone(),
                reason: message,
            }),
            Some(AgentMessage::Call { method, .. }) => Err(LoaderError::Protocol {
                path: self.path.clone(),
                reason: format!("agent called {} while being evaluated", method),
            }),
            None => {
                let stderr = match tokio::time::timeout(EXIT_GRACE, stderr_task).await {
                    Ok(Ok(Ok(bytes))) => stderr_text(&bytes),
                    _ => String::new(),
                };
                let reason = match status {
                    Ok(Ok(status)) => format!("exited with {}: {}", status, stderr),
                    _ => format!("exited without evaluating the module: {}", stderr),
                };
                Err(LoaderError::Import {
                    path: self.path.clone(),
                    reason,
                })
            }
        }
    }

    async fn invoke(&self, ctx: AgentContext) -> Result<Option<String>> {
        let started_at = Instant::now();
        tracing::info!(
            path = %self.path.display(),
            entry = self.entry.export_name(),
            timeout_secs = self.timeout.as_secs(),
            "Invoking script agent"
        );

        let mut child = self.command().spawn().map_err(|e| {
            self.invocation_error(format!(
                "failed to start {}: {}",
                self.interpreter.program, e
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.invocation_error("agent stdin is unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.invocation_error("agent stdout is unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.invocation_error("agent stderr is unavailable"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            stderr.read_to_end(&mut buffer).await.map(|_| buffer)
        });

        let terminal =
            match tokio::time::timeout(self.timeout, self.converse(&ctx, &mut child, stdin, stdout))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    let _ = child.kill().await;
                    tracing::warn!(path = %self.path.display(), "Agent timed out");
                    return Err(LoaderError::Timeout {
                        path: self.path.clone(),
                        timeout: self.timeout,
                    }
                    .into());
                }
            };

        let status = match terminal {
            Some(_) => None,
            None => Some(
                tokio::time::timeout(EXIT_GRACE, child.wait())
                    .await
                    .map_err(|_| LoaderError::Timeout {
                        path: self.path.clone(),
                        timeout: EXIT_GRACE,
                    })?
                    .map_err(|e| LoaderError::io(&self.path, e))?,
            ),
        };
        let stderr = match tokio::time::timeout(EXIT_GRACE, stderr_task).await {
            Ok(Ok(Ok(bytes))) => stderr_text(&bytes),
            _ => String::new(),
        };
        if !stderr.is_empty() {
            tracing::debug!(path = %self.path.display(), stderr = %stderr, "Agent stderr");
        }

        tracing::info!(
            path = %self.path.display(),
            duration_ms = started_at.elapsed().as_millis(),
            "Script agent finished"
        );

        match (terminal, status) {
            (Some(Terminal::Done(reply)), _) => Ok(reply_text(reply)),
            (Some(Terminal::Failed(Phase::Import, message)), _) => Err(LoaderError::Import {
                path: self.path.clone(),
                reason: message,
            }
            .into()),
            (Some(Terminal::Failed(Phase::Invoke, message)), _) => {
                Err(self.invocation_error(message).into())
            }
            (None, Some(status)) if !status.success() => Err(self
                .invocation_error(format!("exited with {}: {}", status, stderr))
                .into()),
            (None, _) => Err(LoaderError::Protocol {
                path: self.path.clone(),
                reason: "agent exited without reporting a result".to_string(),
            }
            .into()),
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

fn stderr_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= MAX_STDERR_SIZE {
        return text.to_string();
    }
    let mut start = text.len() - MAX_STDERR_SIZE;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

fn reply_text(reply: Value) -> Option<String> {
    match reply {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

// ── Call dispatch ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Deserialize)]
struct RoleParams {
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Deserialize)]
struct ContentParams {
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesParams {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    order: Order,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddReplyParams {
    content: String,
    #[serde(default)]
    message_type: Option<String>,
}

#[derive(Deserialize)]
struct ChainParams {
    messages: Vec<ChatMessage>,
    #[serde(flatten)]
    options: RunOptions,
}

#[derive(Deserialize)]
struct WriteFileParams {
    filename: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadFileParams {
    content: String,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default = "default_file_name")]
    file_name: String,
    #[serde(default)]
    file_type: Option<String>,
}

fn default_file_name() -> String {
    "file.txt".to_string()
}

#[derive(Deserialize)]
struct FilenameParams {
    filename: String,
}

#[derive(Deserialize)]
struct OrderParams {
    #[serde(default)]
    order: Order,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryVectorStoreParams {
    vector_store_id: String,
    query: String,
    #[serde(default)]
    full_files: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVectorStoreParams {
    name: String,
    #[serde(default)]
    file_ids: Vec<String>,
    #[serde(default)]
    expires_after: Option<Value>,
    #[serde(default)]
    chunking_strategy: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddFileParams {
    vector_store_id: String,
    file_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindVectorStoreParams {
    id_or_name: String,
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> std::result::Result<T, String> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| format!("invalid params for {}: {}", method, e))
}

fn to_value<T: serde::Serialize>(value: T) -> std::result::Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Serve one agent call against the environment.
///
/// Errors are returned as text; they travel back to the agent, not the host.
pub async fn dispatch(
    env: &Arc<Environment>,
    method: &str,
    raw: Value,
) -> std::result::Result<Value, String> {
    let api = |e: crate::error::ApiError| e.to_string();
    match method {
        "getEnvVar" => {
            let p: KeyParams = params(method, raw)?;
            Ok(env.get_env_var(&p.key).map_or(Value::Null, |v| Value::String(v.to_string())))
        }
        "getThreadId" => Ok(Value::String(env.thread_id().to_string())),
        "isLocal" => Ok(Value::Bool(env.is_local())),
        "getAllLocalMessages" => to_value(env.local_messages().await),
        "setLocalUserMessage" => {
            let p: ContentParams = params(method, raw)?;
            env.set_local_user_message(p.content).await;
            Ok(Value::Null)
        }
        "fetchLastMessage" => {
            let p: RoleParams = params(method, raw)?;
            to_value(env.fetch_last_message(&p.role).await.map_err(api)?)
        }
        "fetchLastMessageContent" => {
            let p: RoleParams = params(method, raw)?;
            Ok(Value::String(
                env.fetch_last_message_content(&p.role).await.map_err(api)?,
            ))
        }
        "listMessages" => {
            let p: ListMessagesParams = params(method, raw)?;
            to_value(
                env.list_messages(p.thread_id.as_deref(), p.limit, p.order)
                    .await
                    .map_err(api)?,
            )
        }
        "addReply" => {
            let p: AddReplyParams = params(method, raw)?;
            to_value(
                env.add_reply(&p.content, p.message_type.as_deref())
                    .await
                    .map_err(api)?,
            )
        }
        "generateCompletion" => {
            let p: ChainParams = params(method, raw)?;
            to_value(
                env.generate_completion(&p.messages, &p.options.to_params())
                    .await
                    .map_err(api)?,
            )
        }
        "runChain" => {
            let p: ChainParams = params(method, raw)?;
            let mut builder = AgentBuilder::new(Arc::clone(env));
            builder.extend(p.messages);
            to_value(builder.run(p.options).await.map_err(api)?)
        }
        "writeFile" => {
            let p: WriteFileParams = params(method, raw)?;
            to_value(env.write_file(&p.filename, &p.content).await.map_err(api)?)
        }
        "uploadFile" => {
            let p: UploadFileParams = params(method, raw)?;
            to_value(
                env.upload_file(
                    &p.content,
                    p.purpose.as_deref().unwrap_or("assistants"),
                    &p.file_name,
                    p.file_type.as_deref().unwrap_or("text/plain"),
                )
                .await
                .map_err(api)?,
            )
        }
        "readFile" => {
            let p: FilenameParams = params(method, raw)?;
            Ok(Value::String(env.read_file(&p.filename).await.map_err(api)?))
        }
        "listFilesFromThread" => {
            let p: OrderParams = params(method, raw)?;
            to_value(env.list_files_from_thread(p.order).await.map_err(api)?)
        }
        "queryVectorStore" => {
            let p: QueryVectorStoreParams = params(method, raw)?;
            env.query_vector_store(&p.vector_store_id, &p.query, p.full_files)
                .await
                .map_err(api)
        }
        "createVectorStore" => {
            let p: CreateVectorStoreParams = params(method, raw)?;
            let request = CreateVectorStore {
                name: p.name,
                file_ids: p.file_ids,
                expires_after: p.expires_after,
                chunking_strategy: p.chunking_strategy,
                metadata: p.metadata,
            };
            env.create_vector_store(&request).await.map_err(api)
        }
        "addFileToVectorStore" => {
            let p: AddFileParams = params(method, raw)?;
            env.add_file_to_vector_store(&p.vector_store_id, &p.file_id)
                .await
                .map_err(api)
        }
        "findVectorStore" => {
            let p: FindVectorStoreParams = params(method, raw)?;
            to_value(env.find_vector_store(&p.id_or_name).await.map_err(api)?)
        }
        other => Err(format!("unknown method: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, Credential, LOCAL_THREAD_ID};
    use crate::error::Error;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_env() -> (AgentConfig, Arc<Environment>) {
        let mut config = AgentConfig {
            auth: Some(Credential::new("tok")),
            thread_id: LOCAL_THREAD_ID.to_string(),
            ..AgentConfig::default()
        };
        config.env_vars.insert("GREETING".into(), "hi".into());
        let env = Arc::new(Environment::new(&config, Duration::from_secs(1)).unwrap());
        (config, env)
    }

    #[tokio::test]
    async fn dispatch_serves_local_operations() {
        let (_, env) = local_env();

        assert_eq!(
            dispatch(&env, "getEnvVar", json!({"key": "GREETING"})).await.unwrap(),
            json!("hi")
        );
        assert_eq!(
            dispatch(&env, "getEnvVar", json!({"key": "NOPE"})).await.unwrap(),
            Value::Null
        );
        assert_eq!(dispatch(&env, "isLocal", Value::Null).await.unwrap(), json!(true));

        dispatch(&env, "setLocalUserMessage", json!({"content": "Hello"}))
            .await
            .unwrap();
        assert_eq!(
            dispatch(&env, "fetchLastMessageContent", Value::Null).await.unwrap(),
            json!("Hello")
        );
        let all = dispatch(&env, "getAllLocalMessages", Value::Null).await.unwrap();
        assert_eq!(all, json!([{"role": "user", "content": "Hello"}]));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_methods_and_bad_params() {
        let (_, env) = local_env();
        let err = dispatch(&env, "launchRockets", Value::Null).await.unwrap_err();
        assert!(err.contains("unknown method"));
        let err = dispatch(&env, "getEnvVar", json!({"name": 1})).await.unwrap_err();
        assert!(err.starts_with("invalid params for getEnvVar"));
    }

    fn remote_env(server: &MockServer) -> (AgentConfig, Arc<Environment>) {
        let config = AgentConfig {
            auth: Some(Credential::new("tok")),
            base_url: format!("{}/v1", server.uri()),
            ..AgentConfig::default()
        };
        let env = Arc::new(Environment::new(&config, Duration::from_secs(5)).unwrap());
        (config, env)
    }

    #[tokio::test]
    async fn upload_without_name_uses_default_file_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "file_1", "filename": "file.txt", "purpose": "assistants"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (_, env) = remote_env(&server);

        let file = dispatch(&env, "uploadFile", json!({"content": "abc", "purpose": "assistants"}))
            .await
            .unwrap();
        assert_eq!(file["id"], "file_1");

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains(r#"filename="file.txt""#), "{body}");
        assert!(body.contains("text/plain"), "{body}");
    }

    #[tokio::test]
    async fn completion_params_reach_the_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "my-model", "max_tokens": 12})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (_, env) = remote_env(&server);

        let reply = dispatch(
            &env,
            "generateCompletion",
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "model": "my-model",
                "maxTokens": 12
            }),
        )
        .await
        .unwrap();
        assert_eq!(reply, json!("ok"));
    }

    #[test]
    fn replies_are_normalized_to_text() {
        assert_eq!(reply_text(json!("ok")).as_deref(), Some("ok"));
        assert_eq!(reply_text(Value::Null), None);
        assert_eq!(reply_text(json!({"a": 1})).as_deref(), Some(r#"{"a":1}"#));
    }

    #[cfg(unix)]
    mod script {
        use super::*;

        async fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("agent.sh");
            tokio::fs::write(&path, body).await.unwrap();
            path
        }

        fn module(path: PathBuf, timeout: Duration) -> ScriptModule {
            ScriptModule::new(
                path,
                EntryPoint::Default,
                CommandTemplate::new("sh", &["{entry}"]),
                None,
                timeout,
            )
        }

        async fn invoke(body: &str, timeout: Duration) -> Result<Option<String>> {
            let dir = TempDir::new().unwrap();
            let path = script(&dir, body).await;
            let (config, env) = local_env();
            module(path, timeout)
                .invoke(AgentContext::new(config, env))
                .await
        }

        #[tokio::test]
        async fn done_message_carries_reply() {
            let reply = invoke(
                "read init\necho 'log line'\necho '{\"type\":\"done\",\"reply\":\"pong\"}'\n",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
            assert_eq!(reply.as_deref(), Some("pong"));
        }

        #[tokio::test]
        async fn init_carries_config_without_credential() {
            let body = r#"read init
case "$init" in
  *'"tok"'*) echo '{"type":"done","reply":"leaked"}' ;;
  *'"threadId":"thread_local"'*) echo '{"type":"done","reply":"clean"}' ;;
  *) echo '{"type":"done","reply":null}' ;;
esac
"#;
            let reply = invoke(body, Duration::from_secs(10)).await.unwrap();
            assert_eq!(reply.as_deref(), Some("clean"));
        }

        #[tokio::test]
        async fn calls_are_answered_from_the_environment() {
            let body = r#"read init
echo '{"type":"call","id":1,"method":"getEnvVar","params":{"key":"GREETING"}}'
read result
case "$result" in
  *'"value":"hi"'*) echo '{"type":"done","reply":"got hi"}' ;;
  *) echo '{"type":"done","reply":null}' ;;
esac
"#;
            let reply = invoke(body, Duration::from_secs(10)).await.unwrap();
            assert_eq!(reply.as_deref(), Some("got hi"));
        }

        #[tokio::test]
        async fn import_failure_names_the_module() {
            let body = r#"read init
echo '{"type":"error","phase":"import","message":"SyntaxError: boom"}'
exit 1
"#;
            let err = invoke(body, Duration::from_secs(10))
            .await
            .unwrap_err();
            match err {
                Error::Loader(LoaderError::Import { path, reason }) => {
                    assert!(path.ends_with("agent.sh"));
                    assert!(reason.contains("boom"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn crash_reports_stderr() {
            let err = invoke("echo 'fatal: out of cheese' >&2\nexit 3\n", Duration::from_secs(10))
                .await
                .unwrap_err();
            let message = err.to_string();
            assert!(matches!(err, Error::Loader(LoaderError::Invocation { .. })));
            assert!(message.contains("out of cheese"), "{message}");
        }

        #[tokio::test]
        async fn silent_exit_is_a_protocol_error() {
            let err = invoke("read init\nexit 0\n", Duration::from_secs(10))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Loader(LoaderError::Protocol { .. })));
        }

        #[tokio::test]
        async fn slow_agent_hits_the_deadline() {
            let err = invoke("exec sleep 5\n", Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Loader(LoaderError::Timeout { .. })));
        }

        #[tokio::test]
        async fn verify_is_a_no_op_without_bootstrap() {
            let dir = TempDir::new().unwrap();
            let marker = dir.path().join("ran");
            let path = script(&dir, &format!("touch {}\n", marker.display())).await;

            module(path, Duration::from_secs(5)).verify().await.unwrap();
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn missing_interpreter_fails_to_start() {
            let dir = TempDir::new().unwrap();
            let path = script(&dir, "").await;
            let (config, env) = local_env();
            let module = ScriptModule::new(
                path,
                EntryPoint::Default,
                CommandTemplate::new("agent-runtime-no-such-interpreter", &["{entry}"]),
                None,
                Duration::from_secs(1),
            );
            let err = module
                .invoke(AgentContext::new(config, env))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("failed to start"));
        }
    }

    /// Runs the real bootstrap under Node. Skipped when `node` is not installed.
    #[cfg(unix)]
    mod node {
        use super::*;
        use crate::loader::{Lowerer, ModuleLoader};

        fn node_available() -> bool {
            std::process::Command::new("node")
                .arg("--version")
                .output()
                .is_ok_and(|o| o.status.success())
        }

        struct Loaded {
            _src: TempDir,
            _out: TempDir,
            module: Arc<dyn AgentModule>,
        }

        async fn load(source: &str) -> Loaded {
            let src = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            let entry = src.path().join("agent.js");
            tokio::fs::write(&entry, source).await.unwrap();

            let loader = ModuleLoader::new(
                out.path().to_path_buf(),
                Lowerer::with_transpiler(CommandTemplate::new("cp", &["{input}", "{output}"])),
                CommandTemplate::new("node", &["{bootstrap}", "{entry}"]),
                Duration::from_secs(20),
            );
            let lowered = loader.load(&entry, None).await.unwrap();
            let module = loader.import(&lowered).await.unwrap();
            Loaded {
                _src: src,
                _out: out,
                module,
            }
        }

        async fn run_agent(source: &str, config: AgentConfig) -> Result<Option<String>> {
            let loaded = load(source).await;
            let env = Arc::new(Environment::new(&config, Duration::from_secs(5)).unwrap());
            loaded.module.invoke(AgentContext::new(config, env)).await
        }

        #[tokio::test]
        async fn evaluation_failure_is_an_import_error() {
            if !node_available() {
                eprintln!("node not found, skipping");
                return;
            }
            let loaded = load(
                "throw new Error('broken at load');\nexport default async () => 'never';",
            )
            .await;

            match loaded.module.verify().await.unwrap_err() {
                LoaderError::Import { path, reason } => {
                    assert!(path.ends_with("agent.js"));
                    assert!(reason.contains("broken at load"), "{reason}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn verify_does_not_call_the_entry() {
            if !node_available() {
                eprintln!("node not found, skipping");
                return;
            }
            // Calling the entry would reach the environment, which verify forbids.
            let loaded = load(
                "export default async (config) => { await config.env.getThreadId(); return 'x'; };",
            )
            .await;
            loaded.module.verify().await.unwrap();
        }

        fn config_for(server: &MockServer) -> AgentConfig {
            remote_env(server).0
        }

        #[tokio::test]
        async fn default_and_named_entries_receive_config() {
            if !node_available() {
                eprintln!("node not found, skipping");
                return;
            }
            let config = AgentConfig {
                auth: Some(Credential::new("tok")),
                thread_id: "thread_n".to_string(),
                ..AgentConfig::default()
            };

            let reply = run_agent(
                "export default async function (config) { return 'default:' + config.threadId; }",
                config.clone(),
            )
            .await
            .unwrap();
            assert_eq!(reply.as_deref(), Some("default:thread_n"));

            let reply = run_agent(
                "export async function Agent(config) { return 'named:' + config.threadId; }",
                config,
            )
            .await
            .unwrap();
            assert_eq!(reply.as_deref(), Some("named:thread_n"));
        }

        #[tokio::test]
        async fn two_parameter_entry_gets_agent_with_every_handle() {
            if !node_available() {
                eprintln!("node not found, skipping");
                return;
            }
            let source = "export default async (agent, config) => [\n\
                typeof agent.messages, typeof agent.files, typeof agent.vectors,\n\
                typeof agent.completions, typeof config.env,\n\
            ].join(',');";
            let reply = run_agent(source, local_env().0).await.unwrap();
            assert_eq!(reply.as_deref(), Some("function,function,function,function,object"));
        }

        #[tokio::test]
        async fn positional_completion_arguments_are_forwarded() {
            if !node_available() {
                eprintln!("node not found, skipping");
                return;
            }
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .and(body_partial_json(json!({"model": "my-model", "max_tokens": 12})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "ok"}}]
                })))
                .expect(1)
                .mount(&server)
                .await;

            let source = "export default async (config) =>\n\
                config.env.generateCompletion([{ role: 'user', content: 'hi' }], 'my-model', 12);";
            let reply = run_agent(source, config_for(&server)).await.unwrap();
            assert_eq!(reply.as_deref(), Some("ok"));
        }

        #[tokio::test]
        async fn agent_handles_drive_files_vectors_and_completions() {
            if !node_available() {
                eprintln!("node not found, skipping");
                return;
            }
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/v1/vector_stores"))
                .and(query_param("name", "docs"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/files"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "id": "file_1", "filename": "file.txt"
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/vector_stores"))
                .and(body_partial_json(json!({"name": "docs", "file_ids": ["file_1"]})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "vs_1"})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/vector_stores/vs_1/files"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file_1"})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/vector_stores/vs_1/search"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!([{"chunk_text": "context"}])),
                )
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .and(body_partial_json(json!({
                    "messages": [{"role": "user", "content": "context"}]
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "answer"}}]
                })))
                .expect(1)
                .mount(&server)
                .await;

            let source = r#"export default async (agent, config) => {
    const existing = await agent.vectors().find('docs');
    const file = await agent.files().upload('some text', 'assistants');
    const store = await agent.vectors().create('docs', [file.id]);
    await agent.vectors().addFile(store.id, file.id);
    const hits = await agent.vectors().query(store.id, 'what?');
    const chain = [{ role: 'user', content: hits[0].chunk_text }];
    const answer = await agent.completions().generate(chain);
    return [existing, file.id, store.id, answer].join('|');
};
"#;
            let reply = run_agent(source, config_for(&server)).await.unwrap();
            assert_eq!(reply.as_deref(), Some("|file_1|vs_1|answer"));
        }
    }
}
