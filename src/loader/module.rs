//! The loaded-module seam: what the runner hands back and the host invokes.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::agent::AgentBuilder;
use crate::config::AgentConfig;
use crate::environment::Environment;
use crate::error::{LoaderError, Result};

static DEFAULT_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*export\s+default\b|\bexport\s*\{[^}]*\bas\s+default\b")
        .expect("default export pattern is valid")
});

static AGENT_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?m)^\s*export\s+(?:async\s+)?",
        r"(?:function\s*\*?\s*|const\s+|let\s+|var\s+|class\s+)Agent\b",
        r"|\bexport\s*\{[^}]*\bAgent\b[^}]*\}",
    ))
    .expect("named export pattern is valid")
});

/// Which exported function the host calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `export default`.
    Default,
    /// The named `Agent` export.
    Agent,
}

impl EntryPoint {
    pub fn export_name(&self) -> &'static str {
        match self {
            EntryPoint::Default => "default",
            EntryPoint::Agent => "Agent",
        }
    }

    /// Detect the entry export of a lowered JavaScript module.
    pub fn detect(path: &Path, source: &str) -> std::result::Result<Self, LoaderError> {
        if DEFAULT_EXPORT.is_match(source) {
            Ok(EntryPoint::Default)
        } else if AGENT_EXPORT.is_match(source) {
            Ok(EntryPoint::Agent)
        } else {
            Err(LoaderError::EntryNotFound {
                path: path.to_path_buf(),
            })
        }
    }
}

/// Everything an agent entry receives.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub config: AgentConfig,
    pub env: Arc<Environment>,
}

impl AgentContext {
    pub fn new(config: AgentConfig, env: Arc<Environment>) -> Self {
        Self { config, env }
    }

    /// A fresh builder over this run's environment.
    pub fn builder(&self) -> AgentBuilder {
        AgentBuilder::new(Arc::clone(&self.env))
    }
}

/// An imported agent, ready to be invoked.
#[async_trait]
pub trait AgentModule: Send + Sync + fmt::Debug {
    /// Location of the executable module (or a name for in-process agents).
    fn path(&self) -> &Path;

    fn entry(&self) -> EntryPoint;

    /// Evaluate the module without calling its entry. Modules that cannot be
    /// evaluated ahead of time accept by default.
    async fn verify(&self) -> std::result::Result<(), LoaderError> {
        Ok(())
    }

    /// Run the entry once and return its reply.
    async fn invoke(&self, ctx: AgentContext) -> Result<Option<String>>;
}

type AgentFuture = Pin<Box<dyn Future<Output = Result<Option<String>>> + Send>>;
type AgentFn = dyn Fn(AgentContext) -> AgentFuture + Send + Sync;

/// An agent written in Rust and run in-process.
pub struct NativeAgent {
    name: PathBuf,
    func: Box<AgentFn>,
}

impl NativeAgent {
    pub fn new<F, Fut>(name: impl Into<PathBuf>, func: F) -> Self
    where
        F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(move |ctx| Box::pin(func(ctx))),
        }
    }
}

impl fmt::Debug for NativeAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeAgent")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentModule for NativeAgent {
    fn path(&self) -> &Path {
        &self.name
    }

    fn entry(&self) -> EntryPoint {
        EntryPoint::Default
    }

    async fn invoke(&self, ctx: AgentContext) -> Result<Option<String>> {
        (self.func)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credential, LOCAL_THREAD_ID};
    use std::time::Duration;

    fn detect(source: &str) -> std::result::Result<EntryPoint, LoaderError> {
        EntryPoint::detect(Path::new("agent.js"), source)
    }

    #[test]
    fn default_export_wins() {
        let source =
            "export async function Agent() {}\nexport default async function run(config) {}";
        assert_eq!(detect(source).unwrap(), EntryPoint::Default);
        let reexport = "const run = () => 1;\nexport { run as default };";
        assert_eq!(detect(reexport).unwrap(), EntryPoint::Default);
    }

    #[test]
    fn named_agent_export_is_the_fallback() {
        assert_eq!(detect("export async function Agent(config) {}").unwrap(), EntryPoint::Agent);
        assert_eq!(detect("export const Agent = async () => null;").unwrap(), EntryPoint::Agent);
        assert_eq!(detect("function Agent() {}\nexport { Agent };").unwrap(), EntryPoint::Agent);
    }

    #[test]
    fn module_without_entry_is_rejected() {
        let err = detect("export function helper() {}\nexport const AgentName = 'x';").unwrap_err();
        assert!(matches!(err, LoaderError::EntryNotFound { .. }));
        assert!(err.to_string().contains("agent.js"));
    }

    #[tokio::test]
    async fn native_agent_reads_its_context() {
        let config = AgentConfig {
            auth: Some(Credential::new("tok")),
            thread_id: LOCAL_THREAD_ID.to_string(),
            ..AgentConfig::default()
        };
        let env = Arc::new(Environment::new(&config, Duration::from_secs(1)).unwrap());
        env.set_local_user_message("ping").await;

        let agent = NativeAgent::new("echo", |ctx: AgentContext| async move {
            let text = ctx.env.fetch_last_message_content("user").await?;
            Ok(Some(format!("{} from {}", text, ctx.config.thread_id)))
        });

        assert_eq!(agent.path(), Path::new("echo"));
        let reply = agent.invoke(AgentContext::new(config, env)).await.unwrap();
        assert_eq!(reply.as_deref(), Some("ping from thread_local"));
    }
}
