//! Composition root: resolve config, lower and import the agent, initialize
//! the environment.
//!
//! The runner never invokes the agent itself; callers use
//! [`RunnerResult::invoke`] (or the module directly) when they are ready.

use std::path::Path;
use std::sync::Arc;

use crate::config::{AgentConfig, ConfigResolver, ResolveFlags, RuntimeSettings};
use crate::environment::{self, EnvSlot, Environment};
use crate::error::Result;
use crate::loader::{AgentContext, AgentModule, ModuleLoader};

/// A prepared run.
#[derive(Debug)]
pub struct RunnerResult {
    pub config: AgentConfig,
    pub module: Arc<dyn AgentModule>,
    pub env: Arc<Environment>,
}

impl RunnerResult {
    pub fn context(&self) -> AgentContext {
        AgentContext::new(self.config.clone(), Arc::clone(&self.env))
    }

    /// Invoke the module's entry once.
    pub async fn invoke(&self) -> Result<Option<String>> {
        self.module.invoke(self.context()).await
    }
}

#[derive(Debug)]
pub struct Runner {
    resolver: ConfigResolver,
    loader: ModuleLoader,
    settings: RuntimeSettings,
    slot: &'static EnvSlot,
}

impl Runner {
    pub fn new(resolver: ConfigResolver, loader: ModuleLoader, settings: RuntimeSettings) -> Self {
        Self {
            resolver,
            loader,
            settings,
            slot: environment::global(),
        }
    }

    /// Runner built from `AGENT_RUNTIME_*` settings and the default resolver.
    pub fn from_env() -> Self {
        let settings = RuntimeSettings::from_env();
        let loader = ModuleLoader::from_settings(&settings);
        Self::new(ConfigResolver::new(), loader, settings)
    }

    /// Initialize into `slot` instead of the process-wide one.
    pub fn with_slot(mut self, slot: &'static EnvSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Prepare a script agent at `agent_path`.
    ///
    /// Nothing is initialized unless resolving, lowering, importing and
    /// evaluating the module all succeed.
    pub async fn run(
        &self,
        agent_path: &Path,
        config_json: Option<&str>,
        flags: &ResolveFlags,
    ) -> Result<RunnerResult> {
        let mut config = self.resolver.resolve(config_json, agent_path, flags)?;

        let files = (!config.agent_files.is_empty()).then_some(config.agent_files.as_slice());
        let lowered = self.loader.load(agent_path, files).await?;
        let module = self.loader.import(&lowered).await?;
        module.verify().await?;

        let env = self.slot.init(&mut config, self.settings.request_timeout)?;
        tracing::info!(
            agent = %agent_path.display(),
            module = %module.path().display(),
            "Agent ready"
        );
        Ok(RunnerResult {
            config,
            module,
            env,
        })
    }

    /// Prepare an in-process agent. No lowering happens.
    pub fn run_native(
        &self,
        module: Arc<dyn AgentModule>,
        config_json: Option<&str>,
        flags: &ResolveFlags,
    ) -> Result<RunnerResult> {
        let mut config = self.resolver.resolve(config_json, module.path(), flags)?;
        let env = self.slot.init(&mut config, self.settings.request_timeout)?;
        tracing::info!(module = %module.path().display(), "Native agent ready");
        Ok(RunnerResult {
            config,
            module,
            env,
        })
    }
}
