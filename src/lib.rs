//! Agent runtime: loads user-authored agent modules and gives them one
//! environment whether the conversation lives in a remote thread or only in
//! the local session.

pub mod agent;
pub mod api;
pub mod config;
pub mod environment;
pub mod error;
pub mod loader;
pub mod runner;

pub use agent::{AgentBuilder, ChainPolicy, RunOptions};
pub use config::{AgentConfig, ConfigResolver, ResolveFlags, RuntimeSettings};
pub use environment::{Environment, env, init_env};
pub use error::{Error, Result};
pub use loader::{AgentContext, AgentModule, ModuleLoader, NativeAgent};
pub use runner::{Runner, RunnerResult};
