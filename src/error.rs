//! Error types for the agent runtime.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse config JSON: {0}")]
    Parse(String),

    #[error("Config JSON must be an object, got {0}")]
    NotAnObject(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while lowering, importing or invoking an agent module.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to lower {path}: {reason}")]
    Lowering { path: PathBuf, reason: String },

    #[error("Unsupported agent source: {path}")]
    UnsupportedSource { path: PathBuf },

    #[error("Module {path} lies outside the agent root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Entry {entry} is not part of the declared file list")]
    EntryNotInList { entry: PathBuf },

    #[error("Could not import agent at path: {path}\n{reason}")]
    Import { path: PathBuf, reason: String },

    #[error("Agent module {path} exports neither a default nor an `Agent` entry function")]
    EntryNotFound { path: PathBuf },

    #[error("Agent at {path} failed: {reason}")]
    Invocation { path: PathBuf, reason: String },

    #[error("Protocol violation from agent at {path}: {reason}")]
    Protocol { path: PathBuf, reason: String },

    #[error("Agent at {path} timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoaderError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Remote service errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{operation} failed: {status} {reason}")]
    Status {
        operation: String,
        status: u16,
        reason: String,
    },

    #[error("{operation} request failed: {reason}")]
    Request { operation: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),
}

/// Facade lifecycle and usage errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Environment not initialized")]
    NotInitialized,

    #[error("Environment already initialized")]
    AlreadyInitialized,

    #[error("No auth provided in AgentConfig; the remote service requires a credential")]
    MissingAuth,

    #[error("Invalid auth credential: {0}")]
    InvalidAuth(String),
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
