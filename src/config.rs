//! Configuration: per-run agent config resolution and process-level settings.
//!
//! `ConfigResolver` merges the explicit config string (or the on-disk
//! credential file), the agent's `.env`, allow-listed process variables and
//! legacy snake_case keys into one canonical [`AgentConfig`].
//! [`RuntimeSettings`] holds the knobs that do not change per run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};

use crate::environment::Environment;
use crate::error::ConfigError;

/// Production endpoint of the remote service.
pub const DEFAULT_BASE_URL: &str = "https://api.near.ai/v1";

/// Loopback development endpoint selected by the `--local` flag.
pub const LOCAL_BASE_URL: &str = "http://localhost:8081/v1";

/// Thread id meaning "no remote thread, messages are synthesized locally".
pub const LOCAL_THREAD_ID: &str = "thread_local";

/// Credential file location, relative to the user's home directory.
pub const CREDENTIAL_FILE: &str = ".nearai/config.json";

/// Process environment variables an agent is allowed to see.
pub const DEFAULT_ENV_ALLOW_LIST: &[&str] = &[
    "NEARAI_MODEL",
    "NEARAI_DEBUG",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "HF_TOKEN",
];

/// Legacy (snake_case) keys and the canonical key each one maps to.
const LEGACY_KEYS: &[(&str, &str)] = &[
    ("user_auth", "auth"),
    ("base_url", "baseUrl"),
    ("thread_id", "threadId"),
    ("env_vars", "envVars"),
    ("agent_ts_files_to_transpile", "agentFiles"),
];

/// Opaque credential used as the bearer token for the remote service.
///
/// A string blob is used verbatim; an object is serialized to JSON.
#[derive(Debug, Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Build a credential from a config value. `null` yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self::new(s.clone())),
            other => Some(Self::new(other.to_string())),
        }
    }

    /// True for an empty string or an empty JSON object.
    pub fn is_empty(&self) -> bool {
        let token = self.0.expose_secret().trim();
        token.is_empty() || token == "{}"
    }

    pub fn secret(&self) -> &SecretString {
        &self.0
    }
}

/// Canonical run configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Credential for the remote service. Checked when the facade is initialized.
    pub auth: Option<Credential>,
    /// Remote endpoint.
    pub base_url: String,
    /// Remote thread id, or [`LOCAL_THREAD_ID`].
    pub thread_id: String,
    /// Variables exposed to the agent through `get_env_var`.
    pub env_vars: BTreeMap<String, String>,
    /// Files a hosting container attached to the run (explicit-file-list mode).
    pub agent_files: Vec<PathBuf>,
    /// Unrecognized keys, forwarded to script agents untouched.
    pub extra: Map<String, Value>,
    /// The live facade, set by `init_env`.
    pub env: Option<Arc<Environment>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auth: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            thread_id: LOCAL_THREAD_ID.to_string(),
            env_vars: BTreeMap::new(),
            agent_files: Vec::new(),
            extra: Map::new(),
            env: None,
        }
    }
}

impl AgentConfig {
    /// Whether messages are synthesized locally rather than read from a thread.
    pub fn is_local(&self) -> bool {
        self.thread_id == LOCAL_THREAD_ID
    }

    /// Camel-case JSON view handed to script agents. Never includes the credential.
    pub fn to_agent_json(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("baseUrl".into(), Value::String(self.base_url.clone()));
        map.insert("threadId".into(), Value::String(self.thread_id.clone()));
        map.insert(
            "envVars".into(),
            Value::Object(
                self.env_vars
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        Value::Object(map)
    }
}

/// Command-line flags that influence resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveFlags {
    /// Point the runtime at the loopback development endpoint.
    pub local: bool,
}

/// Rename legacy keys to their canonical names, in place.
///
/// A canonical key that is already present (and not `null`) wins; the legacy
/// key is removed either way.
pub fn normalize_legacy_keys(map: &mut Map<String, Value>) {
    for (legacy, canonical) in LEGACY_KEYS {
        let Some(value) = map.remove(*legacy) else {
            continue;
        };
        let canonical_present = map.get(*canonical).is_some_and(|v| !v.is_null());
        if !canonical_present {
            map.insert((*canonical).to_string(), value);
        }
    }
}

/// Merges configuration sources into an [`AgentConfig`]. Performs no network I/O.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    credential_path: Option<PathBuf>,
    env_allow_list: Vec<String>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver reading `~/.nearai/config.json` and the default allow-list.
    pub fn new() -> Self {
        Self {
            credential_path: dirs::home_dir().map(|home| home.join(CREDENTIAL_FILE)),
            env_allow_list: DEFAULT_ENV_ALLOW_LIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Override (or disable, with `None`) the credential file location.
    pub fn with_credential_path(mut self, path: Option<PathBuf>) -> Self {
        self.credential_path = path;
        self
    }

    pub fn with_env_allow_list(mut self, keys: Vec<String>) -> Self {
        self.env_allow_list = keys;
        self
    }

    /// Resolve the run configuration.
    ///
    /// `raw` wins over the credential file. A missing credential file is not
    /// an error; the missing `auth` surfaces when the facade is initialized.
    pub fn resolve(
        &self,
        raw: Option<&str>,
        agent_path: &Path,
        flags: &ResolveFlags,
    ) -> Result<AgentConfig, ConfigError> {
        let raw = match raw.filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(raw.to_string()),
            None => self.read_credential_file()?,
        };

        let mut map = match raw {
            Some(raw) => parse_object(&raw)?,
            None => Map::new(),
        };
        normalize_legacy_keys(&mut map);

        let mut config = AgentConfig {
            auth: map.remove("auth").as_ref().and_then(Credential::from_value),
            ..AgentConfig::default()
        };
        if let Some(base_url) = take_string(&mut map, "baseUrl")? {
            config.base_url = base_url;
        }
        if let Some(thread_id) = take_string(&mut map, "threadId")? {
            config.thread_id = thread_id;
        }
        let explicit_env = take_string_map(&mut map, "envVars")?;
        config.agent_files = take_path_list(&mut map, "agentFiles")?;
        map.remove("env");
        config.extra = map;

        if flags.local {
            config.base_url = LOCAL_BASE_URL.to_string();
        }

        config.env_vars = self.load_env_vars(agent_path);
        config.env_vars.extend(explicit_env);

        tracing::debug!(
            base_url = %config.base_url,
            thread_id = %config.thread_id,
            has_auth = config.auth.is_some(),
            env_vars = config.env_vars.len(),
            agent_files = config.agent_files.len(),
            "Resolved agent config"
        );
        Ok(config)
    }

    fn read_credential_file(&self) -> Result<Option<String>, ConfigError> {
        let Some(path) = &self.credential_path else {
            return Ok(None);
        };
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No credential file");
                Ok(None)
            }
            Err(source) => Err(ConfigError::Io {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Agent-local `.env` entries, overridden by allow-listed process variables.
    fn load_env_vars(&self, agent_path: &Path) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();

        let dotenv = agent_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".env");
        if dotenv.is_file() {
            match dotenvy::from_path_iter(&dotenv) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) => {
                                vars.insert(key, value);
                            }
                            Err(e) => tracing::warn!(
                                path = %dotenv.display(),
                                "Skipping .env entry: {}",
                                e
                            ),
                        }
                    }
                }
                Err(e) => tracing::warn!(path = %dotenv.display(), "Could not read .env: {}", e),
            }
        }

        for key in &self.env_allow_list {
            if let Ok(value) = std::env::var(key) {
                vars.insert(key.clone(), value);
            }
        }
        vars
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, ConfigError> {
    match serde_json::from_str::<Value>(raw).map_err(|e| ConfigError::Parse(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::NotAnObject(json_kind(&other).to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Result<Option<String>, ConfigError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a string, got {}", json_kind(&other)),
        }),
    }
}

fn take_string_map(
    map: &mut Map<String, Value>,
    key: &str,
) -> Result<BTreeMap<String, String>, ConfigError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(entries)) => Ok(entries
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an object, got {}", json_kind(&other)),
        }),
    }
}

fn take_path_list(map: &mut Map<String, Value>, key: &str) -> Result<Vec<PathBuf>, ConfigError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(PathBuf::from(s)),
                other => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a list of paths, found {}", json_kind(&other)),
                }),
            })
            .collect(),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an array, got {}", json_kind(&other)),
        }),
    }
}

/// A program plus arguments with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Parse a whitespace-separated template. Returns `None` for a blank string.
    pub fn parse(template: &str) -> Option<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Whether any argument references `{name}`.
    pub fn uses(&self, name: &str) -> bool {
        let needle = format!("{{{}}}", name);
        self.args.iter().any(|a| a.contains(&needle))
    }

    /// Arguments with every `{name}` replaced by its value.
    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect()
    }
}

/// Process-level runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Output root for lowered modules. Shared across runs.
    pub out_dir: PathBuf,
    /// Deadline applied to every remote call.
    pub request_timeout: Duration,
    /// Deadline for a single agent invocation.
    pub invoke_timeout: Duration,
    /// Executes a lowered script module (`{entry}`, `{bootstrap}`).
    pub interpreter: CommandTemplate,
    /// Lowers a TypeScript source (`{input}`, `{output}`).
    pub transpiler: CommandTemplate,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            out_dir: std::env::temp_dir().join("nearai_ts_compiled"),
            request_timeout: Duration::from_secs(120),
            invoke_timeout: Duration::from_secs(600), // 10 minutes
            interpreter: CommandTemplate::new("node", &["{bootstrap}", "{entry}"]),
            transpiler: CommandTemplate::new(
                "esbuild",
                &[
                    "{input}",
                    "--format=esm",
                    "--platform=node",
                    "--log-level=error",
                    "--outfile={output}",
                ],
            ),
        }
    }
}

impl RuntimeSettings {
    /// Defaults overridden by `AGENT_RUNTIME_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            out_dir: std::env::var("AGENT_RUNTIME_OUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.out_dir),
            request_timeout: env_secs("AGENT_RUNTIME_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            invoke_timeout: env_secs("AGENT_RUNTIME_INVOKE_TIMEOUT_SECS")
                .unwrap_or(defaults.invoke_timeout),
            interpreter: std::env::var("AGENT_RUNTIME_INTERPRETER")
                .ok()
                .and_then(|t| CommandTemplate::parse(&t))
                .unwrap_or(defaults.interpreter),
            transpiler: std::env::var("AGENT_RUNTIME_TRANSPILER")
                .ok()
                .and_then(|t| CommandTemplate::parse(&t))
                .unwrap_or(defaults.transpiler),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
