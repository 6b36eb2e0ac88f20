//! Agent module loading: lowering sources and importing the result.
//!
//! Two lowering modes:
//! - graph mode lowers everything reachable from the entry through relative
//!   imports into the output directory, mirroring relative paths;
//! - explicit-list mode lowers exactly the listed files, flattened by file
//!   name, into a subdirectory that is emptied first. Nothing outside the list
//!   can be imported from there.
//!
//! Either way a `package.json` marker declaring ES modules is written next to
//! the output; an existing marker is left alone.

pub mod bridge;
pub mod graph;
pub mod lowering;
pub mod module;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::config::{CommandTemplate, RuntimeSettings};
use crate::error::LoaderError;

pub use bridge::ScriptModule;
pub use lowering::{CommandLowering, CopyLowering, Lowerer, Lowering};
pub use module::{AgentContext, AgentModule, EntryPoint, NativeAgent};

/// Marker file telling the interpreter the directory holds ES modules.
pub const MODULE_MARKER: &str = "package.json";

const MODULE_MARKER_CONTENT: &str = r#"{"type":"module"}"#;

/// Subdirectory used by explicit-list mode.
pub const LISTED_DIR: &str = "listed";

/// Bootstrap script written for interpreters whose template uses `{bootstrap}`.
pub const BOOTSTRAP_FILE: &str = "agent-runtime-bootstrap.mjs";

const BOOTSTRAP_SOURCE: &str = include_str!("bootstrap.mjs");

/// Lowers agent sources and imports the lowered entry.
#[derive(Debug)]
pub struct ModuleLoader {
    out_dir: PathBuf,
    lowerer: Lowerer,
    interpreter: CommandTemplate,
    invoke_timeout: Duration,
}

impl ModuleLoader {
    pub fn new(
        out_dir: PathBuf,
        lowerer: Lowerer,
        interpreter: CommandTemplate,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            out_dir,
            lowerer,
            interpreter,
            invoke_timeout,
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::new(
            settings.out_dir.clone(),
            Lowerer::with_transpiler(settings.transpiler.clone()),
            settings.interpreter.clone(),
            settings.invoke_timeout,
        )
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Lower `entry` and return the path of its lowered form.
    ///
    /// A non-empty `files` selects explicit-list mode.
    pub async fn load(
        &self,
        entry: &Path,
        files: Option<&[PathBuf]>,
    ) -> Result<PathBuf, LoaderError> {
        let lowered = match files.filter(|f| !f.is_empty()) {
            Some(files) => self.load_listed(entry, files).await?,
            None => self.load_graph(entry).await?,
        };
        tracing::info!(
            entry = %entry.display(),
            lowered = %lowered.display(),
            "Agent module lowered"
        );
        Ok(lowered)
    }

    async fn load_graph(&self, entry: &Path) -> Result<PathBuf, LoaderError> {
        let files = graph::collect(entry).await?;
        create_dir(&self.out_dir).await?;

        let mut lowered_entry = None;
        for file in &files {
            let name = lowering::lowered_file_name(&file.source).ok_or_else(|| {
                LoaderError::UnsupportedSource {
                    path: file.source.clone(),
                }
            })?;
            let output = match file.relative.parent() {
                Some(parent) => self.out_dir.join(parent).join(name),
                None => self.out_dir.join(name),
            };
            self.lowerer.lower(&file.source, &output).await?;
            lowered_entry.get_or_insert(output);
        }
        tracing::debug!(files = files.len(), "Lowered import graph");

        write_marker(&self.out_dir).await;
        lowered_entry.ok_or_else(|| LoaderError::UnsupportedSource {
            path: entry.to_path_buf(),
        })
    }

    async fn load_listed(&self, entry: &Path, files: &[PathBuf]) -> Result<PathBuf, LoaderError> {
        let dir = self.out_dir.join(LISTED_DIR);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LoaderError::io(&dir, e)),
        }
        create_dir(&dir).await?;

        let entry_path = std::path::absolute(entry).map_err(|e| LoaderError::io(entry, e))?;
        let entry_name = lowering::lowered_file_name(entry);

        let mut by_path = None;
        let mut by_name = None;
        for file in files {
            let source = std::path::absolute(file).map_err(|e| LoaderError::io(file, e))?;
            let name = lowering::lowered_file_name(&source).ok_or_else(|| {
                LoaderError::UnsupportedSource {
                    path: source.clone(),
                }
            })?;
            let output = dir.join(&name);
            if tokio::fs::try_exists(&output).await.unwrap_or(false) {
                tracing::warn!(
                    file = %source.display(),
                    "Listed file shadows an earlier one with the same name"
                );
            }
            self.lowerer.lower(&source, &output).await?;

            if source == entry_path {
                by_path = Some(output);
            } else if entry_name.as_ref() == Some(&name) {
                by_name.get_or_insert(output);
            }
        }
        tracing::debug!(files = files.len(), "Lowered listed files");

        write_marker(&dir).await;
        by_path
            .or(by_name)
            .ok_or_else(|| LoaderError::EntryNotInList {
                entry: entry.to_path_buf(),
            })
    }

    /// Import a lowered module: check it is there, find its entry export and
    /// wrap it for execution.
    pub async fn import(&self, lowered: &Path) -> Result<Arc<dyn AgentModule>, LoaderError> {
        let import_error = |e: std::io::Error| LoaderError::Import {
            path: lowered.to_path_buf(),
            reason: e.to_string(),
        };

        let entry = if lowering::is_javascript(lowered) {
            let source = tokio::fs::read_to_string(lowered)
                .await
                .map_err(import_error)?;
            EntryPoint::detect(lowered, &source)?
        } else {
            tokio::fs::metadata(lowered).await.map_err(import_error)?;
            EntryPoint::Default
        };

        let bootstrap = if self.interpreter.uses("bootstrap") {
            Some(self.write_bootstrap().await?)
        } else {
            None
        };

        tracing::debug!(
            path = %lowered.display(),
            entry = entry.export_name(),
            "Agent module imported"
        );
        Ok(Arc::new(ScriptModule::new(
            lowered.to_path_buf(),
            entry,
            self.interpreter.clone(),
            bootstrap,
            self.invoke_timeout,
        )))
    }

    async fn write_bootstrap(&self) -> Result<PathBuf, LoaderError> {
        create_dir(&self.out_dir).await?;
        let path = self.out_dir.join(BOOTSTRAP_FILE);
        tokio::fs::write(&path, BOOTSTRAP_SOURCE)
            .await
            .map_err(|e| LoaderError::io(&path, e))?;
        Ok(path)
    }
}

async fn create_dir(dir: &Path) -> Result<(), LoaderError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| LoaderError::io(dir, e))
}

/// Write the module marker unless one already exists. Never fails the load.
async fn write_marker(dir: &Path) {
    let path = dir.join(MODULE_MARKER);
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(MODULE_MARKER_CONTENT.as_bytes()).await?;
        file.flush().await
    }
    .await;

    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Wrote module marker"),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => tracing::warn!(path = %path.display(), "Could not write module marker: {}", e),
    }
}
