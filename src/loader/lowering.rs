//! Turning agent sources into files the interpreter can execute.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::CommandTemplate;
use crate::error::LoaderError;

/// Maximum stderr kept from a failed lowering command (8KB).
const MAX_DIAGNOSTIC_SIZE: usize = 8 * 1024;

/// How a source file is lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `.ts` / `.mts`, needs the transpiler.
    TypeScript,
    /// Anything else is executed as written.
    Plain,
}

impl SourceKind {
    pub fn of(path: &Path) -> Self {
        match extension(path) {
            Some("ts") | Some("mts") => Self::TypeScript,
            _ => Self::Plain,
        }
    }
}

/// Whether `path` is an ES module the bootstrap can import.
pub fn is_javascript(path: &Path) -> bool {
    matches!(extension(path), Some("js") | Some("mjs") | Some("cjs"))
}

/// File name of the lowered output for `path` (`.ts` → `.js`, `.mts` → `.mjs`).
pub fn lowered_file_name(path: &Path) -> Option<PathBuf> {
    let name = PathBuf::from(path.file_name()?);
    Some(match extension(path) {
        Some("ts") => name.with_extension("js"),
        Some("mts") => name.with_extension("mjs"),
        _ => name,
    })
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

/// One lowering step: read `input`, write an executable `output`.
#[async_trait]
pub trait Lowering: Send + Sync + Debug {
    async fn lower(&self, input: &Path, output: &Path) -> Result<(), LoaderError>;
}

/// Lowers by copying the file unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyLowering;

#[async_trait]
impl Lowering for CopyLowering {
    async fn lower(&self, input: &Path, output: &Path) -> Result<(), LoaderError> {
        tokio::fs::copy(input, output)
            .await
            .map_err(|e| LoaderError::io(input, e))?;
        Ok(())
    }
}

/// Lowers by running an external transpiler (`{input}` / `{output}` template).
#[derive(Debug, Clone)]
pub struct CommandLowering {
    template: CommandTemplate,
}

impl CommandLowering {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl Lowering for CommandLowering {
    async fn lower(&self, input: &Path, output: &Path) -> Result<(), LoaderError> {
        let input_arg = input.to_string_lossy().into_owned();
        let output_arg = output.to_string_lossy().into_owned();
        let args = self.template.render_args(&[
            ("input", input_arg.as_str()),
            ("output", output_arg.as_str()),
        ]);

        let result = Command::new(&self.template.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| LoaderError::Lowering {
                path: input.to_path_buf(),
                reason: format!("failed to run {}: {}", self.template.program, e),
            })?;

        if !result.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&result.stderr).trim().to_string();
            if diagnostics.is_empty() {
                diagnostics = String::from_utf8_lossy(&result.stdout).trim().to_string();
            }
            truncate(&mut diagnostics, MAX_DIAGNOSTIC_SIZE);
            return Err(LoaderError::Lowering {
                path: input.to_path_buf(),
                reason: format!(
                    "{} exited with {}: {}",
                    self.template.program, result.status, diagnostics
                ),
            });
        }

        // Transpilers that print to stdout instead of honoring `{output}`.
        if !self.template.uses("output") {
            tokio::fs::write(output, &result.stdout)
                .await
                .map_err(|e| LoaderError::io(output, e))?;
        }
        Ok(())
    }
}

fn truncate(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push_str("...");
}

/// Picks the lowering step for a source file by its kind.
#[derive(Debug)]
pub struct Lowerer {
    typescript: Box<dyn Lowering>,
    plain: Box<dyn Lowering>,
}

impl Lowerer {
    pub fn new(typescript: Box<dyn Lowering>, plain: Box<dyn Lowering>) -> Self {
        Self { typescript, plain }
    }

    /// TypeScript through `transpiler`, everything else copied.
    pub fn with_transpiler(transpiler: CommandTemplate) -> Self {
        Self::new(Box::new(CommandLowering::new(transpiler)), Box::new(CopyLowering))
    }

    pub async fn lower(&self, input: &Path, output: &Path) -> Result<(), LoaderError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LoaderError::io(parent, e))?;
        }
        let kind = SourceKind::of(input);
        tracing::debug!(
            input = %input.display(),
            output = %output.display(),
            ?kind,
            "Lowering source"
        );
        match kind {
            SourceKind::TypeScript => self.typescript.lower(input, output).await,
            SourceKind::Plain => self.plain.lower(input, output).await,
        }
    }
}
