//! Discovery of the local import graph reachable from an agent entry file.
//!
//! Only relative specifiers (`./x`, `../y`) are followed; bare package
//! imports are left to the interpreter. Every reachable file must live under
//! the entry's directory so the lowered tree can mirror it.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::LoaderError;

/// `from './x'`, `import './x'` and `import('./x')`.
static RELATIVE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bfrom\s*|\bimport\s*\(?\s*)["'](\.{1,2}/[^"'\n]+)["']"#)
        .expect("import pattern is valid")
});

/// String literals (kept as-is) or comments (blanked before scanning).
static LITERAL_OR_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#""(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*'|`(?:[^`\\]|\\.)*`"#,
        r"|//[^\n]*|/\*(?s:.*?)\*/",
    ))
    .expect("comment pattern is valid")
});

/// A source file in the graph, with its location relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFile {
    pub source: PathBuf,
    pub relative: PathBuf,
}

/// Relative import specifiers in `source`, in order of appearance.
/// Imports inside comments are not edges.
pub fn relative_imports(source: &str) -> Vec<String> {
    let code = strip_comments(source);
    RELATIVE_IMPORT
        .captures_iter(&code)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn strip_comments(source: &str) -> std::borrow::Cow<'_, str> {
    LITERAL_OR_COMMENT.replace_all(source, |caps: &regex::Captures| {
        let text = &caps[0];
        if text.starts_with('/') {
            " ".to_string()
        } else {
            text.to_string()
        }
    })
}

/// Walk the graph from `entry` (breadth first). The entry comes first.
pub async fn collect(entry: &Path) -> Result<Vec<GraphFile>, LoaderError> {
    let entry = tokio::fs::canonicalize(entry)
        .await
        .map_err(|e| LoaderError::io(entry, e))?;
    let root = entry
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| LoaderError::UnsupportedSource {
            path: entry.clone(),
        })?;

    let mut seen = HashSet::from([entry.clone()]);
    let mut queue = VecDeque::from([entry]);
    let mut files = Vec::new();

    while let Some(path) = queue.pop_front() {
        let relative = path
            .strip_prefix(&root)
            .map_err(|_| LoaderError::OutsideRoot {
                path: path.clone(),
                root: root.clone(),
            })?
            .to_path_buf();

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| LoaderError::io(&path, e))?;
        let dir = path.parent().unwrap_or(&root);
        for specifier in relative_imports(&source) {
            let resolved = resolve(dir, &specifier)
                .await
                .ok_or_else(|| LoaderError::Lowering {
                    path: path.clone(),
                    reason: format!("cannot resolve import '{}'", specifier),
                })?;
            if seen.insert(resolved.clone()) {
                queue.push_back(resolved);
            }
        }

        files.push(GraphFile {
            source: path,
            relative,
        });
    }

    Ok(files)
}

/// Candidate files for `specifier`, in lookup order.
///
/// TypeScript sources conventionally import their siblings by the lowered
/// name (`./util.js` for `util.ts`), so the source extension is tried first.
fn candidates(dir: &Path, specifier: &str) -> Vec<PathBuf> {
    let base = dir.join(specifier);
    let ext = base.extension().and_then(|e| e.to_str());
    match ext {
        Some("js") => vec![base.with_extension("ts"), base],
        Some("mjs") => vec![base.with_extension("mts"), base],
        Some("ts") | Some("mts") | Some("cjs") | Some("json") => vec![base],
        _ => {
            let mut out: Vec<PathBuf> = ["ts", "js", "mts", "mjs"]
                .iter()
                .map(|e| with_suffix(&base, e))
                .collect();
            out.push(base.join("index.ts"));
            out.push(base.join("index.js"));
            out
        }
    }
}

fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

async fn resolve(dir: &Path, specifier: &str) -> Option<PathBuf> {
    for candidate in candidates(dir, specifier) {
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return tokio::fs::canonicalize(&candidate).await.ok();
        }
    }
    None
}
