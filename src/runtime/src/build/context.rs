//! Build context: recipe text plus the files COPY may reference.

use std::collections::BTreeMap;
use std::path::Path;

use strata_core::error::{Result, StrataError};

use crate::digest::sha256_bytes;
use crate::fs::normalize_path;

/// Recipe file names tried by `BuildContext::from_dir`, in order.
pub const RECIPE_FILES: &[&str] = &["Stratafile", "Dockerfile"];

/// Read-only input to a build.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Recipe text.
    pub recipe: String,
    /// Context files keyed by relative path (`config/app.yml`).
    files: BTreeMap<String, Vec<u8>>,
}

/// A context file selected by a COPY source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile<'a> {
    /// Path relative to the matched source (the file name for a file
    /// source, the remainder below the directory for a directory source).
    pub relative: String,
    pub data: &'a [u8],
    /// Selected through a directory source rather than named exactly.
    pub from_dir: bool,
}

impl BuildContext {
    pub fn new(recipe: impl Into<String>) -> Self {
        Self {
            recipe: recipe.into(),
            files: BTreeMap::new(),
        }
    }

    /// Add a file to the context.
    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert_file(path, data);
        self
    }

    pub fn insert_file(&mut self, path: &str, data: impl Into<Vec<u8>>) {
        self.files.insert(context_key(path), data.into());
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&context_key(path)).map(|d| d.as_slice())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Load a directory: the recipe from `Stratafile` (or `Dockerfile`),
    /// and every regular file below it as context.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let recipe_path = RECIPE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                StrataError::Other(format!(
                    "no {} found in {}",
                    RECIPE_FILES.join(" or "),
                    dir.display()
                ))
            })?;
        let recipe = std::fs::read_to_string(&recipe_path).map_err(|e| {
            StrataError::Other(format!(
                "Failed to read recipe at {}: {}",
                recipe_path.display(),
                e
            ))
        })?;

        let mut context = Self::new(recipe);
        collect_files(dir, dir, &mut context)?;
        tracing::debug!(
            dir = %dir.display(),
            files = context.files.len(),
            "Loaded build context"
        );
        Ok(context)
    }

    /// Files selected by a COPY source: the exact file, every file below a
    /// directory prefix, or everything for `.`.
    pub fn resolve_source(&self, source: &str) -> Vec<SourceFile<'_>> {
        let key = context_key(source);
        if key.is_empty() {
            return self
                .files
                .iter()
                .map(|(path, data)| SourceFile {
                    relative: path.clone(),
                    data,
                    from_dir: true,
                })
                .collect();
        }

        if let Some(data) = self.files.get(&key) {
            let name = key.rsplit('/').next().unwrap_or(&key).to_string();
            return vec![SourceFile {
                relative: name,
                data,
                from_dir: false,
            }];
        }

        let prefix = format!("{}/", key);
        self.files
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, data)| SourceFile {
                relative: path[prefix.len()..].to_string(),
                data,
                from_dir: true,
            })
            .collect()
    }

    /// `(path, sha256)` of every file a source selects, for cache keys.
    pub fn source_digests(&self, source: &str) -> Vec<(String, String)> {
        self.resolve_source(source)
            .into_iter()
            .map(|f| (f.relative, sha256_bytes(f.data)))
            .collect()
    }
}

/// Normalize a context path to a relative key (`./a/../b` -> `b`).
fn context_key(path: &str) -> String {
    normalize_path("/", path).trim_start_matches('/').to_string()
}

fn collect_files(root: &Path, current: &Path, context: &mut BuildContext) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        StrataError::Other(format!(
            "Failed to read context directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, context)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| StrataError::Other(format!("Failed to strip prefix: {}", e)))?;
            let relative = relative.to_string_lossy();
            if RECIPE_FILES.contains(&relative.as_ref()) {
                continue;
            }
            context.insert_file(&relative, std::fs::read(&path)?);
        }
    }
    Ok(())
}
