use crate::mock::MockFetcher;
use crate::CoreError;
use kiln_schema::SourceSpec;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("unsupported source url '{0}': only file:// and local paths can be fetched")]
    UnsupportedScheme(String),
    #[error("cannot strip root of {path}: expected exactly one top-level directory")]
    StripRoot { path: String },
    #[error("fetch failed: {0}")]
    Failed(String),
}

/// Acquires package sources into a destination directory.
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Populate `dest` (existing and empty) with the sources `source` names.
    fn fetch(&self, source: &SourceSpec, dest: &Path) -> Result<(), FetchError>;
}

/// Copies sources from a local directory.
///
/// Accepts `file://` urls and plain paths; relative paths are resolved
/// against the base directory.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    base: PathBuf,
}

impl LocalFetcher {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn locate(&self, url: &str) -> Result<PathBuf, FetchError> {
        let raw = match url.split_once("://") {
            Some(("file", rest)) => rest,
            Some(_) => return Err(FetchError::UnsupportedScheme(url.to_owned())),
            None => url,
        };
        let path = Path::new(raw);
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        };
        if full.exists() {
            Ok(full)
        } else {
            Err(FetchError::NotFound(full.display().to_string()))
        }
    }
}

impl Fetcher for LocalFetcher {
    fn name(&self) -> &'static str {
        "local"
    }

    fn fetch(&self, source: &SourceSpec, dest: &Path) -> Result<(), FetchError> {
        let mut from = self.locate(&source.url)?;
        if from.is_file() {
            let file_name = from
                .file_name()
                .ok_or_else(|| FetchError::NotFound(source.url.clone()))?;
            fs::copy(&from, dest.join(file_name))?;
            return Ok(());
        }

        if source.strip_root {
            let mut entries = fs::read_dir(&from)?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| !n.starts_with('.'))
                });
            match (entries.next(), entries.next()) {
                (Some(only), None) if only.is_dir() => from = only,
                _ => {
                    return Err(FetchError::StripRoot {
                        path: from.display().to_string(),
                    })
                }
            }
        }

        copy_tree(&from, dest)?;
        tracing::debug!("fetched {} into {}", from.display(), dest.display());
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), FetchError> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_tree(&src, &dst)?;
        } else if ft.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&src)?, &dst)?;
        } else {
            fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

pub fn select_fetcher(name: &str, base: &Path) -> Result<Box<dyn Fetcher>, CoreError> {
    match name {
        "local" => Ok(Box::new(LocalFetcher::new(base))),
        "mock" => Ok(Box::new(MockFetcher::new())),
        other => Err(CoreError::UnknownCollaborator {
            kind: "fetcher",
            name: other.to_owned(),
        }),
    }
}
