use crate::cache::BuildCache;
use crate::concurrency::{Cancellation, StoreLock};
use crate::fetch::Fetcher;
use crate::orchestrator::{OrchestrationReport, Orchestrator};
use crate::registry::RecipeProvider;
use crate::resolver::{resolve, ResolvedSet};
use crate::tool::BuildTool;
use crate::validate::{validate, CompatibilityWarning, ValidationError};
use crate::CoreError;
use kiln_schema::{load_recipe_file, Environment, LockFile, Recipe};
use kiln_store::{ArtifactRecord, StoreLayout};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const LOCK_FILE_NAME: &str = "kiln.lock";

/// Entry point for every kiln operation on one home directory.
pub struct Engine {
    layout: StoreLayout,
}

pub struct ResolveResult {
    pub resolved: ResolvedSet,
    pub lock: LockFile,
}

pub struct BuildResult {
    pub resolved: ResolvedSet,
    pub lock: LockFile,
    pub report: OrchestrationReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Worker threads; `None` uses the available parallelism.
    pub jobs: Option<usize>,
    /// Require the resolution to match the existing lock file exactly.
    pub locked: bool,
}

/// Validation outcome for one resolved package.
#[derive(Debug, Clone, Serialize)]
pub struct PackageCheck {
    pub name: String,
    pub version: String,
    pub warnings: Vec<CompatibilityWarning>,
    pub error: Option<ValidationError>,
}

impl Engine {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            layout: StoreLayout::new(home),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn load_root(recipe_path: &Path) -> Result<Arc<Recipe>, CoreError> {
        let recipe = load_recipe_file(recipe_path)?;
        debug!("loaded {} from {}", recipe.reference(), recipe_path.display());
        Ok(Arc::new(recipe))
    }

    /// `kiln.lock`, next to the recipe.
    pub fn lock_path(recipe_path: &Path) -> PathBuf {
        recipe_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(LOCK_FILE_NAME)
    }

    pub fn resolve(
        &self,
        recipe_path: &Path,
        provider: &dyn RecipeProvider,
        write_lock: bool,
    ) -> Result<ResolveResult, CoreError> {
        let root = Self::load_root(recipe_path)?;
        let resolved = resolve(&root, provider)?;
        let lock = resolved.to_lock_file();
        info!(
            "resolved {} package(s) for {}",
            resolved.len(),
            root.reference()
        );
        if write_lock {
            let path = Self::lock_path(recipe_path);
            lock.write_to_file(&path)?;
            info!("wrote {}", path.display());
        }
        Ok(ResolveResult { resolved, lock })
    }

    /// Resolve and validate every package against `env` without building.
    pub fn check(
        &self,
        recipe_path: &Path,
        provider: &dyn RecipeProvider,
        env: &Environment,
    ) -> Result<Vec<PackageCheck>, CoreError> {
        let root = Self::load_root(recipe_path)?;
        let resolved = resolve(&root, provider)?;
        Ok(resolved
            .build_order()
            .into_iter()
            .filter_map(|name| resolved.get(name))
            .map(|pkg| {
                let (warnings, error) = match validate(&pkg.recipe, env) {
                    Ok(warnings) => (warnings, None),
                    Err(e) => (Vec::new(), Some(e)),
                };
                PackageCheck {
                    name: pkg.name().to_owned(),
                    version: pkg.version().to_string(),
                    warnings,
                    error,
                }
            })
            .collect())
    }

    /// Resolve, then drive every package through its lifecycle.
    ///
    /// Resolution errors and lock drift abort before anything is built;
    /// per-package failures are reported in the returned report.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        recipe_path: &Path,
        provider: &dyn RecipeProvider,
        env: &Environment,
        fetcher: &dyn Fetcher,
        tool: &dyn BuildTool,
        options: BuildOptions,
        cancel: &Cancellation,
    ) -> Result<BuildResult, CoreError> {
        self.layout.initialize()?;
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;

        let root = Self::load_root(recipe_path)?;
        let resolved = resolve(&root, provider)?;
        let lock = resolved.to_lock_file();
        let lock_path = Self::lock_path(recipe_path);

        if options.locked {
            let existing = LockFile::read_from_file(&lock_path)?;
            existing.verify_integrity()?;
            existing.verify_matches(&lock)?;
            debug!("resolution matches {}", lock_path.display());
        } else {
            lock.write_to_file(&lock_path)?;
        }

        let cache = BuildCache::new(self.layout.clone());
        let mut orchestrator =
            Orchestrator::new(&cache, fetcher, tool).with_cancellation(cancel.clone());
        if let Some(jobs) = options.jobs {
            orchestrator = orchestrator.with_jobs(jobs);
        }
        let report = orchestrator.run(&resolved, env)?;
        info!(
            "{}: {} built, {} cached, {} failed",
            root.reference(),
            report.built(),
            report.cached(),
            report.failures().len()
        );

        Ok(BuildResult {
            resolved,
            lock,
            report,
        })
    }

    pub fn list_artifacts(&self) -> Result<Vec<ArtifactRecord>, CoreError> {
        Ok(BuildCache::new(self.layout.clone()).list()?)
    }

    /// Remove the artifact whose fingerprint (or short id) starts with `prefix`.
    pub fn remove_artifact(&self, prefix: &str) -> Result<ArtifactRecord, CoreError> {
        self.layout.initialize()?;
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        Ok(BuildCache::new(self.layout.clone()).remove(prefix)?)
    }
}
