//! Parallel, dependency-ordered execution of the package lifecycle.
//!
//! Workers share one scheduling board guarded by a mutex and condvar.
//! Fetching and validation of any package may start at once; a package
//! moves on to `Configuring` only after every dependency (runtime and build)
//! is `Complete`. A failed dependency fails its dependents without touching
//! unrelated packages.

use crate::cache::{BuildArtifact, BuildCache, CacheLookup};
use crate::concurrency::Cancellation;
use crate::fetch::Fetcher;
use crate::lifecycle::{validate_transition, PackageState};
use crate::resolver::{ResolvedPackage, ResolvedSet};
use crate::tool::{BuildRequest, BuildTool};
use crate::validate::{effective_options, validate, CompatibilityWarning, ValidationError};
use crate::CoreError;
use glob::MatchOptions;
use kiln_schema::{compute_fingerprint, Environment, LayoutRule};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const SCHEDULER_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Incompatible(ValidationError),
    #[error("dependency '{0}' failed")]
    DependencyFailed(String),
    #[error("build tool exited with code {exit_code}")]
    BuildFailed { exit_code: i32, log: String },
    #[error("build tool error: {0}")]
    BuildTool(String),
    #[error("packaging failed: {0}")]
    Packaging(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// A package that ended in `Failed`, with the state it failed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageFailure {
    pub package: String,
    pub state: PackageState,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageOutcome {
    pub name: String,
    pub version: String,
    pub state: PackageState,
    /// Every state the package passed through, starting at `Pending`.
    pub history: Vec<PackageState>,
    pub artifact: Option<BuildArtifact>,
    /// Completed from the cache without invoking the build tool.
    pub cached: bool,
    pub warnings: Vec<CompatibilityWarning>,
    pub failure: Option<PackageFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestrationReport {
    pub outcomes: BTreeMap<String, PackageOutcome>,
}

impl OrchestrationReport {
    pub fn is_success(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| o.state == PackageState::Complete)
    }

    pub fn failures(&self) -> Vec<&PackageFailure> {
        self.outcomes
            .values()
            .filter_map(|o| o.failure.as_ref())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&PackageOutcome> {
        self.outcomes.get(name)
    }

    pub fn built(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.state == PackageState::Complete && !o.cached)
            .count()
    }

    pub fn cached(&self) -> usize {
        self.outcomes.values().filter(|o| o.cached).count()
    }
}

struct Entry {
    state: PackageState,
    history: Vec<PackageState>,
    claimed: bool,
    validated: bool,
    failure: Option<PackageFailure>,
    artifact: Option<BuildArtifact>,
    cached: bool,
    warnings: Vec<CompatibilityWarning>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: PackageState::Pending,
            history: vec![PackageState::Pending],
            claimed: false,
            validated: false,
            failure: None,
            artifact: None,
            cached: false,
            warnings: Vec::new(),
        }
    }
}

enum Task {
    Prepare(String),
    Build {
        name: String,
        dependencies: BTreeMap<String, PathBuf>,
    },
}

struct Board {
    order: Vec<String>,
    entries: BTreeMap<String, Entry>,
}

impl Board {
    fn new(resolved: &ResolvedSet) -> Self {
        let order: Vec<String> = resolved
            .build_order()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let entries = order.iter().map(|n| (n.clone(), Entry::new())).collect();
        Self { order, entries }
    }

    fn state(&self, name: &str) -> Option<PackageState> {
        self.entries.get(name).map(|e| e.state)
    }

    fn advance(&mut self, name: &str, to: PackageState) -> Result<(), FailureReason> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| FailureReason::Internal(format!("unknown package '{name}'")))?;
        validate_transition(entry.state, to).map_err(|e| FailureReason::Internal(e.to_string()))?;
        debug!("{name}: {} -> {to}", entry.state);
        entry.state = to;
        entry.history.push(to);
        Ok(())
    }

    fn fail(&mut self, name: &str, reason: FailureReason) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        warn!("{name}: failed while {}: {reason}", entry.state);
        entry.failure = Some(PackageFailure {
            package: name.to_owned(),
            state: entry.state,
            reason,
        });
        entry.state = PackageState::Failed;
        entry.history.push(PackageState::Failed);
    }

    /// Fail idle packages that can no longer make progress: everything when
    /// cancelled, otherwise dependents of failed packages.
    fn settle(&mut self, resolved: &ResolvedSet, cancelled: bool) {
        for name in self.order.clone() {
            let Some(entry) = self.entries.get(&name) else {
                continue;
            };
            if entry.claimed || entry.state.is_terminal() {
                continue;
            }
            let reason = if cancelled {
                Some(FailureReason::Cancelled)
            } else {
                resolved.get(&name).and_then(|pkg| {
                    pkg.dependencies()
                        .find(|dep| self.state(dep) == Some(PackageState::Failed))
                        .map(|dep| FailureReason::DependencyFailed(dep.to_owned()))
                })
            };
            if let Some(reason) = reason {
                self.fail(&name, reason);
            }
        }
    }

    fn next_task(&mut self, resolved: &ResolvedSet) -> Option<Task> {
        for name in &self.order {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if entry.claimed || !entry.validated || entry.state != PackageState::Validating {
                continue;
            }
            let Some(pkg) = resolved.get(name) else {
                continue;
            };
            let mut dependencies = BTreeMap::new();
            let ready = pkg.dependencies().all(|dep| {
                match self.entries.get(dep).and_then(|e| e.artifact.as_ref()) {
                    Some(artifact) => {
                        dependencies.insert(dep.to_owned(), artifact.package_dir.clone());
                        true
                    }
                    None => false,
                }
            });
            if ready {
                let name = name.clone();
                if let Some(entry) = self.entries.get_mut(&name) {
                    entry.claimed = true;
                }
                return Some(Task::Build { name, dependencies });
            }
        }

        let pending = self.order.iter().find(|name| {
            self.entries
                .get(*name)
                .is_some_and(|e| !e.claimed && e.state == PackageState::Pending)
        })?;
        let name = pending.clone();
        if let Some(entry) = self.entries.get_mut(&name) {
            entry.claimed = true;
        }
        Some(Task::Prepare(name))
    }

    fn finished(&self) -> bool {
        self.entries.values().all(|e| e.state.is_terminal())
    }

    fn into_report(self, resolved: &ResolvedSet) -> OrchestrationReport {
        let outcomes = self
            .entries
            .into_iter()
            .map(|(name, entry)| {
                let version = resolved
                    .version_of(&name)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let outcome = PackageOutcome {
                    name: name.clone(),
                    version,
                    state: entry.state,
                    history: entry.history,
                    artifact: entry.artifact,
                    cached: entry.cached,
                    warnings: entry.warnings,
                    failure: entry.failure,
                };
                (name, outcome)
            })
            .collect();
        OrchestrationReport { outcomes }
    }
}

/// Drives every package of a resolved set through its lifecycle.
pub struct Orchestrator<'a> {
    cache: &'a BuildCache,
    fetcher: &'a dyn Fetcher,
    tool: &'a dyn BuildTool,
    jobs: usize,
    cancel: Cancellation,
}

struct Run<'r> {
    resolved: &'r ResolvedSet,
    env: &'r Environment,
    /// Removed when the run ends.
    scratch: tempfile::TempDir,
    board: Mutex<Board>,
    wake: Condvar,
}

impl Run<'_> {
    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `source/` and `build/` of one package live below this.
    fn work_dir(&self, pkg: &ResolvedPackage) -> PathBuf {
        self.scratch
            .path()
            .join(format!("{}-{}", pkg.name(), pkg.version()))
    }

    fn advance(&self, name: &str, to: PackageState) -> Result<(), FailureReason> {
        let result = self.lock().advance(name, to);
        self.wake.notify_all();
        result
    }
}

impl<'a> Orchestrator<'a> {
    pub fn new(cache: &'a BuildCache, fetcher: &'a dyn Fetcher, tool: &'a dyn BuildTool) -> Self {
        let jobs = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            cache,
            fetcher,
            tool,
            jobs,
            cancel: Cancellation::new(),
        }
    }

    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build every package of `resolved`. Per-package failures land in the
    /// report; only setting up the scratch area can fail the call.
    pub fn run(
        &self,
        resolved: &ResolvedSet,
        env: &Environment,
    ) -> Result<OrchestrationReport, CoreError> {
        let work_root = self.cache.layout().work_dir();
        fs::create_dir_all(&work_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&work_root)?;
        let run = Run {
            resolved,
            env,
            scratch,
            board: Mutex::new(Board::new(resolved)),
            wake: Condvar::new(),
        };
        let workers = self.jobs.min(resolved.len()).max(1);
        info!(
            "building {} package(s) for {} with {workers} worker(s)",
            resolved.len(),
            resolved.root()
        );

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| self.worker(&run));
            }
        });

        Ok(run
            .board
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_report(resolved))
    }

    fn worker(&self, run: &Run<'_>) {
        loop {
            let task = {
                let mut board = run.lock();
                loop {
                    board.settle(run.resolved, self.cancel.is_cancelled());
                    if let Some(task) = board.next_task(run.resolved) {
                        break Some(task);
                    }
                    if board.finished() {
                        break None;
                    }
                    board = run
                        .wake
                        .wait_timeout(board, SCHEDULER_TICK)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            };
            let Some(task) = task else {
                run.wake.notify_all();
                return;
            };

            match task {
                Task::Prepare(name) => {
                    let result = self.prepare(run, &name);
                    let mut board = run.lock();
                    if let Some(entry) = board.entries.get_mut(&name) {
                        entry.claimed = false;
                    }
                    match result {
                        Ok(warnings) => {
                            if let Some(entry) = board.entries.get_mut(&name) {
                                entry.validated = true;
                                entry.warnings = warnings;
                            }
                        }
                        Err(reason) => board.fail(&name, reason),
                    }
                }
                Task::Build { name, dependencies } => {
                    let result = self.build(run, &name, dependencies);
                    let mut board = run.lock();
                    if let Some(entry) = board.entries.get_mut(&name) {
                        entry.claimed = false;
                    }
                    match result {
                        Ok((artifact, cached)) => {
                            if let Some(entry) = board.entries.get_mut(&name) {
                                entry.artifact = Some(artifact);
                                entry.cached = cached;
                            }
                        }
                        Err(reason) => board.fail(&name, reason),
                    }
                }
            }
            run.wake.notify_all();
        }
    }

    fn checkpoint(&self) -> Result<(), FailureReason> {
        if self.cancel.is_cancelled() {
            Err(FailureReason::Cancelled)
        } else {
            Ok(())
        }
    }

    fn package<'r>(run: &Run<'r>, name: &str) -> Result<&'r ResolvedPackage, FailureReason> {
        run.resolved
            .get(name)
            .ok_or_else(|| FailureReason::Internal(format!("'{name}' is not in the resolved set")))
    }

    /// Fetching and Validating.
    fn prepare(
        &self,
        run: &Run<'_>,
        name: &str,
    ) -> Result<Vec<CompatibilityWarning>, FailureReason> {
        let pkg = Self::package(run, name)?;
        let recipe = &pkg.recipe;

        self.checkpoint()?;
        run.advance(name, PackageState::Fetching)?;
        let source_dir = run.work_dir(pkg).join("source");
        reset_dir(&source_dir).map_err(|e| FailureReason::Fetch(e.to_string()))?;
        match recipe.source() {
            Some(source) => {
                info!("{}: fetching {}", recipe.reference(), source.url);
                self.fetcher
                    .fetch(source, &source_dir)
                    .map_err(|e| FailureReason::Fetch(e.to_string()))?;
            }
            None => debug!("{}: no sources declared", recipe.reference()),
        }

        self.checkpoint()?;
        run.advance(name, PackageState::Validating)?;
        validate(recipe, run.env).map_err(FailureReason::Incompatible)
    }

    /// Configuring through Complete. Returns the artifact and whether it
    /// came from the cache.
    fn build(
        &self,
        run: &Run<'_>,
        name: &str,
        dependencies: BTreeMap<String, PathBuf>,
    ) -> Result<(BuildArtifact, bool), FailureReason> {
        let pkg = Self::package(run, name)?;
        let recipe = &pkg.recipe;

        self.checkpoint()?;
        run.advance(name, PackageState::Configuring)?;
        let options = effective_options(recipe, run.env).map_err(FailureReason::Incompatible)?;
        let identity = compute_fingerprint(
            recipe,
            &run.resolved.runtime_closure(name),
            run.env,
            &options,
        )
        .map_err(|e| FailureReason::Internal(e.to_string()))?;
        debug!("{}: fingerprint {}", recipe.reference(), identity.fingerprint);

        let ticket = match self
            .cache
            .lookup_or_claim(&identity.fingerprint)
            .map_err(|e| FailureReason::Cache(e.to_string()))?
        {
            CacheLookup::Hit(artifact) => {
                info!("{}: cached ({})", recipe.reference(), artifact.short_id);
                run.advance(name, PackageState::Complete)?;
                return Ok((artifact, true));
            }
            CacheLookup::Failed(reason) => {
                return Err(FailureReason::Cache(format!(
                    "build of {} failed elsewhere: {reason}",
                    identity.short_id
                )))
            }
            CacheLookup::Claimed(ticket) => ticket,
        };

        if let Err(reason) = self.checkpoint() {
            ticket.fail(reason.to_string());
            return Err(reason);
        }
        run.advance(name, PackageState::Building)?;
        let work_dir = run.work_dir(pkg);
        let build_dir = work_dir.join("build");
        reset_dir(&build_dir).map_err(|e| FailureReason::BuildTool(e.to_string()))?;
        let request = BuildRequest {
            package: name.to_owned(),
            version: pkg.version().to_string(),
            source_dir: work_dir.join("source"),
            build_dir: build_dir.clone(),
            environment: run.env.clone(),
            options,
            dependencies,
        };
        info!("{}: building with {}", recipe.reference(), self.tool.name());
        let output = match self.tool.invoke(&request) {
            Ok(output) => output,
            Err(e) => {
                ticket.fail(e.to_string());
                return Err(FailureReason::BuildTool(e.to_string()));
            }
        };
        if !output.success() {
            ticket.fail(format!("build tool exited with code {}", output.exit_code));
            return Err(FailureReason::BuildFailed {
                exit_code: output.exit_code,
                log: output.log,
            });
        }

        if let Err(reason) = self.checkpoint() {
            ticket.fail(reason.to_string());
            return Err(reason);
        }
        run.advance(name, PackageState::Packaging)?;
        let staging = match stage_package(
            &self.cache.layout().staging_dir(),
            &build_dir,
            &output.artifacts,
            &request.source_dir,
            recipe.layout(),
        ) {
            Ok(staging) => staging,
            Err(e) => {
                ticket.fail(e.to_string());
                return Err(FailureReason::Packaging(e.to_string()));
            }
        };
        let artifact = ticket
            .publish(name, &request.version, staging.path())
            .map_err(|e| FailureReason::Packaging(e.to_string()))?;
        info!(
            "{}: packaged {} file(s) as {}",
            recipe.reference(),
            artifact.files.len(),
            artifact.short_id
        );
        run.advance(name, PackageState::Complete)?;
        Ok((artifact, false))
    }
}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

/// Only plain relative components; no `..`, no absolute paths.
fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Assemble the package tree: build outputs at their build-relative paths,
/// then files selected by the recipe's layout rules.
fn stage_package(
    staging_root: &Path,
    build_dir: &Path,
    outputs: &[PathBuf],
    source_dir: &Path,
    rules: &[LayoutRule],
) -> std::io::Result<tempfile::TempDir> {
    fs::create_dir_all(staging_root)?;
    let staging = tempfile::Builder::new()
        .prefix(".stage-")
        .tempdir_in(staging_root)?;

    for output in outputs {
        if !is_contained(output) {
            warn!("ignoring build output outside the build directory: {}", output.display());
            continue;
        }
        copy_into(&build_dir.join(output), &staging.path().join(output))?;
    }

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    for rule in rules {
        let src_root = match &rule.src {
            Some(src) => source_dir.join(src),
            None => source_dir.to_path_buf(),
        };
        if !is_contained(Path::new(&rule.dst))
            || rule.src.as_deref().is_some_and(|s| !is_contained(Path::new(s)))
        {
            warn!("ignoring layout rule with an escaping path: {}", rule.pattern);
            continue;
        }
        let pattern = glob::Pattern::new(&rule.pattern)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        if !src_root.is_dir() {
            continue;
        }
        let files = kiln_store::list_files(&src_root)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        for relative in files.iter().filter(|f| pattern.matches_with(f, options)) {
            let path = src_root.join(relative);
            if path.is_file() {
                copy_into(&path, &staging.path().join(&rule.dst).join(relative))?;
            }
        }
    }
    Ok(staging)
}

fn copy_into(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).map(|_| ())
}
