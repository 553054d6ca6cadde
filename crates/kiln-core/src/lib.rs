//! Resolution and build orchestration engine for kiln.
//!
//! This crate ties the schema and store layers together: the compatibility
//! validator (`validate`), the flat version resolver (`resolve`) over a
//! pluggable `RecipeProvider`, the per-package lifecycle state machine, the
//! single-flight `BuildCache`, and the parallel `Orchestrator`. The `Engine`
//! is the entry point used by the CLI. Source fetching and build-tool
//! invocation are collaborators behind the `Fetcher` and `BuildTool` traits.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod lifecycle;
pub mod mock;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod tool;
pub mod validate;

pub use cache::{BuildArtifact, BuildCache, BuildTicket, CacheError, CacheLookup};
pub use concurrency::{install_signal_handler, Cancellation, StoreLock};
pub use config::KilnConfig;
pub use engine::{BuildOptions, BuildResult, Engine, PackageCheck, ResolveResult, LOCK_FILE_NAME};
pub use fetch::{select_fetcher, FetchError, Fetcher, LocalFetcher};
pub use lifecycle::{validate_transition, PackageState};
pub use mock::{MockBuildTool, MockFetcher};
pub use orchestrator::{
    FailureReason, OrchestrationReport, Orchestrator, PackageFailure, PackageOutcome,
};
pub use registry::{DirectoryRegistry, InMemoryRegistry, ProviderError, RecipeProvider};
pub use resolver::{resolve, ResolveError, ResolvedPackage, ResolvedSet};
pub use tool::{
    select_build_tool, BuildOutput, BuildRequest, BuildTool, BuildToolError, CommandBuildTool,
};
pub use validate::{effective_options, validate, CompatibilityWarning, ValidationError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("recipe error: {0}")]
    Recipe(#[from] kiln_schema::RecipeError),
    #[error("profile error: {0}")]
    Profile(#[from] kiln_schema::ProfileError),
    #[error("lock error: {0}")]
    Lock(#[from] kiln_schema::LockError),
    #[error("store error: {0}")]
    Store(#[from] kiln_store::StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("compatibility error: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown {kind} '{name}'")]
    UnknownCollaborator { kind: &'static str, name: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
