//! Recipe parsing, version constraints, environments, and build identity for kiln.
//!
//! This crate defines the schema layer: TOML recipe parsing and validation
//! (`Recipe`), version and constraint algebra (`Version`, `VersionConstraint`),
//! build environments loaded from profiles (`Environment`), deterministic
//! build fingerprints (`compute_fingerprint`), and lock files (`LockFile`).

pub mod environment;
pub mod fingerprint;
pub mod lock;
pub mod options;
pub mod recipe;
pub mod standard;
pub mod types;
pub mod version;

pub use environment::{Compiler, Environment, ProfileError, Settings};
pub use fingerprint::{compute_fingerprint, BuildIdentity};
pub use lock::{LockError, LockFile, LockedPackage, LOCK_VERSION};
pub use options::{OptionSpec, OptionValue};
pub use recipe::{
    load_recipe, load_recipe_file, parse_recipe_str, validate_package_name, Compatibility,
    LayoutRule, Recipe, RecipeError, RecipeFile, Requirement, SourceSpec,
};
pub use standard::{LanguageStandard, StandardError};
pub use types::{Fingerprint, ObjectHash, ShortId};
pub use version::{Version, VersionConstraint, VersionError};
