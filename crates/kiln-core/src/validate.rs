//! Compatibility checks of a recipe against a concrete environment.

use kiln_schema::{Environment, LanguageStandard, OptionValue, Recipe, Version};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("{package} does not support platform '{platform}' (supported: {})", .supported.join(", "))]
    IncompatiblePlatform {
        package: String,
        platform: String,
        supported: Vec<String>,
    },
    #[error("{package} requires C++ standard {required} or newer, environment selects {selected}")]
    InsufficientStandard {
        package: String,
        required: LanguageStandard,
        selected: LanguageStandard,
    },
    #[error("{package} does not support compiler {compiler}: {reason}")]
    UnsupportedCompiler {
        package: String,
        compiler: String,
        reason: String,
    },
    #[error("{package}: invalid value '{value}' for option '{option}': {reason}")]
    InvalidOption {
        package: String,
        option: String,
        value: String,
        reason: String,
    },
}

/// Non-fatal finding reported alongside a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompatibilityWarning {
    UnknownCompiler { package: String, compiler: String },
}

impl fmt::Display for CompatibilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompatibilityWarning::UnknownCompiler { package, compiler } => write!(
                f,
                "{package}: compatibility with compiler '{compiler}' is unknown"
            ),
        }
    }
}

/// Check `env` against the constraints `recipe` declares.
///
/// Checks run in a fixed order: platform, language standard, standard
/// library variant, compiler minimum version, option selections. The first
/// failing check decides the error.
pub fn validate(
    recipe: &Recipe,
    env: &Environment,
) -> Result<Vec<CompatibilityWarning>, ValidationError> {
    let compat = recipe.compatibility();
    let package = recipe.name();
    let compiler = &env.compiler;
    let mut warnings = Vec::new();

    if !compat.supports_platform(&env.platform) {
        return Err(ValidationError::IncompatiblePlatform {
            package: package.to_owned(),
            platform: env.platform.clone(),
            supported: compat.platforms.iter().cloned().collect(),
        });
    }

    if let (Some(selected), Some(required)) = (compiler.cppstd, compat.min_cppstd) {
        if !selected.meets(&required) {
            return Err(ValidationError::InsufficientStandard {
                package: package.to_owned(),
                required,
                selected,
            });
        }
    }

    if let Some(libcxx) = &compiler.libcxx {
        if compat.forbids_libcxx(&compiler.name, libcxx) {
            return Err(ValidationError::UnsupportedCompiler {
                package: package.to_owned(),
                compiler: compiler.name.clone(),
                reason: format!("standard library '{libcxx}' is not supported"),
            });
        }
    }

    match compat.compilers.get(&compiler.name) {
        None => {
            warn!(
                "{}: no minimum version declared for compiler '{}', compatibility unknown",
                recipe.reference(),
                compiler.name
            );
            warnings.push(CompatibilityWarning::UnknownCompiler {
                package: package.to_owned(),
                compiler: compiler.name.clone(),
            });
        }
        Some(minimum) if compiler.version < *minimum => {
            return Err(ValidationError::UnsupportedCompiler {
                package: package.to_owned(),
                compiler: compiler.name.clone(),
                reason: version_too_low(&compiler.version, minimum),
            });
        }
        Some(_) => {}
    }

    effective_options(recipe, env)?;
    Ok(warnings)
}

fn version_too_low(actual: &Version, minimum: &Version) -> String {
    format!("version {actual} is older than the required minimum {minimum}")
}

/// Final option values for `recipe`: declared defaults, overridden by global
/// selections, overridden by `package:option` selections.
///
/// Global selections naming an option the recipe does not declare are
/// ignored; scoped ones are an error.
pub fn effective_options(
    recipe: &Recipe,
    env: &Environment,
) -> Result<BTreeMap<String, OptionValue>, ValidationError> {
    let package = recipe.name();
    let mut values: BTreeMap<String, OptionValue> = recipe
        .options()
        .iter()
        .map(|(name, spec)| (name.clone(), spec.default.clone()))
        .collect();

    for (option, selected) in env.selections_for(package) {
        let scoped = env.options.contains_key(&format!("{package}:{option}"));
        let Some(spec) = recipe.options().get(option) else {
            if scoped {
                return Err(ValidationError::InvalidOption {
                    package: package.to_owned(),
                    option: option.to_owned(),
                    value: selected.to_string(),
                    reason: "option is not declared by the recipe".to_owned(),
                });
            }
            continue;
        };
        let accepted = spec
            .accept(selected)
            .ok_or_else(|| ValidationError::InvalidOption {
                package: package.to_owned(),
                option: option.to_owned(),
                value: selected.to_string(),
                reason: format!(
                    "allowed values are [{}]",
                    spec.allowed
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })?;
        values.insert(option.to_owned(), accepted);
    }
    Ok(values)
}
