//! The concrete build environment a recipe is validated and built against.
//!
//! Environments are usually loaded from a profile file:
//!
//! ```toml
//! [settings]
//! os = "Linux"
//! arch = "x86_64"
//! build_type = "Release"
//!
//! [compiler]
//! name = "gcc"
//! version = "11.2"
//! cppstd = "17"
//! libcxx = "libstdc++"
//!
//! [options]
//! shared = true
//! "fmt:header_only" = true
//! ```

use crate::options::OptionValue;
use crate::standard::LanguageStandard;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse profile: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("profile field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("invalid option selection '{0}', expected 'name=value' or 'package:name=value'")]
    InvalidSelection(String),
}

/// Compiler identity and version are separate, independently comparable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Compiler {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub cppstd: Option<LanguageStandard>,
    #[serde(default)]
    pub libcxx: Option<String>,
}

impl Compiler {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            cppstd: None,
            libcxx: None,
        }
    }

    #[must_use]
    pub fn with_cppstd(mut self, cppstd: LanguageStandard) -> Self {
        self.cppstd = Some(cppstd);
        self
    }

    #[must_use]
    pub fn with_libcxx(mut self, libcxx: impl Into<String>) -> Self {
        self.libcxx = Some(libcxx.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub os: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_build_type")]
    pub build_type: String,
}

fn default_arch() -> String {
    "x86_64".to_owned()
}

fn default_build_type() -> String {
    "Release".to_owned()
}

/// Profile file layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ProfileFile {
    settings: Settings,
    compiler: Compiler,
    #[serde(default)]
    options: BTreeMap<String, OptionValue>,
}

/// A concrete platform, compiler and option selection. Immutable for the
/// duration of one resolution and build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub platform: String,
    pub arch: String,
    pub build_type: String,
    pub compiler: Compiler,
    /// `option` applies to every package declaring it, `package:option` to one.
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

impl Environment {
    pub fn new(platform: impl Into<String>, compiler: Compiler) -> Self {
        Self {
            platform: platform.into(),
            arch: default_arch(),
            build_type: default_build_type(),
            compiler,
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: OptionValue) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Apply a `name=value` or `package:name=value` selection.
    pub fn select_option(&mut self, selection: &str) -> Result<(), ProfileError> {
        let Some((key, value)) = selection.split_once('=') else {
            return Err(ProfileError::InvalidSelection(selection.to_owned()));
        };
        let key = key.trim();
        if key.is_empty() || key.starts_with(':') || key.ends_with(':') {
            return Err(ProfileError::InvalidSelection(selection.to_owned()));
        }
        self.options
            .insert(key.to_owned(), OptionValue::parse_cli(value));
        Ok(())
    }

    /// The selected value for `option` of `package`; scoped selections win.
    pub fn option_for(&self, package: &str, option: &str) -> Option<&OptionValue> {
        self.options
            .get(&format!("{package}:{option}"))
            .or_else(|| self.options.get(option))
    }

    /// Selections that name `package` or apply globally, keyed by option name.
    pub fn selections_for(&self, package: &str) -> BTreeMap<&str, &OptionValue> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.options {
            if !key.contains(':') {
                out.entry(key.as_str()).or_insert(value);
            }
        }
        for (key, value) in &self.options {
            if let Some((pkg, opt)) = key.split_once(':') {
                if pkg == package {
                    out.insert(opt, value);
                }
            }
        }
        out
    }

    pub fn from_profile_str(input: &str) -> Result<Self, ProfileError> {
        let file: ProfileFile = toml::from_str(input)?;
        let env = Self {
            platform: file.settings.os.trim().to_owned(),
            arch: file.settings.arch.trim().to_owned(),
            build_type: file.settings.build_type.trim().to_owned(),
            compiler: Compiler {
                name: file.compiler.name.trim().to_owned(),
                ..file.compiler
            },
            options: file.options,
        };
        if env.platform.is_empty() {
            return Err(ProfileError::EmptyField("settings.os"));
        }
        if env.compiler.name.is_empty() {
            return Err(ProfileError::EmptyField("compiler.name"));
        }
        Ok(env)
    }

    pub fn load_profile(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let content = fs::read_to_string(path)?;
        Self::from_profile_str(&content)
    }
}
