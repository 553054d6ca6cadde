use crate::options::{OptionSpec, OptionValue};
use crate::standard::LanguageStandard;
use crate::version::{Version, VersionConstraint, VersionError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read recipe file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse recipe: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported recipe_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("package.{0} is required and must not be empty")]
    MissingField(&'static str),
    #[error("invalid package name '{0}': must be 1-64 characters of [a-z0-9_.+-]")]
    InvalidName(String),
    #[error("invalid version for '{package}': {source}")]
    InvalidVersion {
        package: String,
        #[source]
        source: VersionError,
    },
    #[error("invalid requirement '{name}': {source}")]
    InvalidRequirement {
        name: String,
        #[source]
        source: VersionError,
    },
    #[error("package '{0}' requires itself")]
    SelfDependency(String),
    #[error("'{0}' is listed in both requires and build_requires")]
    DuplicateRequirement(String),
    #[error("option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },
    #[error("layout rule '{pattern}': {reason}")]
    InvalidLayout { pattern: String, reason: String },
    #[error("recipe serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Raw recipe file as written on disk, before validation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RecipeFile {
    pub recipe_version: u32,
    pub package: PackageSection,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
    #[serde(default)]
    pub build_requires: BTreeMap<String, String>,
    #[serde(default)]
    pub compatibility: CompatibilitySection,
    #[serde(default)]
    pub options: BTreeMap<String, OptionSpec>,
    #[serde(default)]
    pub layout: Vec<LayoutRule>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PackageSection {
    pub name: Option<String>,
    pub version: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub header_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CompatibilitySection {
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub min_cppstd: Option<LanguageStandard>,
    #[serde(default)]
    pub compilers: BTreeMap<String, Version>,
    #[serde(default)]
    pub forbidden_libcxx: BTreeMap<String, Vec<String>>,
}

/// Where the package sources come from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    pub url: String,
    #[serde(default)]
    pub strip_root: bool,
}

/// Copies files matching `pattern` from `src` (relative to the source tree)
/// into `dst` (relative to the package directory).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LayoutRule {
    pub pattern: String,
    #[serde(default)]
    pub src: Option<String>,
    pub dst: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: VersionConstraint,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Compatibility {
    /// Empty means every platform is accepted.
    pub platforms: BTreeSet<String>,
    pub min_cppstd: Option<LanguageStandard>,
    pub compilers: BTreeMap<String, Version>,
    pub forbidden_libcxx: BTreeMap<String, BTreeSet<String>>,
}

impl Compatibility {
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.contains(platform)
    }

    pub fn forbids_libcxx(&self, compiler: &str, libcxx: &str) -> bool {
        self.forbidden_libcxx
            .get(compiler)
            .is_some_and(|set| set.contains(libcxx))
    }
}

/// A validated, immutable package recipe.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Recipe {
    name: String,
    version: Version,
    license: String,
    homepage: String,
    url: Option<String>,
    description: Option<String>,
    topics: Vec<String>,
    header_only: bool,
    source: Option<SourceSpec>,
    requires: Vec<Requirement>,
    build_requires: Vec<Requirement>,
    compatibility: Compatibility,
    options: BTreeMap<String, OptionSpec>,
    layout: Vec<LayoutRule>,
}

impl Recipe {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// `name/version`, the display form used in logs and errors.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn homepage(&self) -> &str {
        &self.homepage
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn header_only(&self) -> bool {
        self.header_only
    }

    pub fn source(&self) -> Option<&SourceSpec> {
        self.source.as_ref()
    }

    pub fn requires(&self) -> &[Requirement] {
        &self.requires
    }

    pub fn build_requires(&self) -> &[Requirement] {
        &self.build_requires
    }

    /// Runtime then build requirements.
    pub fn all_requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.requires.iter().chain(self.build_requires.iter())
    }

    pub fn compatibility(&self) -> &Compatibility {
        &self.compatibility
    }

    pub fn options(&self) -> &BTreeMap<String, OptionSpec> {
        &self.options
    }

    pub fn layout(&self) -> &[LayoutRule] {
        &self.layout
    }

    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl RecipeFile {
    /// Validate every field and produce the immutable [`Recipe`].
    pub fn validate(&self) -> Result<Recipe, RecipeError> {
        if self.recipe_version != 1 {
            return Err(RecipeError::UnsupportedVersion(self.recipe_version));
        }

        let pkg = &self.package;
        let name = required(pkg.name.as_ref(), "name")?;
        validate_package_name(&name)?;
        let raw_version = required(pkg.version.as_ref(), "version")?;
        let version =
            Version::parse(&raw_version).map_err(|source| RecipeError::InvalidVersion {
                package: name.clone(),
                source,
            })?;
        let license = required(pkg.license.as_ref(), "license")?;
        let homepage = required(pkg.homepage.as_ref(), "homepage")?;

        let requires = parse_requirements(&name, &self.requires)?;
        let build_requires = parse_requirements(&name, &self.build_requires)?;
        if let Some(dup) = requires
            .iter()
            .find(|r| build_requires.iter().any(|b| b.name == r.name))
        {
            return Err(RecipeError::DuplicateRequirement(dup.name.clone()));
        }

        for (opt_name, spec) in &self.options {
            validate_option(opt_name, spec)?;
        }
        for rule in &self.layout {
            validate_layout_rule(rule)?;
        }

        let compat = &self.compatibility;
        let compatibility = Compatibility {
            platforms: normalize_set(&compat.platforms),
            min_cppstd: compat.min_cppstd,
            compilers: compat
                .compilers
                .iter()
                .map(|(k, v)| (k.trim().to_owned(), v.clone()))
                .collect(),
            forbidden_libcxx: compat
                .forbidden_libcxx
                .iter()
                .map(|(k, v)| (k.trim().to_owned(), normalize_set(v)))
                .collect(),
        };

        Ok(Recipe {
            name,
            version,
            license,
            homepage,
            url: trimmed_opt(pkg.url.as_ref()),
            description: trimmed_opt(pkg.description.as_ref()),
            topics: normalize_set(&pkg.topics).into_iter().collect(),
            header_only: pkg.header_only,
            source: self.source.clone(),
            requires,
            build_requires,
            compatibility,
            options: self.options.clone(),
            layout: self.layout.clone(),
        })
    }
}

pub fn parse_recipe_str(input: &str) -> Result<RecipeFile, RecipeError> {
    Ok(toml::from_str(input)?)
}

/// Parse and validate recipe source text.
pub fn load_recipe(input: &str) -> Result<Recipe, RecipeError> {
    parse_recipe_str(input)?.validate()
}

pub fn load_recipe_file(path: impl AsRef<Path>) -> Result<Recipe, RecipeError> {
    let content = fs::read_to_string(path)?;
    load_recipe(&content)
}

pub fn validate_package_name(name: &str) -> Result<(), RecipeError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'+' | b'-')
        });
    if valid {
        Ok(())
    } else {
        Err(RecipeError::InvalidName(name.to_owned()))
    }
}

fn required(value: Option<&String>, field: &'static str) -> Result<String, RecipeError> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .ok_or(RecipeError::MissingField(field))
}

fn trimmed_opt(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_requirements(
    owner: &str,
    raw: &BTreeMap<String, String>,
) -> Result<Vec<Requirement>, RecipeError> {
    let mut out = Vec::with_capacity(raw.len());
    for (name, constraint) in raw {
        let name = name.trim().to_owned();
        validate_package_name(&name)?;
        if name == owner {
            return Err(RecipeError::SelfDependency(name));
        }
        let constraint = VersionConstraint::parse(constraint).map_err(|source| {
            RecipeError::InvalidRequirement {
                name: name.clone(),
                source,
            }
        })?;
        out.push(Requirement { name, constraint });
    }
    Ok(out)
}

fn validate_option(name: &str, spec: &OptionSpec) -> Result<(), RecipeError> {
    let invalid = |reason: String| RecipeError::InvalidOption {
        name: name.to_owned(),
        reason,
    };

    if name.trim().is_empty() || name.contains(':') {
        return Err(invalid("name must be non-empty and must not contain ':'".to_owned()));
    }
    if spec.allowed.is_empty() {
        return Err(invalid("allowed set must not be empty".to_owned()));
    }
    let unique: BTreeSet<&OptionValue> = spec.allowed.iter().collect();
    if unique.len() != spec.allowed.len() {
        return Err(invalid("allowed set contains duplicates".to_owned()));
    }
    if !spec.allowed.contains(&spec.default) {
        return Err(invalid(format!(
            "default '{}' is not in the allowed set",
            spec.default
        )));
    }
    Ok(())
}

fn validate_layout_rule(rule: &LayoutRule) -> Result<(), RecipeError> {
    let invalid = |reason: &str| RecipeError::InvalidLayout {
        pattern: rule.pattern.clone(),
        reason: reason.to_owned(),
    };

    glob::Pattern::new(&rule.pattern).map_err(|e| invalid(&e.to_string()))?;
    for path in rule.src.iter().chain(std::iter::once(&rule.dst)) {
        let escapes = Path::new(path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(invalid(&format!(
                "path '{path}' must be relative and stay inside its tree"
            )));
        }
    }
    Ok(())
}

fn normalize_set(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
recipe_version = 1

[package]
name = "cpp_project_framework"
version = "1.0.0"
license = "AGPL-3.0"
homepage = "https://github.com/sheepgrass/cpp_project_framework"
url = "https://github.com/conan-io/conan-center-index"
description = "C++ Project Framework is a framework for creating C++ project."
topics = ["c++", "project", "framework"]
header_only = true

[source]
url = "file:///srv/sources/cpp_project_framework-1.0.0"
strip_root = true

[requires]
fmt = ">=7.0,<8.0"

[build_requires]
gtest = "1.10.0"
doxygen = "1.8.20"
benchmark = "1.5.1"

[compatibility]
platforms = ["Linux", "Windows"]
min_cppstd = 14

[compatibility.compilers]
"Visual Studio" = "16"
gcc = "7"
clang = "6"
apple-clang = "10"

[compatibility.forbidden_libcxx]
gcc = ["libstdc++11"]
clang = ["libc++"]

[options.shared]
default = false
allowed = [true, false]

[[layout]]
pattern = "*.h"
src = "cpp_project_framework"
dst = "include/cpp_project_framework"

[[layout]]
pattern = "LICENSE"
dst = "licenses"
"#;

    #[test]
    fn loads_full_recipe() {
        let recipe = load_recipe(FULL).unwrap();
        assert_eq!(recipe.name(), "cpp_project_framework");
        assert_eq!(recipe.version().as_str(), "1.0.0");
        assert_eq!(recipe.reference(), "cpp_project_framework/1.0.0");
        assert!(recipe.header_only());
        assert_eq!(recipe.requires().len(), 1);
        assert_eq!(recipe.build_requires().len(), 3);
        assert_eq!(recipe.all_requirements().count(), 4);
        assert!(recipe.compatibility().supports_platform("Linux"));
        assert!(!recipe.compatibility().supports_platform("Macos"));
        assert_eq!(
            recipe.compatibility().min_cppstd,
            Some(LanguageStandard::parse("14").unwrap())
        );
        assert_eq!(
            recipe.compatibility().compilers["gcc"],
            Version::parse("7").unwrap()
        );
        assert!(recipe.compatibility().forbids_libcxx("clang", "libc++"));
        assert!(!recipe.compatibility().forbids_libcxx("gcc", "libc++"));
        assert_eq!(recipe.layout().len(), 2);
        assert_eq!(recipe.topics(), ["c++", "framework", "project"]);
    }

    #[test]
    fn loads_minimal_recipe() {
        let recipe = load_recipe(
            r#"
recipe_version = 1
[package]
name = "zlib"
version = "1.3"
license = "Zlib"
homepage = "https://zlib.net"
"#,
        )
        .unwrap();
        assert!(recipe.requires().is_empty());
        assert!(recipe.compatibility().supports_platform("anything"));
        assert!(recipe.source().is_none());
        assert!(!recipe.header_only());
    }

    fn minimal_with(extra_package: &str, tail: &str) -> String {
        format!(
            "recipe_version = 1\n[package]\nversion = \"1.0\"\n{extra_package}\n{tail}"
        )
    }

    #[test]
    fn rejects_missing_name() {
        let input = minimal_with("license = \"MIT\"\nhomepage = \"https://x\"", "");
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::MissingField("name"))
        ));
    }

    #[test]
    fn rejects_missing_license() {
        let input = minimal_with("name = \"a\"\nhomepage = \"https://x\"", "");
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::MissingField("license"))
        ));
    }

    #[test]
    fn rejects_blank_homepage() {
        let input = minimal_with("name = \"a\"\nlicense = \"MIT\"\nhomepage = \"  \"", "");
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::MissingField("homepage"))
        ));
    }

    #[test]
    fn rejects_malformed_constraint() {
        let input = minimal_with(
            "name = \"a\"\nlicense = \"MIT\"\nhomepage = \"https://x\"",
            "[requires]\nb = \">=1.0,<\"\n",
        );
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::InvalidRequirement { .. })
        ));
    }

    #[test]
    fn rejects_self_dependency() {
        let input = minimal_with(
            "name = \"a\"\nlicense = \"MIT\"\nhomepage = \"https://x\"",
            "[requires]\na = \"*\"\n",
        );
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::SelfDependency(_))
        ));
    }

    #[test]
    fn rejects_option_default_outside_allowed() {
        let input = minimal_with(
            "name = \"a\"\nlicense = \"MIT\"\nhomepage = \"https://x\"",
            "[options.fpic]\ndefault = true\nallowed = [false]\n",
        );
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::InvalidOption { .. })
        ));
    }

    #[test]
    fn rejects_escaping_layout_paths() {
        let input = minimal_with(
            "name = \"a\"\nlicense = \"MIT\"\nhomepage = \"https://x\"",
            "[[layout]]\npattern = \"*.h\"\ndst = \"../outside\"\n",
        );
        assert!(matches!(
            load_recipe(&input),
            Err(RecipeError::InvalidLayout { .. })
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = minimal_with(
            "name = \"a\"\nlicense = \"MIT\"\nhomepage = \"https://x\"\nmaintainer = \"me\"",
            "",
        );
        assert!(matches!(load_recipe(&input), Err(RecipeError::ParseToml(_))));
    }

    #[test]
    fn rejects_uppercase_names() {
        let input = minimal_with(
            "name = \"Zlib\"\nlicense = \"MIT\"\nhomepage = \"https://x\"",
            "",
        );
        assert!(matches!(load_recipe(&input), Err(RecipeError::InvalidName(_))));
    }

    #[test]
    fn canonical_json_is_stable_across_field_order() {
        let a = load_recipe(FULL).unwrap();
        let reordered = FULL.replace(
            "platforms = [\"Linux\", \"Windows\"]",
            "platforms = [\"Windows\", \"Linux\"]",
        );
        let b = load_recipe(&reordered).unwrap();
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
    }
}
