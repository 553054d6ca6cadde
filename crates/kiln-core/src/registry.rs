use kiln_schema::{load_recipe_file, Recipe, RecipeError, Version};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no recipe for {name}/{version}")]
    UnknownVersion { name: String, version: String },
    #[error("invalid recipe at {path}: {source}")]
    InvalidRecipe {
        path: PathBuf,
        #[source]
        source: RecipeError,
    },
    #[error("recipe at {path} declares {found}, expected {expected}")]
    Mismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// Source of candidate recipes for the resolver.
///
/// Implementations must be deterministic: the same name always yields the
/// same versions and recipes, otherwise resolution is not reproducible.
pub trait RecipeProvider: Send + Sync {
    /// Available versions of `name`, ascending. Unknown names yield an empty list.
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, ProviderError>;

    fn load_recipe(&self, name: &str, version: &Version) -> Result<Arc<Recipe>, ProviderError>;
}

/// Registry held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRegistry {
    recipes: BTreeMap<String, BTreeMap<Version, Arc<Recipe>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes
            .entry(recipe.name().to_owned())
            .or_default()
            .insert(recipe.version().clone(), Arc::new(recipe));
    }

    #[must_use]
    pub fn with(mut self, recipe: Recipe) -> Self {
        self.insert(recipe);
        self
    }

    pub fn len(&self) -> usize {
        self.recipes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

impl RecipeProvider for InMemoryRegistry {
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, ProviderError> {
        Ok(self
            .recipes
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn load_recipe(&self, name: &str, version: &Version) -> Result<Arc<Recipe>, ProviderError> {
        self.recipes
            .get(name)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| ProviderError::UnknownVersion {
                name: name.to_owned(),
                version: version.to_string(),
            })
    }
}

/// Registry backed by a directory tree: `<root>/<name>/<version>.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_files(&self, name: &str) -> Result<Vec<(Version, PathBuf)>, ProviderError> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Version::parse(stem) {
                Ok(version) => found.push((version, path)),
                Err(e) => tracing::warn!("ignoring registry file {}: {e}", path.display()),
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

impl RecipeProvider for DirectoryRegistry {
    fn list_versions(&self, name: &str) -> Result<Vec<Version>, ProviderError> {
        Ok(self
            .version_files(name)?
            .into_iter()
            .map(|(version, _)| version)
            .collect())
    }

    fn load_recipe(&self, name: &str, version: &Version) -> Result<Arc<Recipe>, ProviderError> {
        let path = self
            .version_files(name)?
            .into_iter()
            .find(|(v, _)| v == version)
            .map(|(_, path)| path)
            .ok_or_else(|| ProviderError::UnknownVersion {
                name: name.to_owned(),
                version: version.to_string(),
            })?;

        let recipe = load_recipe_file(&path).map_err(|source| ProviderError::InvalidRecipe {
            path: path.clone(),
            source,
        })?;
        if recipe.name() != name || recipe.version() != version {
            return Err(ProviderError::Mismatch {
                path,
                expected: format!("{name}/{version}"),
                found: recipe.reference(),
            });
        }
        Ok(Arc::new(recipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::load_recipe;

    fn recipe_text(name: &str, version: &str) -> String {
        format!(
            "recipe_version = 1\n[package]\nname = \"{name}\"\nversion = \"{version}\"\nlicense = \"MIT\"\nhomepage = \"https://example.com\"\n"
        )
    }

    #[test]
    fn in_memory_lists_ascending() {
        let registry = InMemoryRegistry::new()
            .with(load_recipe(&recipe_text("bar", "2.0")).unwrap())
            .with(load_recipe(&recipe_text("bar", "1.10")).unwrap())
            .with(load_recipe(&recipe_text("bar", "1.3")).unwrap());
        let versions: Vec<String> = registry
            .list_versions("bar")
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(versions, ["1.3", "1.10", "2.0"]);
        assert!(registry.list_versions("missing").unwrap().is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn in_memory_unknown_version() {
        let registry = InMemoryRegistry::new().with(load_recipe(&recipe_text("bar", "1.0")).unwrap());
        let v = Version::parse("9.9").unwrap();
        assert!(matches!(
            registry.load_recipe("bar", &v),
            Err(ProviderError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn directory_registry_reads_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("zlib");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("1.2.13.toml"), recipe_text("zlib", "1.2.13")).unwrap();
        fs::write(pkg.join("1.3.toml"), recipe_text("zlib", "1.3")).unwrap();
        fs::write(pkg.join("README.md"), "ignored").unwrap();

        let registry = DirectoryRegistry::new(dir.path());
        let versions = registry.list_versions("zlib").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].as_str(), "1.3");

        let recipe = registry.load_recipe("zlib", &versions[1]).unwrap();
        assert_eq!(recipe.reference(), "zlib/1.3");
        assert!(registry.list_versions("absent").unwrap().is_empty());
    }

    #[test]
    fn directory_registry_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("zlib");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("1.3.toml"), recipe_text("zlib", "1.4")).unwrap();

        let registry = DirectoryRegistry::new(dir.path());
        let v = Version::parse("1.3").unwrap();
        assert!(matches!(
            registry.load_recipe("zlib", &v),
            Err(ProviderError::Mismatch { .. })
        ));
    }
}
