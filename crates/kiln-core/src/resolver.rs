//! Flat, highest-version dependency resolution.

use crate::registry::{ProviderError, RecipeProvider};
use kiln_schema::{LockFile, LockedPackage, Recipe, Requirement, Version, VersionConstraint};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no version of '{name}' satisfies every constraint: {}", .requirers.join("; "))]
    UnsatisfiableConstraint { name: String, requirers: Vec<String> },
    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
    #[error("recipe provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// One chosen package and the names of its direct dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub recipe: Arc<Recipe>,
    pub requires: Vec<String>,
    pub build_requires: Vec<String>,
}

impl ResolvedPackage {
    fn new(recipe: Arc<Recipe>) -> Self {
        let names = |reqs: &[Requirement]| -> Vec<String> {
            reqs.iter().map(|r| r.name.clone()).collect()
        };
        Self {
            requires: names(recipe.requires()),
            build_requires: names(recipe.build_requires()),
            recipe,
        }
    }

    pub fn name(&self) -> &str {
        self.recipe.name()
    }

    pub fn version(&self) -> &Version {
        self.recipe.version()
    }

    /// Runtime then build dependencies.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.requires
            .iter()
            .chain(self.build_requires.iter())
            .map(String::as_str)
    }
}

/// Single version per package name, every dependency edge satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSet {
    root: String,
    packages: BTreeMap<String, ResolvedPackage>,
}

impl ResolvedSet {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        self.packages.get(name)
    }

    pub fn version_of(&self, name: &str) -> Option<&Version> {
        self.packages.get(name).map(ResolvedPackage::version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Dependencies before dependents; ties broken by name.
    pub fn build_order(&self) -> Vec<&str> {
        let mut remaining: BTreeMap<&str, usize> = self
            .packages
            .values()
            .map(|p| (p.name(), p.dependencies().count()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, deps)| **deps == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.packages.len());
        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            order.push(name);
            for pkg in self.packages.values() {
                let waits_on = pkg.dependencies().filter(|d| *d == name).count();
                if waits_on == 0 {
                    continue;
                }
                if let Some(left) = remaining.get_mut(pkg.name()) {
                    *left -= waits_on;
                    if *left == 0 {
                        ready.insert(pkg.name());
                    }
                }
            }
        }
        order
    }

    /// Resolved versions of every package reachable from `name` through
    /// runtime requirements, excluding `name` itself.
    pub fn runtime_closure(&self, name: &str) -> BTreeMap<String, Version> {
        let mut out = BTreeMap::new();
        let mut stack: Vec<&str> = self
            .get(name)
            .map(|p| p.requires.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            let Some(pkg) = self.get(dep) else { continue };
            if out.insert(dep.to_owned(), pkg.version().clone()).is_none() {
                stack.extend(pkg.requires.iter().map(String::as_str));
            }
        }
        out
    }

    pub fn to_lock_file(&self) -> LockFile {
        let packages = self
            .packages
            .values()
            .map(|p| LockedPackage {
                name: p.name().to_owned(),
                version: p.version().to_string(),
                requires: p.requires.clone(),
                build_requires: p.build_requires.clone(),
            })
            .collect();
        LockFile::new(self.root.clone(), packages)
    }
}

/// Resolve the dependency graph of `root` against `provider`.
///
/// Breadth-first: each chosen package demands a constraint on every package
/// it requires, and a name's effective constraint is the intersection of the
/// demands made by its currently chosen requirers. A package is (re)selected
/// at the highest available version satisfying that intersection whenever it
/// is first reached or a new demand excludes its current choice. Reselecting
/// a package retracts every demand its old version made; packages left with
/// no demands are dropped. A name/version pair is selected at most
/// `MAX_SELECTIONS` times, so the traversal terminates. The chosen graph is then walked from the root
/// to detect cycles.
pub fn resolve(
    root: &Arc<Recipe>,
    provider: &dyn RecipeProvider,
) -> Result<ResolvedSet, ResolveError> {
    let mut resolution = Resolution::new(root, provider);
    resolution.run()?;
    resolution.finish()
}

const MAX_SELECTIONS: u32 = 3;

/// A constraint one chosen package places on a dependency.
struct Demand {
    description: String,
    constraint: VersionConstraint,
}

struct Resolution<'a> {
    provider: &'a dyn RecipeProvider,
    root: Arc<Recipe>,
    /// Dependency name -> requirer name -> demand.
    demands: BTreeMap<String, BTreeMap<String, Demand>>,
    chosen: BTreeMap<String, Arc<Recipe>>,
    available: BTreeMap<String, Vec<Version>>,
    selections: BTreeMap<(String, Version), u32>,
    expanded: BTreeMap<String, Version>,
    queue: VecDeque<String>,
}

impl<'a> Resolution<'a> {
    fn new(root: &Arc<Recipe>, provider: &'a dyn RecipeProvider) -> Self {
        let name = root.name().to_owned();
        let pin = Demand {
            description: format!("root {}", root.reference()),
            constraint: VersionConstraint::exact(root.version().clone()),
        };
        Self {
            provider,
            root: Arc::clone(root),
            demands: BTreeMap::from([(name.clone(), BTreeMap::from([(name.clone(), pin)]))]),
            chosen: BTreeMap::from([(name.clone(), Arc::clone(root))]),
            available: BTreeMap::new(),
            selections: BTreeMap::new(),
            expanded: BTreeMap::new(),
            queue: VecDeque::from([name]),
        }
    }

    fn run(&mut self) -> Result<(), ResolveError> {
        while let Some(name) = self.queue.pop_front() {
            let Some(recipe) = self.chosen.get(&name).cloned() else {
                continue;
            };
            if self.expanded.get(&name) == Some(recipe.version()) {
                continue;
            }
            self.expanded.insert(name, recipe.version().clone());
            debug!("expanding {}", recipe.reference());
            for req in recipe.all_requirements() {
                if !self.is_chosen(&recipe) {
                    break;
                }
                self.demand(&recipe, req)?;
            }
        }
        Ok(())
    }

    fn is_chosen(&self, recipe: &Arc<Recipe>) -> bool {
        self.chosen
            .get(recipe.name())
            .is_some_and(|c| Arc::ptr_eq(c, recipe))
    }

    fn demand(&mut self, requirer: &Recipe, req: &Requirement) -> Result<(), ResolveError> {
        let demands = self.demands.entry(req.name.clone()).or_default();
        let constraint = match demands.get(requirer.name()) {
            Some(existing) => existing.constraint.intersect(&req.constraint),
            None => req.constraint.clone(),
        };
        demands.insert(
            requirer.name().to_owned(),
            Demand {
                description: format!("{} requires {constraint}", requirer.reference()),
                constraint,
            },
        );
        self.reconcile(&req.name)
    }

    fn narrowed(&self, name: &str) -> VersionConstraint {
        self.demands
            .get(name)
            .into_iter()
            .flat_map(BTreeMap::values)
            .fold(VersionConstraint::any(), |acc, d| acc.intersect(&d.constraint))
    }

    /// Make the choice for `name` agree with its current demands.
    fn reconcile(&mut self, name: &str) -> Result<(), ResolveError> {
        let narrowed = self.narrowed(name);
        if narrowed.is_empty() {
            return Err(self.unsatisfiable(name));
        }

        if let Some(current) = self.chosen.get(name).cloned() {
            if narrowed.satisfies(current.version()) {
                return Ok(());
            }
            if name == self.root.name() {
                return Err(self.unsatisfiable(name));
            }
            debug!(
                "constraint '{narrowed}' excludes {}, reselecting",
                current.reference()
            );
            self.drop_choice(name);
            if self.demands.get(name).is_none_or(BTreeMap::is_empty) {
                return Ok(());
            }
        }

        let narrowed = self.narrowed(name);
        let Some(version) = self.best_candidate(name, &narrowed)? else {
            return Err(self.unsatisfiable(name));
        };
        let recipe = self.provider.load_recipe(name, &version)?;
        debug!("selected {} for '{narrowed}'", recipe.reference());
        *self.selections.entry((name.to_owned(), version)).or_default() += 1;
        self.chosen.insert(name.to_owned(), recipe);
        self.queue.push_back(name.to_owned());
        Ok(())
    }

    /// Forget the choice for `name` and every demand it made, dropping
    /// packages that no chosen package requires any more.
    fn drop_choice(&mut self, name: &str) {
        if self.chosen.remove(name).is_none() {
            return;
        }
        self.expanded.remove(name);
        let mut orphaned = Vec::new();
        for (dep, demands) in &mut self.demands {
            if demands.remove(name).is_some() && demands.is_empty() {
                orphaned.push(dep.clone());
            }
        }
        for dep in orphaned {
            debug!("dropping '{dep}', no longer required");
            self.drop_choice(&dep);
        }
    }

    fn best_candidate(
        &mut self,
        name: &str,
        constraint: &VersionConstraint,
    ) -> Result<Option<Version>, ResolveError> {
        if !self.available.contains_key(name) {
            let versions = self.provider.list_versions(name)?;
            self.available.insert(name.to_owned(), versions);
        }
        let selections = &self.selections;
        Ok(self
            .available
            .get(name)
            .and_then(|versions| {
                constraint.best_match(
                    versions
                        .iter()
                        .filter(|v| {
                            selections
                                .get(&(name.to_owned(), (*v).clone()))
                                .is_none_or(|n| *n < MAX_SELECTIONS)
                        }),
                )
            })
            .cloned())
    }

    fn unsatisfiable(&self, name: &str) -> ResolveError {
        ResolveError::UnsatisfiableConstraint {
            name: name.to_owned(),
            requirers: self
                .demands
                .get(name)
                .map(|d| d.values().map(|d| d.description.clone()).collect())
                .unwrap_or_default(),
        }
    }

    fn finish(self) -> Result<ResolvedSet, ResolveError> {
        let mut done = BTreeSet::new();
        let mut path = Vec::new();
        self.visit(self.root.name(), &mut path, &mut done)?;

        let packages = done
            .into_iter()
            .filter_map(|name| {
                let recipe = self.chosen.get(&name)?;
                Some((name, ResolvedPackage::new(Arc::clone(recipe))))
            })
            .collect();
        Ok(ResolvedSet {
            root: self.root.name().to_owned(),
            packages,
        })
    }

    fn visit(
        &self,
        name: &str,
        path: &mut Vec<String>,
        done: &mut BTreeSet<String>,
    ) -> Result<(), ResolveError> {
        if let Some(start) = path.iter().position(|p| p == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_owned());
            return Err(ResolveError::CyclicDependency { path: cycle });
        }
        if done.contains(name) {
            return Ok(());
        }
        let Some(recipe) = self.chosen.get(name) else {
            return Err(self.unsatisfiable(name));
        };

        path.push(name.to_owned());
        for req in recipe.all_requirements() {
            self.visit(&req.name, path, done)?;
        }
        path.pop();
        done.insert(name.to_owned());
        Ok(())
    }
}
