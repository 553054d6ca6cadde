use kiln_core::{
    resolve, BuildCache, BuildOptions, Cancellation, CoreError, DirectoryRegistry, Engine,
    FailureReason, InMemoryRegistry, LocalFetcher, MockBuildTool, MockFetcher, Orchestrator,
    PackageState, RecipeProvider, ResolveError, ValidationError,
};
use kiln_schema::{compute_fingerprint, load_recipe, Compiler, Environment, Recipe, Version};
use kiln_store::StoreLayout;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn recipe_text(name: &str, version: &str, requires: &[(&str, &str)], extra: &str) -> String {
    let mut text = format!(
        "recipe_version = 1\n[package]\nname = \"{name}\"\nversion = \"{version}\"\nlicense = \"MIT\"\nhomepage = \"https://example.com/{name}\"\n"
    );
    if !requires.is_empty() {
        text.push_str("[requires]\n");
        for (dep, constraint) in requires {
            text.push_str(&format!("{dep} = \"{constraint}\"\n"));
        }
    }
    text.push_str(extra);
    text
}

fn recipe(name: &str, version: &str, requires: &[(&str, &str)]) -> Recipe {
    load_recipe(&recipe_text(name, version, requires, "")).unwrap()
}

fn gcc(version: &str) -> Environment {
    Environment::new("Linux", Compiler::new("gcc", Version::parse(version).unwrap()))
}

fn write_registry(root: &Path, recipes: &[String]) -> DirectoryRegistry {
    for text in recipes {
        let recipe = load_recipe(text).unwrap();
        let dir = root.join(recipe.name());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.toml", recipe.version())), text).unwrap();
    }
    DirectoryRegistry::new(root)
}

fn write_recipe(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("kiln.toml");
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn picks_highest_version_in_range() {
    let registry_dir = tempfile::tempdir().unwrap();
    let registry = write_registry(
        registry_dir.path(),
        &["1.1", "1.3", "1.5", "2.0"]
            .iter()
            .map(|v| recipe_text("bar", v, &[], ""))
            .collect::<Vec<_>>(),
    );
    let root = Arc::new(recipe("foo", "1.0", &[("bar", ">=1.2, <2.0")]));
    let resolved = resolve(&root, &registry).unwrap();
    assert_eq!(resolved.version_of("bar").unwrap().as_str(), "1.5");
}

#[test]
fn resolution_is_deterministic_and_satisfies_every_edge() {
    let registry = InMemoryRegistry::new()
        .with(recipe("zlib", "1.2.13", &[]))
        .with(recipe("zlib", "1.3", &[]))
        .with(recipe("openssl", "3.0.12", &[("zlib", ">=1.2")]))
        .with(recipe("openssl", "3.2.0", &[("zlib", ">=1.3")]))
        .with(recipe("curl", "8.4.0", &[("openssl", "~3.0"), ("zlib", ">=1.2.11")]));
    let root = Arc::new(recipe("app", "0.1", &[("curl", ">=8"), ("zlib", "<1.3")]));

    let first = resolve(&root, &registry).unwrap();
    let second = resolve(&root, &registry).unwrap();
    assert_eq!(first, second);

    for pkg in first.iter() {
        for req in pkg.recipe.all_requirements() {
            let chosen = first.version_of(&req.name).unwrap();
            assert!(
                req.constraint.satisfies(chosen),
                "{} requires {} {}, got {chosen}",
                pkg.name(),
                req.name,
                req.constraint
            );
        }
    }
    assert_eq!(first.version_of("zlib").unwrap().as_str(), "1.2.13");
    assert_eq!(first.version_of("openssl").unwrap().as_str(), "3.0.12");
}

#[test]
fn cycle_is_reported_not_looped() {
    let registry = InMemoryRegistry::new()
        .with(recipe("a", "1.0", &[("b", ">=1.0")]))
        .with(recipe("b", "1.0", &[("a", ">=1.0")]));
    let root = Arc::new(recipe("app", "1.0", &[("a", ">=1.0")]));
    let err = resolve(&root, &registry).unwrap_err();
    match err {
        ResolveError::CyclicDependency { path } => {
            assert!(path.contains(&"a".to_owned()));
            assert!(path.contains(&"b".to_owned()));
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

#[test]
fn conflicting_constraints_name_requirers() {
    let registry = InMemoryRegistry::new()
        .with(recipe("zlib", "1.2.13", &[]))
        .with(recipe("zlib", "1.3", &[]))
        .with(recipe("png", "1.6", &[("zlib", ">=1.3")]));
    let root = Arc::new(recipe("app", "1.0", &[("png", "*"), ("zlib", "<1.3")]));
    match resolve(&root, &registry).unwrap_err() {
        ResolveError::UnsatisfiableConstraint { name, requirers } => {
            assert_eq!(name, "zlib");
            assert!(requirers.iter().any(|r| r.starts_with("app")));
            assert!(requirers.iter().any(|r| r.starts_with("png")));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn same_fingerprint_built_once_across_builds() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let registry = InMemoryRegistry::new().with(recipe("zlib", "1.3", &[]));
    let path = write_recipe(
        project.path(),
        &recipe_text("app", "1.0", &[("zlib", "^1.3")], ""),
    );
    let engine = Engine::new(home.path());
    let tool = MockBuildTool::new();
    let fetcher = MockFetcher::new();

    for _ in 0..2 {
        let result = engine
            .build(
                &path,
                &registry,
                &gcc("12"),
                &fetcher,
                &tool,
                BuildOptions::default(),
                &Cancellation::new(),
            )
            .unwrap();
        assert!(result.report.is_success());
    }
    assert_eq!(tool.invocations_for("zlib"), 1);
    assert_eq!(tool.invocations_for("app"), 1);
}

#[test]
fn environment_change_rebuilds() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let registry = InMemoryRegistry::new();
    let path = write_recipe(project.path(), &recipe_text("app", "1.0", &[], ""));
    let engine = Engine::new(home.path());
    let tool = MockBuildTool::new();

    for version in ["11", "12", "12"] {
        engine
            .build(
                &path,
                &registry,
                &gcc(version),
                &MockFetcher::new(),
                &tool,
                BuildOptions::default(),
                &Cancellation::new(),
            )
            .unwrap();
    }
    assert_eq!(tool.invocations_for("app"), 2);
    assert_eq!(engine.list_artifacts().unwrap().len(), 2);
}

#[test]
fn header_only_fingerprint_ignores_compiler() {
    let header_only =
        load_recipe(&recipe_text("fmt", "10.2", &[], "header_only = true\n")).unwrap();
    assert!(header_only.header_only());
    let compiled = recipe("zlib", "1.3", &[]);
    let deps = BTreeMap::new();
    let opts = BTreeMap::new();

    let fp = |r: &Recipe, env: &Environment| {
        compute_fingerprint(r, &deps, env, &opts).unwrap().fingerprint
    };
    assert_eq!(fp(&header_only, &gcc("11")), fp(&header_only, &gcc("13")));
    assert_ne!(fp(&compiled, &gcc("11")), fp(&compiled, &gcc("13")));
}

#[test]
fn old_compiler_fails_validation_only_for_that_package() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let strict = load_recipe(&recipe_text(
        "modern",
        "2.0",
        &[],
        "[compatibility.compilers]\ngcc = \"7\"\n",
    ))
    .unwrap();
    let registry = InMemoryRegistry::new()
        .with(strict)
        .with(recipe("legacy", "1.0", &[]));
    let path = write_recipe(
        project.path(),
        &recipe_text("app", "1.0", &[("modern", "*"), ("legacy", "*")], ""),
    );

    let tool = MockBuildTool::new();
    let result = Engine::new(home.path())
        .build(
            &path,
            &registry,
            &gcc("6"),
            &MockFetcher::new(),
            &tool,
            BuildOptions::default(),
            &Cancellation::new(),
        )
        .unwrap();

    let report = &result.report;
    assert!(!report.is_success());
    let modern = report.get("modern").unwrap().failure.clone().unwrap();
    assert_eq!(modern.state, PackageState::Validating);
    assert!(matches!(
        modern.reason,
        FailureReason::Incompatible(ValidationError::UnsupportedCompiler { .. })
    ));
    assert_eq!(
        report.get("app").unwrap().failure.as_ref().unwrap().reason,
        FailureReason::DependencyFailed("modern".to_owned())
    );
    assert_eq!(report.get("legacy").unwrap().state, PackageState::Complete);
    assert_eq!(tool.invocations_for("legacy"), 1);
    assert_eq!(tool.invocations_for("modern"), 0);
}

#[test]
fn concurrent_runs_share_single_flight_cache() {
    let home = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(home.path());
    layout.initialize().unwrap();
    let cache = BuildCache::new(layout);

    let registry = InMemoryRegistry::new()
        .with(recipe("boost", "1.83", &[]))
        .with(recipe("fmt", "10.2", &[]));
    let root = Arc::new(recipe("app", "1.0", &[("boost", "*"), ("fmt", "*")]));
    let resolved = resolve(&root, &registry).unwrap();
    let env = gcc("12");
    let tool = MockBuildTool::new().with_delay(Duration::from_millis(30));
    let fetcher = MockFetcher::new();

    let reports: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                s.spawn(|| {
                    Orchestrator::new(&cache, &fetcher, &tool)
                        .with_jobs(2)
                        .run(&resolved, &env)
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for report in &reports {
        assert!(report.is_success(), "{:?}", report.failures());
    }
    for name in ["boost", "fmt", "app"] {
        assert_eq!(tool.invocations_for(name), 1, "{name} built more than once");
    }
}

#[test]
fn cancellation_fails_in_flight_and_waiting_packages() {
    let home = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(home.path());
    layout.initialize().unwrap();
    let cache = BuildCache::new(layout);

    // chain: app -> mid -> base
    let registry = InMemoryRegistry::new()
        .with(recipe("base", "1.0", &[]))
        .with(recipe("mid", "1.0", &[("base", "*")]));
    let root = Arc::new(recipe("app", "1.0", &[("mid", "*")]));
    let resolved = resolve(&root, &registry).unwrap();
    let env = gcc("12");
    let tool = MockBuildTool::new().with_delay(Duration::from_millis(200));
    let fetcher = MockFetcher::new();
    let cancel = Cancellation::new();

    let report = thread::scope(|s| {
        let run = s.spawn(|| {
            Orchestrator::new(&cache, &fetcher, &tool)
                .with_jobs(1)
                .with_cancellation(cancel.clone())
                .run(&resolved, &env)
                .unwrap()
        });
        // Cancel while `base` is inside the build tool.
        while tool.invocations().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();
        run.join().unwrap()
    });

    let base = report.get("base").unwrap();
    assert_eq!(base.state, PackageState::Failed);
    assert_eq!(
        base.failure.as_ref().unwrap().reason,
        FailureReason::Cancelled
    );
    for name in ["mid", "app"] {
        let outcome = report.get(name).unwrap();
        assert_eq!(outcome.state, PackageState::Failed, "{name}");
        assert_eq!(
            outcome.failure.as_ref().unwrap().reason,
            FailureReason::Cancelled
        );
    }
    assert_eq!(tool.invocations().len(), 1);
}

#[test]
fn completed_packages_survive_cancellation() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let registry = InMemoryRegistry::new().with(recipe("base", "1.0", &[]));
    let path = write_recipe(
        project.path(),
        &recipe_text("app", "1.0", &[("base", "*")], ""),
    );
    let engine = Engine::new(home.path());
    let tool = MockBuildTool::new();
    engine
        .build(
            &path,
            &registry,
            &gcc("12"),
            &MockFetcher::new(),
            &tool,
            BuildOptions::default(),
            &Cancellation::new(),
        )
        .unwrap();

    let cancel = Cancellation::new();
    cancel.cancel();
    let result = engine
        .build(
            &path,
            &registry,
            &gcc("12"),
            &MockFetcher::new(),
            &tool,
            BuildOptions::default(),
            &cancel,
        )
        .unwrap();
    assert!(result
        .report
        .outcomes
        .values()
        .all(|o| o.failure.as_ref().map(|f| &f.reason) == Some(&FailureReason::Cancelled)));
    assert_eq!(engine.list_artifacts().unwrap().len(), 2);
}

#[test]
fn local_sources_and_layout_rules_are_packaged() {
    let upstream = tempfile::tempdir().unwrap();
    let top = upstream.path().join("fmt-10.2.1");
    fs::create_dir_all(top.join("include/fmt")).unwrap();
    fs::write(top.join("include/fmt/core.h"), "#pragma once").unwrap();
    fs::write(top.join("LICENSE.rst"), "MIT").unwrap();

    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let text = recipe_text("fmt", "10.2.1", &[], "")
        .replace("license = \"MIT\"", "license = \"MIT\"\nheader_only = true")
        + &format!(
            "[source]\nurl = \"file://{}\"\nstrip_root = true\n\
             [[layout]]\npattern = \"*.h\"\nsrc = \"include\"\ndst = \"include\"\n\
             [[layout]]\npattern = \"LICENSE*\"\ndst = \"licenses\"\n",
            upstream.path().display()
        );
    let path = write_recipe(project.path(), &text);

    let result = Engine::new(home.path())
        .build(
            &path,
            &InMemoryRegistry::new(),
            &gcc("12"),
            &LocalFetcher::new(project.path()),
            &MockBuildTool::new(),
            BuildOptions::default(),
            &Cancellation::new(),
        )
        .unwrap();
    let outcome = result.report.get("fmt").unwrap();
    assert_eq!(outcome.state, PackageState::Complete, "{:?}", outcome.failure);
    let files = &outcome.artifact.as_ref().unwrap().files;
    assert_eq!(
        files,
        &[
            "include/fmt/core.h".to_owned(),
            "lib/fmt.mock".to_owned(),
            "licenses/LICENSE.rst".to_owned(),
        ]
    );
}

#[test]
fn missing_dependency_aborts_before_building() {
    let project = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let path = write_recipe(
        project.path(),
        &recipe_text("app", "1.0", &[("nowhere", ">=1")], ""),
    );
    let tool = MockBuildTool::new();
    let err = Engine::new(home.path())
        .build(
            &path,
            &InMemoryRegistry::new(),
            &gcc("12"),
            &MockFetcher::new(),
            &tool,
            BuildOptions::default(),
            &Cancellation::new(),
        )
        .err()
        .unwrap();
    assert!(matches!(
        err,
        CoreError::Resolve(ResolveError::UnsatisfiableConstraint { .. })
    ));
    assert!(tool.invocations().is_empty());
}

#[test]
fn directory_registry_feeds_resolution() {
    let registry_dir = tempfile::tempdir().unwrap();
    let registry = write_registry(
        registry_dir.path(),
        &[
            recipe_text("zlib", "1.2.13", &[], ""),
            recipe_text("zlib", "1.3", &[], ""),
        ],
    );
    let versions = registry.list_versions("zlib").unwrap();
    assert_eq!(versions.len(), 2);

    let root = Arc::new(recipe("app", "1.0", &[("zlib", "~1.2")]));
    let resolved = resolve(&root, &registry).unwrap();
    assert_eq!(resolved.version_of("zlib").unwrap().as_str(), "1.2.13");
}
