//! CLI subprocess integration tests.
//!
//! These tests run the `kiln` binary against a throwaway home, registry,
//! and profile, using the mock fetcher and build tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const PROFILE: &str = r#"
[settings]
os = "Linux"

[compiler]
name = "gcc"
version = "12"
"#;

struct Fixture {
    dir: tempfile::TempDir,
    home: PathBuf,
    registry: PathBuf,
    project: PathBuf,
    profile: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let registry = dir.path().join("registry");
        let project = dir.path().join("project");
        fs::create_dir_all(&registry).unwrap();
        fs::create_dir_all(&project).unwrap();
        let profile = dir.path().join("linux-gcc12.toml");
        fs::write(&profile, PROFILE).unwrap();
        Self {
            dir,
            home,
            registry,
            project,
            profile,
        }
    }

    fn publish(&self, name: &str, version: &str, extra: &str) {
        let dir = self.registry.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(format!("{version}.toml")),
            recipe_text(name, version, extra),
        )
        .unwrap();
    }

    fn write_root(&self, extra: &str) -> PathBuf {
        let path = self.project.join("kiln.toml");
        fs::write(&path, recipe_text("app", "0.1.0", extra)).unwrap();
        path
    }

    fn kiln(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
        cmd.env("XDG_CONFIG_HOME", self.dir.path().join("config"))
            .env_remove("KILN_HOME")
            .env_remove("KILN_LOG")
            .arg("--home")
            .arg(&self.home);
        cmd
    }

    fn build(&self, recipe: &Path, extra: &[&str]) -> Output {
        self.kiln()
            .arg("build")
            .arg(recipe)
            .arg("--registry")
            .arg(&self.registry)
            .arg("--profile")
            .arg(&self.profile)
            .args(["--fetcher", "mock", "--tool", "mock"])
            .args(extra)
            .output()
            .unwrap()
    }
}

fn recipe_text(name: &str, version: &str, extra: &str) -> String {
    format!(
        "recipe_version = 1\n\n[package]\nname = \"{name}\"\nversion = \"{version}\"\nlicense = \"MIT\"\nhomepage = \"https://example.com/{name}\"\n{extra}"
    )
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("kiln"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["resolve", "build", "check", "cache"] {
        assert!(stdout.contains(command), "help must list '{command}'");
    }
}

#[test]
fn cli_resolve_json_picks_highest_version() {
    let fx = Fixture::new();
    fx.publish("fmt", "9.1", "");
    fx.publish("fmt", "10.2", "");
    fx.publish("fmt", "11.0", "");
    let recipe = fx.write_root("[requires]\nfmt = \">=9.0, <11.0\"\n");

    let output = fx
        .kiln()
        .args(["--json", "resolve"])
        .arg(&recipe)
        .arg("--registry")
        .arg(&fx.registry)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let value = json(&output);
    assert_eq!(value["root"], "app");
    assert_eq!(value["build_order"], serde_json::json!(["fmt", "app"]));
    let fmt = value["packages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "fmt")
        .unwrap();
    assert_eq!(fmt["version"], "10.2");
}

#[test]
fn cli_resolve_write_lock_creates_lock_file() {
    let fx = Fixture::new();
    fx.publish("zlib", "1.3", "");
    let recipe = fx.write_root("[requires]\nzlib = \"*\"\n");

    let output = fx
        .kiln()
        .arg("resolve")
        .arg(&recipe)
        .arg("--registry")
        .arg(&fx.registry)
        .arg("--write-lock")
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(fx.project.join("kiln.lock").exists());
}

#[test]
fn cli_resolve_missing_dependency_fails() {
    let fx = Fixture::new();
    let recipe = fx.write_root("[requires]\nopenssl = \">=3.0\"\n");

    let output = fx
        .kiln()
        .arg("resolve")
        .arg(&recipe)
        .arg("--registry")
        .arg(&fx.registry)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("openssl"));
}

#[test]
fn cli_invalid_recipe_exits_with_recipe_code() {
    let fx = Fixture::new();
    let path = fx.project.join("kiln.toml");
    fs::write(&path, "recipe_version = 1\n[package]\nname = \"app\"\n").unwrap();

    let output = fx.kiln().arg("resolve").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("recipe error"));
}

#[test]
fn cli_build_without_profile_exits_with_recipe_code() {
    let fx = Fixture::new();
    let recipe = fx.write_root("");

    let output = fx
        .kiln()
        .arg("build")
        .arg(&recipe)
        .args(["--fetcher", "mock", "--tool", "mock"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("profile error"));
}

#[test]
fn cli_build_then_rebuild_is_cached() {
    let fx = Fixture::new();
    fx.publish("fmt", "10.2", "");
    fx.publish("spdlog", "1.12", "[requires]\nfmt = \">=10.0\"\n");
    let recipe = fx.write_root("[requires]\nspdlog = \"*\"\n");

    let first = fx.build(&recipe, &["--json"]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let value = json(&first);
    assert_eq!(value["success"], true);
    assert_eq!(value["built"], 3);
    assert_eq!(value["packages"]["spdlog"]["state"], "complete");
    assert_eq!(
        value["packages"]["fmt"]["history"],
        serde_json::json!([
            "pending",
            "fetching",
            "validating",
            "configuring",
            "building",
            "packaging",
            "complete"
        ])
    );

    let second = fx.build(&recipe, &["--json"]);
    assert!(second.status.success(), "stderr: {}", stderr(&second));
    let value = json(&second);
    assert_eq!(value["built"], 0);
    assert_eq!(value["cached"], 3);
}

#[test]
fn cli_build_option_changes_fingerprint() {
    let fx = Fixture::new();
    fx.publish(
        "zlib",
        "1.3",
        "[options.shared]\ndefault = false\nallowed = [true, false]\n",
    );
    let recipe = fx.write_root("[requires]\nzlib = \"*\"\n");

    let first = fx.build(&recipe, &["--json"]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let shared = fx.build(&recipe, &["--json", "-o", "zlib:shared=True"]);
    assert!(shared.status.success(), "stderr: {}", stderr(&shared));

    let a = json(&first)["packages"]["zlib"]["artifact"]["fingerprint"].clone();
    let b = json(&shared)["packages"]["zlib"]["artifact"]["fingerprint"].clone();
    assert!(a.is_string());
    assert_ne!(a, b);
}

#[test]
fn cli_build_incompatible_package_exits_nonzero() {
    let fx = Fixture::new();
    fx.publish(
        "modern",
        "2.0",
        "[compatibility.compilers]\ngcc = \"13\"\n",
    );
    let recipe = fx.write_root("[requires]\nmodern = \"*\"\n");

    let output = fx.build(&recipe, &["--json"]);
    assert_eq!(output.status.code(), Some(1));
    let value = json(&output);
    assert_eq!(value["success"], false);
    assert_eq!(value["packages"]["modern"]["state"], "failed");
    assert_eq!(
        value["packages"]["modern"]["failure"]["state"],
        "validating"
    );
    assert_eq!(
        value["packages"]["app"]["failure"]["reason"]["kind"],
        "dependency_failed"
    );
}

#[test]
fn cli_locked_build_detects_drift() {
    let fx = Fixture::new();
    fx.publish("fmt", "9.1", "");
    let recipe = fx.write_root("[requires]\nfmt = \">=9.0\"\n");

    let lock = fx
        .kiln()
        .arg("resolve")
        .arg(&recipe)
        .arg("--registry")
        .arg(&fx.registry)
        .arg("--write-lock")
        .output()
        .unwrap();
    assert!(lock.status.success(), "stderr: {}", stderr(&lock));

    fx.publish("fmt", "10.2", "");
    let output = fx.build(&recipe, &["--locked"]);
    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("drift"));
}

#[test]
fn cli_check_reports_incompatibility() {
    let fx = Fixture::new();
    fx.publish("legacy", "1.0", "");
    fx.publish(
        "modern",
        "2.0",
        "[compatibility.compilers]\ngcc = \"13\"\n",
    );
    let recipe = fx.write_root("[requires]\nlegacy = \"*\"\nmodern = \"*\"\n");

    let output = fx
        .kiln()
        .args(["--json", "check"])
        .arg(&recipe)
        .arg("--registry")
        .arg(&fx.registry)
        .arg("--profile")
        .arg(&fx.profile)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let value = json(&output);
    assert_eq!(value["compatible"], false);
    let packages = value["packages"].as_array().unwrap();
    let modern = packages.iter().find(|p| p["name"] == "modern").unwrap();
    let legacy = packages.iter().find(|p| p["name"] == "legacy").unwrap();
    assert!(modern["error"].is_object());
    assert!(legacy["error"].is_null());
}

#[test]
fn cli_cache_list_and_remove() {
    let fx = Fixture::new();
    fx.publish("fmt", "10.2", "");
    let recipe = fx.write_root("[requires]\nfmt = \"*\"\n");
    let build = fx.build(&recipe, &[]);
    assert!(build.status.success(), "stderr: {}", stderr(&build));

    let list = fx.kiln().args(["--json", "cache", "list"]).output().unwrap();
    assert!(list.status.success(), "stderr: {}", stderr(&list));
    let records = json(&list);
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    let fmt = records.iter().find(|r| r["name"] == "fmt").unwrap();
    let short_id = fmt["short_id"].as_str().unwrap().to_owned();

    let remove = fx
        .kiln()
        .args(["cache", "remove", &short_id])
        .output()
        .unwrap();
    assert!(remove.status.success(), "stderr: {}", stderr(&remove));

    let list = fx.kiln().args(["--json", "cache", "list"]).output().unwrap();
    assert_eq!(json(&list).as_array().unwrap().len(), 1);
}

#[test]
fn cli_cache_list_empty_home() {
    let fx = Fixture::new();
    let output = fx.kiln().args(["cache", "list"]).output().unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("no cached artifacts"));
}

#[test]
fn cli_completions_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("kiln"));
}
