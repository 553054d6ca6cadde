use crate::mock::MockBuildTool;
use crate::CoreError;
use kiln_schema::{Environment, OptionValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BuildToolError {
    #[error("build tool I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("build tool error: {0}")]
    Failed(String),
}

/// Everything a build tool needs to build one configured package.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub package: String,
    pub version: String,
    pub source_dir: PathBuf,
    /// Outputs written here are packaged, keyed by their path relative to it.
    pub build_dir: PathBuf,
    pub environment: Environment,
    pub options: BTreeMap<String, OptionValue>,
    /// Package directories of every completed direct dependency.
    pub dependencies: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub exit_code: i32,
    /// Output files, relative to the build directory.
    pub artifacts: Vec<PathBuf>,
    /// Captured diagnostic output.
    pub log: String,
}

impl BuildOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait BuildTool: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, request: &BuildRequest) -> Result<BuildOutput, BuildToolError>;
}

/// Runs an external program in the source directory.
///
/// The program sees the request through environment variables:
/// `KILN_PACKAGE`, `KILN_VERSION`, `KILN_SOURCE_DIR`, `KILN_BUILD_DIR`,
/// `KILN_OS`, `KILN_ARCH`, `KILN_BUILD_TYPE`, `KILN_COMPILER`,
/// `KILN_COMPILER_VERSION`, `KILN_CPPSTD`, `KILN_LIBCXX`,
/// `KILN_OPTION_<NAME>` per option and `KILN_DEP_<NAME>` per dependency.
#[derive(Debug, Clone)]
pub struct CommandBuildTool {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandBuildTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn command(&self, request: &BuildRequest) -> Command {
        let env = &request.environment;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.source_dir)
            .env("KILN_PACKAGE", &request.package)
            .env("KILN_VERSION", &request.version)
            .env("KILN_SOURCE_DIR", &request.source_dir)
            .env("KILN_BUILD_DIR", &request.build_dir)
            .env("KILN_OS", &env.platform)
            .env("KILN_ARCH", &env.arch)
            .env("KILN_BUILD_TYPE", &env.build_type)
            .env("KILN_COMPILER", &env.compiler.name)
            .env("KILN_COMPILER_VERSION", env.compiler.version.as_str());
        if let Some(cppstd) = env.compiler.cppstd {
            cmd.env("KILN_CPPSTD", cppstd.to_string());
        }
        if let Some(libcxx) = &env.compiler.libcxx {
            cmd.env("KILN_LIBCXX", libcxx);
        }
        for (name, value) in &request.options {
            cmd.env(format!("KILN_OPTION_{}", env_key(name)), value.to_string());
        }
        for (name, dir) in &request.dependencies {
            cmd.env(format!("KILN_DEP_{}", env_key(name)), dir);
        }
        cmd
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl BuildTool for CommandBuildTool {
    fn name(&self) -> &'static str {
        "command"
    }

    fn invoke(&self, request: &BuildRequest) -> Result<BuildOutput, BuildToolError> {
        debug!(
            "running {} for {}/{} in {}",
            self.program.display(),
            request.package,
            request.version,
            request.source_dir.display()
        );
        let output = self
            .command(request)
            .output()
            .map_err(|source| BuildToolError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        // Killed by a signal: no exit code.
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!("{} exited with code {exit_code}", self.program.display());
        }

        let artifacts = if output.status.success() {
            kiln_store::list_files(&request.build_dir)
                .map_err(|e| BuildToolError::Failed(e.to_string()))?
                .into_iter()
                .map(PathBuf::from)
                .collect()
        } else {
            Vec::new()
        };

        Ok(BuildOutput {
            exit_code,
            artifacts,
            log,
        })
    }
}

pub fn select_build_tool(
    name: &str,
    program: Option<&Path>,
) -> Result<Box<dyn BuildTool>, CoreError> {
    match (name, program) {
        ("command", Some(program)) => Ok(Box::new(CommandBuildTool::new(program))),
        ("command", None) => Err(CoreError::Config(
            "the command build tool needs a program (--tool-program)".to_owned(),
        )),
        ("mock", _) => Ok(Box::new(MockBuildTool::new())),
        (other, _) => Err(CoreError::UnknownCollaborator {
            kind: "build tool",
            name: other.to_owned(),
        }),
    }
}
