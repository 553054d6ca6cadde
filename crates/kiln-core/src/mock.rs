use crate::fetch::{FetchError, Fetcher};
use crate::tool::{BuildOutput, BuildRequest, BuildTool, BuildToolError};
use kiln_schema::SourceSpec;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Fetcher that writes a marker file instead of copying anything.
///
/// Urls marked with [`MockFetcher::failing`] are reported as unreachable.
#[derive(Debug, Default)]
pub struct MockFetcher {
    fetched: Mutex<Vec<String>>,
    failing: BTreeSet<String>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing(mut self, url: impl Into<String>) -> Self {
        self.failing.insert(url.into());
        self
    }

    /// Urls fetched so far, in call order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl Fetcher for MockFetcher {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn fetch(&self, source: &SourceSpec, dest: &std::path::Path) -> Result<(), FetchError> {
        self.fetched
            .lock()
            .map_err(|e| FetchError::Failed(format!("mutex poisoned: {e}")))?
            .push(source.url.clone());
        if self.failing.contains(&source.url) {
            return Err(FetchError::NotFound(source.url.clone()));
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join(".kiln-mock-source"), &source.url)?;
        Ok(())
    }
}

/// Build tool that records invocations and writes one output per package.
///
/// Each successful build writes `lib/<package>.mock` into the build
/// directory. Packages marked with [`MockBuildTool::failing`] exit with 1.
#[derive(Debug, Default)]
pub struct MockBuildTool {
    invocations: Mutex<Vec<BuildRequest>>,
    failing: BTreeSet<String>,
    delay: Option<Duration>,
}

impl MockBuildTool {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing(mut self, package: impl Into<String>) -> Self {
        self.failing.insert(package.into());
        self
    }

    /// Sleep this long inside every invocation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> Vec<BuildRequest> {
        self.invocations
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    pub fn invocations_for(&self, package: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|r| r.package == package)
            .count()
    }
}

impl BuildTool for MockBuildTool {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn invoke(&self, request: &BuildRequest) -> Result<BuildOutput, BuildToolError> {
        self.invocations
            .lock()
            .map_err(|e| BuildToolError::Failed(format!("mutex poisoned: {e}")))?
            .push(request.clone());

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if self.failing.contains(&request.package) {
            return Ok(BuildOutput {
                exit_code: 1,
                artifacts: Vec::new(),
                log: format!("mock build of {} failed\n", request.package),
            });
        }

        let relative = PathBuf::from("lib").join(format!("{}.mock", request.package));
        let output = request.build_dir.join(&relative);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options: Vec<String> = request
            .options
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        std::fs::write(
            &output,
            format!(
                "{}/{} [{}]\n",
                request.package,
                request.version,
                options.join(",")
            ),
        )?;

        Ok(BuildOutput {
            exit_code: 0,
            artifacts: vec![relative],
            log: format!("mock build of {} ok\n", request.package),
        })
    }
}
