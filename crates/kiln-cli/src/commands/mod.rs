pub mod build;
pub mod cache;
pub mod check;
pub mod completions;
pub mod resolve;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{DirectoryRegistry, InMemoryRegistry, KilnConfig, PackageState, RecipeProvider};
use kiln_schema::Environment;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_RECIPE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: PackageState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        PackageState::Complete => Style::new().green().apply_to(text).to_string(),
        PackageState::Failed => Style::new().red().bold().apply_to(text).to_string(),
        PackageState::Pending => Style::new().dim().apply_to(text).to_string(),
        _ => Style::new().yellow().apply_to(text).to_string(),
    }
}

/// `--registry`, then the configured registry, then an empty registry
/// (a recipe without requirements still resolves).
pub fn open_registry(explicit: Option<&Path>, config: &KilnConfig) -> Box<dyn RecipeProvider> {
    match explicit.or(config.registry.as_deref()) {
        Some(dir) => {
            tracing::debug!("using recipe registry {}", dir.display());
            Box::new(DirectoryRegistry::new(dir))
        }
        None => Box::new(InMemoryRegistry::new()),
    }
}

/// Load the build profile and apply `-o` selections on top of it.
pub fn load_environment(
    profile: Option<&Path>,
    selections: &[String],
    config: &KilnConfig,
) -> Result<Environment, String> {
    let path = profile.or(config.profile.as_deref()).ok_or_else(|| {
        "profile error: no build profile given; pass --profile or set 'profile' in the config file"
            .to_owned()
    })?;
    let mut env = Environment::load_profile(path)
        .map_err(|e| format!("profile error: {}: {e}", path.display()))?;
    for selection in selections {
        env.select_option(selection)
            .map_err(|e| format!("profile error: {e}"))?;
    }
    Ok(env)
}
