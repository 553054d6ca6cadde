use super::{json_pretty, load_environment, EXIT_FAILURE, EXIT_SUCCESS};
use kiln_core::{Engine, KilnConfig, RecipeProvider};
use std::path::Path;

pub fn run(
    engine: &Engine,
    recipe: &Path,
    provider: &dyn RecipeProvider,
    profile: Option<&Path>,
    selections: &[String],
    config: &KilnConfig,
    json: bool,
) -> Result<u8, String> {
    let env = load_environment(profile, selections, config)?;
    let checks = engine
        .check(recipe, provider, &env)
        .map_err(|e| e.to_string())?;
    let incompatible = checks.iter().filter(|c| c.error.is_some()).count();

    if json {
        let payload = serde_json::json!({
            "environment": env,
            "compatible": incompatible == 0,
            "packages": checks,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let ok = console::Style::new().green();
        let bad = console::Style::new().red().bold();
        let warn = console::Style::new().yellow();
        for check in &checks {
            let reference = format!("{}/{}", check.name, check.version);
            match &check.error {
                None => println!("{} {reference}", ok.apply_to("ok  ")),
                Some(e) => println!("{} {reference}: {e}", bad.apply_to("FAIL")),
            }
            for warning in &check.warnings {
                println!("     {} {warning}", warn.apply_to("warning:"));
            }
        }
        println!(
            "{} package(s) checked against {} / {} {}, {incompatible} incompatible",
            checks.len(),
            env.platform,
            env.compiler.name,
            env.compiler.version
        );
    }

    Ok(if incompatible == 0 {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
