use super::{json_pretty, EXIT_SUCCESS};
use kiln_core::{Engine, RecipeProvider};
use std::path::Path;

pub fn run(
    engine: &Engine,
    recipe: &Path,
    provider: &dyn RecipeProvider,
    write_lock: bool,
    json: bool,
) -> Result<u8, String> {
    let result = engine
        .resolve(recipe, provider, write_lock)
        .map_err(|e| e.to_string())?;
    let lock_path = write_lock.then(|| Engine::lock_path(recipe));

    if json {
        let payload = serde_json::json!({
            "root": result.lock.root,
            "digest": result.lock.digest,
            "build_order": result.resolved.build_order(),
            "packages": result.lock.packages,
            "lock_file": lock_path,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "resolved {} package(s) for {}",
        result.resolved.len(),
        result.lock.root
    );
    println!("{:<24} {:<12} REQUIRES", "PACKAGE", "VERSION");
    for name in result.resolved.build_order() {
        let Some(pkg) = result.lock.get(name) else {
            continue;
        };
        let mut deps = pkg.requires.clone();
        deps.extend(pkg.build_requires.iter().map(|d| format!("{d} (build)")));
        println!("{:<24} {:<12} {}", pkg.name, pkg.version, deps.join(", "));
    }
    if let Some(path) = lock_path {
        println!("wrote {}", path.display());
    }
    Ok(EXIT_SUCCESS)
}
