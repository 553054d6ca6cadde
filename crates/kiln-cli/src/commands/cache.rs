use super::{json_pretty, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_store::ArtifactRecord;

pub fn list(engine: &Engine, json: bool) -> Result<u8, String> {
    let mut records: Vec<ArtifactRecord> =
        engine.list_artifacts().map_err(|e| e.to_string())?;
    records.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));

    if json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no cached artifacts");
    } else {
        println!(
            "{:<14} {:<24} {:<12} {:>6}  CREATED",
            "SHORT_ID", "PACKAGE", "VERSION", "FILES"
        );
        for record in &records {
            println!(
                "{:<14} {:<24} {:<12} {:>6}  {}",
                record.short_id,
                record.name,
                record.version,
                record.files.len(),
                record.created_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn remove(engine: &Engine, prefix: &str, json: bool) -> Result<u8, String> {
    let removed = engine
        .remove_artifact(prefix)
        .map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({
            "fingerprint": removed.fingerprint,
            "name": removed.name,
            "version": removed.version,
            "status": "removed",
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "removed {}/{} ({})",
            removed.name, removed.version, removed.short_id
        );
    }
    Ok(EXIT_SUCCESS)
}
