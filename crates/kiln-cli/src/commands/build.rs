use super::{
    colorize_state, json_pretty, load_environment, spin_fail, spin_ok, spinner, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use kiln_core::{
    select_build_tool, select_fetcher, BuildOptions, Cancellation, Engine, FailureReason,
    KilnConfig, OrchestrationReport, RecipeProvider,
};
use std::path::Path;

/// Lines of build output shown for a failed package.
const LOG_TAIL: usize = 20;

pub struct BuildArgs<'a> {
    pub profile: Option<&'a Path>,
    pub options: &'a [String],
    pub jobs: Option<usize>,
    pub locked: bool,
    pub fetcher: &'a str,
    pub tool: &'a str,
    pub tool_program: Option<&'a Path>,
}

pub fn run(
    engine: &Engine,
    recipe: &Path,
    provider: &dyn RecipeProvider,
    args: &BuildArgs<'_>,
    config: &KilnConfig,
    cancel: &Cancellation,
    json: bool,
) -> Result<u8, String> {
    let env = load_environment(args.profile, args.options, config)?;
    let source_base = recipe
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let fetcher = select_fetcher(args.fetcher, source_base).map_err(|e| e.to_string())?;
    let tool = select_build_tool(args.tool, args.tool_program).map_err(|e| e.to_string())?;
    let options = BuildOptions {
        jobs: args.jobs,
        locked: args.locked,
    };

    let pb = if json {
        None
    } else {
        Some(spinner(&format!("building {}...", recipe.display())))
    };
    let result = match engine.build(
        recipe,
        provider,
        &env,
        fetcher.as_ref(),
        tool.as_ref(),
        options,
        cancel,
    ) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build aborted");
            }
            return Err(e.to_string());
        }
    };
    let report = &result.report;
    if let Some(ref pb) = pb {
        let summary = format!(
            "{}: {} built, {} cached, {} failed",
            result.lock.root,
            report.built(),
            report.cached(),
            report.failures().len()
        );
        if report.is_success() {
            spin_ok(pb, &summary);
        } else {
            spin_fail(pb, &summary);
        }
    }

    if json {
        let payload = serde_json::json!({
            "root": result.lock.root,
            "lock_digest": result.lock.digest,
            "success": report.is_success(),
            "built": report.built(),
            "cached": report.cached(),
            "packages": report.outcomes,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print_report(report, &result.resolved.build_order());
    }

    Ok(if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn print_report(report: &OrchestrationReport, order: &[&str]) {
    println!(
        "{:<24} {:<12} {:<12} ARTIFACT",
        "PACKAGE", "VERSION", "STATE"
    );
    for name in order {
        let Some(outcome) = report.get(name) else {
            continue;
        };
        let artifact = match &outcome.artifact {
            Some(a) if outcome.cached => format!("{} (cached)", a.short_id),
            Some(a) => a.short_id.to_string(),
            None => "-".to_owned(),
        };
        // Pad before colorizing; escape codes break the width calculation.
        let label = outcome.state.to_string();
        let pad = " ".repeat(12usize.saturating_sub(label.len()));
        println!(
            "{:<24} {:<12} {}{pad} {artifact}",
            outcome.name,
            outcome.version,
            colorize_state(outcome.state),
        );
        for warning in &outcome.warnings {
            println!("  warning: {warning}");
        }
    }

    for failure in report.failures() {
        eprintln!(
            "{} failed while {}: {}",
            failure.package, failure.state, failure.reason
        );
        if let FailureReason::BuildFailed { log, .. } = &failure.reason {
            for line in log_tail(log, LOG_TAIL) {
                eprintln!("  | {line}");
            }
        }
    }
}

fn log_tail(log: &str, lines: usize) -> Vec<&str> {
    let all: Vec<&str> = log.lines().collect();
    all[all.len().saturating_sub(lines)..].to_vec()
}
