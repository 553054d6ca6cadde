mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_RECIPE_ERROR, EXIT_STORE_ERROR};
use kiln_core::{install_signal_handler, Cancellation, Engine, KilnConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Recipe resolution and cached build orchestration for C and C++ packages"
)]
struct Cli {
    /// Cache and work directory (defaults to $KILN_HOME, the config file, then ~/.kiln).
    #[arg(long, global = true)]
    home: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve the dependency graph of a recipe and print the pinned versions.
    Resolve {
        /// Path to the root recipe.
        #[arg(default_value = "kiln.toml")]
        recipe: PathBuf,
        /// Recipe registry directory (`<name>/<version>.toml`).
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Write kiln.lock next to the recipe.
        #[arg(long, default_value_t = false)]
        write_lock: bool,
    },
    /// Resolve, validate, and build every package of a recipe.
    Build {
        /// Path to the root recipe.
        #[arg(default_value = "kiln.toml")]
        recipe: PathBuf,
        /// Recipe registry directory (`<name>/<version>.toml`).
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Build profile describing the target environment.
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Option selection, `name=value` or `package:name=value`. Repeatable.
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
        /// Number of packages built in parallel.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Require an existing kiln.lock and fail if the resolution drifted.
        #[arg(long, default_value_t = false)]
        locked: bool,
        /// Source fetcher: `local` or `mock`.
        #[arg(long, default_value = "local")]
        fetcher: String,
        /// Build tool: `command` or `mock`.
        #[arg(long, default_value = "command")]
        tool: String,
        /// Program run by the `command` build tool.
        #[arg(long)]
        tool_program: Option<PathBuf>,
    },
    /// Validate every resolved package against a profile without building.
    Check {
        /// Path to the root recipe.
        #[arg(default_value = "kiln.toml")]
        recipe: PathBuf,
        /// Recipe registry directory (`<name>/<version>.toml`).
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Build profile describing the target environment.
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Option selection, `name=value` or `package:name=value`. Repeatable.
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
    },
    /// Inspect or prune the artifact cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// List cached build artifacts.
    List,
    /// Remove a cached artifact by fingerprint or short id prefix.
    Remove {
        /// Fingerprint, short id, or an unambiguous prefix of either.
        fingerprint: String,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = match KilnConfig::load_default() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let home = cli
        .home
        .as_deref()
        .map_or_else(|| config.resolve_home(), expand_tilde);
    let engine = Engine::new(&home);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Resolve {
            recipe,
            registry,
            write_lock,
        } => {
            let provider = commands::open_registry(registry.as_deref(), &config);
            commands::resolve::run(&engine, &recipe, provider.as_ref(), write_lock, json_output)
        }
        Commands::Build {
            recipe,
            registry,
            profile,
            options,
            jobs,
            locked,
            fetcher,
            tool,
            tool_program,
        } => {
            let cancel = Cancellation::new();
            install_signal_handler(cancel.clone());
            let provider = commands::open_registry(registry.as_deref(), &config);
            commands::build::run(
                &engine,
                &recipe,
                provider.as_ref(),
                &commands::build::BuildArgs {
                    profile: profile.as_deref(),
                    options: &options,
                    jobs: jobs.or(config.jobs),
                    locked,
                    fetcher: &fetcher,
                    tool: &tool,
                    tool_program: tool_program.as_deref(),
                },
                &config,
                &cancel,
                json_output,
            )
        }
        Commands::Check {
            recipe,
            registry,
            profile,
            options,
        } => {
            let provider = commands::open_registry(registry.as_deref(), &config);
            commands::check::run(
                &engine,
                &recipe,
                provider.as_ref(),
                profile.as_deref(),
                &options,
                &config,
                json_output,
            )
        }
        Commands::Cache { action } => match action {
            CacheAction::List => commands::cache::list(&engine, json_output),
            CacheAction::Remove { fingerprint } => {
                commands::cache::remove(&engine, &fingerprint, json_output)
            }
        },
        Commands::Completions { shell } => {
            commands::completions::run::<Cli>(shell, &mut std::io::stdout())
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("recipe error:")
        || msg.starts_with("profile error:")
        || msg.starts_with("lock error:")
    {
        EXIT_RECIPE_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("cache error:") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
