use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use overseer_runner::{
    describe_experiment, load_config, CycleController, ExperimentConfig, ExperimentSummary,
    RunMode, RunSummary, CONFIG_TEMPLATE, DEFAULT_CONFIG_PATH,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "overseer",
    version,
    about = "Runs parameter-sweep transmission trials against listening workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the experiment (the default when no subcommand is given).
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stop after one pass over the sweep.
        #[arg(long)]
        once: bool,
        #[arg(long)]
        max_trials: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show what a run would launch without starting anything.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter experiment file.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        config: None,
        once: false,
        max_trials: None,
        json: false,
    });
    let json_mode = command_json_mode(&command);
    match run_command(command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            once,
            max_trials,
            json,
        } => {
            let mut config = resolve_config(config.as_deref())?;
            if once {
                config.mode = RunMode::Once;
            }
            let mut controller = CycleController::new(config)?;
            let interrupter = controller.interrupter();
            ctrlc::set_handler(move || {
                let signalled = interrupter.interrupt();
                warn!(workers = signalled, "interrupt received; shutting down");
            })
            .context("failed to install interrupt handler")?;

            let summary = match max_trials {
                Some(limit) => controller.run_trials(Some(limit))?,
                None => controller.run()?,
            };
            if json {
                emit_json(&json!({
                    "ok": summary.exit_code() == 0,
                    "command": "run",
                    "run": run_summary_to_json(&summary),
                }));
            } else {
                print_run_summary(&summary);
            }
            Ok(summary.exit_code())
        }
        Commands::Describe { config, json } => {
            let config = resolve_config(config.as_deref())?;
            let summary = describe_experiment(&config)?;
            if json {
                emit_json(&json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                }));
            } else {
                print_summary(&summary);
            }
            Ok(0)
        }
        Commands::Init { path, force } => {
            if path.exists() && !force {
                return Err(anyhow::anyhow!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, CONFIG_TEMPLATE)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote: {}", path.display());
            println!("next: overseer describe --config {}", path.display());
            Ok(0)
        }
    }
}

/// `--config`, else the project file when present, else the built-in
/// power-level cycle.
fn resolve_config(explicit: Option<&Path>) -> Result<ExperimentConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return load_config(default_path);
    }
    info!("no experiment file found; using built-in power cycle");
    let mut config = ExperimentConfig::builtin_power_cycle();
    let cwd = std::env::current_dir()?;
    config.log_dir = cwd.join(&config.log_dir);
    config.base_dir = cwd;
    Ok(config)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn run_summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "run_id": summary.run_id,
        "log_dir": summary.log_dir.display().to_string(),
        "trials_attempted": summary.trials_attempted,
        "trials_failed": summary.trials_failed,
        "logs_archived": summary.logs_archived,
        "interrupted": summary.interrupted,
        "exit_code": summary.exit_code(),
    })
}

fn print_run_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("log_dir: {}", summary.log_dir.display());
    println!("trials_attempted: {}", summary.trials_attempted);
    println!("trials_failed: {}", summary.trials_failed);
    println!("logs_archived: {}", summary.logs_archived);
    if summary.interrupted {
        println!("interrupted: true");
    }
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.name);
    println!("mode: {:?}", summary.mode);
    println!("parameters: {}", summary.parameters.join(", "));
    if summary.cyclic {
        println!("trials_per_pass: {} (cyclic)", summary.trials_per_pass);
    } else {
        println!("trials_per_pass: {}", summary.trials_per_pass);
    }
    if let Some(tuple) = &summary.first_tuple {
        println!("first_trial: {}", tuple);
    }
    println!("primary: {}", summary.primary.command);
    if !summary.primary.program_exists {
        println!("primary_program_missing: true");
    }
    for aux in &summary.auxiliaries {
        let missing = if aux.program_exists { "" } else { " (program missing)" };
        println!("auxiliary {}: {}{}", aux.name, aux.command, missing);
    }
    for name in &summary.disabled_auxiliaries {
        println!("auxiliary {}: disabled", name);
    }
    println!("log_dir: {}", summary.log_dir.display());
    println!("settle_delay_secs: {}", summary.settle_delay_secs);
    println!("grace_period_secs: {}", summary.grace_period_secs);
}
