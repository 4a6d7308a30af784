pub mod archive;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod ledger;
pub mod registry;
pub mod supervisor;
pub mod sweep;
pub mod worker;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use archive::{ArchiveClock, ArchiveReport, LogArchiver};
pub use cancel::CancellationToken;
pub use config::{load_config, ExperimentConfig, RunMode, CONFIG_TEMPLATE, DEFAULT_CONFIG_PATH};
pub use controller::{CycleController, RunSummary, TrialPhase, EXIT_INTERRUPTED};
pub use registry::{Interrupter, WorkerRegistry};
pub use supervisor::{TrialError, TrialSupervisor};
pub use sweep::{ParameterSweep, ParameterTuple};
pub use worker::{Role, WorkerHandle, WorkerSpec};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub name: String,
    pub role: Role,
    pub command: String,
    pub program_exists: bool,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub name: String,
    pub mode: RunMode,
    pub parameters: Vec<String>,
    pub trials_per_pass: usize,
    pub cyclic: bool,
    pub first_tuple: Option<ParameterTuple>,
    pub primary: WorkerSummary,
    pub auxiliaries: Vec<WorkerSummary>,
    pub disabled_auxiliaries: Vec<String>,
    pub log_dir: PathBuf,
    pub settle_delay_secs: f64,
    pub grace_period_secs: f64,
}

/// Resolves what a run would launch without starting anything.
pub fn describe_experiment(config: &ExperimentConfig) -> Result<ExperimentSummary> {
    config.validate()?;
    let mut sweep = config.sweep.build()?;
    let first_tuple = sweep.next();
    let tuple = first_tuple
        .clone()
        .ok_or_else(|| anyhow!("sweep produced no parameter tuples"))?;

    let primary = config
        .primary
        .primary_spec(&tuple, &config.log_dir, &config.base_dir)?;
    let auxiliaries = config
        .enabled_auxiliaries()
        .map(|t| worker_summary(&t.auxiliary_spec(&config.log_dir, &config.base_dir)))
        .collect();
    let disabled_auxiliaries = config
        .auxiliaries
        .iter()
        .filter(|a| !a.enabled)
        .map(|a| a.name.clone())
        .collect();

    Ok(ExperimentSummary {
        name: config.name.clone(),
        mode: config.mode,
        parameters: sweep.axis_names(),
        trials_per_pass: sweep.pass_len(),
        cyclic: sweep.is_cyclic(),
        first_tuple,
        primary: worker_summary(&primary),
        auxiliaries,
        disabled_auxiliaries,
        log_dir: config.log_dir.clone(),
        settle_delay_secs: config.timing.settle_delay_secs,
        grace_period_secs: config.timing.grace_period_secs,
    })
}

fn worker_summary(spec: &WorkerSpec) -> WorkerSummary {
    WorkerSummary {
        name: spec.name.clone(),
        role: spec.role,
        command: spec.command_line(),
        program_exists: program_exists(&spec.program),
        log_path: spec.log_path.clone(),
    }
}

/// Bare names are looked up on PATH.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_builtin_grid() {
        let summary = describe_experiment(&ExperimentConfig::builtin_collision_grid()).unwrap();
        assert_eq!(summary.trials_per_pass, 180);
        assert!(!summary.cyclic);
        assert_eq!(summary.parameters, vec!["sf", "gain", "delay"]);
        assert_eq!(summary.auxiliaries.len(), 2);
        assert!(summary
            .primary
            .command
            .ends_with("--spreading-factor 7 --gain 0.2 --delay 0"));
        assert!(summary.primary.log_path.ends_with("tx_log.txt"));
    }

    #[test]
    fn describe_power_cycle() {
        let mut config = ExperimentConfig::builtin_power_cycle();
        config.auxiliaries[1].enabled = false;
        let summary = describe_experiment(&config).unwrap();
        assert!(summary.cyclic);
        assert_eq!(summary.trials_per_pass, 5);
        assert_eq!(summary.disabled_auxiliaries, vec!["sniffer"]);
        assert_eq!(summary.first_tuple.unwrap().get("power"), Some(100.0));
    }

    #[test]
    fn program_lookup() {
        assert!(program_exists("sh"));
        assert!(program_exists("/bin/sh"));
        assert!(!program_exists("./definitely/not/here"));
    }
}
