use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::supervisor::SupervisorSettings;
use crate::sweep::{is_valid_name, Axis, ParameterSweep, SweepError};
use crate::worker::{Launcher, ParameterBinding, WorkerTemplate};

pub const DEFAULT_CONFIG_PATH: &str = ".overseer/experiment.yaml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error("invalid worker name '{0}': use ASCII letters, digits, '_' or '-'")]
    InvalidWorkerName(String),
    #[error("duplicate worker name: {0}")]
    DuplicateWorker(String),
    #[error("primary worker '{0}' is disabled")]
    PrimaryDisabled(String),
    #[error("primary binds parameter '{0}' which the sweep does not produce")]
    UnknownParameter(String),
    #[error("binding for parameter '{0}' has an empty flag")]
    EmptyFlag(String),
    #[error("auxiliary worker '{0}' declares parameter bindings; only the primary takes parameters")]
    AuxiliaryParameters(String),
    #[error("timing.{0} must be a finite, non-negative number")]
    InvalidTiming(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SweepConfig {
    /// Cartesian product; first axis slowest.
    Grid { axes: Vec<Axis> },
    /// One parameter over a fixed list, repeated.
    Cycle { parameter: String, values: Vec<f64> },
}

impl SweepConfig {
    pub fn build(&self) -> Result<ParameterSweep, SweepError> {
        match self {
            SweepConfig::Grid { axes } => ParameterSweep::grid(axes.clone()),
            SweepConfig::Cycle { parameter, values } => {
                ParameterSweep::cycle(parameter, values.clone())
            }
        }
    }

    pub fn parameter_names(&self) -> Vec<String> {
        match self {
            SweepConfig::Grid { axes } => axes.iter().map(|a| a.name.clone()).collect(),
            SweepConfig::Cycle { parameter, .. } => vec![parameter.clone()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One pass over the sweep.
    Once,
    /// Until the sweep is exhausted; forever for a cycle.
    #[default]
    Forever,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_delay_secs: f64,
    pub grace_period_secs: f64,
    pub poll_interval_ms: u64,
    pub kill_after_grace: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 2.0,
            grace_period_secs: 2.0,
            poll_interval_ms: 200,
            kill_after_grace: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub mode: RunMode,
    pub sweep: SweepConfig,
    pub primary: WorkerTemplate,
    #[serde(default)]
    pub auxiliaries: Vec<WorkerTemplate>,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Directory relative worker paths and `log_dir` resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut config: ExperimentConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    config.base_dir = base_dir
        .canonicalize()
        .unwrap_or_else(|_| base_dir.to_path_buf());
    if config.log_dir.is_relative() {
        config.log_dir = config.base_dir.join(&config.log_dir);
    }
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sweep.build()?;

        let mut names = BTreeSet::new();
        for worker in std::iter::once(&self.primary).chain(self.auxiliaries.iter()) {
            if !is_valid_name(&worker.name) {
                return Err(ConfigError::InvalidWorkerName(worker.name.clone()));
            }
            if !names.insert(worker.name.as_str()) {
                return Err(ConfigError::DuplicateWorker(worker.name.clone()));
            }
        }
        if !self.primary.enabled {
            return Err(ConfigError::PrimaryDisabled(self.primary.name.clone()));
        }
        if let Some(aux) = self.auxiliaries.iter().find(|a| !a.parameters.is_empty()) {
            return Err(ConfigError::AuxiliaryParameters(aux.name.clone()));
        }

        let produced = self.sweep.parameter_names();
        for binding in &self.primary.parameters {
            if !produced.contains(&binding.parameter) {
                return Err(ConfigError::UnknownParameter(binding.parameter.clone()));
            }
            if binding.flag.trim().is_empty() {
                return Err(ConfigError::EmptyFlag(binding.parameter.clone()));
            }
        }

        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(self.timing.settle_delay_secs) {
            return Err(ConfigError::InvalidTiming("settle_delay_secs"));
        }
        if !non_negative(self.timing.grace_period_secs) {
            return Err(ConfigError::InvalidTiming("grace_period_secs"));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("poll_interval_ms"));
        }
        Ok(())
    }

    pub fn enabled_auxiliaries(&self) -> impl Iterator<Item = &WorkerTemplate> {
        self.auxiliaries.iter().filter(|a| a.enabled)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.timing.settle_delay_secs)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            grace_period: Duration::from_secs_f64(self.timing.grace_period_secs),
            kill_after_grace: self.timing.kill_after_grace,
        }
    }

    /// The transmitter power-level loop: one cyclic parameter, run forever.
    pub fn builtin_power_cycle() -> Self {
        Self {
            name: "power_cycle".to_string(),
            log_dir: default_log_dir(),
            mode: RunMode::Forever,
            sweep: SweepConfig::Cycle {
                parameter: "power".to_string(),
                values: vec![100.0, 90.0, 80.0, 70.0, 60.0],
            },
            primary: WorkerTemplate {
                name: "tx".to_string(),
                launch: Launcher::Python {
                    script: "./scripts/CollisionTX.py".to_string(),
                    interpreter: "python3".to_string(),
                    args: vec![],
                },
                parameters: vec![ParameterBinding {
                    parameter: "power".to_string(),
                    flag: "--power".to_string(),
                    min: Some(0.0),
                    max: Some(100.0),
                    integer: true,
                }],
                enabled: true,
            },
            auxiliaries: default_listeners(),
            timing: TimingConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }

    /// The two-transmitter collision grid: spreading factor × gain × delay,
    /// one pass.
    pub fn builtin_collision_grid() -> Self {
        Self {
            name: "collision_grid".to_string(),
            log_dir: default_log_dir(),
            mode: RunMode::Once,
            sweep: SweepConfig::Grid {
                axes: vec![
                    Axis::new("sf", 7.0, 1.0, 12.0),
                    Axis::new("gain", 0.2, 0.2, 1.0),
                    Axis::new("delay", 0.0, 0.002, 0.01),
                ],
            },
            primary: WorkerTemplate {
                name: "tx".to_string(),
                launch: Launcher::Python {
                    script: "./scripts/ActualCollision.py".to_string(),
                    interpreter: "python3".to_string(),
                    args: vec!["--packets".to_string(), "300".to_string()],
                },
                parameters: vec![
                    ParameterBinding {
                        parameter: "sf".to_string(),
                        flag: "--spreading-factor".to_string(),
                        min: Some(7.0),
                        max: Some(12.0),
                        integer: true,
                    },
                    ParameterBinding {
                        parameter: "gain".to_string(),
                        flag: "--gain".to_string(),
                        min: Some(0.0),
                        max: None,
                        integer: false,
                    },
                    ParameterBinding {
                        parameter: "delay".to_string(),
                        flag: "--delay".to_string(),
                        min: Some(0.0),
                        max: None,
                        integer: false,
                    },
                ],
                enabled: true,
            },
            auxiliaries: default_listeners(),
            timing: TimingConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

fn default_listeners() -> Vec<WorkerTemplate> {
    vec![
        WorkerTemplate {
            name: "spectrum".to_string(),
            launch: Launcher::Exec {
                program: "./listeners/spectrum_scan.sh".to_string(),
                args: vec![],
            },
            parameters: vec![],
            enabled: true,
        },
        WorkerTemplate {
            name: "sniffer".to_string(),
            launch: Launcher::Exec {
                program: "./listeners/serial_listener.sh".to_string(),
                args: vec!["/dev/ttyACM0".to_string(), "115200".to_string()],
            },
            parameters: vec![],
            enabled: true,
        },
    ]
}

pub const CONFIG_TEMPLATE: &str = "\
name: collision_grid
log_dir: logs                         # transient *_log.txt and archived logs
mode: once                            # once | forever (forever repeats a cycle sweep)

sweep:
  mode: grid                          # grid | cycle
  axes:                               # first axis varies slowest
    - { name: sf,    start: 7,   step: 1,     end: 12 }
    - { name: gain,  start: 0.2, step: 0.2,   end: 1.0 }
    - { name: delay, start: 0,   step: 0.002, end: 0.01 }
# sweep:
#   mode: cycle
#   parameter: power
#   values: [100, 90, 80, 70, 60]

primary:                              # its exit ends the trial
  name: tx
  launch:
    type: python                      # exec | python | conda
    script: ./scripts/ActualCollision.py
    args: [--packets, '300']
  parameters:                         # appended as `flag value`, in this order
    - { parameter: sf,    flag: --spreading-factor, min: 7, max: 12, integer: true }
    - { parameter: gain,  flag: --gain,  min: 0 }
    - { parameter: delay, flag: --delay, min: 0 }

auxiliaries:                          # started first, terminated after archiving
  - name: spectrum
    launch: { type: exec, program: ./listeners/spectrum_scan.sh }
  - name: sniffer
    launch: { type: exec, program: ./listeners/serial_listener.sh, args: [/dev/ttyACM0, '115200'] }
    enabled: true

timing:
  settle_delay_secs: 2
  grace_period_secs: 2
  poll_interval_ms: 200
  kill_after_grace: true
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_valid() {
        ExperimentConfig::builtin_power_cycle()
            .validate()
            .expect("power cycle");
        ExperimentConfig::builtin_collision_grid()
            .validate()
            .expect("collision grid");
    }

    #[test]
    fn template_parses_and_matches_builtin_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.yaml");
        fs::write(&path, CONFIG_TEMPLATE).unwrap();
        let config = load_config(&path).expect("template must load");
        let builtin = ExperimentConfig::builtin_collision_grid();
        assert_eq!(config.sweep, builtin.sweep);
        assert_eq!(config.primary, builtin.primary);
        assert_eq!(config.mode, RunMode::Once);
        assert_eq!(config.auxiliaries.len(), 2);
        assert!(config.log_dir.is_absolute());
        assert!(config.log_dir.ends_with("logs"));
        assert_eq!(config.sweep.build().unwrap().len_hint(), Some(6 * 5 * 6));
    }

    #[test]
    fn json_config_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        let json = r#"{
            "name": "power",
            "sweep": { "mode": "cycle", "parameter": "power", "values": [100, 80, 60] },
            "primary": {
                "name": "tx",
                "launch": { "type": "exec", "program": "/bin/true" },
                "parameters": [{ "parameter": "power", "flag": "-p" }]
            },
            "timing": { "settle_delay_secs": 0 }
        }"#;
        fs::write(&path, json).unwrap();
        let config = load_config(&path).expect("json config");
        assert_eq!(config.mode, RunMode::Forever);
        assert_eq!(config.timing.grace_period_secs, 2.0);
        assert_eq!(config.settle_delay(), Duration::ZERO);
        assert!(config.auxiliaries.is_empty());
    }

    #[test]
    fn validation_catches_wiring_mistakes() {
        let mut config = ExperimentConfig::builtin_power_cycle();
        config.primary.parameters[0].parameter = "gain".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownParameter("gain".to_string()))
        );

        let mut config = ExperimentConfig::builtin_power_cycle();
        config.auxiliaries[1].name = "spectrum".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateWorker("spectrum".to_string()))
        );

        let mut config = ExperimentConfig::builtin_power_cycle();
        config.timing.grace_period_secs = -1.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTiming("grace_period_secs"))
        );

        let mut config = ExperimentConfig::builtin_power_cycle();
        config.primary.enabled = false;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PrimaryDisabled(_))
        ));

        let mut config = ExperimentConfig::builtin_power_cycle();
        config.sweep = SweepConfig::Cycle {
            parameter: "power".to_string(),
            values: vec![],
        };
        assert!(matches!(config.validate(), Err(ConfigError::Sweep(_))));
    }

    #[test]
    fn disabled_auxiliaries_are_skipped() {
        let mut config = ExperimentConfig::builtin_power_cycle();
        config.auxiliaries[0].enabled = false;
        let names: Vec<&str> = config
            .enabled_auxiliaries()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["sniffer"]);
    }
}
