use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveClock, ArchiveReport, LogArchiver};
use crate::cancel::CancellationToken;
use crate::config::{ExperimentConfig, RunMode};
use crate::ledger::{
    acquire_log_dir_lock, LogDirLock, RunLedger, RunStatus, TrialEntry, TrialOutcome,
};
use crate::registry::{Interrupter, WorkerRegistry};
use crate::supervisor::{TerminationOutcome, TrialError, TrialLog, TrialSupervisor};
use crate::sweep::{ParameterSweep, ParameterTuple};
use crate::worker::{Role, WorkerSpec};

pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Idle,
    Launching,
    Running,
    Archiving,
    Terminating,
    ShuttingDown,
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrialPhase::Idle => "idle",
            TrialPhase::Launching => "launching",
            TrialPhase::Running => "running",
            TrialPhase::Archiving => "archiving",
            TrialPhase::Terminating => "terminating",
            TrialPhase::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub log_dir: PathBuf,
    pub trials_attempted: usize,
    pub trials_failed: usize,
    pub logs_archived: usize,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.trials_failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Drives the sweep one trial at a time:
/// launch, wait for the primary, archive, terminate auxiliaries, settle.
pub struct CycleController {
    supervisor: TrialSupervisor,
    config: ExperimentConfig,
    sweep: ParameterSweep,
    archiver: LogArchiver,
    clock: ArchiveClock,
    ledger: RunLedger,
    token: CancellationToken,
    registry: WorkerRegistry,
    phase: TrialPhase,
    summary: RunSummary,
    _lock: LogDirLock,
}

impl CycleController {
    /// Validates the config and claims the log directory. Failures here are
    /// the only fatal ones.
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("failed to create log directory {}", config.log_dir.display())
        })?;
        let lock = acquire_log_dir_lock(&config.log_dir)?;
        let run_id = format!("run_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let ledger = RunLedger::open(&config.log_dir, &run_id)?;
        let sweep = config.sweep.build()?;

        let token = CancellationToken::new();
        let registry = WorkerRegistry::new();
        let supervisor = TrialSupervisor::new(
            registry.clone(),
            token.clone(),
            config.supervisor_settings(),
        );
        let summary = RunSummary {
            run_id,
            log_dir: config.log_dir.clone(),
            ..RunSummary::default()
        };
        Ok(Self {
            supervisor,
            archiver: LogArchiver::new(&config.log_dir),
            config,
            sweep,
            clock: ArchiveClock::new(),
            ledger,
            token,
            registry,
            phase: TrialPhase::Idle,
            summary,
            _lock: lock,
        })
    }

    /// Handle for the process-wide interrupt handler.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter::new(self.token.clone(), self.registry.clone())
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Runs according to the configured mode.
    pub fn run(&mut self) -> Result<RunSummary> {
        match self.config.mode {
            RunMode::Once => self.run_once(),
            RunMode::Forever => self.run_forever(),
        }
    }

    /// One pass: every grid tuple, or one turn through a cycle.
    pub fn run_once(&mut self) -> Result<RunSummary> {
        let pass = self.sweep.pass_len();
        self.run_trials(Some(pass))
    }

    /// Until the sweep is exhausted, which a cycle never is.
    pub fn run_forever(&mut self) -> Result<RunSummary> {
        self.run_trials(None)
    }

    pub fn run_trials(&mut self, limit: Option<usize>) -> Result<RunSummary> {
        info!(
            run_id = %self.summary.run_id,
            experiment = %self.config.name,
            parameters = ?self.sweep.axis_names(),
            trials = ?self.sweep.len_hint(),
            log_dir = %self.config.log_dir.display(),
            "run started"
        );
        let mut executed = 0usize;
        while limit.map_or(true, |l| executed < l) {
            if self.token.is_cancelled() {
                break;
            }
            if executed > 0 && !self.token.sleep(self.config.settle_delay()) {
                break;
            }
            let Some(tuple) = self.sweep.next() else {
                break;
            };
            executed += 1;
            self.run_trial(&tuple);
        }
        self.finish()
    }

    fn set_phase(&mut self, phase: TrialPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
        }
    }

    fn build_specs(
        &self,
        tuple: &ParameterTuple,
    ) -> Result<(Vec<WorkerSpec>, WorkerSpec), TrialError> {
        let log_dir = &self.config.log_dir;
        let base_dir = &self.config.base_dir;
        let auxiliaries = self
            .config
            .enabled_auxiliaries()
            .map(|t| t.auxiliary_spec(log_dir, base_dir))
            .collect();
        let primary = self.config.primary.primary_spec(tuple, log_dir, base_dir)?;
        Ok((auxiliaries, primary))
    }

    fn run_trial(&mut self, tuple: &ParameterTuple) {
        self.summary.trials_attempted += 1;
        let trial = self.summary.trials_attempted;
        info!(trial, %tuple, "trial starting");
        self.set_phase(TrialPhase::Launching);
        if let Err(e) = self.ledger.write_status(RunStatus::Running, Some((trial, tuple))) {
            warn!(error = %e, "failed to update run status");
        }

        let launched = self.build_specs(tuple).and_then(|(auxiliaries, primary)| {
            self.supervisor.launch(&auxiliaries, &primary)?;
            Ok((auxiliaries, primary))
        });
        let (auxiliaries, primary) = match launched {
            Ok(specs) => specs,
            Err(e) => return self.fail_trial(trial, tuple, e, None),
        };

        self.set_phase(TrialPhase::Running);
        let result = match self.supervisor.wait(tuple, &auxiliaries, &primary) {
            Ok(result) => result,
            Err(e) => {
                let logs = trial_logs(&auxiliaries, &primary);
                return self.fail_trial(trial, tuple, e, Some(logs.as_slice()));
            }
        };
        if self.token.is_cancelled() {
            return self.fail_trial(trial, tuple, TrialError::Interrupted, None);
        }

        self.set_phase(TrialPhase::Archiving);
        let report = self.archive(tuple, &result.logs);

        self.set_phase(TrialPhase::Terminating);
        self.terminate_auxiliaries(trial);

        let code = result.primary_status.code();
        let outcome = if result.primary_status.success() {
            TrialOutcome::Completed
        } else {
            warn!(trial, %tuple, status = %result.primary_status, "primary worker exited unsuccessfully");
            TrialOutcome::PrimaryFailed
        };
        let mut entry = TrialEntry::new(trial, tuple, outcome).with_archive(&report);
        entry.primary_exit_code = code;
        self.record(&entry);
        info!(trial, %tuple, archived = report.records.len(), "trial complete");
        self.set_phase(TrialPhase::Idle);
    }

    fn archive(&mut self, tuple: &ParameterTuple, logs: &[TrialLog]) -> ArchiveReport {
        let stamp = self.clock.stamp(Local::now().naive_local());
        let report = self.archiver.archive(tuple, logs, &stamp);
        self.summary.logs_archived += report.records.len();
        if !report.is_ok() {
            error!(
                %tuple,
                collisions = report.collisions.len(),
                failures = report.failures.len(),
                "archive step incomplete; affected logs left in place"
            );
        }
        report
    }

    fn terminate_auxiliaries(&mut self, trial: usize) {
        for report in self.supervisor.terminate_auxiliaries() {
            match report.outcome {
                TerminationOutcome::TimedOut { killed } => {
                    warn!(trial, worker = %report.name, killed, "auxiliary worker termination timed out")
                }
                TerminationOutcome::SignalFailed(msg) => {
                    warn!(trial, worker = %report.name, error = %msg, "could not signal auxiliary worker")
                }
                _ => {}
            }
        }
    }

    /// Per-trial failure: report it, keep whatever logs exist, move on.
    fn fail_trial(
        &mut self,
        trial: usize,
        tuple: &ParameterTuple,
        err: TrialError,
        logs: Option<&[TrialLog]>,
    ) {
        if matches!(err, TrialError::Interrupted) {
            warn!(trial, %tuple, phase = %self.phase, "trial interrupted; skipping archive");
            self.record(&TrialEntry::new(trial, tuple, TrialOutcome::Interrupted));
            return;
        }

        let role = match &err {
            TrialError::Launch { role, .. } | TrialError::Wait { role, .. } => *role,
            _ => Role::Primary,
        };
        error!(trial, %tuple, %role, error = %err, "trial failed");
        self.summary.trials_failed += 1;
        self.supervisor.shutdown();

        let mut entry = TrialEntry::new(trial, tuple, TrialOutcome::LaunchFailed);
        entry.error = Some(err.to_string());
        let logs = match logs {
            Some(logs) => logs.to_vec(),
            None => self.expected_logs(),
        };
        let existing: Vec<TrialLog> = logs.into_iter().filter(|l| l.path.exists()).collect();
        if !existing.is_empty() {
            self.set_phase(TrialPhase::Archiving);
            let report = self.archive(tuple, &existing);
            entry = entry.with_archive(&report);
        }
        self.record(&entry);
        self.set_phase(TrialPhase::Idle);
    }

    fn expected_logs(&self) -> Vec<TrialLog> {
        let log_dir = &self.config.log_dir;
        let mut logs: Vec<TrialLog> = self
            .config
            .enabled_auxiliaries()
            .map(|t| TrialLog {
                role: Role::Auxiliary,
                name: t.name.clone(),
                path: t.log_path(log_dir),
            })
            .collect();
        logs.push(TrialLog {
            role: Role::Primary,
            name: self.config.primary.name.clone(),
            path: self.config.primary.log_path(log_dir),
        });
        logs
    }

    fn record(&self, entry: &TrialEntry) {
        if let Err(e) = self.ledger.append(entry) {
            warn!(trial = entry.trial, error = %e, "failed to append trial ledger");
        }
    }

    fn finish(&mut self) -> Result<RunSummary> {
        let status = if self.token.is_cancelled() {
            self.set_phase(TrialPhase::ShuttingDown);
            let live = self.registry.live_count();
            let stopped = self.supervisor.shutdown();
            warn!(workers = stopped.len(), live, "interrupted; all workers signalled");
            self.summary.interrupted = true;
            RunStatus::Interrupted
        } else {
            self.supervisor.shutdown();
            self.set_phase(TrialPhase::Idle);
            if self.summary.trials_failed > 0 {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            }
        };
        self.ledger.complete(status)?;
        info!(
            run_id = %self.summary.run_id,
            trials = self.summary.trials_attempted,
            failed = self.summary.trials_failed,
            archived = self.summary.logs_archived,
            interrupted = self.summary.interrupted,
            "run finished"
        );
        Ok(self.summary.clone())
    }
}

fn trial_logs(auxiliaries: &[WorkerSpec], primary: &WorkerSpec) -> Vec<TrialLog> {
    auxiliaries
        .iter()
        .chain(std::iter::once(primary))
        .map(|spec| TrialLog {
            role: spec.role,
            name: spec.name.clone(),
            path: spec.log_path.clone(),
        })
        .collect()
}
