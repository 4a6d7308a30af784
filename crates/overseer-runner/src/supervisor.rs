use crate::cancel::CancellationToken;
use crate::registry::WorkerRegistry;
use crate::sweep::ParameterTuple;
use crate::worker::{Role, Signal, SpecError, WorkerHandle, WorkerSpec};
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TrialError {
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    #[error("failed to launch {role} worker '{name}' ({program}): {source}")]
    Launch {
        role: Role,
        name: String,
        program: String,
        source: io::Error,
    },
    #[error("failed to poll {role} worker '{name}': {source}")]
    Wait {
        role: Role,
        name: String,
        source: io::Error,
    },
    #[error("trial interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialLog {
    pub role: Role,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TrialResult {
    pub tuple: ParameterTuple,
    pub primary_status: ExitStatus,
    pub logs: Vec<TrialLog>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationOutcome {
    /// Exited before any signal was needed.
    AlreadyExited(ExitStatus),
    Exited(ExitStatus),
    /// Still running after the grace period.
    TimedOut { killed: bool },
    SignalFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminationReport {
    pub name: String,
    pub role: Role,
    pub outcome: TerminationOutcome,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub kill_after_grace: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            grace_period: Duration::from_secs(2),
            kill_after_grace: true,
        }
    }
}

/// Runs one trial at a time: auxiliaries first, the primary last, and a wait
/// that ends only when the primary exits.
pub struct TrialSupervisor {
    registry: WorkerRegistry,
    token: CancellationToken,
    settings: SupervisorSettings,
}

impl TrialSupervisor {
    pub fn new(
        registry: WorkerRegistry,
        token: CancellationToken,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            token,
            settings,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Launches the trial's workers and blocks until the primary exits.
    /// Archiving and auxiliary teardown are left to the caller.
    pub fn run(
        &mut self,
        tuple: &ParameterTuple,
        auxiliaries: &[WorkerSpec],
        primary: &WorkerSpec,
    ) -> Result<TrialResult, TrialError> {
        self.launch(auxiliaries, primary)?;
        self.wait(tuple, auxiliaries, primary)
    }

    /// Starts every auxiliary in order, then the primary. On a launch failure
    /// the workers already started are stopped before the error is returned.
    pub fn launch(
        &mut self,
        auxiliaries: &[WorkerSpec],
        primary: &WorkerSpec,
    ) -> Result<(), TrialError> {
        if !self.registry.is_empty() {
            warn!(
                workers = self.registry.len(),
                "workers left over from previous trial; stopping them first"
            );
            self.shutdown();
        }

        for spec in auxiliaries.iter().chain(std::iter::once(primary)) {
            if self.token.is_cancelled() {
                return Err(TrialError::Interrupted);
            }
            if let Err(e) = self.launch_one(spec) {
                self.shutdown();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn wait(
        &mut self,
        tuple: &ParameterTuple,
        auxiliaries: &[WorkerSpec],
        primary: &WorkerSpec,
    ) -> Result<TrialResult, TrialError> {
        let primary_status = self.wait_for_primary()?;
        info!(%tuple, status = %primary_status, "primary worker exited");

        let logs = auxiliaries
            .iter()
            .chain(std::iter::once(primary))
            .map(|spec| TrialLog {
                role: spec.role,
                name: spec.name.clone(),
                path: spec.log_path.clone(),
            })
            .collect();
        Ok(TrialResult {
            tuple: tuple.clone(),
            primary_status,
            logs,
        })
    }

    fn launch_one(&self, spec: &WorkerSpec) -> Result<(), TrialError> {
        let handle = WorkerHandle::spawn(spec.clone()).map_err(|source| TrialError::Launch {
            role: spec.role,
            name: spec.name.clone(),
            program: spec.program.clone(),
            source,
        })?;
        info!(
            worker = %spec.name,
            role = %spec.role,
            pid = handle.pid(),
            command = %spec.command_line(),
            log = %spec.log_path.display(),
            "worker started"
        );
        self.registry.register(handle);
        Ok(())
    }

    fn wait_for_primary(&self) -> Result<ExitStatus, TrialError> {
        loop {
            if self.token.is_cancelled() {
                return Err(TrialError::Interrupted);
            }
            let polled = self.registry.with_workers(|workers| {
                let mut primary_status = None;
                for worker in workers.iter_mut() {
                    let status = worker.poll().map_err(|source| TrialError::Wait {
                        role: worker.role(),
                        name: worker.name().to_string(),
                        source,
                    })?;
                    match (worker.role(), status) {
                        (Role::Primary, Some(status)) => primary_status = Some(status),
                        (Role::Auxiliary, Some(status)) if !worker.early_exit_reported => {
                            worker.early_exit_reported = true;
                            warn!(worker = worker.name(), %status, "auxiliary worker exited before the primary");
                        }
                        _ => {}
                    }
                }
                Ok::<_, TrialError>(primary_status)
            })?;
            if let Some(status) = polled {
                return Ok(status);
            }
            self.token.sleep(self.settings.poll_interval);
        }
    }

    /// Signals every auxiliary group, allows the grace period to pass and
    /// escalates the stragglers. The exited primary's group is swept and
    /// released in the same pass, leaving the registry empty for the next
    /// trial. Reports cover auxiliaries only. Does not wait for the OS to
    /// reclaim a worker that ignores SIGKILL.
    pub fn terminate_auxiliaries(&mut self) -> Vec<TerminationReport> {
        let mut reports =
            self.stop_workers(|w| w.role() == Role::Auxiliary || w.exited().is_some());
        reports.retain(|r| r.role == Role::Auxiliary);
        reports
    }

    /// Stops every registered worker. Idempotent: the registry is empty
    /// afterwards, so a second call signals nothing.
    pub fn shutdown(&mut self) -> Vec<TerminationReport> {
        self.stop_workers(|_| true)
    }

    fn stop_workers(
        &mut self,
        selected: impl Fn(&WorkerHandle) -> bool,
    ) -> Vec<TerminationReport> {
        // Registry positions of the selected workers; nothing else touches the
        // registry until this returns, so they stay valid.
        let (indices, mut reports): (Vec<usize>, Vec<TerminationReport>) =
            self.registry.with_workers(|workers| {
                workers
                    .iter_mut()
                    .enumerate()
                    .filter(|(_, w)| selected(&**w))
                    .map(|(i, w)| {
                        let leader = w.poll();
                        let outcome = match w.signal(Signal::Terminate) {
                            Err(e) => TerminationOutcome::SignalFailed(e.to_string()),
                            Ok(_) => match leader {
                                Ok(Some(status)) => TerminationOutcome::AlreadyExited(status),
                                _ => TerminationOutcome::TimedOut { killed: false },
                            },
                        };
                        let report = TerminationReport {
                            name: w.name().to_string(),
                            role: w.role(),
                            outcome,
                        };
                        (i, report)
                    })
                    .unzip()
            });

        let deadline = Instant::now() + self.settings.grace_period;
        loop {
            let pending = self.registry.with_workers(|workers| {
                indices
                    .iter()
                    .map(|&i| workers[i].group_alive())
                    .filter(|alive| *alive)
                    .count()
            });
            if pending == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.settings.poll_interval.min(Duration::from_millis(50)));
        }

        let kill = self.settings.kill_after_grace;
        self.registry.with_workers(|workers| {
            for (&i, report) in indices.iter().zip(reports.iter_mut()) {
                let w = &mut workers[i];
                if !w.group_alive() {
                    if matches!(report.outcome, TerminationOutcome::TimedOut { .. }) {
                        if let Some(status) = w.exited() {
                            report.outcome = TerminationOutcome::Exited(status);
                        }
                    }
                    continue;
                }
                warn!(
                    worker = w.name(),
                    pid = w.pid(),
                    leader_exited = w.exited().is_some(),
                    grace_ms = self.settings.grace_period.as_millis() as u64,
                    "worker group did not exit within grace period"
                );
                let killed = kill && matches!(w.signal(Signal::Kill), Ok(true));
                w.detach_reaper();
                if !matches!(report.outcome, TerminationOutcome::SignalFailed(_)) {
                    report.outcome = TerminationOutcome::TimedOut { killed };
                }
            }
            let mut position = 0;
            workers.retain(|_| {
                let keep = !indices.contains(&position);
                position += 1;
                keep
            });
        });

        for report in &reports {
            debug!(worker = %report.name, role = %report.role, outcome = ?report.outcome, "worker stopped");
        }
        reports
    }
}

impl Drop for TrialSupervisor {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sh(role: Role, name: &str, script: &str, dir: &Path) -> WorkerSpec {
        WorkerSpec {
            role,
            name: name.to_string(),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            log_path: dir.join(format!("{}_log.txt", name)),
        }
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(20),
            grace_period: Duration::from_millis(500),
            kill_after_grace: true,
        }
    }

    fn tuple() -> ParameterTuple {
        ParameterTuple::new(vec![("power".to_string(), 80.0)])
    }

    #[test]
    fn trial_waits_for_primary_not_auxiliary() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = TrialSupervisor::new(
            WorkerRegistry::new(),
            CancellationToken::new(),
            fast_settings(),
        );
        let crashing_aux = sh(Role::Auxiliary, "sniffer", "echo boom; exit 3", dir.path());
        let primary = sh(Role::Primary, "tx", "sleep 1; echo Finished", dir.path());

        let started = Instant::now();
        let result = sup.run(&tuple(), &[crashing_aux], &primary).expect("trial");
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert!(result.primary_status.success());
        assert_eq!(result.logs.len(), 2);
        assert_eq!(result.logs[1].role, Role::Primary);

        let reports = sup.terminate_auxiliaries();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].outcome,
            TerminationOutcome::AlreadyExited(_)
        ));
        assert!(sup.registry().is_empty());
    }

    #[test]
    fn terminate_signals_running_auxiliaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = TrialSupervisor::new(
            WorkerRegistry::new(),
            CancellationToken::new(),
            fast_settings(),
        );
        let aux = sh(Role::Auxiliary, "scanner", "echo listening; exec sleep 30", dir.path());
        let primary = sh(Role::Primary, "tx", "exit 0", dir.path());
        sup.run(&tuple(), &[aux], &primary).expect("trial");

        let reports = sup.terminate_auxiliaries();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, TerminationOutcome::Exited(_)));
        assert!(sup.shutdown().is_empty());
    }

    #[test]
    fn stubborn_auxiliary_times_out_and_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = TrialSupervisor::new(
            WorkerRegistry::new(),
            CancellationToken::new(),
            fast_settings(),
        );
        let aux = sh(
            Role::Auxiliary,
            "stubborn",
            "trap '' TERM; while true; do sleep 1; done",
            dir.path(),
        );
        let primary = sh(Role::Primary, "tx", "sleep 0.3", dir.path());
        sup.run(&tuple(), &[aux], &primary).expect("trial");

        let started = Instant::now();
        let reports = sup.terminate_auxiliaries();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            reports[0].outcome,
            TerminationOutcome::TimedOut { killed: true }
        );
    }

    fn process_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[test]
    fn backgrounded_helpers_are_stopped_with_their_group() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let mut sup =
            TrialSupervisor::new(registry.clone(), CancellationToken::new(), fast_settings());
        let aux = sh(Role::Auxiliary, "sniffer", "sleep 30 & echo $!; exit 0", dir.path());
        let primary = sh(Role::Primary, "tx", "sleep 30 & echo $!; sleep 0.3", dir.path());
        sup.run(&tuple(), &[aux], &primary).expect("trial");

        let helper = |name: &str| -> i32 {
            let log = dir.path().join(format!("{}_log.txt", name));
            std::fs::read_to_string(log).unwrap().trim().parse().unwrap()
        };
        let (aux_helper, tx_helper) = (helper("sniffer"), helper("tx"));
        assert!(process_running(aux_helper));
        assert!(process_running(tx_helper));

        let reports = sup.terminate_auxiliaries();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].role, Role::Auxiliary);
        assert!(registry.is_empty());

        let deadline = Instant::now() + Duration::from_secs(5);
        while (process_running(aux_helper) || process_running(tx_helper))
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!process_running(aux_helper), "auxiliary helper left running");
        assert!(!process_running(tx_helper), "primary helper left running");
    }

    #[test]
    fn reports_follow_their_own_worker_when_names_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = TrialSupervisor::new(
            WorkerRegistry::new(),
            CancellationToken::new(),
            fast_settings(),
        );
        let quick = sh(Role::Auxiliary, "listener", "exit 0", dir.path());
        let mut lasting = sh(Role::Auxiliary, "listener", "exec sleep 30", dir.path());
        lasting.log_path = dir.path().join("listener_2_log.txt");
        let primary = sh(Role::Primary, "tx", "sleep 0.3", dir.path());
        sup.run(&tuple(), &[quick, lasting], &primary).expect("trial");

        let reports = sup.terminate_auxiliaries();
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            reports[0].outcome,
            TerminationOutcome::AlreadyExited(_)
        ));
        assert!(matches!(reports[1].outcome, TerminationOutcome::Exited(_)));
    }

    #[test]
    fn consecutive_trials_start_with_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let mut sup =
            TrialSupervisor::new(registry.clone(), CancellationToken::new(), fast_settings());
        for _ in 0..2 {
            let aux = sh(Role::Auxiliary, "scanner", "exec sleep 30", dir.path());
            let primary = sh(Role::Primary, "tx", "exit 0", dir.path());
            sup.launch(std::slice::from_ref(&aux), &primary).expect("launch");
            assert_eq!(registry.len(), 2);
            sup.wait(&tuple(), &[aux], &primary).expect("wait");
            sup.terminate_auxiliaries();
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn launch_failure_stops_already_started_workers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        let mut sup =
            TrialSupervisor::new(registry.clone(), CancellationToken::new(), fast_settings());
        let aux = sh(Role::Auxiliary, "scanner", "exec sleep 30", dir.path());
        let mut primary = sh(Role::Primary, "tx", "", dir.path());
        primary.program = dir.path().join("missing-tx").to_string_lossy().to_string();

        let err = sup.run(&tuple(), &[aux], &primary).expect_err("launch must fail");
        match err {
            TrialError::Launch { role, name, .. } => {
                assert_eq!(role, Role::Primary);
                assert_eq!(name, "tx");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn cancelled_token_interrupts_wait() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let mut sup = TrialSupervisor::new(WorkerRegistry::new(), token.clone(), fast_settings());
        let primary = sh(Role::Primary, "tx", "exec sleep 30", dir.path());
        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });
        let err = sup.run(&tuple(), &[], &primary).expect_err("interrupted");
        assert!(matches!(err, TrialError::Interrupted));
        canceller.join().unwrap();
        let reports = sup.shutdown();
        assert_eq!(reports.len(), 1);
        assert!(sup.shutdown().is_empty());
    }
}
