use crate::sweep::{format_value, ParameterTuple};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Auxiliary,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SpecError {
    #[error("worker '{worker}': parameter '{parameter}' missing from tuple")]
    MissingParameter { worker: String, parameter: String },
    #[error("worker '{worker}': parameter '{parameter}' = {value} outside [{min}, {max}]")]
    OutOfRange {
        worker: String,
        parameter: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("worker '{worker}': parameter '{parameter}' = {value} must be an integer")]
    NotIntegral {
        worker: String,
        parameter: String,
        value: String,
    },
}

/// How a worker's executable is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Launcher {
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Python {
        script: String,
        #[serde(default = "default_interpreter")]
        interpreter: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Conda {
        env: String,
        script: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_interpreter() -> String {
    "python3".to_string()
}

impl Launcher {
    /// Program and leading arguments, with path-like parts resolved against
    /// `base_dir`.
    pub fn command(&self, base_dir: &Path) -> (String, Vec<String>) {
        match self {
            Launcher::Exec { program, args } => (resolve_part(program, base_dir), args.clone()),
            Launcher::Python {
                script,
                interpreter,
                args,
            } => {
                let mut out = vec!["-u".to_string(), resolve_part(script, base_dir)];
                out.extend(args.iter().cloned());
                (interpreter.clone(), out)
            }
            Launcher::Conda { env, script, args } => {
                let mut out = vec![
                    "run".to_string(),
                    "--no-capture-output".to_string(),
                    "-n".to_string(),
                    env.clone(),
                    "python".to_string(),
                    "-u".to_string(),
                    resolve_part(script, base_dir),
                ];
                out.extend(args.iter().cloned());
                ("conda".to_string(), out)
            }
        }
    }
}

fn part_looks_like_path(part: &str) -> bool {
    part.starts_with("./") || part.starts_with("../") || (part.contains('/') && !part.starts_with('/'))
}

fn resolve_part(part: &str, base_dir: &Path) -> String {
    if part_looks_like_path(part) {
        normalize_path(&base_dir.join(part))
            .to_string_lossy()
            .to_string()
    } else {
        part.to_string()
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Maps one tuple parameter to a command-line flag on the primary worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub parameter: String,
    pub flag: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub integer: bool,
}

impl ParameterBinding {
    fn check(&self, worker: &str, value: f64) -> Result<(), SpecError> {
        let below = self.min.map(|m| value < m).unwrap_or(false);
        let above = self.max.map(|m| value > m).unwrap_or(false);
        if below || above {
            let bound = |b: Option<f64>| b.map(format_value).unwrap_or_else(|| "..".to_string());
            return Err(SpecError::OutOfRange {
                worker: worker.to_string(),
                parameter: self.parameter.clone(),
                value: format_value(value),
                min: bound(self.min),
                max: bound(self.max),
            });
        }
        if self.integer && value.fract() != 0.0 {
            return Err(SpecError::NotIntegral {
                worker: worker.to_string(),
                parameter: self.parameter.clone(),
                value: format_value(value),
            });
        }
        Ok(())
    }
}

/// Static description of a worker, turned into a fresh `WorkerSpec` per trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub name: String,
    pub launch: Launcher,
    /// Primary only: tuple values appended as `flag value` pairs, in order.
    #[serde(default)]
    pub parameters: Vec<ParameterBinding>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WorkerTemplate {
    pub fn log_path(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!("{}_log.txt", self.name))
    }

    pub fn auxiliary_spec(&self, log_dir: &Path, base_dir: &Path) -> WorkerSpec {
        let (program, args) = self.launch.command(base_dir);
        WorkerSpec {
            role: Role::Auxiliary,
            name: self.name.clone(),
            program,
            args,
            log_path: self.log_path(log_dir),
        }
    }

    /// Builds the primary's argument list from `tuple`, validating every bound
    /// value before anything is launched.
    pub fn primary_spec(
        &self,
        tuple: &ParameterTuple,
        log_dir: &Path,
        base_dir: &Path,
    ) -> Result<WorkerSpec, SpecError> {
        let (program, mut args) = self.launch.command(base_dir);
        for binding in &self.parameters {
            let value = tuple
                .get(&binding.parameter)
                .ok_or_else(|| SpecError::MissingParameter {
                    worker: self.name.clone(),
                    parameter: binding.parameter.clone(),
                })?;
            binding.check(&self.name, value)?;
            args.push(binding.flag.clone());
            args.push(format_value(value));
        }
        Ok(WorkerSpec {
            role: Role::Primary,
            name: self.name.clone(),
            program,
            args,
            log_path: self.log_path(log_dir),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub role: Role,
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub log_path: PathBuf,
}

impl WorkerSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A launched worker. The process leads its own process group, so signals
/// reach any helpers it forks as well.
#[derive(Debug)]
pub struct WorkerHandle {
    spec: WorkerSpec,
    child: Option<Child>,
    pid: u32,
    started: DateTime<Local>,
    exited: Option<ExitStatus>,
    term_sent: bool,
    kill_sent: bool,
    group_gone: bool,
    pub(crate) early_exit_reported: bool,
}

impl WorkerHandle {
    /// Starts the worker with stdout and stderr both writing to its log file.
    pub fn spawn(spec: WorkerSpec) -> io::Result<Self> {
        let log = open_log(&spec.log_path)?;
        let log_err = log.try_clone()?;
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()?;
        let pid = child.id();
        Ok(Self {
            spec,
            child: Some(child),
            pid,
            started: Local::now(),
            exited: None,
            term_sent: false,
            kill_sent: false,
            group_gone: false,
            early_exit_reported: false,
        })
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn role(&self) -> Role {
        self.spec.role
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    pub fn exited(&self) -> Option<ExitStatus> {
        self.exited
    }

    pub fn termination_sent(&self) -> bool {
        self.term_sent
    }

    /// Non-blocking exit check; reaps the process when it has finished.
    pub fn poll(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exited.is_some() {
            return Ok(self.exited);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        if let Some(status) = child.try_wait()? {
            self.exited = Some(status);
        }
        Ok(self.exited)
    }

    /// Sends `signal` to the worker's process group, whether or not the
    /// leader is still running. Returns `false` without signalling when the
    /// group already received it or has no members left.
    pub fn signal(&mut self, signal: Signal) -> io::Result<bool> {
        let already = match signal {
            Signal::Terminate => self.term_sent,
            Signal::Kill => self.kill_sent,
        };
        if already || self.group_gone {
            return Ok(false);
        }
        // A zombie leader keeps the group alive; reap it first so an empty
        // group reports ESRCH.
        self.poll()?;
        if !self.killpg(signal.raw())? {
            return Ok(false);
        }
        match signal {
            Signal::Terminate => self.term_sent = true,
            Signal::Kill => self.kill_sent = true,
        }
        Ok(true)
    }

    /// True while any process of the worker's group exists, including
    /// helpers that outlived the leader.
    pub fn group_alive(&mut self) -> bool {
        if self.group_gone {
            return false;
        }
        let _ = self.poll();
        matches!(self.killpg(0), Ok(true))
    }

    fn killpg(&mut self, raw: libc::c_int) -> io::Result<bool> {
        let rc = unsafe { libc::killpg(self.pid as libc::pid_t, raw) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            self.group_gone = true;
            return Ok(false);
        }
        Err(err)
    }

    /// Polls until the worker exits or `timeout` elapses.
    pub fn wait_timeout(
        &mut self,
        timeout: Duration,
        interval: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(interval.min(deadline - now));
        }
    }

    /// Hands a still-running child to a background thread that reaps it, so
    /// the caller never blocks on a worker stuck in shutdown.
    pub fn detach_reaper(&mut self) {
        if self.exited.is_some() {
            return;
        }
        if let Some(mut child) = self.child.take() {
            let name = self.spec.name.clone();
            thread::spawn(move || match child.wait() {
                Ok(status) => tracing::debug!(worker = %name, %status, "late worker reaped"),
                Err(e) => tracing::warn!(worker = %name, error = %e, "failed to reap worker"),
            });
        }
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}
