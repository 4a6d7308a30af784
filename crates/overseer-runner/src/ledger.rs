use anyhow::{anyhow, Result};
use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveRecord, ArchiveReport};
use crate::sweep::ParameterTuple;

pub const LOCK_FILE: &str = "overseer.lock";
pub const RUN_CONTROL_FILE: &str = "run_control.json";
pub const TRIAL_LEDGER_FILE: &str = "trials.jsonl";

/// Exclusive claim on a log directory. Two controllers sharing one directory
/// would also share serial ports and transient log names.
#[derive(Debug)]
pub struct LogDirLock {
    path: PathBuf,
}

impl Drop for LogDirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_log_dir_lock(log_dir: &Path) -> Result<LogDirLock> {
    fs::create_dir_all(log_dir)?;
    let lock_path = log_dir.join(LOCK_FILE);
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Local::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(LogDirLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "log directory {} is in use by another controller (remove {} if stale)",
            log_dir.display(),
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

/// Replaces `path` through a sibling temp file so a reader polling the status
/// never sees a half-written document. The log-dir lock makes the temp name
/// private to this process.
fn replace_json(path: &Path, value: &Value) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(RUN_CONTROL_FILE);
    let tmp = dir.join(format!(".{}.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Ok(dir) = fs::File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed,
    PrimaryFailed,
    LaunchFailed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialEntry {
    pub trial: usize,
    pub parameters: ParameterTuple,
    pub outcome: TrialOutcome,
    pub primary_exit_code: Option<i32>,
    pub error: Option<String>,
    pub archived: Vec<ArchiveRecord>,
    pub missing_logs: Vec<PathBuf>,
    pub collisions: Vec<ArchiveRecord>,
    pub finished_at: String,
}

impl TrialEntry {
    pub fn new(trial: usize, parameters: &ParameterTuple, outcome: TrialOutcome) -> Self {
        Self {
            trial,
            parameters: parameters.clone(),
            outcome,
            primary_exit_code: None,
            error: None,
            archived: Vec::new(),
            missing_logs: Vec::new(),
            collisions: Vec::new(),
            finished_at: Local::now().to_rfc3339(),
        }
    }

    pub fn with_archive(mut self, report: &ArchiveReport) -> Self {
        self.archived = report.records.clone();
        self.missing_logs = report.misses.clone();
        self.collisions = report.collisions.clone();
        self
    }
}

/// Run status file plus an append-only JSONL record of every trial, both in
/// the log directory.
pub struct RunLedger {
    log_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunLedger {
    pub fn open(log_dir: &Path, run_id: &str) -> Result<Self> {
        let ledger = Self {
            log_dir: log_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        };
        ledger.write_status(RunStatus::Running, None)?;
        Ok(ledger)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status_path(&self) -> PathBuf {
        self.log_dir.join(RUN_CONTROL_FILE)
    }

    pub fn trials_path(&self) -> PathBuf {
        self.log_dir.join(TRIAL_LEDGER_FILE)
    }

    pub fn write_status(
        &self,
        status: RunStatus,
        active: Option<(usize, &ParameterTuple)>,
    ) -> Result<()> {
        let payload = json!({
            "schema_version": "run_control_v1",
            "run_id": self.run_id,
            "pid": std::process::id(),
            "status": status,
            "active_trial": active.map(|(i, _)| i),
            "active_parameters": active.map(|(_, t)| t),
            "updated_at": Local::now().to_rfc3339(),
        });
        replace_json(&self.status_path(), &payload)
    }

    pub fn append(&self, entry: &TrialEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&json!({
            "run_id": self.run_id,
            "entry": entry,
        }))?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trials_path())?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn complete(&mut self, status: RunStatus) -> Result<()> {
        self.write_status(status, None)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunLedger {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.write_status(RunStatus::Failed, None);
        }
    }
}
