use crate::supervisor::TrialLog;
use crate::sweep::ParameterTuple;
use crate::worker::Role;
use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("log not found: {}", .0.display())]
    Miss(PathBuf),
    #[error("refusing to overwrite {} with {}", .to.display(), .from.display())]
    Collision { from: PathBuf, to: PathBuf },
    #[error("failed to move {}: {err}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct ArchiveReport {
    pub records: Vec<ArchiveRecord>,
    pub misses: Vec<PathBuf>,
    pub collisions: Vec<ArchiveRecord>,
    pub failures: Vec<ArchiveFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveFailure {
    pub source: PathBuf,
    pub message: String,
}

impl ArchiveReport {
    /// Misses are expected when a worker never wrote output; collisions and
    /// I/O failures are not.
    pub fn is_ok(&self) -> bool {
        self.collisions.is_empty() && self.failures.is_empty()
    }
}

/// Hands out archive timestamps with second resolution, never repeating a
/// second within one session so that back-to-back trials with identical
/// parameters still get distinct names.
#[derive(Debug, Default)]
pub struct ArchiveClock {
    last: Option<NaiveDateTime>,
}

impl ArchiveClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, now: NaiveDateTime) -> NaiveDateTime {
        let now = now.with_nanosecond(0).unwrap_or(now);
        let next = match self.last {
            Some(last) if now <= last => last + Duration::seconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

pub struct LogArchiver {
    log_dir: PathBuf,
}

impl LogArchiver {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// `tx_sf7_gain0.5_20250101_120000.txt` for the primary,
    /// `sniffer_20250101_120000.txt` for auxiliaries.
    pub fn destination(
        &self,
        log: &TrialLog,
        tuple: &ParameterTuple,
        timestamp: &NaiveDateTime,
    ) -> PathBuf {
        let ts = timestamp.format(TIMESTAMP_FORMAT);
        let file_name = match log.role {
            Role::Primary if !tuple.is_empty() => {
                format!("{}_{}_{}.txt", log.name, tuple.file_token(), ts)
            }
            _ => format!("{}_{}.txt", log.name, ts),
        };
        self.log_dir.join(file_name)
    }

    pub fn archive(
        &self,
        tuple: &ParameterTuple,
        logs: &[TrialLog],
        timestamp: &NaiveDateTime,
    ) -> ArchiveReport {
        let mut report = ArchiveReport::default();
        for log in logs {
            let destination = self.destination(log, tuple, timestamp);
            match move_without_clobber(&log.path, &destination) {
                Ok(()) => {
                    info!(worker = %log.name, to = %destination.display(), "log archived");
                    report.records.push(ArchiveRecord {
                        source: log.path.clone(),
                        destination,
                    });
                }
                Err(ArchiveError::Miss(path)) => {
                    warn!(worker = %log.name, path = %path.display(), "no log to archive");
                    report.misses.push(path);
                }
                Err(ArchiveError::Collision { from, to }) => {
                    error!(
                        worker = %log.name,
                        from = %from.display(),
                        to = %to.display(),
                        "archive destination exists; log left in place"
                    );
                    report.collisions.push(ArchiveRecord {
                        source: from,
                        destination: to,
                    });
                }
                Err(e @ ArchiveError::Io { .. }) => {
                    error!(worker = %log.name, error = %e, "failed to archive log");
                    report.failures.push(ArchiveFailure {
                        source: log.path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

/// Moves `from` to `to` unless `to` already exists. A hard link fails
/// atomically on an existing destination; filesystems without hard links fall
/// back to a checked rename.
fn move_without_clobber(from: &Path, to: &Path) -> Result<(), ArchiveError> {
    let io_err = |err: io::Error| ArchiveError::Io {
        path: from.to_path_buf(),
        err,
    };
    if fs::symlink_metadata(from).is_err() {
        return Err(ArchiveError::Miss(from.to_path_buf()));
    }
    match fs::hard_link(from, to) {
        Ok(()) => fs::remove_file(from).map_err(io_err),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(ArchiveError::Collision {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(ArchiveError::Miss(from.to_path_buf()))
        }
        Err(_) => {
            if fs::symlink_metadata(to).is_ok() {
                return Err(ArchiveError::Collision {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                });
            }
            fs::rename(from, to).map_err(io_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn logs(dir: &Path) -> Vec<TrialLog> {
        vec![
            TrialLog {
                role: Role::Auxiliary,
                name: "sniffer".to_string(),
                path: dir.join("sniffer_log.txt"),
            },
            TrialLog {
                role: Role::Primary,
                name: "tx".to_string(),
                path: dir.join("tx_log.txt"),
            },
        ]
    }

    fn tuple() -> ParameterTuple {
        ParameterTuple::new(vec![
            ("sf".to_string(), 7.0),
            ("gain".to_string(), 0.5),
            ("delay".to_string(), 0.002),
        ])
    }

    #[test]
    fn destination_embeds_parameters_for_primary_only() {
        let archiver = LogArchiver::new(Path::new("/logs"));
        let l = logs(Path::new("/logs"));
        let ts = at(9, 5, 7);
        assert_eq!(
            archiver.destination(&l[1], &tuple(), &ts),
            PathBuf::from("/logs/tx_sf7_gain0.5_delay0.002_20250314_090507.txt")
        );
        assert_eq!(
            archiver.destination(&l[0], &tuple(), &ts),
            PathBuf::from("/logs/sniffer_20250314_090507.txt")
        );
    }

    #[test]
    fn archive_moves_logs_and_reports_misses() {
        let dir = tempfile::tempdir().unwrap();
        let l = logs(dir.path());
        fs::write(&l[1].path, "Finished\n").unwrap();

        let report = LogArchiver::new(dir.path()).archive(&tuple(), &l, &at(10, 0, 0));
        assert!(report.is_ok());
        assert_eq!(report.misses, vec![l[0].path.clone()]);
        assert_eq!(report.records.len(), 1);
        assert!(!l[1].path.exists());
        let archived = fs::read_to_string(&report.records[0].destination).unwrap();
        assert_eq!(archived, "Finished\n");
    }

    #[test]
    fn archive_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let l = logs(dir.path());
        let archiver = LogArchiver::new(dir.path());
        let ts = at(10, 0, 0);
        let taken = archiver.destination(&l[1], &tuple(), &ts);
        fs::write(&taken, "earlier trial").unwrap();
        fs::write(&l[1].path, "this trial").unwrap();

        let report = archiver.archive(&tuple(), &l[1..], &ts);
        assert!(!report.is_ok());
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(fs::read_to_string(&taken).unwrap(), "earlier trial");
        assert_eq!(fs::read_to_string(&l[1].path).unwrap(), "this trial");
    }

    #[test]
    fn clock_never_repeats_a_second() {
        let mut clock = ArchiveClock::new();
        let first = clock.stamp(at(10, 0, 0));
        let second = clock.stamp(at(10, 0, 0));
        let third = clock.stamp(at(9, 59, 59));
        let later = clock.stamp(at(11, 0, 0));
        assert_eq!(first, at(10, 0, 0));
        assert_eq!(second, at(10, 0, 1));
        assert_eq!(third, at(10, 0, 2));
        assert_eq!(later, at(11, 0, 0));
    }

    #[test]
    fn identical_tuples_get_distinct_destinations() {
        let archiver = LogArchiver::new(Path::new("/logs"));
        let mut clock = ArchiveClock::new();
        let l = logs(Path::new("/logs"));
        let now = at(12, 0, 0);
        let a = archiver.destination(&l[1], &tuple(), &clock.stamp(now));
        let b = archiver.destination(&l[1], &tuple(), &clock.stamp(now));
        assert_ne!(a, b);
        let c = archiver.destination(&l[0], &tuple(), &clock.stamp(now));
        assert_ne!(a, c);
    }
}
