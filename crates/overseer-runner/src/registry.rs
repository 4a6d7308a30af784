use crate::cancel::CancellationToken;
use crate::worker::{Signal, WorkerHandle};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Every live worker of the active trial, shared between the coordinator and
/// the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<Vec<WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: WorkerHandle) {
        self.lock().push(handle);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs `f` with the registry locked. Keep `f` short: the interrupt
    /// handler waits on the same lock.
    pub fn with_workers<R>(&self, f: impl FnOnce(&mut Vec<WorkerHandle>) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .iter_mut()
            .map(|w| w.group_alive())
            .filter(|alive| *alive)
            .count()
    }

    /// Signals every registered worker group that still has members and has
    /// not already been sent `signal`. Returns how many were newly signalled.
    pub fn signal_all(&self, signal: Signal) -> usize {
        let mut sent = 0;
        for worker in self.lock().iter_mut() {
            match worker.signal(signal) {
                Ok(true) => {
                    sent += 1;
                    info!(worker = worker.name(), role = %worker.role(), pid = worker.pid(), ?signal, "worker signalled");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(worker = worker.name(), pid = worker.pid(), error = %e, "failed to signal worker")
                }
            }
        }
        sent
    }

    pub fn drain(&self) -> Vec<WorkerHandle> {
        std::mem::take(&mut *self.lock())
    }
}

/// What the process-wide interrupt handler holds: cancelling the token stops
/// every blocking wait, and the registry lets the handler reach the workers
/// immediately instead of waiting for the coordinator to notice.
#[derive(Debug, Clone)]
pub struct Interrupter {
    token: CancellationToken,
    registry: WorkerRegistry,
}

impl Interrupter {
    pub fn new(token: CancellationToken, registry: WorkerRegistry) -> Self {
        Self { token, registry }
    }

    /// Safe to call repeatedly and with no workers running.
    pub fn interrupt(&self) -> usize {
        self.token.cancel();
        self.registry.signal_all(Signal::Terminate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Role, WorkerSpec};
    use std::time::Duration;

    fn sleeper(dir: &std::path::Path, name: &str) -> WorkerHandle {
        WorkerHandle::spawn(WorkerSpec {
            role: Role::Auxiliary,
            name: name.to_string(),
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            log_path: dir.join(format!("{}_log.txt", name)),
        })
        .expect("spawn sleeper")
    }

    #[test]
    fn interrupt_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new();
        registry.register(sleeper(dir.path(), "a"));
        registry.register(sleeper(dir.path(), "b"));
        let token = CancellationToken::new();
        let interrupter = Interrupter::new(token.clone(), registry.clone());

        assert_eq!(interrupter.interrupt(), 2);
        assert_eq!(interrupter.interrupt(), 0);
        assert!(token.is_cancelled());

        let mut workers = registry.drain();
        for w in workers.iter_mut() {
            let status = w
                .wait_timeout(Duration::from_secs(10), Duration::from_millis(20))
                .unwrap();
            assert!(status.is_some(), "worker {} still running", w.name());
        }
    }

    #[test]
    fn interrupt_with_no_workers_is_harmless() {
        let interrupter = Interrupter::new(CancellationToken::new(), WorkerRegistry::new());
        assert_eq!(interrupter.interrupt(), 0);
        assert_eq!(interrupter.interrupt(), 0);
    }
}
