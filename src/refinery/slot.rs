//! Merge slot: the rig-wide single-writer lock on mainline.
//!
//! Only one batch may mutate the target branch at a time. The slot is
//! advisory and process-external; the processor refuses to run when it
//! cannot claim it. A crashed holder leaks the slot, recovery is the
//! collaborator's concern.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use fd_lock::{RwLock, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("slot io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observed slot state after an acquisition attempt.
#[derive(Debug, Clone)]
pub struct SlotStatus {
    pub available: bool,
    /// The current holder: the caller on success, the occupant otherwise.
    pub holder: String,
}

#[async_trait]
pub trait MergeSlot: Send + Sync {
    /// Idempotently materialize the slot; returns its identifier.
    async fn ensure_exists(&self) -> Result<String, SlotError>;

    /// Attempt to claim the slot. When it is held elsewhere, `add_waiter`
    /// records interest so the holder can release promptly.
    async fn acquire(&self, holder: &str, add_waiter: bool) -> Result<SlotStatus, SlotError>;

    /// Release iff the caller currently holds; otherwise a no-op.
    async fn release(&self, holder: &str) -> Result<(), SlotError>;
}

/// Always grants. Suitable for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct NoopMergeSlot;

#[async_trait]
impl MergeSlot for NoopMergeSlot {
    async fn ensure_exists(&self) -> Result<String, SlotError> {
        Ok("noop-slot".to_string())
    }

    async fn acquire(&self, holder: &str, _add_waiter: bool) -> Result<SlotStatus, SlotError> {
        Ok(SlotStatus {
            available: true,
            holder: holder.to_string(),
        })
    }

    async fn release(&self, _holder: &str) -> Result<(), SlotError> {
        Ok(())
    }
}

/// File-backed slot: an OS write lock on `<dir>/<name>.lock`.
///
/// The lock survives across processes on the same host. The holder name is
/// mirrored into a sidecar file so contenders can report who occupies the
/// slot; waiters append to `<name>.waiters` as a best-effort signal.
pub struct FileMergeSlot {
    dir: PathBuf,
    name: String,
    guard: Mutex<Option<RwLockWriteGuard<'static, File>>>,
}

impl FileMergeSlot {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, name: S) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            guard: Mutex::new(None),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.name))
    }

    fn holder_path(&self) -> PathBuf {
        self.dir.join(format!("{}.holder", self.name))
    }

    fn waiters_path(&self) -> PathBuf {
        self.dir.join(format!("{}.waiters", self.name))
    }

    fn current_holder(&self) -> String {
        std::fs::read_to_string(self.holder_path())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

#[async_trait]
impl MergeSlot for FileMergeSlot {
    async fn ensure_exists(&self) -> Result<String, SlotError> {
        std::fs::create_dir_all(&self.dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.lock_path())?;
        Ok(self.name.clone())
    }

    async fn acquire(&self, holder: &str, add_waiter: bool) -> Result<SlotStatus, SlotError> {
        let mut held = self.guard.lock().expect("slot guard poisoned");
        if held.is_some() {
            return Ok(SlotStatus {
                available: true,
                holder: holder.to_string(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.lock_path())?;
        let lock = Box::leak(Box::new(RwLock::new(file)));
        match lock.try_write() {
            Ok(guard) => {
                std::fs::write(self.holder_path(), holder)?;
                *held = Some(guard);
                Ok(SlotStatus {
                    available: true,
                    holder: holder.to_string(),
                })
            }
            Err(_) => {
                if add_waiter {
                    if let Ok(mut waiters) = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(self.waiters_path())
                    {
                        let _ = writeln!(waiters, "{holder}");
                    }
                }
                Ok(SlotStatus {
                    available: false,
                    holder: self.current_holder(),
                })
            }
        }
    }

    async fn release(&self, holder: &str) -> Result<(), SlotError> {
        let mut held = self.guard.lock().expect("slot guard poisoned");
        if held.take().is_some() {
            let _ = std::fs::remove_file(self.holder_path());
            let _ = std::fs::remove_file(self.waiters_path());
            tracing::debug!(holder, "merge slot released");
        }
        Ok(())
    }
}
