//! Block-level shared/exclusive locks with bounded waits.
//!
//! There is no wait-for graph. A request that cannot be granted before its
//! deadline fails with `DbError::LockAbort`, and the caller is expected to
//! roll the transaction back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::block::BlockId;
use crate::error::{DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Snapshot of one block's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared(u32),
    Exclusive,
}

const EXCLUSIVE: i64 = -1;

#[derive(Debug, Default)]
struct LockEntry {
    /// 0 unlocked, > 0 shared holders, -1 exclusive.
    value: i64,
    waiters: usize,
    cond: Arc<Condvar>,
}

/// The lock table shared by all transactions of one database.
#[derive(Debug)]
pub struct LockTable {
    entries: Mutex<HashMap<BlockId, LockEntry>>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Takes a shared lock, waiting while someone holds it exclusively.
    pub fn slock(&self, block: &BlockId) -> DbResult<()> {
        self.acquire(block, LockMode::Shared, |value| value < 0)?;
        trace!(%block, "slock granted");
        Ok(())
    }

    /// Takes the exclusive lock. The caller is assumed to already hold one
    /// shared lock on `block`, so only a count above 1 means other holders.
    pub fn xlock(&self, block: &BlockId) -> DbResult<()> {
        self.acquire(block, LockMode::Exclusive, |value| value > 1 || value < 0)?;
        trace!(%block, "xlock granted");
        Ok(())
    }

    fn acquire(&self, block: &BlockId, mode: LockMode, blocked: impl Fn(i64) -> bool) -> DbResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut entries = self.entries.lock();
        loop {
            let entry = entries.entry(block.clone()).or_default();
            if !blocked(entry.value) {
                entry.value = match mode {
                    LockMode::Shared => entry.value + 1,
                    LockMode::Exclusive => EXCLUSIVE,
                };
                return Ok(());
            }
            if Instant::now() >= deadline {
                Self::remove_if_idle(&mut entries, block);
                warn!(%block, ?mode, "lock wait timed out");
                return Err(DbError::LockAbort {
                    block: block.clone(),
                });
            }

            entry.waiters += 1;
            let cond = entry.cond.clone();
            cond.wait_until(&mut entries, deadline);
            if let Some(entry) = entries.get_mut(block) {
                entry.waiters -= 1;
            }
        }
    }

    fn remove_if_idle(entries: &mut MutexGuard<'_, HashMap<BlockId, LockEntry>>, block: &BlockId) {
        if entries
            .get(block)
            .is_some_and(|e| e.value == 0 && e.waiters == 0)
        {
            entries.remove(block);
        }
    }

    /// Drops one shared hold, or the exclusive hold, and wakes every waiter
    /// on `block`.
    pub fn unlock(&self, block: &BlockId) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(block) else {
            warn!(%block, "unlock of an unlocked block ignored");
            return;
        };
        entry.value = if entry.value > 1 { entry.value - 1 } else { 0 };
        entry.cond.notify_all();
        trace!(%block, value = entry.value, "unlocked");
        Self::remove_if_idle(&mut entries, block);
    }

    pub fn state(&self, block: &BlockId) -> LockState {
        match self.entries.lock().get(block).map_or(0, |e| e.value) {
            0 => LockState::Unlocked,
            v if v < 0 => LockState::Exclusive,
            v => LockState::Shared(v as u32),
        }
    }
}
