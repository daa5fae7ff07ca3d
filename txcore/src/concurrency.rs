//! Per-transaction view of the lock table.
use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::block::BlockId;
use crate::error::DbResult;
use crate::lock_table::{LockMode, LockTable};

/// Remembers which locks one transaction holds so that repeated requests are
/// free and an exclusive request always starts from this transaction's own
/// shared lock. Everything is released together at transaction end.
#[derive(Debug)]
pub struct ConcurrencyManager {
    lock_table: Arc<LockTable>,
    locks: HashMap<BlockId, LockMode>,
}

impl ConcurrencyManager {
    pub fn new(lock_table: Arc<LockTable>) -> Self {
        Self {
            lock_table,
            locks: HashMap::new(),
        }
    }

    pub fn slock(&mut self, block: &BlockId) -> DbResult<()> {
        if !self.locks.contains_key(block) {
            self.lock_table.slock(block)?;
            self.locks.insert(block.clone(), LockMode::Shared);
        }
        Ok(())
    }

    pub fn xlock(&mut self, block: &BlockId) -> DbResult<()> {
        if self.has_xlock(block) {
            return Ok(());
        }
        self.slock(block)?;
        self.lock_table.xlock(block)?;
        self.locks.insert(block.clone(), LockMode::Exclusive);
        Ok(())
    }

    fn has_xlock(&self, block: &BlockId) -> bool {
        self.locks.get(block) == Some(&LockMode::Exclusive)
    }

    pub fn holds(&self, block: &BlockId) -> Option<LockMode> {
        self.locks.get(block).copied()
    }

    /// Releases every lock. Safe to call more than once.
    pub fn release(&mut self) {
        for (block, mode) in self.locks.drain() {
            trace!(%block, ?mode, "releasing lock");
            self.lock_table.unlock(&block);
        }
    }

    /// Releases the shared locks only. Exclusive locks stay held in the lock
    /// table with no owner left to release them, and their blocks are
    /// returned.
    pub fn release_shared(&mut self) -> Vec<BlockId> {
        let mut kept = Vec::new();
        for (block, mode) in self.locks.drain() {
            match mode {
                LockMode::Shared => self.lock_table.unlock(&block),
                LockMode::Exclusive => kept.push(block),
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::lock_table::LockState;
    use std::time::Duration;

    #[test]
    fn test_repeated_requests_are_noops() {
        let table = Arc::new(LockTable::new(Duration::from_millis(100)));
        let mut cm = ConcurrencyManager::new(table.clone());
        let blk = BlockId::new("f", 1);

        cm.slock(&blk).unwrap();
        cm.slock(&blk).unwrap();
        assert_eq!(table.state(&blk), LockState::Shared(1));

        cm.xlock(&blk).unwrap();
        cm.xlock(&blk).unwrap();
        cm.slock(&blk).unwrap();
        assert_eq!(table.state(&blk), LockState::Exclusive);
        assert_eq!(cm.holds(&blk), Some(LockMode::Exclusive));

        cm.release();
        cm.release();
        assert_eq!(table.state(&blk), LockState::Unlocked);
        assert_eq!(cm.holds(&blk), None);
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let table = Arc::new(LockTable::new(Duration::from_millis(100)));
        let mut reader = ConcurrencyManager::new(table.clone());
        let mut writer = ConcurrencyManager::new(table.clone());
        let blk = BlockId::new("f", 1);

        reader.slock(&blk).unwrap();
        let err = writer.xlock(&blk).unwrap_err();
        assert!(matches!(err, DbError::LockAbort { .. }));
        // The writer kept the shared lock it took on the way.
        assert_eq!(writer.holds(&blk), Some(LockMode::Shared));
        assert_eq!(table.state(&blk), LockState::Shared(2));

        reader.release();
        writer.xlock(&blk).unwrap();
        assert_eq!(table.state(&blk), LockState::Exclusive);
        writer.release();
        assert_eq!(table.state(&blk), LockState::Unlocked);
    }

    #[test]
    fn test_release_shared_keeps_exclusive_locks() {
        let table = Arc::new(LockTable::new(Duration::from_millis(50)));
        let mut cm = ConcurrencyManager::new(table.clone());
        let read = BlockId::new("f", 1);
        let written = BlockId::new("f", 2);
        cm.slock(&read).unwrap();
        cm.xlock(&written).unwrap();

        assert_eq!(cm.release_shared(), vec![written.clone()]);
        assert_eq!(cm.holds(&written), None);
        assert_eq!(table.state(&read), LockState::Unlocked);
        assert_eq!(table.state(&written), LockState::Exclusive);

        let mut other = ConcurrencyManager::new(table.clone());
        assert!(other.slock(&written).is_err());
        other.xlock(&read).unwrap();
        other.release();
    }
}
