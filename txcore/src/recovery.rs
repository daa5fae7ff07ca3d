//! Undo logging, rollback and crash recovery for one transaction.
//!
//! Only pre-images are logged. A committed transaction is durable because
//! `commit` writes its pages before the COMMIT record, so recovery never has
//! to redo anything: it rolls back every transaction without a COMMIT or
//! ROLLBACK record and leaves the rest alone.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::block::BlockId;
use crate::buffer_pool::BufferPool;
use crate::error::DbResult;
use crate::failpoint;
use crate::log_record::{LogRecord, UndoContext};
use crate::page::Page;
use crate::wal::{LogManager, Lsn};
use crate::TxNum;

#[derive(Clone)]
pub struct RecoveryManager {
    tx_num: TxNum,
    log: Arc<LogManager>,
    pool: Arc<BufferPool>,
}

impl RecoveryManager {
    /// Starts logging for `tx_num` by writing its START record.
    pub fn new(tx_num: TxNum, log: Arc<LogManager>, pool: Arc<BufferPool>) -> DbResult<Self> {
        let rm = Self { tx_num, log, pool };
        rm.write(&LogRecord::Start { tx_num })?;
        Ok(rm)
    }

    fn write(&self, record: &LogRecord) -> DbResult<Lsn> {
        self.log.append(&record.to_bytes()?)
    }

    /// Logs the integer currently at `offset` in `page`, which holds `block`.
    /// Must be called before the page is changed.
    pub fn set_int(&self, block: &BlockId, page: &Page, offset: usize) -> DbResult<Lsn> {
        let old = page.get_int(offset)?;
        self.write(&LogRecord::SetInt {
            tx_num: self.tx_num,
            block: block.clone(),
            offset,
            old,
        })
    }

    /// Logs the bytes at `offset` that writing `val` will cover, as they are,
    /// whether or not they hold a string.
    pub fn set_string(&self, block: &BlockId, page: &Page, offset: usize, val: &str) -> DbResult<Lsn> {
        let old = page.get_raw(offset, Page::max_length(val.len()))?.to_vec();
        self.write(&LogRecord::SetString {
            tx_num: self.tx_num,
            block: block.clone(),
            offset,
            old,
        })
    }

    /// Writes this transaction's pages, then a durable COMMIT record.
    pub fn commit(&self) -> DbResult<()> {
        self.pool.flush_all(self.tx_num)?;
        failpoint::maybe_fail(failpoint::TX_COMMIT_BEFORE_LOG)?;
        let lsn = self.write(&LogRecord::Commit {
            tx_num: self.tx_num,
        })?;
        self.log.flush(lsn)?;
        debug!(tx = self.tx_num, lsn, "committed");
        Ok(())
    }

    /// Undoes every change this transaction logged, newest first, then
    /// writes a durable ROLLBACK record.
    pub fn rollback(&self, ctx: &mut impl UndoContext) -> DbResult<()> {
        let undone = self.undo(ctx)?;
        self.log_rollback(undone)
    }

    /// Restores the pre-image of every change this transaction logged,
    /// newest first. Returns how many records were undone.
    pub fn undo(&self, ctx: &mut impl UndoContext) -> DbResult<usize> {
        let mut undone = 0;
        for bytes in self.log.iter()? {
            let record = LogRecord::from_bytes(bytes?)?;
            if record.tx_number() != Some(self.tx_num) {
                continue;
            }
            if let LogRecord::Start { .. } = record {
                break;
            }
            record.undo(ctx)?;
            undone += 1;
        }
        Ok(undone)
    }

    /// Writes the undone pages, then a durable ROLLBACK record.
    pub fn log_rollback(&self, undone: usize) -> DbResult<()> {
        self.pool.flush_all(self.tx_num)?;
        failpoint::maybe_fail(failpoint::TX_ROLLBACK_BEFORE_LOG)?;
        let lsn = self.write(&LogRecord::Rollback {
            tx_num: self.tx_num,
        })?;
        self.log.flush(lsn)?;
        debug!(tx = self.tx_num, undone, "rolled back");
        Ok(())
    }

    /// Rolls back every unfinished transaction in the log and ends with a
    /// CHECKPOINT. Returns the highest transaction number found anywhere in
    /// the log.
    ///
    /// Undo stops at the newest CHECKPOINT. The rest of the log is only read
    /// for transaction numbers.
    pub fn recover(&self, ctx: &mut impl UndoContext) -> DbResult<TxNum> {
        let mut finished = HashSet::new();
        let mut max_tx = self.tx_num;
        let mut checkpointed = false;
        let mut undone = 0;
        for bytes in self.log.iter()? {
            let record = LogRecord::from_bytes(bytes?)?;
            if let Some(tx_num) = record.tx_number() {
                max_tx = max_tx.max(tx_num);
            }
            if checkpointed {
                continue;
            }
            match &record {
                LogRecord::Checkpoint => checkpointed = true,
                LogRecord::Commit { tx_num } | LogRecord::Rollback { tx_num } => {
                    finished.insert(*tx_num);
                }
                LogRecord::SetInt { tx_num, .. } | LogRecord::SetString { tx_num, .. }
                    if !finished.contains(tx_num) =>
                {
                    record.undo(ctx)?;
                    undone += 1;
                }
                _ => {}
            }
        }
        self.pool.flush_all(self.tx_num)?;
        let lsn = self.write(&LogRecord::Checkpoint)?;
        self.log.flush(lsn)?;
        info!(undone, max_tx, "recovery complete");
        Ok(max_tx)
    }

    pub fn tx_num(&self) -> TxNum {
        self.tx_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::pager::Pager;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Applies undos to pages kept outside the pool.
    #[derive(Default)]
    struct Pages(HashMap<BlockId, Page>);

    impl Pages {
        fn page(&mut self, block: &BlockId) -> &mut Page {
            self.0.entry(block.clone()).or_insert_with(|| Page::new(400))
        }
    }

    impl UndoContext for Pages {
        fn pin(&mut self, _block: &BlockId) -> DbResult<()> {
            Ok(())
        }

        fn unpin(&mut self, _block: &BlockId) -> DbResult<()> {
            Ok(())
        }

        fn set_int(&mut self, block: &BlockId, offset: usize, val: i64, _ok_to_log: bool) -> DbResult<()> {
            self.page(block).set_int(offset, val)
        }

        fn set_raw(&mut self, block: &BlockId, offset: usize, bytes: &[u8]) -> DbResult<()> {
            self.page(block).set_raw(offset, bytes)
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<LogManager>, Arc<BufferPool>) {
        let temp_dir = tempdir().unwrap();
        let config = DbConfig::new(temp_dir.path());
        let pager = Arc::new(Pager::open(temp_dir.path(), 400).unwrap());
        let log = Arc::new(LogManager::open(pager.clone(), "log").unwrap());
        let pool = Arc::new(BufferPool::new(pager, log.clone(), &config));
        (temp_dir, log, pool)
    }

    fn records(log: &LogManager) -> Vec<String> {
        log.iter()
            .unwrap()
            .map(|r| LogRecord::from_bytes(r.unwrap()).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_rollback_undoes_only_own_records() {
        let (_dir, log, pool) = setup();
        let blk = BlockId::new("f", 1);
        let mut pages = Pages::default();

        let t1 = RecoveryManager::new(1, log.clone(), pool.clone()).unwrap();
        let t2 = RecoveryManager::new(2, log.clone(), pool.clone()).unwrap();
        for (rm, offset, val) in [(&t1, 0, 10), (&t2, 8, 20), (&t1, 0, 11)] {
            let page = pages.page(&blk);
            rm.set_int(&blk, page, offset).unwrap();
            page.set_int(offset, val).unwrap();
        }

        t1.rollback(&mut pages).unwrap();
        let page = pages.page(&blk);
        assert_eq!(page.get_int(0).unwrap(), 0);
        assert_eq!(page.get_int(8).unwrap(), 20);
        assert_eq!(records(&log)[0], "<ROLLBACK 1>");
    }

    #[test]
    fn test_string_over_an_int_is_undone_exactly() {
        let (_dir, log, pool) = setup();
        let blk = BlockId::new("f", 0);
        let mut pages = Pages::default();
        let page = pages.page(&blk);
        page.set_int(0, 1000).unwrap();
        page.set_raw(8, &[0xc3, 0x28, 0xff]).unwrap();
        let before = page.clone();

        let rm = RecoveryManager::new(1, log.clone(), pool).unwrap();
        rm.set_string(&blk, page, 0, "abc").unwrap();
        page.set_string(0, "abc").unwrap();
        assert_eq!(page.get_string(0).unwrap(), "abc");

        rm.rollback(&mut pages).unwrap();
        assert_eq!(*pages.page(&blk), before);
        assert_eq!(pages.page(&blk).get_int(0).unwrap(), 1000);
    }

    #[test]
    fn test_recover_undoes_unfinished_and_checkpoints() {
        let (_dir, log, pool) = setup();
        let blk = BlockId::new("f", 1);
        let mut pages = Pages::default();

        let done = RecoveryManager::new(5, log.clone(), pool.clone()).unwrap();
        let page = pages.page(&blk);
        done.set_int(&blk, page, 0).unwrap();
        page.set_int(0, 50).unwrap();
        done.commit().unwrap();

        let open = RecoveryManager::new(6, log.clone(), pool.clone()).unwrap();
        let page = pages.page(&blk);
        open.set_string(&blk, page, 100, "dirty").unwrap();
        page.set_string(100, "dirty").unwrap();

        let rm = RecoveryManager::new(0, log.clone(), pool.clone()).unwrap();
        assert_eq!(rm.recover(&mut pages).unwrap(), 6);
        let page = pages.page(&blk);
        assert_eq!(page.get_int(0).unwrap(), 50);
        assert_eq!(page.get_string(100).unwrap(), "");
        assert_eq!(records(&log)[0], "<CHECKPOINT>");

        // Nothing left to undo: the scan stops at the checkpoint.
        page.set_string(100, "later").unwrap();
        let rm = RecoveryManager::new(0, log.clone(), pool).unwrap();
        assert_eq!(rm.recover(&mut pages).unwrap(), 6);
        assert_eq!(pages.page(&blk).get_string(100).unwrap(), "later");
    }
}
