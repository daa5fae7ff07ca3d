//! Transactions: the interface the rest of the engine uses to read and write
//! blocks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::BlockId;
use crate::buffer::SharedBuffer;
use crate::buffer_pool::BufferPool;
use crate::concurrency::ConcurrencyManager;
use crate::error::{DbError, DbResult};
use crate::lock_table::LockTable;
use crate::log_record::UndoContext;
use crate::recovery::RecoveryManager;
use crate::TxNum;

/// The buffers one transaction has pinned. A block pinned twice is unpinned
/// twice.
struct BufferList {
    buffers: HashMap<BlockId, SharedBuffer>,
    pins: Vec<BlockId>,
}

impl BufferList {
    fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            pins: Vec::new(),
        }
    }

    fn get(&self, block: &BlockId) -> DbResult<&SharedBuffer> {
        self.buffers
            .get(block)
            .ok_or_else(|| DbError::UnknownBuffer {
                block: block.clone(),
            })
    }

    fn pin(&mut self, pool: &BufferPool, block: &BlockId) -> DbResult<()> {
        let buffer = pool.pin(block)?;
        self.buffers.insert(block.clone(), buffer);
        self.pins.push(block.clone());
        Ok(())
    }

    fn unpin(&mut self, pool: &BufferPool, block: &BlockId) -> DbResult<()> {
        pool.unpin(self.get(block)?);
        if let Some(pos) = self.pins.iter().position(|b| b == block) {
            self.pins.swap_remove(pos);
        }
        if !self.pins.contains(block) {
            self.buffers.remove(block);
        }
        Ok(())
    }

    fn unpin_all(&mut self, pool: &BufferPool) {
        for block in self.pins.drain(..) {
            if let Some(buffer) = self.buffers.get(&block) {
                pool.unpin(buffer);
            }
        }
        self.buffers.clear();
    }
}

/// One transaction. Reads take shared locks and writes take exclusive locks,
/// all held until `commit` or `rollback`.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back. A failed commit rolls back too. If an undo cannot be completed,
/// the exclusive locks are kept until restart, when recovery finishes it.
pub struct Transaction {
    tx_num: TxNum,
    pool: Arc<BufferPool>,
    concurrency: ConcurrencyManager,
    recovery: RecoveryManager,
    buffers: BufferList,
    undo_incomplete: bool,
    finished: bool,
}

impl Transaction {
    /// Starts transaction `tx_num`. Its START record is appended to the log
    /// right away.
    pub fn new(tx_num: TxNum, pool: Arc<BufferPool>, lock_table: Arc<LockTable>) -> DbResult<Self> {
        let recovery = RecoveryManager::new(tx_num, pool.log().clone(), pool.clone())?;
        debug!(tx = tx_num, "begin");
        Ok(Self {
            tx_num,
            pool,
            concurrency: ConcurrencyManager::new(lock_table),
            recovery,
            buffers: BufferList::new(),
            undo_incomplete: false,
            finished: false,
        })
    }

    pub fn tx_num(&self) -> TxNum {
        self.tx_num
    }

    /// Makes every change durable. On failure the changes are rolled back
    /// before any lock is released, and the commit error is returned.
    pub fn commit(mut self) -> DbResult<()> {
        if let Err(e) = self.recovery.commit() {
            warn!(tx = self.tx_num, error = %e, "commit failed, rolling back");
            if let Err(rb) = self.rollback_in_place() {
                warn!(tx = self.tx_num, error = %rb, "rollback after failed commit failed");
            }
            self.finish();
            return Err(e);
        }
        self.finish();
        Ok(())
    }

    pub fn rollback(mut self) -> DbResult<()> {
        let res = self.rollback_in_place();
        self.finish();
        res
    }

    fn rollback_in_place(&mut self) -> DbResult<()> {
        // Undo pins each block it restores.
        self.buffers.unpin_all(&self.pool);
        let recovery = self.recovery.clone();
        match recovery.undo(self) {
            Ok(undone) => recovery.log_rollback(undone),
            Err(e) => {
                self.undo_incomplete = true;
                Err(e)
            }
        }
    }

    /// Rolls back every unfinished transaction found in the log. Only run
    /// before any other transaction starts. Returns the highest transaction
    /// number in the log.
    pub fn recover(mut self) -> DbResult<TxNum> {
        let recovery = self.recovery.clone();
        let res = recovery.recover(&mut self);
        self.finish();
        res
    }

    fn finish(&mut self) {
        if self.undo_incomplete {
            let kept = self.concurrency.release_shared();
            warn!(
                tx = self.tx_num,
                blocks = kept.len(),
                "undo incomplete, exclusive locks kept until restart"
            );
        } else {
            self.concurrency.release();
        }
        self.buffers.unpin_all(&self.pool);
        self.finished = true;
    }

    pub fn pin(&mut self, block: &BlockId) -> DbResult<()> {
        self.buffers.pin(&self.pool, block)
    }

    pub fn unpin(&mut self, block: &BlockId) -> DbResult<()> {
        self.buffers.unpin(&self.pool, block)
    }

    pub fn get_int(&mut self, block: &BlockId, offset: usize) -> DbResult<i64> {
        self.concurrency.slock(block)?;
        let buffer = self.buffers.get(block)?;
        let val = buffer.lock().contents().get_int(offset)?;
        Ok(val)
    }

    pub fn get_string(&mut self, block: &BlockId, offset: usize) -> DbResult<String> {
        self.concurrency.slock(block)?;
        let buffer = self.buffers.get(block)?;
        let val = buffer.lock().contents().get_string(offset)?;
        Ok(val)
    }

    /// Writes `val` at `offset`. With `ok_to_log` the old value is logged
    /// first so the write can be undone.
    pub fn set_int(&mut self, block: &BlockId, offset: usize, val: i64, ok_to_log: bool) -> DbResult<()> {
        self.concurrency.xlock(block)?;
        let buffer = self.buffers.get(block)?.clone();
        {
            let mut b = buffer.lock();
            let lsn = if ok_to_log {
                Some(self.recovery.set_int(block, b.contents(), offset)?)
            } else {
                None
            };
            b.contents_mut().set_int(offset, val)?;
            b.set_modified(self.tx_num, lsn);
        }
        self.pool.add_to_dirty(&buffer);
        Ok(())
    }

    pub fn set_string(&mut self, block: &BlockId, offset: usize, val: &str, ok_to_log: bool) -> DbResult<()> {
        self.concurrency.xlock(block)?;
        let buffer = self.buffers.get(block)?.clone();
        {
            let mut b = buffer.lock();
            let lsn = if ok_to_log {
                Some(self.recovery.set_string(block, b.contents(), offset, val)?)
            } else {
                None
            };
            b.contents_mut().set_string(offset, val)?;
            b.set_modified(self.tx_num, lsn);
        }
        self.pool.add_to_dirty(&buffer);
        Ok(())
    }

    /// Puts raw bytes back at `offset` without logging. Only undo uses this.
    fn set_raw(&mut self, block: &BlockId, offset: usize, bytes: &[u8]) -> DbResult<()> {
        self.concurrency.xlock(block)?;
        let buffer = self.buffers.get(block)?.clone();
        {
            let mut b = buffer.lock();
            b.contents_mut().set_raw(offset, bytes)?;
            b.set_modified(self.tx_num, None);
        }
        self.pool.add_to_dirty(&buffer);
        Ok(())
    }

    /// Number of blocks in `file_name`. Conflicts with a concurrent `append`.
    pub fn size(&mut self, file_name: &str) -> DbResult<u64> {
        self.concurrency.slock(&BlockId::end_of_file(file_name))?;
        self.pool.pager().block_count(file_name)
    }

    pub fn append(&mut self, file_name: &str) -> DbResult<BlockId> {
        self.concurrency.xlock(&BlockId::end_of_file(file_name))?;
        self.pool.pager().append(file_name)
    }

    pub fn block_size(&self) -> usize {
        self.pool.pager().block_size()
    }

    pub fn available_buffers(&self) -> usize {
        self.pool.available()
    }
}

impl UndoContext for Transaction {
    fn pin(&mut self, block: &BlockId) -> DbResult<()> {
        Transaction::pin(self, block)
    }

    fn unpin(&mut self, block: &BlockId) -> DbResult<()> {
        Transaction::unpin(self, block)
    }

    fn set_int(&mut self, block: &BlockId, offset: usize, val: i64, ok_to_log: bool) -> DbResult<()> {
        Transaction::set_int(self, block, offset, val, ok_to_log)
    }

    fn set_raw(&mut self, block: &BlockId, offset: usize, bytes: &[u8]) -> DbResult<()> {
        Transaction::set_raw(self, block, offset, bytes)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(tx = self.tx_num, "transaction dropped while active, rolling back");
        if let Err(e) = self.rollback_in_place() {
            warn!(tx = self.tx_num, error = %e, "rollback on drop failed");
        }
        self.finish();
    }
}
