//! A single slot of the buffer pool.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::error::DbResult;
use crate::failpoint;
use crate::page::Page;
use crate::pager::Pager;
use crate::wal::{LogManager, Lsn};
use crate::TxNum;

/// A buffer as handed out by the pool. The mutex only guards page access and
/// metadata; it is never held across a lock-table wait.
pub type SharedBuffer = Arc<Mutex<Buffer>>;

/// One page plus the bookkeeping that decides when it may be reused and what
/// must be logged before it is written back.
#[derive(Debug)]
pub struct Buffer {
    index: usize,
    contents: Page,
    block: Option<BlockId>,
    pins: u32,
    modifying_tx: Option<TxNum>,
    lsn: Option<Lsn>,
}

impl Buffer {
    pub(crate) fn new(index: usize, block_size: usize) -> Self {
        Self {
            index,
            contents: Page::new(block_size),
            block: None,
            pins: 0,
            modifying_tx: None,
            lsn: None,
        }
    }

    /// Position of this buffer in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn contents(&self) -> &Page {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Page {
        &mut self.contents
    }

    pub fn block(&self) -> Option<&BlockId> {
        self.block.as_ref()
    }

    /// Records that `tx_num` changed the page. `lsn` is the undo record for
    /// the change, or `None` when the change was not logged.
    pub fn set_modified(&mut self, tx_num: TxNum, lsn: Option<Lsn>) {
        self.modifying_tx = Some(tx_num);
        if let Some(lsn) = lsn {
            self.lsn = Some(self.lsn.map_or(lsn, |old| old.max(lsn)));
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pins(&self) -> u32 {
        self.pins
    }

    pub fn modifying_tx(&self) -> Option<TxNum> {
        self.modifying_tx
    }

    pub fn lsn(&self) -> Option<Lsn> {
        self.lsn
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    /// Returns false if the buffer was not pinned.
    pub(crate) fn unpin(&mut self) -> bool {
        if self.pins == 0 {
            return false;
        }
        self.pins -= 1;
        true
    }

    /// Writes the page back if it holds unflushed changes. The log is made
    /// durable up to this buffer's LSN first.
    pub(crate) fn flush(&mut self, pager: &Pager, log: &LogManager) -> DbResult<()> {
        let Some(block) = &self.block else {
            return Ok(());
        };
        if self.modifying_tx.is_none() {
            return Ok(());
        }
        if let Some(lsn) = self.lsn {
            log.flush(lsn)?;
        }
        failpoint::maybe_fail(failpoint::POOL_FLUSH_BEFORE_PAGE)?;
        pager.write(block, &self.contents)?;
        self.modifying_tx = None;
        self.lsn = None;
        Ok(())
    }

    /// Loads `block` into this buffer. The caller must have flushed the
    /// previous contents and checked the buffer is unpinned.
    pub(crate) fn assign_to_block(&mut self, block: &BlockId, pager: &Pager) -> DbResult<()> {
        debug_assert!(!self.is_pinned());
        debug_assert!(self.modifying_tx.is_none());
        self.block = None;
        pager.read(block, &mut self.contents)?;
        self.block = Some(block.clone());
        self.pins = 0;
        Ok(())
    }
}
