//! Manages the buffer pool, a fixed set of in-memory buffers that cache disk
//! blocks.
//!
//! Policy is steal, no-force: a dirty buffer may be written back as soon as
//! it is unpinned (or evicted), before its transaction commits, and commit
//! writes back only that transaction's buffers. Every write-back flushes the
//! log up to the buffer's LSN first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::block::BlockId;
use crate::buffer::{Buffer, SharedBuffer};
use crate::config::DbConfig;
use crate::error::{DbError, DbResult};
use crate::pager::Pager;
use crate::replacer::Replacer;
use crate::wal::LogManager;
use crate::TxNum;

struct PoolState {
    page_table: HashMap<BlockId, usize>,
    /// Buffers that have never held a block.
    free_list: VecDeque<usize>,
    replacer: Replacer,
    /// Buffers registered as modified since their last write-back.
    dirty: HashSet<usize>,
    /// Unpinned dirty buffers waiting for a deferred write-back.
    flush_queue: VecDeque<usize>,
    available: usize,
}

/// The buffer pool manager.
pub struct BufferPool {
    pager: Arc<Pager>,
    log: Arc<LogManager>,
    buffers: Vec<SharedBuffer>,
    state: Mutex<PoolState>,
    unpinned: Condvar,
    pin_timeout: Duration,
    retry_interval: Duration,
    read_ahead: bool,
    flush_batch: usize,
}

impl BufferPool {
    pub fn new(pager: Arc<Pager>, log: Arc<LogManager>, config: &DbConfig) -> Self {
        let count = config.buffer_count;
        let buffers = (0..count)
            .map(|i| Arc::new(Mutex::new(Buffer::new(i, pager.block_size()))))
            .collect();
        Self {
            pager,
            log,
            buffers,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list: (0..count).collect(),
                replacer: Replacer::new(config.hot_dwell, config.hot_front_fraction),
                dirty: HashSet::new(),
                flush_queue: VecDeque::new(),
                available: count,
            }),
            unpinned: Condvar::new(),
            pin_timeout: config.pin_timeout,
            retry_interval: config.pin_retry_interval,
            read_ahead: config.read_ahead,
            flush_batch: config.flush_batch(),
        }
    }

    /// Number of buffers with a pin count of zero.
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    pub fn size(&self) -> usize {
        self.buffers.len()
    }

    /// True if `block` currently occupies a buffer, pinned or not.
    pub fn is_resident(&self, block: &BlockId) -> bool {
        self.state.lock().page_table.contains_key(block)
    }

    /// Pins a buffer to `block`, reading the block in if needed. Waits up to
    /// the pin timeout for a buffer to become unpinned, then gives up with
    /// `DbError::BufferAbort`.
    pub fn pin(&self, block: &BlockId) -> DbResult<SharedBuffer> {
        let deadline = Instant::now() + self.pin_timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(buffer) = self.try_pin(&mut state, block)? {
                if self.read_ahead {
                    if let Err(e) = self.prefetch_next(&mut state, block) {
                        debug!(%block, error = %e, "read-ahead skipped");
                    }
                }
                return Ok(buffer);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(%block, "no buffer available before timeout");
                return Err(DbError::BufferAbort {
                    block: block.clone(),
                });
            }
            trace!(%block, "waiting for an unpinned buffer");
            let wake_at = (now + self.retry_interval).min(deadline);
            self.unpinned.wait_until(&mut state, wake_at);
        }
    }

    fn try_pin(&self, state: &mut PoolState, block: &BlockId) -> DbResult<Option<SharedBuffer>> {
        let now = Instant::now();
        if let Some(&index) = state.page_table.get(block) {
            let shared = &self.buffers[index];
            let mut buffer = shared.lock();
            if !buffer.is_pinned() {
                state.available -= 1;
            }
            buffer.pin();
            state.replacer.record_access(index, now);
            trace!(%block, index, pins = buffer.pins(), "buffer hit");
            return Ok(Some(shared.clone()));
        }

        let Some(index) = self.choose_unpinned(state) else {
            return Ok(None);
        };
        let shared = &self.buffers[index];
        let mut buffer = shared.lock();
        if let Err(e) = buffer.flush(&self.pager, &self.log) {
            // The old block stays resident and dirty.
            state.replacer.record_load(index, now);
            return Err(e);
        }
        if let Some(old) = buffer.block().cloned() {
            trace!(old = %old, index, "evicting");
            state.page_table.remove(&old);
        }
        state.dirty.remove(&index);
        state.flush_queue.retain(|&i| i != index);

        if let Err(e) = buffer.assign_to_block(block, &self.pager) {
            state.free_list.push_back(index);
            return Err(e);
        }
        buffer.pin();
        state.available -= 1;
        state.page_table.insert(block.clone(), index);
        state.replacer.record_load(index, now);
        trace!(%block, index, "buffer miss, block loaded");
        Ok(Some(shared.clone()))
    }

    fn choose_unpinned(&self, state: &mut PoolState) -> Option<usize> {
        if let Some(index) = state.free_list.pop_front() {
            return Some(index);
        }
        let buffers = &self.buffers;
        state
            .replacer
            .victim(|index| !buffers[index].lock().is_pinned())
    }

    /// Loads the block after `block` into a never-used buffer without pinning
    /// it. Never evicts anything.
    fn prefetch_next(&self, state: &mut PoolState, block: &BlockId) -> DbResult<()> {
        let Some(next) = block.next() else {
            return Ok(());
        };
        if state.page_table.contains_key(&next) || state.free_list.is_empty() {
            return Ok(());
        }
        if next.number() >= self.pager.block_count(next.file_name())? {
            return Ok(());
        }
        let Some(index) = state.free_list.pop_front() else {
            return Ok(());
        };
        if let Err(e) = self.buffers[index].lock().assign_to_block(&next, &self.pager) {
            state.free_list.push_front(index);
            return Err(e);
        }
        state.page_table.insert(next.clone(), index);
        state.replacer.record_prefetch(index, Instant::now());
        trace!(block = %next, index, "read ahead");
        Ok(())
    }

    /// Drops one pin. When the last pin goes the buffer becomes reusable, and
    /// if it is dirty it joins the deferred write-back queue.
    pub fn unpin(&self, shared: &SharedBuffer) {
        let mut state = self.state.lock();
        let index = {
            let mut buffer = shared.lock();
            if !buffer.unpin() {
                warn!(index = buffer.index(), "unpin of an unpinned buffer ignored");
                return;
            }
            if buffer.is_pinned() {
                return;
            }
            buffer.index()
        };
        state.available += 1;
        if state.dirty.contains(&index) && !state.flush_queue.contains(&index) {
            state.flush_queue.push_back(index);
        }
        if state.flush_queue.len() >= self.flush_batch {
            if let Err(e) = self.drain_flush_queue(&mut state) {
                // Still dirty; eviction or commit will write it.
                warn!(error = %e, "deferred write-back failed");
            }
        }
        self.unpinned.notify_all();
    }

    fn drain_flush_queue(&self, state: &mut PoolState) -> DbResult<()> {
        while let Some(index) = state.flush_queue.pop_front() {
            let mut buffer = self.buffers[index].lock();
            if buffer.is_pinned() {
                continue;
            }
            if let Err(e) = buffer.flush(&self.pager, &self.log) {
                state.flush_queue.push_front(index);
                return Err(e);
            }
            state.dirty.remove(&index);
        }
        Ok(())
    }

    /// Registers a buffer whose page was just modified.
    pub fn add_to_dirty(&self, shared: &SharedBuffer) {
        let index = shared.lock().index();
        self.state.lock().dirty.insert(index);
    }

    /// Writes back every buffer last modified by `tx_num`.
    pub fn flush_all(&self, tx_num: TxNum) -> DbResult<()> {
        self.flush_where(|buffer| buffer.modifying_tx() == Some(tx_num))
    }

    /// Writes back every modified buffer.
    pub fn flush_everything(&self) -> DbResult<()> {
        self.flush_where(|buffer| buffer.modifying_tx().is_some())
    }

    fn flush_where(&self, wanted: impl Fn(&Buffer) -> bool) -> DbResult<()> {
        let mut state = self.state.lock();
        for (index, shared) in self.buffers.iter().enumerate() {
            let mut buffer = shared.lock();
            if !wanted(&*buffer) {
                continue;
            }
            buffer.flush(&self.pager, &self.log)?;
            state.dirty.remove(&index);
            state.flush_queue.retain(|&i| i != index);
        }
        Ok(())
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use tempfile::{tempdir, TempDir};

    fn setup(buffers: usize, read_ahead: bool) -> (TempDir, BufferPool) {
        let temp_dir = tempdir().unwrap();
        let config = DbConfig {
            buffer_count: buffers,
            read_ahead,
            pin_timeout: Duration::from_millis(300),
            pin_retry_interval: Duration::from_millis(20),
            flush_batch: Some(100),
            ..DbConfig::new(temp_dir.path())
        };
        let pager = Arc::new(Pager::open(temp_dir.path(), 400).unwrap());
        let log = Arc::new(LogManager::open(pager.clone(), "log").unwrap());
        (temp_dir, BufferPool::new(pager, log, &config))
    }

    #[test]
    fn test_hit_shares_buffer_and_counts_pins() {
        let (_dir, pool) = setup(3, false);
        let blk = BlockId::new("f", 1);
        let a = pool.pin(&blk).unwrap();
        let b = pool.pin(&BlockId::new("f".to_string(), 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().pins(), 2);
        assert_eq!(pool.available(), 2);

        pool.unpin(&a);
        assert_eq!(pool.available(), 2);
        pool.unpin(&b);
        assert_eq!(pool.available(), 3);
        // Extra unpins are ignored rather than going negative.
        pool.unpin(&b);
        assert_eq!(b.lock().pins(), 0);
        assert_eq!(pool.available(), 3);
        assert!(pool.is_resident(&blk));
    }

    #[test]
    fn test_pin_times_out_when_everything_is_pinned() {
        let (_dir, pool) = setup(3, false);
        let pinned: Vec<_> = (0..3)
            .map(|i| pool.pin(&BlockId::new("f", i)).unwrap())
            .collect();
        assert_eq!(pool.available(), 0);

        let start = Instant::now();
        let err = pool.pin(&BlockId::new("f", 3)).unwrap_err();
        assert!(matches!(err, DbError::BufferAbort { .. }));
        assert!(start.elapsed() >= Duration::from_millis(300));

        pool.unpin(&pinned[1]);
        let buffer = pool.pin(&BlockId::new("f", 4)).unwrap();
        assert_eq!(buffer.lock().index(), 1);
        assert!(!pool.is_resident(&BlockId::new("f", 1)));
    }

    #[test]
    fn test_waiting_pin_wakes_on_unpin() {
        let (_dir, pool) = setup(1, false);
        let pool = Arc::new(pool);
        let held = pool.pin(&BlockId::new("f", 0)).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.pin(&BlockId::new("f", 1)).map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.unpin(&held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let (_dir, pool) = setup(1, false);
        let blk = BlockId::new("f", 0);
        let buffer = pool.pin(&blk).unwrap();
        {
            let mut b = buffer.lock();
            b.contents_mut().set_int(80, 99).unwrap();
            let lsn = pool.log().append(b"pre-image").unwrap();
            b.set_modified(1, Some(lsn));
        }
        pool.add_to_dirty(&buffer);
        pool.unpin(&buffer);

        let other = pool.pin(&BlockId::new("f", 1)).unwrap();
        pool.unpin(&other);
        // The log record reached disk before the page did.
        assert!(pool.log().last_saved_lsn() >= 1);
        let mut page = Page::new(400);
        pool.pager().read(&blk, &mut page).unwrap();
        assert_eq!(page.get_int(80).unwrap(), 99);
    }

    #[test]
    fn test_flush_all_only_touches_one_transaction() {
        let (_dir, pool) = setup(3, false);
        let (b1, b2) = (BlockId::new("f", 0), BlockId::new("f", 1));
        for (blk, tx) in [(&b1, 1), (&b2, 2)] {
            let buffer = pool.pin(blk).unwrap();
            let mut b = buffer.lock();
            b.contents_mut().set_int(0, tx as i64 * 10).unwrap();
            b.set_modified(tx, None);
            drop(b);
            pool.add_to_dirty(&buffer);
        }
        pool.flush_all(1).unwrap();

        let mut page = Page::new(400);
        pool.pager().read(&b1, &mut page).unwrap();
        assert_eq!(page.get_int(0).unwrap(), 10);
        pool.pager().read(&b2, &mut page).unwrap();
        assert_eq!(page.get_int(0).unwrap(), 0);

        pool.flush_everything().unwrap();
        pool.pager().read(&b2, &mut page).unwrap();
        assert_eq!(page.get_int(0).unwrap(), 20);
    }

    #[test]
    fn test_deferred_flush_after_batch() {
        let temp_dir = tempdir().unwrap();
        let config = DbConfig {
            buffer_count: 4,
            read_ahead: false,
            flush_batch: Some(2),
            ..DbConfig::new(temp_dir.path())
        };
        let pager = Arc::new(Pager::open(temp_dir.path(), 400).unwrap());
        let log = Arc::new(LogManager::open(pager.clone(), "log").unwrap());
        let pool = BufferPool::new(pager.clone(), log, &config);

        let mut page = Page::new(400);
        for i in 0..2 {
            let blk = BlockId::new("f", i);
            let buffer = pool.pin(&blk).unwrap();
            buffer.lock().contents_mut().set_int(0, 7).unwrap();
            buffer.lock().set_modified(1, None);
            pool.add_to_dirty(&buffer);
            pool.unpin(&buffer);
            pager.read(&blk, &mut page).unwrap();
            // First unpin only queues, the second one drains both.
            assert_eq!(page.get_int(0).unwrap(), if i == 0 { 0 } else { 7 });
        }
        pager.read(&BlockId::new("f", 0), &mut page).unwrap();
        assert_eq!(page.get_int(0).unwrap(), 7);
    }

    #[test]
    fn test_read_ahead_prefetches_existing_next_block() {
        let (_dir, pool) = setup(3, true);
        for _ in 0..3 {
            pool.pager().append("seq").unwrap();
        }
        let first = pool.pin(&BlockId::new("seq", 0)).unwrap();
        assert!(pool.is_resident(&BlockId::new("seq", 1)));
        // Prefetched but unpinned.
        assert_eq!(pool.available(), 2);

        // Past the end of the file nothing is prefetched.
        let last = pool.pin(&BlockId::new("seq", 2)).unwrap();
        assert!(!pool.is_resident(&BlockId::new("seq", 3)));

        // The prefetched block is the first to go.
        let other = pool.pin(&BlockId::new("other", 0)).unwrap();
        assert!(!pool.is_resident(&BlockId::new("seq", 1)));
        for b in [&first, &last, &other] {
            pool.unpin(b);
        }
    }
}
