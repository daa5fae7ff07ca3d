//! The Write-Ahead Log manager.
//!
//! The log is a file of ordinary blocks. Each block is filled from the end
//! toward the front, so reading a block front to back yields its newest
//! record first:
//!
//! ```text
//! ---------------------------------------------------------------
//! | boundary (8 bytes) |  free space  | rec n | ... | rec 2 | rec 1 |
//! ---------------------------------------------------------------
//! ```
//!
//! `boundary` is the offset of the newest record. Every record is framed as
//! `[len: u64][crc32: u32][payload]`, little-endian.

use std::sync::Arc;

use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::block::BlockId;
use crate::error::{DbError, DbResult};
use crate::page::{Page, INT_SIZE};
use crate::pager::Pager;

pub type Lsn = u64;

const CRC_SIZE: usize = std::mem::size_of::<u32>();
const FRAME_HEADER: usize = INT_SIZE + CRC_SIZE;

/// Smallest block size that holds the boundary plus one framed START,
/// COMMIT or ROLLBACK record.
pub const MIN_BLOCK_SIZE: usize = INT_SIZE + FRAME_HEADER + 2 * INT_SIZE;

struct LogState {
    /// In-memory copy of the tail block.
    page: Page,
    current: BlockId,
    latest_lsn: Lsn,
    last_saved_lsn: Lsn,
}

/// The WAL manager. Appends go to the in-memory tail block; `flush` makes
/// them durable.
pub struct LogManager {
    pager: Arc<Pager>,
    log_file: String,
    state: Mutex<LogState>,
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn read_boundary(page: &Page) -> DbResult<usize> {
    let boundary = page.get_int(0)?;
    // A block that was appended but never initialized reads as all zeroes.
    if boundary == 0 {
        return Ok(page.size());
    }
    match usize::try_from(boundary) {
        Ok(b) if (INT_SIZE..=page.size()).contains(&b) => Ok(b),
        _ => Err(DbError::CorruptLog(format!(
            "log block boundary {boundary} out of range"
        ))),
    }
}

impl LogManager {
    /// Opens the log file inside the pager's directory. An empty log gets a
    /// fresh first block; otherwise appending continues in the last block.
    pub fn open(pager: Arc<Pager>, log_file: impl Into<String>) -> DbResult<Self> {
        let log_file = log_file.into();
        let block_size = pager.block_size();
        if block_size < MIN_BLOCK_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "block size {block_size} is below the minimum of {MIN_BLOCK_SIZE}"
            )));
        }
        let blocks = pager.block_count(&log_file)?;

        let mut page = Page::new(block_size);
        let current = if blocks == 0 {
            Self::append_new_block(&pager, &log_file, &mut page)?
        } else {
            let current = BlockId::new(log_file.as_str(), blocks - 1);
            pager.read(&current, &mut page)?;
            let boundary = read_boundary(&page)?;
            page.set_int(0, boundary as i64)?;
            current
        };
        debug!(log_file = %log_file, block = %current, "opened log");

        Ok(Self {
            pager,
            log_file,
            state: Mutex::new(LogState {
                page,
                current,
                latest_lsn: 0,
                last_saved_lsn: 0,
            }),
        })
    }

    fn append_new_block(pager: &Pager, log_file: &str, page: &mut Page) -> DbResult<BlockId> {
        let block = pager.append(log_file)?;
        page.contents_mut().fill(0);
        page.set_int(0, pager.block_size() as i64)?;
        pager.write(&block, page)?;
        Ok(block)
    }

    /// Appends one record and returns its LSN. The record is durable only
    /// after a `flush` covering that LSN.
    pub fn append(&self, record: &[u8]) -> DbResult<Lsn> {
        let block_size = self.pager.block_size();
        let needed = FRAME_HEADER + record.len();
        if needed > block_size - INT_SIZE {
            return Err(DbError::RecordTooLarge {
                len: record.len(),
                max: block_size - INT_SIZE - FRAME_HEADER,
            });
        }

        let mut state = self.state.lock();
        let mut boundary = read_boundary(&state.page)?;
        if boundary < needed + INT_SIZE {
            self.pager.write(&state.current, &state.page)?;
            let LogState { page, current, .. } = &mut *state;
            *current = Self::append_new_block(&self.pager, &self.log_file, page)?;
            boundary = block_size;
        }

        let pos = boundary - needed;
        state.page.set_int(pos, record.len() as i64)?;
        state.page.contents_mut()[pos + INT_SIZE..pos + FRAME_HEADER]
            .copy_from_slice(&checksum(record).to_le_bytes());
        state.page.contents_mut()[pos + FRAME_HEADER..boundary].copy_from_slice(record);
        state.page.set_int(0, pos as i64)?;
        state.latest_lsn += 1;
        trace!(lsn = state.latest_lsn, len = record.len(), "appended log record");
        Ok(state.latest_lsn)
    }

    /// Makes every record up to and including `lsn` durable.
    pub fn flush(&self, lsn: Lsn) -> DbResult<()> {
        let mut state = self.state.lock();
        if lsn > state.last_saved_lsn {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    fn flush_locked(&self, state: &mut LogState) -> DbResult<()> {
        self.pager.write(&state.current, &state.page)?;
        state.last_saved_lsn = state.latest_lsn;
        trace!(lsn = state.last_saved_lsn, "flushed log");
        Ok(())
    }

    pub fn latest_lsn(&self) -> Lsn {
        self.state.lock().latest_lsn
    }

    pub fn last_saved_lsn(&self) -> Lsn {
        self.state.lock().last_saved_lsn
    }

    /// Flushes the tail block and returns an iterator over all records,
    /// newest first.
    pub fn iter(&self) -> DbResult<LogIterator> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)?;
        let page = state.page.clone();
        let pos = read_boundary(&page)?;
        Ok(LogIterator {
            pager: self.pager.clone(),
            block: state.current.clone(),
            page,
            pos,
            done: false,
        })
    }
}

/// Walks the log backwards across blocks. It works on its own copy of each
/// block, so appends made during iteration are not observed.
pub struct LogIterator {
    pager: Arc<Pager>,
    block: BlockId,
    page: Page,
    pos: usize,
    done: bool,
}

impl LogIterator {
    fn move_to_previous_block(&mut self) -> DbResult<bool> {
        if self.block.number() == 0 {
            return Ok(false);
        }
        self.block = BlockId::new(self.block.file_name(), self.block.number() - 1);
        self.pager.read(&self.block, &mut self.page)?;
        self.pos = read_boundary(&self.page)?;
        Ok(true)
    }

    fn next_record(&mut self) -> DbResult<Option<Vec<u8>>> {
        while self.pos >= self.page.size() {
            if !self.move_to_previous_block()? {
                return Ok(None);
            }
        }
        let pos = self.pos;
        let size = self.page.size();
        let len = usize::try_from(self.page.get_int(pos)?)
            .ok()
            .filter(|len| pos + FRAME_HEADER + len <= size)
            .ok_or_else(|| {
                DbError::CorruptLog(format!("bad record length at {} offset {pos}", self.block))
            })?;

        let data = self.page.contents();
        let mut crc = [0u8; CRC_SIZE];
        crc.copy_from_slice(&data[pos + INT_SIZE..pos + FRAME_HEADER]);
        let payload = &data[pos + FRAME_HEADER..pos + FRAME_HEADER + len];
        if u32::from_le_bytes(crc) != checksum(payload) {
            return Err(DbError::CorruptLog(format!(
                "checksum mismatch at {} offset {pos}",
                self.block
            )));
        }
        let payload = payload.to_vec();
        self.pos = pos + FRAME_HEADER + len;
        Ok(Some(payload))
    }
}

impl Iterator for LogIterator {
    type Item = DbResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
