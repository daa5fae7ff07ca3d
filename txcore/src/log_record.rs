//! Undo log records and their on-log encoding.
//!
//! Every record starts with an 8-byte op tag. START, COMMIT and ROLLBACK add
//! the transaction number. SETINT and SETSTRING add the transaction number,
//! the block (file name as a length-prefixed string, then the block number),
//! the offset and the value that was there before the write. For SETSTRING
//! that value is the raw bytes the new string covered, whatever they held,
//! so undo puts back exactly what was there.

use std::fmt;

use crate::block::BlockId;
use crate::error::{DbError, DbResult};
use crate::page::{Page, INT_SIZE};
use crate::TxNum;

pub const CHECKPOINT: i64 = 0;
pub const START: i64 = 1;
pub const COMMIT: i64 = 2;
pub const ROLLBACK: i64 = 3;
pub const SETINT: i64 = 4;
pub const SETSTRING: i64 = 5;

/// What an undo needs from the transaction applying it. Writes made here
/// must not be logged themselves.
pub trait UndoContext {
    fn pin(&mut self, block: &BlockId) -> DbResult<()>;
    fn unpin(&mut self, block: &BlockId) -> DbResult<()>;
    fn set_int(&mut self, block: &BlockId, offset: usize, val: i64, ok_to_log: bool) -> DbResult<()>;
    fn set_raw(&mut self, block: &BlockId, offset: usize, bytes: &[u8]) -> DbResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Checkpoint,
    Start {
        tx_num: TxNum,
    },
    Commit {
        tx_num: TxNum,
    },
    Rollback {
        tx_num: TxNum,
    },
    SetInt {
        tx_num: TxNum,
        block: BlockId,
        offset: usize,
        old: i64,
    },
    SetString {
        tx_num: TxNum,
        block: BlockId,
        offset: usize,
        old: Vec<u8>,
    },
}

struct Reader {
    page: Page,
    pos: usize,
}

impl Reader {
    fn int(&mut self) -> DbResult<i64> {
        let v = self.page.get_int(self.pos)?;
        self.pos += INT_SIZE;
        Ok(v)
    }

    fn unsigned(&mut self, what: &str) -> DbResult<u64> {
        let v = self.int()?;
        u64::try_from(v).map_err(|_| DbError::CorruptLog(format!("negative {what} {v}")))
    }

    fn bytes(&mut self) -> DbResult<Vec<u8>> {
        let bytes = self.page.get_bytes(self.pos)?.to_vec();
        self.pos += Page::max_length(bytes.len());
        Ok(bytes)
    }

    fn string(&mut self) -> DbResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| DbError::CorruptLog(format!("file name is not UTF-8: {e}")))
    }
}

impl LogRecord {
    pub fn op(&self) -> i64 {
        match self {
            LogRecord::Checkpoint => CHECKPOINT,
            LogRecord::Start { .. } => START,
            LogRecord::Commit { .. } => COMMIT,
            LogRecord::Rollback { .. } => ROLLBACK,
            LogRecord::SetInt { .. } => SETINT,
            LogRecord::SetString { .. } => SETSTRING,
        }
    }

    /// The transaction the record belongs to. CHECKPOINT has none.
    pub fn tx_number(&self) -> Option<TxNum> {
        match self {
            LogRecord::Checkpoint => None,
            LogRecord::Start { tx_num }
            | LogRecord::Commit { tx_num }
            | LogRecord::Rollback { tx_num }
            | LogRecord::SetInt { tx_num, .. }
            | LogRecord::SetString { tx_num, .. } => Some(*tx_num),
        }
    }

    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        let mut len = INT_SIZE;
        if self.tx_number().is_some() {
            len += INT_SIZE;
        }
        match self {
            LogRecord::SetInt { block, .. } => {
                len += Page::max_length(block.file_name().len()) + 3 * INT_SIZE;
            }
            LogRecord::SetString { block, old, .. } => {
                len += Page::max_length(block.file_name().len())
                    + 2 * INT_SIZE
                    + Page::max_length(old.len());
            }
            _ => {}
        }

        let mut page = Page::new(len);
        page.set_int(0, self.op())?;
        let mut pos = INT_SIZE;
        if let Some(tx_num) = self.tx_number() {
            page.set_int(pos, tx_num as i64)?;
            pos += INT_SIZE;
        }
        if let LogRecord::SetInt { block, offset, .. } | LogRecord::SetString { block, offset, .. } =
            self
        {
            page.set_string(pos, block.file_name())?;
            pos += Page::max_length(block.file_name().len());
            page.set_int(pos, block.number() as i64)?;
            pos += INT_SIZE;
            page.set_int(pos, *offset as i64)?;
            pos += INT_SIZE;
        }
        match self {
            LogRecord::SetInt { old, .. } => page.set_int(pos, *old)?,
            LogRecord::SetString { old, .. } => page.set_bytes(pos, old)?,
            _ => {}
        }
        Ok(page.into_bytes())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> DbResult<Self> {
        let mut r = Reader {
            page: Page::from_bytes(bytes),
            pos: 0,
        };
        Self::decode(&mut r).map_err(|e| match e {
            DbError::PageOverflow { .. } => DbError::CorruptLog(format!("truncated log record: {e}")),
            other => other,
        })
    }

    fn decode(r: &mut Reader) -> DbResult<Self> {
        let op = r.int()?;
        if op == CHECKPOINT {
            return Ok(LogRecord::Checkpoint);
        }
        let tx_num = r.unsigned("transaction number")?;
        let record = match op {
            START => LogRecord::Start { tx_num },
            COMMIT => LogRecord::Commit { tx_num },
            ROLLBACK => LogRecord::Rollback { tx_num },
            SETINT | SETSTRING => {
                let file_name = r.string()?;
                let number = r.unsigned("block number")?;
                let offset = r.unsigned("offset")? as usize;
                let block = BlockId::new(file_name, number);
                if op == SETINT {
                    LogRecord::SetInt {
                        tx_num,
                        block,
                        offset,
                        old: r.int()?,
                    }
                } else {
                    LogRecord::SetString {
                        tx_num,
                        block,
                        offset,
                        old: r.bytes()?,
                    }
                }
            }
            other => return Err(DbError::CorruptLog(format!("unknown log record op {other}"))),
        };
        Ok(record)
    }

    /// Restores the pre-image for SETINT and SETSTRING. Other records have
    /// nothing to undo.
    pub fn undo(&self, ctx: &mut impl UndoContext) -> DbResult<()> {
        match self {
            LogRecord::SetInt {
                block, offset, old, ..
            } => {
                ctx.pin(block)?;
                let res = ctx.set_int(block, *offset, *old, false);
                ctx.unpin(block)?;
                res
            }
            LogRecord::SetString {
                block, offset, old, ..
            } => {
                ctx.pin(block)?;
                let res = ctx.set_raw(block, *offset, old);
                ctx.unpin(block)?;
                res
            }
            _ => Ok(()),
        }
    }
}

/// The string a SETSTRING pre-image starts with, or its bytes in hex when
/// they don't start with one.
fn describe(raw: &[u8]) -> String {
    let page = Page::from_bytes(raw.to_vec());
    match page.get_bytes(0) {
        Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Err(_) => raw.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Checkpoint => write!(f, "<CHECKPOINT>"),
            LogRecord::Start { tx_num } => write!(f, "<START {tx_num}>"),
            LogRecord::Commit { tx_num } => write!(f, "<COMMIT {tx_num}>"),
            LogRecord::Rollback { tx_num } => write!(f, "<ROLLBACK {tx_num}>"),
            LogRecord::SetInt {
                tx_num,
                block,
                offset,
                old,
            } => write!(
                f,
                "<SETINT {tx_num} {} {} {offset} {old}>",
                block.file_name(),
                block.number()
            ),
            LogRecord::SetString {
                tx_num,
                block,
                offset,
                old,
            } => write!(
                f,
                "<SETSTRING {tx_num} {} {} {offset} {}>",
                block.file_name(),
                block.number(),
                describe(old)
            ),
        }
    }
}
