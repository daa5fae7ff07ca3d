//! Error types shared by every layer of the kernel.

use std::io;

use thiserror::Error;

use crate::block::BlockId;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// A shared or exclusive lock could not be granted within the wait bound.
    /// The owning transaction has to roll back.
    #[error("lock wait on {block} timed out")]
    LockAbort { block: BlockId },

    /// Every buffer stayed pinned for the whole wait bound.
    #[error("no buffer available for {block}, possible deadlock")]
    BufferAbort { block: BlockId },

    #[error("no buffer pinned for {block} in this transaction")]
    UnknownBuffer { block: BlockId },

    #[error("access of {len} bytes at offset {offset} overflows page of {size} bytes")]
    PageOverflow { offset: usize, len: usize, size: usize },

    #[error("log record of {len} bytes exceeds the {max} bytes a log block can hold")]
    RecordTooLarge { len: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DbError {
    /// True for the two timeout failures that callers answer with a rollback.
    pub fn is_abort(&self) -> bool {
        matches!(self, DbError::LockAbort { .. } | DbError::BufferAbort { .. })
    }
}
