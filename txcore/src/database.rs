//! Opening a database directory and starting transactions.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::buffer_pool::BufferPool;
use crate::config::DbConfig;
use crate::error::DbResult;
use crate::lock_table::LockTable;
use crate::pager::Pager;
use crate::transaction::Transaction;
use crate::wal::LogManager;
use crate::TxNum;

/// Transaction number used by startup recovery. User transactions start at 1
/// or above every number already in the log.
pub const RECOVERY_TX: TxNum = 0;

/// A database instance: the shared pool, log and lock table, plus the
/// transaction counter.
pub struct Database {
    config: DbConfig,
    pool: Arc<BufferPool>,
    lock_table: Arc<LockTable>,
    next_tx_num: AtomicU64,
}

impl Database {
    /// Opens (or creates) the database in `config.data_dir` and rolls back
    /// whatever the last run left unfinished. Any recovery error is returned
    /// and the database is not opened.
    pub fn open(config: DbConfig) -> DbResult<Self> {
        config.validate()?;
        let pager = Arc::new(Pager::open(&config.data_dir, config.block_size)?);
        if pager.is_new() {
            info!(dir = %config.data_dir.display(), "creating new database");
        } else {
            info!(dir = %config.data_dir.display(), "recovering existing database");
        }
        let log = Arc::new(LogManager::open(pager.clone(), config.log_file.as_str())?);
        let pool = Arc::new(BufferPool::new(pager, log, &config));
        let lock_table = Arc::new(LockTable::new(config.lock_timeout));

        let recovery = Transaction::new(RECOVERY_TX, pool.clone(), lock_table.clone())?;
        let max_tx = recovery.recover()?;

        Ok(Self {
            config,
            pool,
            lock_table,
            next_tx_num: AtomicU64::new(max_tx + 1),
        })
    }

    /// Starts a transaction with a fresh number.
    pub fn begin(&self) -> DbResult<Transaction> {
        let tx_num = self.next_tx_num.fetch_add(1, Ordering::SeqCst);
        Transaction::new(tx_num, self.pool.clone(), self.lock_table.clone())
    }

    /// Writes every modified buffer back, whichever transaction changed it.
    pub fn flush(&self) -> DbResult<()> {
        self.pool.flush_everything()
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.lock_table
    }

    pub fn log(&self) -> &Arc<LogManager> {
        self.pool.log()
    }
}
