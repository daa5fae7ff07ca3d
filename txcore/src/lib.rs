pub mod block;

pub mod buffer;

pub mod buffer_pool;

pub mod concurrency;

pub mod config;

pub mod database;

pub mod error;

pub mod failpoint;

pub mod lock_table;

pub mod log_record;

pub mod page;

pub mod pager;

pub mod recovery;

pub mod replacer;

pub mod transaction;

pub mod wal;

pub type TxNum = u64;

pub use block::BlockId;
pub use config::DbConfig;
pub use database::Database;
pub use error::{DbError, DbResult};
pub use log_record::LogRecord;
pub use page::Page;
pub use transaction::Transaction;
