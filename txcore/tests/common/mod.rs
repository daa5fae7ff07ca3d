#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use txcore::{BlockId, Database, DbConfig, Transaction};

/// Short waits so that timeout paths finish quickly.
pub fn config(dir: &Path) -> DbConfig {
    DbConfig {
        lock_timeout: Duration::from_millis(500),
        pin_timeout: Duration::from_millis(500),
        pin_retry_interval: Duration::from_millis(20),
        ..DbConfig::new(dir)
    }
}

pub fn open(dir: &Path) -> Database {
    Database::open(config(dir)).expect("open database")
}

/// Reads one integer in its own transaction.
pub fn read_int(db: &Database, block: &BlockId, offset: usize) -> i64 {
    let mut tx = db.begin().unwrap();
    tx.pin(block).unwrap();
    let val = tx.get_int(block, offset).unwrap();
    tx.commit().unwrap();
    val
}

/// Writes one logged integer and commits.
pub fn write_int(db: &Database, block: &BlockId, offset: usize, val: i64) {
    let mut tx: Transaction = db.begin().unwrap();
    tx.pin(block).unwrap();
    tx.set_int(block, offset, val, true).unwrap();
    tx.commit().unwrap();
}
