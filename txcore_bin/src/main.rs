//! Opens a txcore database, which runs crash recovery, and dumps its log.
//!
//! Configuration comes from the `TXCORE_*` environment variables and log
//! verbosity from `RUST_LOG`.

use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;
use txcore::{Database, DbConfig, DbResult, LogRecord};

fn dump_log(db: &Database) -> DbResult<usize> {
    let mut count = 0;
    for bytes in db.log().iter()? {
        println!("{}", LogRecord::from_bytes(bytes?)?);
        count += 1;
    }
    Ok(count)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DbConfig::from_env();
    let db = match Database::open(config) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };
    match dump_log(&db) {
        Ok(count) => {
            println!("{count} log records in {}", db.config().data_dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to read log");
            ExitCode::FAILURE
        }
    }
}
