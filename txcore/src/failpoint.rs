//! Named failure injection points for crash testing.
//!
//! A point fires when it is enabled on the current thread or listed in the
//! comma-separated `TXCORE_FAILPOINTS` environment variable.
use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::sync::OnceLock;

use tracing::warn;

pub const POOL_FLUSH_BEFORE_PAGE: &str = "pool.flush.before_page";
pub const TX_COMMIT_BEFORE_LOG: &str = "tx.commit.before_log";
pub const TX_ROLLBACK_BEFORE_LOG: &str = "tx.rollback.before_log";

const ENV_VAR: &str = "TXCORE_FAILPOINTS";

thread_local! {
    static ENABLED: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Points listed in the environment. Read once per process.
fn from_env() -> &'static HashSet<String> {
    static POINTS: OnceLock<HashSet<String>> = OnceLock::new();
    POINTS.get_or_init(|| {
        std::env::var(ENV_VAR)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    })
}

/// Arms `name` on the calling thread only.
pub fn enable(name: &str) {
    ENABLED.with_borrow_mut(|points| points.insert(name.to_string()));
}

pub fn disable(name: &str) {
    ENABLED.with_borrow_mut(|points| points.remove(name));
}

/// Disarms every point armed on the calling thread.
pub fn clear() {
    ENABLED.with_borrow_mut(HashSet::clear);
}

pub fn is_enabled(name: &str) -> bool {
    ENABLED.with_borrow(|points| points.contains(name)) || from_env().contains(name)
}

/// Fails with an I/O error when `name` is armed.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if !is_enabled(name) {
        return Ok(());
    }
    warn!(failpoint = name, "injecting failure");
    Err(io::Error::other(format!("failpoint triggered: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_local_points() {
        assert!(maybe_fail("test.point").is_ok());
        enable("test.point");
        let err = maybe_fail("test.point").unwrap_err();
        assert_eq!(err.to_string(), "failpoint triggered: test.point");
        // Other threads are unaffected.
        std::thread::spawn(|| assert!(!is_enabled("test.point")))
            .join()
            .unwrap();
        disable("test.point");
        assert!(!is_enabled("test.point"));
        enable("test.point");
        clear();
        assert!(!is_enabled("test.point"));
    }
}
