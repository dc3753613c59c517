//! Connection-pool acquire/release/exhaustion state machine, tracked per
//! `(pid, tid)` key in a correlation table dedicated to pool instrumentation.

/// Which client library a pool-tracking table entry belongs to.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum DbType {
    Sqlite = 0,
    Postgres = 1,
    Mysql = 2,
}

impl DbType {
    pub fn as_str(self) -> &'static str {
        match self {
            DbType::Sqlite => "sqlite",
            DbType::Postgres => "postgres",
            DbType::Mysql => "mysql",
        }
    }
}

/// Per-thread pool-tracking table value. `in_use` makes acquire/release
/// idempotent: a second acquire on an already-`in_use` entry is a no-op
/// (the thread is re-entering the same connection, not opening a new one),
/// and a release on an entry that isn't `in_use` is likewise ignored.
#[derive(Copy, Clone, Debug)]
pub struct PoolState {
    pub db_type: DbType,
    pub acquire_start: u64,
    pub in_use: bool,
}

impl PoolState {
    pub const fn new(db_type: DbType, acquire_start: u64) -> Self {
        Self {
            db_type,
            acquire_start,
            in_use: false,
        }
    }

    /// Returns `true` if this acquire should proceed (table update + wait
    /// timer arm); `false` if it's a redundant re-entry to ignore.
    pub fn begin_acquire(&mut self, now: u64) -> bool {
        if self.in_use {
            return false;
        }
        self.acquire_start = now;
        true
    }

    /// Marks the connection acquired. The acquire event itself fires with
    /// `latency_ns=0` the moment this becomes true; exhaustion wait is
    /// measured separately, between here and the connection's first use.
    pub fn mark_in_use(&mut self) {
        self.in_use = true;
    }

    /// Returns `true` if this release is real (the entry was in use) and
    /// should emit `PoolRelease`; `false` for a release with nothing to
    /// release.
    pub fn release(&mut self) -> bool {
        if !self.in_use {
            return false;
        }
        self.in_use = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_acquire_on_in_use_entry_is_ignored() {
        let mut s = PoolState::new(DbType::Postgres, 100);
        assert!(s.begin_acquire(100));
        s.mark_in_use();
        assert!(!s.begin_acquire(200), "already in use, should not re-arm");
    }

    #[test]
    fn release_without_acquire_is_ignored() {
        let mut s = PoolState::new(DbType::Mysql, 0);
        assert!(!s.release());
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let mut s = PoolState::new(DbType::Sqlite, 0);
        assert!(s.begin_acquire(10));
        s.mark_in_use();
        assert!(s.release());
        assert!(!s.release(), "second release has nothing left to release");
    }

    #[test]
    fn db_type_names() {
        assert_eq!(DbType::Sqlite.as_str(), "sqlite");
        assert_eq!(DbType::Postgres.as_str(), "postgres");
        assert_eq!(DbType::Mysql.as_str(), "mysql");
    }
}
