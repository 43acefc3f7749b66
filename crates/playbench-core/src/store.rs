//! SQLite persistence for build state, samples and comparison overviews.
//!
//! The store is the only resource shared across concurrent units of work.
//! Every write identifies its owning version or comparison-build, so the
//! store needs no locking discipline beyond serializing individual
//! statements; [`SharedStore`] wraps one connection in a mutex for that.
//!
//! Tables:
//!
//! - `build`: one row per version, the persisted stage pointer
//! - `comparison`: one row per comparison run, `ready` flips once complete
//! - `comparison_build`: join row tying a version to a comparison
//! - `sample`: append-only per-interval resource readings
//! - `overview`: one aggregate row per comparison build, written once
//!
//! The read-only query methods at the bottom are the interface consumed by
//! the external dashboard layer.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

use crate::build::BuildState;

/// Errors from [`Store`] operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row carried a state string no [`BuildState`] maps to.
    #[error("unknown build state in database: {0}")]
    UnknownState(String),

    /// The shared store mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// DDL loaded on every open.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS build (
    version TEXT PRIMARY KEY,
    state   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS comparison (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    media TEXT NOT NULL,
    ready INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS comparison_build (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    comparison_id INTEGER NOT NULL REFERENCES comparison(id),
    build_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sample (
    comparison_build_id INTEGER NOT NULL REFERENCES comparison_build(id),
    interval  INTEGER NOT NULL,
    cpu       REAL NOT NULL,
    ram       REAL NOT NULL,
    threads   INTEGER NOT NULL,
    ram_bytes INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sample_cb ON sample(comparison_build_id, interval);

CREATE TABLE IF NOT EXISTS overview (
    comparison_build_id INTEGER PRIMARY KEY,
    cpu        REAL NOT NULL,
    ram        REAL NOT NULL,
    threads    REAL NOT NULL,
    ram_bytes  REAL NOT NULL,
    leak_count INTEGER,
    leak_bytes INTEGER
);
";

/// One per-interval resource reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub comparison_build_id: i64,
    /// Contiguous from 0 for a given comparison build.
    pub interval: u64,
    pub cpu: f64,
    pub ram: f64,
    pub threads: u64,
    pub ram_bytes: u64,
}

/// Aggregated (time-averaged) metrics for one comparison build.
#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    pub comparison_build_id: i64,
    pub cpu: f64,
    pub ram: f64,
    pub threads: f64,
    pub ram_bytes: f64,
    /// Number of leaked allocations, when a leak-trace artifact was found.
    pub leak_count: Option<u64>,
    /// Total bytes leaked across all recorded allocations.
    pub leak_bytes: Option<u64>,
}

/// One comparison run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRow {
    pub id: i64,
    pub media: String,
    pub ready: bool,
}

/// Join row tying a version's build to a comparison run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonBuildRow {
    pub id: i64,
    pub comparison_id: i64,
    pub version: String,
}

/// Store shared between concurrent builders and samplers.
pub type SharedStore = Arc<Mutex<Store>>;

/// Lock a [`SharedStore`], translating poisoning into a [`StoreError`].
pub fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, Store>, StoreError> {
    store.lock().map_err(|_| StoreError::Poisoned)
}

/// SQLite-backed persistence for the whole pipeline.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Wrap this store for sharing across tasks.
    #[must_use]
    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    // ── Build state ─────────────────────────────────────────────────────

    /// Persisted build state for a version. Versions never built read as
    /// [`BuildState::Unstarted`].
    pub fn build_state(&self, version: &str) -> Result<BuildState, StoreError> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM build WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?;

        match state {
            None => Ok(BuildState::Unstarted),
            Some(s) => BuildState::parse(&s).ok_or(StoreError::UnknownState(s)),
        }
    }

    /// Persist a version's build state, creating its row on first use.
    pub fn set_build_state(&self, version: &str, state: BuildState) -> Result<(), StoreError> {
        debug!(version, state = state.as_str(), "persisting build state");
        self.conn.execute(
            "INSERT INTO build (version, state) VALUES (?1, ?2) \
             ON CONFLICT(version) DO UPDATE SET state = excluded.state",
            params![version, state.as_str()],
        )?;
        Ok(())
    }

    // ── Comparison lifecycle ────────────────────────────────────────────

    /// Create a comparison run (not ready) and return its id.
    pub fn create_comparison(&self, media: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO comparison (media, ready) VALUES (?1, 0)",
            params![media],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark a comparison ready once all its samplers have finished.
    pub fn finish_comparison(&self, comparison_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE comparison SET ready = 1 WHERE id = ?1",
            params![comparison_id],
        )?;
        Ok(())
    }

    /// Create the join row for a version participating in a comparison.
    pub fn create_comparison_build(
        &self,
        comparison_id: i64,
        version: &str,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO comparison_build (comparison_id, build_version) VALUES (?1, ?2)",
            params![comparison_id, version],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ── Samples and overview ────────────────────────────────────────────

    /// Append one per-interval sample row.
    pub fn insert_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sample (comparison_build_id, interval, cpu, ram, threads, ram_bytes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.comparison_build_id,
                sample.interval as i64,
                sample.cpu,
                sample.ram,
                sample.threads as i64,
                sample.ram_bytes as i64,
            ],
        )?;
        Ok(())
    }

    /// Write the aggregate row for a comparison build. Written exactly once
    /// after sampling completes.
    pub fn insert_overview(&self, overview: &Overview) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO overview \
             (comparison_build_id, cpu, ram, threads, ram_bytes, leak_count, leak_bytes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                overview.comparison_build_id,
                overview.cpu,
                overview.ram,
                overview.threads,
                overview.ram_bytes,
                overview.leak_count.map(|v| v as i64),
                overview.leak_bytes.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    // ── Read-only queries (dashboard interface) ─────────────────────────

    /// Fetch a comparison row.
    pub fn comparison(&self, comparison_id: i64) -> Result<Option<ComparisonRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, media, ready FROM comparison WHERE id = ?1",
                params![comparison_id],
                |row| {
                    Ok(ComparisonRow {
                        id: row.get(0)?,
                        media: row.get(1)?,
                        ready: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?)
    }

    /// Join rows for a comparison, in creation order.
    pub fn comparison_builds(
        &self,
        comparison_id: i64,
    ) -> Result<Vec<ComparisonBuildRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, comparison_id, build_version FROM comparison_build \
             WHERE comparison_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![comparison_id], |row| {
            Ok(ComparisonBuildRow {
                id: row.get(0)?,
                comparison_id: row.get(1)?,
                version: row.get(2)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Sample time series for a comparison build, ordered by interval.
    pub fn samples(&self, comparison_build_id: i64) -> Result<Vec<Sample>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT comparison_build_id, interval, cpu, ram, threads, ram_bytes \
             FROM sample WHERE comparison_build_id = ?1 ORDER BY interval",
        )?;
        let rows = stmt.query_map(params![comparison_build_id], |row| {
            Ok(Sample {
                comparison_build_id: row.get(0)?,
                interval: row.get::<_, i64>(1)? as u64,
                cpu: row.get(2)?,
                ram: row.get(3)?,
                threads: row.get::<_, i64>(4)? as u64,
                ram_bytes: row.get::<_, i64>(5)? as u64,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Aggregate row for a comparison build, if sampling recorded one.
    pub fn overview(&self, comparison_build_id: i64) -> Result<Option<Overview>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT comparison_build_id, cpu, ram, threads, ram_bytes, leak_count, leak_bytes \
                 FROM overview WHERE comparison_build_id = ?1",
                params![comparison_build_id],
                |row| {
                    Ok(Overview {
                        comparison_build_id: row.get(0)?,
                        cpu: row.get(1)?,
                        ram: row.get(2)?,
                        threads: row.get(3)?,
                        ram_bytes: row.get(4)?,
                        leak_count: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                        leak_bytes: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                    })
                },
            )
            .optional()?)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn unknown_version_reads_unstarted() {
        let store = store();
        assert_eq!(store.build_state("2.1.0").unwrap(), BuildState::Unstarted);
    }

    #[test]
    fn build_state_roundtrip() {
        let store = store();
        store
            .set_build_state("2.1.0", BuildState::Configured)
            .unwrap();
        assert_eq!(store.build_state("2.1.0").unwrap(), BuildState::Configured);

        store
            .set_build_state("2.1.0", BuildState::Installed)
            .unwrap();
        assert_eq!(store.build_state("2.1.0").unwrap(), BuildState::Installed);
    }

    #[test]
    fn comparison_lifecycle() {
        let store = store();
        let id = store.create_comparison("movie.mkv").unwrap();

        let row = store.comparison(id).unwrap().unwrap();
        assert_eq!(row.media, "movie.mkv");
        assert!(!row.ready);

        let cb1 = store.create_comparison_build(id, "2.1.0").unwrap();
        let cb2 = store.create_comparison_build(id, "3.0.1").unwrap();
        assert_ne!(cb1, cb2);

        let builds = store.comparison_builds(id).unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].version, "2.1.0");
        assert_eq!(builds[1].version, "3.0.1");

        store.finish_comparison(id).unwrap();
        assert!(store.comparison(id).unwrap().unwrap().ready);
    }

    #[test]
    fn samples_ordered_by_interval() {
        let store = store();
        let id = store.create_comparison("movie.mkv").unwrap();
        let cb = store.create_comparison_build(id, "2.1.0").unwrap();

        for interval in 0..3u64 {
            store
                .insert_sample(&Sample {
                    comparison_build_id: cb,
                    interval,
                    cpu: 10.0 * interval as f64,
                    ram: 1.5,
                    threads: 4,
                    ram_bytes: 1024,
                })
                .unwrap();
        }

        let samples = store.samples(cb).unwrap();
        assert_eq!(samples.len(), 3);
        let intervals: Vec<u64> = samples.iter().map(|s| s.interval).collect();
        assert_eq!(intervals, vec![0, 1, 2]);
    }

    #[test]
    fn overview_roundtrip_with_and_without_leaks() {
        let store = store();
        let id = store.create_comparison("movie.mkv").unwrap();
        let cb_clean = store.create_comparison_build(id, "2.1.0").unwrap();
        let cb_leaky = store.create_comparison_build(id, "3.0.1").unwrap();

        store
            .insert_overview(&Overview {
                comparison_build_id: cb_clean,
                cpu: 42.5,
                ram: 3.25,
                threads: 17.0,
                ram_bytes: 1_048_576.0,
                leak_count: None,
                leak_bytes: None,
            })
            .unwrap();
        store
            .insert_overview(&Overview {
                comparison_build_id: cb_leaky,
                cpu: 40.0,
                ram: 3.0,
                threads: 16.0,
                ram_bytes: 1_000_000.0,
                leak_count: Some(2),
                leak_bytes: Some(48),
            })
            .unwrap();

        let clean = store.overview(cb_clean).unwrap().unwrap();
        assert!(clean.leak_count.is_none());
        assert!(clean.leak_bytes.is_none());

        let leaky = store.overview(cb_leaky).unwrap().unwrap();
        assert_eq!(leaky.leak_count, Some(2));
        assert_eq!(leaky.leak_bytes, Some(48));

        assert!(store.overview(9999).unwrap().is_none());
    }

    #[test]
    fn open_creates_file_backed_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("pb.sqlite");
        {
            let store = Store::open(&path).unwrap();
            store
                .set_build_state("2.1.0", BuildState::Compiled)
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.build_state("2.1.0").unwrap(), BuildState::Compiled);
    }
}
