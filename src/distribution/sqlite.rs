//! SQLite backing store for composition distributions and vector sets.
//!
//! Tables:
//! - `vector_set_t`: one row per vector set (name and window range).
//! - `comp_dist_t`: one row per sample distribution (sequence name and length).
//! - `comp_dist_map_t`: k-mer counts per distribution and window size.
//! - `comp_vector_t`: pi-values per distribution and window size.
//!
//! Writers share one connection behind a mutex. Counts are buffered and written
//! with UPDATE-or-INSERT statements in one transaction per batch. Busy or locked
//! databases are retried a bounded number of times.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use rustc_hash::FxHashMap;

use super::{KmerIter, KmerStore};
use crate::error::{CcvError, Result};
use crate::params::CcvParams;
use crate::vector::CompleteCompositionVector;
use crate::vector_set::{StoredSample, VectorSetBackend};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS vector_set_t (
        vs_id INTEGER PRIMARY KEY AUTOINCREMENT,
        vs_name TEXT,
        start_window_size INTEGER NOT NULL,
        stop_window_size INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS comp_dist_t (
        cd_id INTEGER PRIMARY KEY AUTOINCREMENT,
        vs_id INTEGER NOT NULL REFERENCES vector_set_t (vs_id),
        seq_name TEXT NOT NULL,
        seq_length INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS comp_dist_map_t (
        cd_id INTEGER NOT NULL REFERENCES comp_dist_t (cd_id),
        window_size INTEGER NOT NULL,
        nmer TEXT NOT NULL,
        cnt INTEGER NOT NULL,
        PRIMARY KEY (cd_id, nmer)
    );
    CREATE TABLE IF NOT EXISTS comp_vector_t (
        cd_id INTEGER NOT NULL REFERENCES comp_dist_t (cd_id),
        window_size INTEGER NOT NULL,
        nmer TEXT NOT NULL,
        pi_value REAL NOT NULL,
        PRIMARY KEY (cd_id, nmer)
    );
    CREATE INDEX IF NOT EXISTS comp_dist_map_window_idx ON comp_dist_map_t (cd_id, window_size);
    CREATE INDEX IF NOT EXISTS comp_dist_vs_idx ON comp_dist_t (vs_id);
";

type SharedConnection = Arc<Mutex<Connection>>;

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Run a database operation, retrying transient lock failures.
fn with_retry<T, F>(context: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!("{context}: database busy, retrying ({attempt}/{MAX_RETRIES})");
                thread::sleep(RETRY_DELAY * attempt);
            }
            Err(e) => return Err(CcvError::backing_store(context, e)),
        }
    }
}

fn lock<'a>(conn: &'a SharedConnection, context: &str) -> Result<MutexGuard<'a, Connection>> {
    conn.lock().map_err(|_| CcvError::PoisonedStore {
        context: context.to_string(),
    })
}

/// K-mer counts of one sample distribution (`comp_dist_t` row).
pub struct SqliteStore {
    conn: SharedConnection,
    cd_id: i64,
    pending: FxHashMap<String, u64>,
}

impl SqliteStore {
    pub fn cd_id(&self) -> i64 {
        self.cd_id
    }

    fn context(&self, op: &str) -> String {
        format!("{op} for distribution {}", self.cd_id)
    }
}

impl KmerStore for SqliteStore {
    fn put(&mut self, kmer: &str, count: u64) -> Result<()> {
        if let Some(c) = self.pending.get_mut(kmer) {
            *c += count;
        } else {
            self.pending.insert(kmer.to_string(), count);
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let context = self.context("writing k-mer counts");
        let mut conn = lock(&self.conn, &context)?;
        let cd_id = self.cd_id;
        let pending = &self.pending;
        with_retry(&context, || {
            let tx = conn.transaction()?;
            {
                let mut update = tx.prepare_cached(
                    "UPDATE comp_dist_map_t SET cnt = cnt + ?1 WHERE cd_id = ?2 AND nmer = ?3",
                )?;
                let mut insert = tx.prepare_cached(
                    "INSERT INTO comp_dist_map_t (cd_id, window_size, nmer, cnt) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (kmer, count) in pending {
                    let count = *count as i64;
                    if update.execute((count, cd_id, kmer))? == 0 {
                        insert.execute((cd_id, kmer.len() as i64, kmer, count))?;
                    }
                }
            }
            tx.commit()
        })?;
        drop(conn);

        debug!("Wrote {} k-mer counts for distribution {}", self.pending.len(), self.cd_id);
        self.pending.clear();

        Ok(())
    }

    fn get(&self, kmer: &str) -> Result<u64> {
        let context = self.context("reading k-mer count");
        let conn = lock(&self.conn, &context)?;
        let count: Option<i64> = with_retry(&context, || {
            conn.query_row(
                "SELECT cnt FROM comp_dist_map_t WHERE cd_id = ?1 AND nmer = ?2",
                (self.cd_id, kmer),
                |row| row.get(0),
            )
            .optional()
        })?;

        Ok(count.unwrap_or(0) as u64)
    }

    fn kmers(&self, window: usize) -> Result<KmerIter<'_>> {
        let context = self.context("reading k-mers");
        let conn = lock(&self.conn, &context)?;
        let rows: Vec<(String, i64)> = with_retry(&context, || {
            let mut stmt = conn.prepare_cached(
                "SELECT nmer, cnt FROM comp_dist_map_t WHERE cd_id = ?1 AND window_size = ?2 AND cnt > 0",
            )?;
            let rows = stmt.query_map((self.cd_id, window as i64), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })?;

        Ok(Box::new(
            rows.into_iter().map(|(kmer, count)| Ok((kmer, count as u64))),
        ))
    }

    fn size(&self, window: usize) -> Result<usize> {
        let context = self.context("counting k-mers");
        let conn = lock(&self.conn, &context)?;
        let size: i64 = with_retry(&context, || {
            conn.query_row(
                "SELECT COUNT(*) FROM comp_dist_map_t WHERE cd_id = ?1 AND window_size = ?2 AND cnt > 0",
                (self.cd_id, window as i64),
                |row| row.get(0),
            )
        })?;

        Ok(size as usize)
    }
}

/// A vector set stored in an SQLite database.
pub struct SqliteVectorSet {
    conn: SharedConnection,
    vs_id: i64,
    params: CcvParams,
}

impl SqliteVectorSet {
    /// Open a database, creating the schema if needed.
    ///
    /// With `vs_id`, the existing vector set is reopened and its window range
    /// must match `params`. Otherwise a new vector set named `name` is created.
    pub fn open(path: &Path, params: CcvParams, vs_id: Option<i64>, name: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CcvError::backing_store(format!("opening {}", path.display()), e))?;
        Self::with_connection(conn, params, vs_id, name)
    }

    pub fn with_connection(
        conn: Connection,
        params: CcvParams,
        vs_id: Option<i64>,
        name: &str,
    ) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CcvError::backing_store("setting busy timeout", e))?;
        with_retry("creating schema", || conn.execute_batch(SCHEMA))?;

        let vs_id = match vs_id {
            Some(vs_id) => {
                let stored: Option<(i64, i64)> = with_retry("reading vector set", || {
                    conn.query_row(
                        "SELECT start_window_size, stop_window_size FROM vector_set_t WHERE vs_id = ?1",
                        (vs_id,),
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                })?;
                let (start, end) = stored.ok_or_else(|| {
                    CcvError::format("vector set", format!("no vector set with id {vs_id}"))
                })?;
                params.check_compatibility(&CcvParams::new(start as usize, end as usize)?)?;
                info!("Extending vector set {vs_id}");
                vs_id
            }
            None => {
                with_retry("creating vector set", || {
                    conn.execute(
                        "INSERT INTO vector_set_t (vs_name, start_window_size, stop_window_size) VALUES (?1, ?2, ?3)",
                        (name, params.start() as i64, params.end() as i64),
                    )
                })?;
                let vs_id = conn.last_insert_rowid();
                info!("Created vector set {vs_id} ({name})");
                vs_id
            }
        };

        Ok(SqliteVectorSet {
            conn: Arc::new(Mutex::new(conn)),
            vs_id,
            params,
        })
    }

    pub fn vs_id(&self) -> i64 {
        self.vs_id
    }

    pub fn params(&self) -> &CcvParams {
        &self.params
    }

    fn store(&self, cd_id: i64) -> SqliteStore {
        SqliteStore {
            conn: Arc::clone(&self.conn),
            cd_id,
            pending: FxHashMap::default(),
        }
    }

    /// Stored pi-values of one distribution, in k-mer order.
    pub fn pi_values(&self, cd_id: i64) -> Result<Vec<(String, f64)>> {
        let context = format!("reading pi-values for distribution {cd_id}");
        let conn = lock(&self.conn, &context)?;
        with_retry(&context, || {
            let mut stmt = conn.prepare_cached(
                "SELECT nmer, pi_value FROM comp_vector_t WHERE cd_id = ?1 ORDER BY nmer",
            )?;
            let rows = stmt.query_map((cd_id,), |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }
}

impl VectorSetBackend for SqliteVectorSet {
    type Store = SqliteStore;

    fn create_store(&mut self, name: &str) -> Result<SqliteStore> {
        let context = format!("creating distribution for {name}");
        let conn = lock(&self.conn, &context)?;
        with_retry(&context, || {
            conn.execute(
                "INSERT INTO comp_dist_t (vs_id, seq_name, seq_length) VALUES (?1, ?2, 0)",
                (self.vs_id, name),
            )
        })?;
        let cd_id = conn.last_insert_rowid();
        drop(conn);

        Ok(self.store(cd_id))
    }

    fn save_sample(
        &mut self,
        store: &SqliteStore,
        length: u64,
        vector: &CompleteCompositionVector,
    ) -> Result<()> {
        let context = format!("writing composition vector for {}", vector.name());
        let mut conn = lock(&self.conn, &context)?;
        let cd_id = store.cd_id();
        with_retry(&context, || {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE comp_dist_t SET seq_length = ?1 WHERE cd_id = ?2",
                (length as i64, cd_id),
            )?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT OR REPLACE INTO comp_vector_t (cd_id, window_size, nmer, pi_value) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (kmer, pi) in vector.entries() {
                    insert.execute((cd_id, kmer.len() as i64, kmer, *pi))?;
                }
            }
            tx.commit()
        })
    }

    fn load_samples(&mut self) -> Result<Vec<StoredSample<SqliteStore>>> {
        let rows: Vec<(i64, String, i64)> = {
            let conn = lock(&self.conn, "reading distributions")?;
            with_retry("reading distributions", || {
                let mut stmt = conn.prepare_cached(
                    "SELECT cd_id, seq_name, seq_length FROM comp_dist_t WHERE vs_id = ?1 AND seq_length > 0 ORDER BY cd_id",
                )?;
                let rows = stmt.query_map((self.vs_id,), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect()
            })?
        };

        rows.into_iter()
            .map(|(cd_id, name, length)| {
                Ok(StoredSample {
                    name,
                    length: length as u64,
                    pi_values: self.pi_values(cd_id)?,
                    store: self.store(cd_id),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::CompositionDistribution;
    use crate::sequence::Sequence;
    use tempfile::tempdir;

    #[test]
    fn test_sqlite_matches_memory() -> Result<()> {
        let params = CcvParams::new(3, 4)?;
        let seq = Sequence::new("A", "ACGTACGT")?;
        let memory = CompositionDistribution::from_sequence(params, &seq)?;

        let mut vs = SqliteVectorSet::with_connection(Connection::open_in_memory().unwrap(), params, None, "test")?;
        let store = vs.create_store("A")?;
        let mut dist = CompositionDistribution::with_store(params, store);
        dist.add_sequence(&seq)?;
        dist.add_sequence(&seq)?;

        for window in params.count_windows() {
            assert_eq!(memory.size(window)?, dist.size(window)?);
            for entry in memory.kmers(window)? {
                let (kmer, count) = entry?;
                assert_eq!(dist.count(&kmer)?, 2 * count);
            }
        }
        assert_eq!(dist.count("TTT")?, 0);

        Ok(())
    }

    #[test]
    fn test_reopen_vector_set() -> Result<()> {
        let dir = tempdir()?;
        let db = dir.path().join("ccv.db");
        let params = CcvParams::new(3, 4)?;

        let vs_id = {
            let mut vs = SqliteVectorSet::open(&db, params, None, "corpus")?;
            let mut dist = CompositionDistribution::with_store(params, vs.create_store("B")?);
            dist.add_sequence(&Sequence::new("B", "ACGTTTTT")?)?;
            let ccv = CompleteCompositionVector::from_distribution(0, "B", &dist)?;
            vs.save_sample(dist.store(), dist.length(), &ccv)?;
            vs.vs_id()
        };

        let mut vs = SqliteVectorSet::open(&db, params, Some(vs_id), "corpus")?;
        let samples = vs.load_samples()?;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "B");
        assert_eq!(samples[0].length, 8);
        assert!(!samples[0].pi_values.is_empty());
        assert_eq!(samples[0].store.get("TTT")?, 3);

        // window range must match
        assert!(SqliteVectorSet::open(&db, CcvParams::new(3, 5)?, Some(vs_id), "corpus").is_err());
        assert!(SqliteVectorSet::open(&db, params, Some(vs_id + 10), "corpus").is_err());

        Ok(())
    }

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None)
    }

    #[test]
    fn test_retry_busy_database() -> Result<()> {
        let mut calls = 0;
        let value = with_retry("test", || {
            calls += 1;
            if calls < 3 { Err(busy()) } else { Ok(42) }
        })?;
        assert_eq!(value, 42);
        assert_eq!(calls, 3);

        // other errors are not retried
        let mut calls = 0;
        let result: Result<()> = with_retry("test", || {
            calls += 1;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(matches!(result, Err(CcvError::BackingStore { .. })));
        assert_eq!(calls, 1);

        Ok(())
    }

    #[test]
    fn test_retry_gives_up() {
        let mut calls = 0;
        let result: Result<()> = with_retry("writing k-mer counts", || {
            calls += 1;
            Err(busy())
        });
        assert!(matches!(result, Err(CcvError::BackingStore { .. })));
        assert_eq!(calls, MAX_RETRIES + 1);
    }

    #[test]
    fn test_poisoned_connection() {
        let conn: SharedConnection = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let writer = Arc::clone(&conn);
        let _ = thread::spawn(move || {
            let _guard = writer.lock().unwrap();
            panic!("writer failed");
        })
        .join();

        match lock(&conn, "reading k-mers") {
            Err(CcvError::PoisonedStore { context }) => assert_eq!(context, "reading k-mers"),
            _ => panic!("expected a poisoned store"),
        }
    }
}
