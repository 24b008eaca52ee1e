use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use duckdb::{params, types::ToSql, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::SampleStore;
use crate::error::{PeakError, Result};
use crate::models::{Outcome, Sample, Window};

const SLOW_QUERY: Duration = Duration::from_millis(500);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS players (
        server VARCHAR NOT NULL,
        timestamp BIGINT NOT NULL,
        player_count INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS server_groups (
        id VARCHAR PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS server_group_members (
        server VARCHAR PRIMARY KEY,
        group_id VARCHAR NOT NULL
    );
";

const SELECT_WINDOW: &str = "
    SELECT server, timestamp, player_count
    FROM players
    WHERE timestamp >= ? AND timestamp <= ?
    ORDER BY timestamp, rowid";

const SELECT_WINDOW_FOR_SERVER: &str = "
    SELECT server, timestamp, player_count
    FROM players
    WHERE timestamp >= ? AND timestamp <= ? AND server = ?
    ORDER BY timestamp, rowid";

const SELECT_LAST_BEFORE: &str = "
    SELECT server, timestamp, player_count
    FROM (
        SELECT server, timestamp, player_count,
               row_number() OVER (PARTITION BY server ORDER BY timestamp DESC, rowid DESC) AS rn
        FROM players
        WHERE timestamp < ?
    )
    WHERE rn = 1
    ORDER BY server";

const SELECT_LAST_BEFORE_FOR_SERVER: &str = "
    SELECT server, timestamp, player_count
    FROM players
    WHERE timestamp < ? AND server = ?
    ORDER BY timestamp DESC, rowid DESC
    LIMIT 1";

const DELETE_THROUGH: &str = "DELETE FROM players WHERE timestamp <= ?";

// Keeps each server's latest non-zero row at or before the cutoff.
const DELETE_THROUGH_KEEPING_LATEST: &str = "
    DELETE FROM players
    WHERE timestamp <= ?
      AND rowid NOT IN (
        SELECT rid
        FROM (
            SELECT rowid AS rid, player_count,
                   row_number() OVER (PARTITION BY server ORDER BY timestamp DESC, rowid DESC) AS rn
            FROM players
            WHERE timestamp <= ?
        )
        WHERE rn = 1 AND player_count > 0
      )";

/// DuckDB-backed sample and group store.
#[derive(Clone)]
pub struct DuckDbStore {
    db: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Opens (or creates) the database at `path`. `:memory:` opens a
    /// throwaway in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        info!("Opened sample store at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the blocking pool with the connection locked. Used for
    /// the scans and deletes that can touch a whole month of samples.
    async fn with_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| PeakError::Internal(format!("Store task failed: {}", e)))?
    }
}

fn read_samples(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> duckdb::Result<Vec<Sample>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok(Sample {
            series_id: row.get(0)?,
            timestamp: row.get(1)?,
            value: row.get(2)?,
        })
    })?;
    let samples = rows.collect::<duckdb::Result<Vec<_>>>()?;
    Ok(samples)
}

fn read_strings(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> duckdb::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| row.get(0))?;
    let values = rows.collect::<duckdb::Result<Vec<String>>>()?;
    Ok(values)
}

fn group_exists_exact(conn: &Connection, id: &str) -> duckdb::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM server_groups WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn log_query(label: &str, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > SLOW_QUERY {
        warn!("Slow store query {} ({} ms)", label, elapsed.as_millis());
    } else {
        debug!("Store query {} ({} ms)", label, elapsed.as_millis());
    }
}

#[async_trait]
impl SampleStore for DuckDbStore {
    async fn insert_samples(&self, samples: &[Sample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO players (server, timestamp, player_count) VALUES (?, ?, ?)")?;
            for sample in samples {
                stmt.execute(params![sample.series_id, sample.timestamp, sample.value])?;
            }
        }
        tx.commit()?;
        log_query("insert_samples", started);

        Ok(samples.len())
    }

    async fn samples_in_window(&self, window: Window, series: Option<&[String]>) -> Result<Vec<Sample>> {
        let series = series.map(<[String]>::to_vec);

        self.with_blocking(move |conn| {
            let started = Instant::now();
            let samples = match series {
                None => read_samples(conn, SELECT_WINDOW, params![window.start, window.end])?,
                Some(series) => {
                    let mut samples = Vec::new();
                    for server in &series {
                        samples.extend(read_samples(
                            conn,
                            SELECT_WINDOW_FOR_SERVER,
                            params![window.start, window.end, server],
                        )?);
                    }
                    samples
                }
            };
            log_query("samples_in_window", started);

            Ok(samples)
        })
        .await
    }

    async fn last_samples_before(&self, timestamp: i64, series: Option<&[String]>) -> Result<Vec<Sample>> {
        let series = series.map(<[String]>::to_vec);

        self.with_blocking(move |conn| {
            let started = Instant::now();
            let samples = match series {
                None => read_samples(conn, SELECT_LAST_BEFORE, params![timestamp])?,
                Some(series) => {
                    let mut samples = Vec::new();
                    for server in &series {
                        samples.extend(read_samples(
                            conn,
                            SELECT_LAST_BEFORE_FOR_SERVER,
                            params![timestamp, server],
                        )?);
                    }
                    samples
                }
            };
            log_query("last_samples_before", started);

            Ok(samples)
        })
        .await
    }

    async fn prune_through(&self, cutoff: i64, keep_latest: bool) -> Result<u64> {
        self.with_blocking(move |conn| {
            let started = Instant::now();
            let affected = if keep_latest {
                conn.execute(DELETE_THROUGH_KEEPING_LATEST, params![cutoff, cutoff])?
            } else {
                conn.execute(DELETE_THROUGH, params![cutoff])?
            };
            log_query("prune_through", started);

            Ok(affected as u64)
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<String>> {
        let conn = self.db.lock().await;
        Ok(read_strings(&conn, "SELECT id FROM server_groups ORDER BY id", params![])?)
    }

    async fn group_exists(&self, id: &str) -> Result<bool> {
        let conn = self.db.lock().await;
        Ok(group_exists_exact(&conn, id)?)
    }

    async fn group_members(&self, id: &str) -> Result<Vec<String>> {
        let conn = self.db.lock().await;
        Ok(read_strings(
            &conn,
            "SELECT server FROM server_group_members WHERE group_id = ? ORDER BY server",
            params![id],
        )?)
    }

    async fn memberships(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare("SELECT group_id, server FROM server_group_members ORDER BY group_id, server")?;
        let rows = stmt.query_map(params![], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (group, server) = row?;
            groups.entry(group).or_default().push(server);
        }

        Ok(groups)
    }

    async fn create_group(&self, id: &str) -> Result<Outcome<()>> {
        let conn = self.db.lock().await;
        let clashes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM server_groups WHERE lower(id) = lower(?)",
            params![id],
            |row| row.get(0),
        )?;
        if clashes > 0 {
            return Ok(Outcome::AlreadyExists);
        }

        conn.execute("INSERT INTO server_groups (id) VALUES (?)", params![id])?;
        info!("Created group {}", id);
        Ok(Outcome::Applied(()))
    }

    async fn delete_group(&self, id: &str) -> Result<Outcome<()>> {
        let mut conn = self.db.lock().await;
        if !group_exists_exact(&conn, id)? {
            return Ok(Outcome::NotFound);
        }

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM server_group_members WHERE group_id = ?", params![id])?;
        tx.execute("DELETE FROM server_groups WHERE id = ?", params![id])?;
        tx.commit()?;
        info!("Deleted group {}", id);
        Ok(Outcome::Applied(()))
    }

    async fn add_member(&self, group: &str, series: &str) -> Result<Outcome<()>> {
        let conn = self.db.lock().await;
        if !group_exists_exact(&conn, group)? {
            return Ok(Outcome::NotFound);
        }

        conn.execute(
            "INSERT INTO server_group_members (server, group_id) VALUES (?, ?)
             ON CONFLICT (server) DO UPDATE SET group_id = excluded.group_id",
            params![series, group],
        )?;
        info!("Added {} to group {}", series, group);
        Ok(Outcome::Applied(()))
    }

    async fn remove_member(&self, group: &str, series: &str) -> Result<Outcome<()>> {
        let conn = self.db.lock().await;
        if !group_exists_exact(&conn, group)? {
            return Ok(Outcome::NotFound);
        }

        let removed = conn.execute(
            "DELETE FROM server_group_members WHERE group_id = ? AND server = ?",
            params![group, series],
        )?;
        if removed == 0 {
            return Ok(Outcome::NotFound);
        }
        info!("Removed {} from group {}", series, group);
        Ok(Outcome::Applied(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn s(series: &str, timestamp: i64, value: i32) -> Sample {
        Sample::new(series, timestamp, value)
    }

    #[tokio::test]
    async fn test_window_scan_is_inclusive_and_ordered() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store
            .insert_samples(&[
                s("lobby", 300, 1),
                s("lobby", 100, 2),
                s("survival", 200, 3),
                s("lobby", 99, 4),
                s("lobby", 301, 5),
            ])
            .await
            .unwrap();

        let samples = store.samples_in_window(Window::new(100, 300), None).await.unwrap();
        assert_eq!(
            samples,
            vec![s("lobby", 100, 2), s("survival", 200, 3), s("lobby", 300, 1)]
        );

        let only = vec!["survival".to_string()];
        let samples = store
            .samples_in_window(Window::new(100, 300), Some(&only))
            .await
            .unwrap();
        assert_eq!(samples, vec![s("survival", 200, 3)]);
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_keep_insertion_order() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store.insert_samples(&[s("lobby", 10, 1)]).await.unwrap();
        store.insert_samples(&[s("lobby", 10, 7)]).await.unwrap();

        let samples = store.samples_in_window(Window::new(0, 20), None).await.unwrap();
        assert_eq!(samples, vec![s("lobby", 10, 1), s("lobby", 10, 7)]);

        let last = store.last_samples_before(11, None).await.unwrap();
        assert_eq!(last, vec![s("lobby", 10, 7)]);
    }

    #[tokio::test]
    async fn test_last_samples_before() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store
            .insert_samples(&[
                s("lobby", 10, 1),
                s("lobby", 20, 2),
                s("survival", 5, 3),
                s("survival", 50, 4),
            ])
            .await
            .unwrap();

        let last = store.last_samples_before(30, None).await.unwrap();
        assert_eq!(last, vec![s("lobby", 20, 2), s("survival", 5, 3)]);

        let only = vec!["lobby".to_string(), "missing".to_string()];
        let last = store.last_samples_before(20, Some(&only)).await.unwrap();
        assert_eq!(last, vec![s("lobby", 10, 1)]);
    }

    #[tokio::test]
    async fn test_prune_through() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store
            .insert_samples(&[s("lobby", 10, 1), s("lobby", 20, 2), s("lobby", 30, 3)])
            .await
            .unwrap();

        assert_eq!(store.prune_through(20, false).await.unwrap(), 2);
        let left = store.samples_in_window(Window::new(0, 100), None).await.unwrap();
        assert_eq!(left, vec![s("lobby", 30, 3)]);
    }

    #[tokio::test]
    async fn test_prune_through_keeps_latest_held_value() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store
            .insert_samples(&[
                s("lobby", 10, 1),
                s("lobby", 20, 2),
                s("lobby", 30, 3),
                s("survival", 5, 4),
                s("survival", 15, 6),
                s("gone", 12, 5),
                s("gone", 18, 0),
            ])
            .await
            .unwrap();

        // a trailing zero carries nothing, so gone loses every row
        assert_eq!(store.prune_through(20, true).await.unwrap(), 4);
        let left = store.samples_in_window(Window::new(0, 100), None).await.unwrap();
        assert_eq!(left, vec![s("survival", 15, 6), s("lobby", 20, 2), s("lobby", 30, 3)]);
    }

    #[tokio::test]
    async fn test_group_lifecycle() {
        let store = DuckDbStore::open_in_memory().unwrap();

        assert_eq!(store.create_group("Survival").await.unwrap(), Outcome::Applied(()));
        assert_eq!(store.create_group("survival").await.unwrap(), Outcome::AlreadyExists);
        assert_eq!(store.create_group("pvp").await.unwrap(), Outcome::Applied(()));
        assert_eq!(store.list_groups().await.unwrap(), vec!["Survival", "pvp"]);
        assert!(store.group_exists("Survival").await.unwrap());
        assert!(!store.group_exists("survival").await.unwrap());

        assert_eq!(store.add_member("Survival", "s1").await.unwrap(), Outcome::Applied(()));
        assert_eq!(store.add_member("Survival", "s2").await.unwrap(), Outcome::Applied(()));
        assert_eq!(store.add_member("missing", "s3").await.unwrap(), Outcome::NotFound);
        assert_eq!(store.group_members("Survival").await.unwrap(), vec!["s1", "s2"]);

        // a server lives in one group at a time
        assert_eq!(store.add_member("pvp", "s2").await.unwrap(), Outcome::Applied(()));
        let memberships = store.memberships().await.unwrap();
        assert_eq!(memberships["Survival"], vec!["s1"]);
        assert_eq!(memberships["pvp"], vec!["s2"]);

        assert_eq!(store.remove_member("Survival", "s2").await.unwrap(), Outcome::NotFound);
        assert_eq!(store.remove_member("Survival", "s1").await.unwrap(), Outcome::Applied(()));
        assert!(store.group_members("Survival").await.unwrap().is_empty());

        assert_eq!(store.delete_group("pvp").await.unwrap(), Outcome::Applied(()));
        assert_eq!(store.delete_group("pvp").await.unwrap(), Outcome::NotFound);
        assert!(store.memberships().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("players.duckdb");

        {
            let store = DuckDbStore::open(&path).unwrap();
            store.insert_samples(&[s("lobby", 10, 1)]).await.unwrap();
            store.create_group("main").await.unwrap();
        }

        let store = DuckDbStore::open(&path).unwrap();
        assert_eq!(store.list_groups().await.unwrap(), vec!["main"]);
        let samples = store.samples_in_window(Window::new(0, 100), None).await.unwrap();
        assert_eq!(samples, vec![s("lobby", 10, 1)]);
    }
}
