use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::{CronError, Result};
use crate::logs::{LogEntry, LogStore};

/// Execution logs in a SQLite database. All statements run on the blocking
/// pool.
#[derive(Clone)]
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| CronError::LogStore("connection mutex poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CronError::Internal(format!("log store task failed: {}", e)))?
    }
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_log (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name       TEXT    NOT NULL,
            command        TEXT    NOT NULL,
            err            TEXT    NOT NULL,
            output         TEXT    NOT NULL,
            plan_time      INTEGER NOT NULL,   -- unix millis
            schedule_time  INTEGER NOT NULL,
            start_time     INTEGER NOT NULL,
            end_time       INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_job_log_name_start ON job_log (job_name, start_time);
        ",
    )?;
    Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn insert_many(&self, entries: &[LogEntry]) -> Result<()> {
        let entries = entries.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO job_log
                        (job_name, command, err, output, plan_time, schedule_time, start_time, end_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for entry in &entries {
                    stmt.execute(params![
                        entry.job_name,
                        entry.command,
                        entry.err,
                        entry.output,
                        entry.plan_time.timestamp_millis(),
                        entry.schedule_time.timestamp_millis(),
                        entry.start_time.timestamp_millis(),
                        entry.end_time.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<LogEntry>> {
        let job_name = job_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_name, command, err, output, plan_time, schedule_time, start_time, end_time
                 FROM job_log
                 WHERE job_name = ?1
                 ORDER BY start_time DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![job_name, limit as i64, skip as i64], |row| {
                Ok(LogEntry {
                    job_name: row.get(0)?,
                    command: row.get(1)?,
                    err: row.get(2)?,
                    output: row.get(3)?,
                    plan_time: from_millis(row.get(4)?),
                    schedule_time: from_millis(row.get(5)?),
                    start_time: from_millis(row.get(6)?),
                    end_time: from_millis(row.get(7)?),
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn entry(name: &str, start_offset_secs: i64) -> LogEntry {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let start = base + Duration::seconds(start_offset_secs);
        LogEntry {
            job_name: name.to_string(),
            command: "echo hi".to_string(),
            err: String::new(),
            output: format!("run {}\n", start_offset_secs),
            plan_time: start,
            schedule_time: start,
            start_time: start,
            end_time: start + Duration::milliseconds(20),
        }
    }

    #[tokio::test]
    async fn list_is_newest_first_with_paging() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteLogStore::open(&dir.path().join("logs.db")).unwrap();

        store
            .insert_many(&[entry("a", 1), entry("a", 3), entry("b", 2), entry("a", 2)])
            .await
            .unwrap();

        let all = store.list("a", 0, 10).await.unwrap();
        let order: Vec<_> = all.iter().map(|e| e.output.as_str()).collect();
        assert_eq!(order, vec!["run 3\n", "run 2\n", "run 1\n"]);

        let page = store.list("a", 1, 1).await.unwrap();
        assert_eq!(page, vec![entry("a", 2)]);

        assert!(store.list("missing", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.db");

        SqliteLogStore::open(&path)
            .unwrap()
            .insert_many(&[entry("a", 1)])
            .await
            .unwrap();

        let reopened = SqliteLogStore::open(&path).unwrap();
        assert_eq!(reopened.list("a", 0, 10).await.unwrap(), vec![entry("a", 1)]);
    }
}
