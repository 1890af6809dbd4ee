//! SQLite-backed event store

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use events_core::{Component, EventsError};

use crate::{Record, Result, Schedule, Storage, StorageError, StoreConfig, BATCH_SIZE, PRIMARY_KEY};

/// Shared handle to the single SQLite connection.
///
/// rusqlite is blocking, so every statement runs on the blocking pool.
#[derive(Clone, Default)]
struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard.as_mut().ok_or(StorageError::Uninitialized)?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?
    }

    fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn close(&self) -> Option<Connection> {
        self.conn.lock().take()
    }

    async fn delete(&self, since: i64, until: i64) -> Result<usize> {
        check_range(since, until)?;
        self.call(move |conn| {
            let sql = format!(
                "DELETE FROM events WHERE {key} >= ?1 AND {key} < ?2",
                key = PRIMARY_KEY
            );
            Ok(conn.execute(&sql, params![since, until])?)
        })
        .await
    }
}

struct Cleaner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Event store persisted to a single SQLite file
pub struct SqliteStorage {
    config: StoreConfig,
    db: Database,
    cleaner: Mutex<Option<Cleaner>>,
}

impl SqliteStorage {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            db: Database::default(),
            cleaner: Mutex::new(None),
        }
    }

    fn open(filename: &str) -> Result<Connection> {
        let conn = Connection::open(filename)?;

        if filename != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        }

        let schema = format!(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                event_base64 TEXT NOT NULL,
                {key} INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_{key} ON events({key});",
            key = PRIMARY_KEY
        );
        conn.execute_batch(&schema)?;

        Ok(conn)
    }

    fn start_autoclean(&self, schedule: Schedule) {
        let cancel = CancellationToken::new();
        let db = self.db.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(delay) = schedule.next_delay_local() else {
                    warn!("Autoclean schedule has no further firings");
                    return;
                };

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let until = Utc::now().timestamp();
                match db.delete(0, until).await {
                    Ok(removed) => info!(removed, until, "Autoclean purged old events"),
                    Err(e) => error!(error = %e, "Autoclean failed"),
                }
            }
        });

        *self.cleaner.lock() = Some(Cleaner { cancel, handle });
    }

    async fn stop_autoclean(&self) {
        let cleaner = self.cleaner.lock().take();
        if let Some(cleaner) = cleaner {
            cleaner.cancel.cancel();
            if let Err(e) = cleaner.handle.await {
                warn!(error = %e, "Autoclean task ended abnormally");
            }
        }
    }
}

fn check_range(since: i64, until: i64) -> Result<()> {
    if since < 0 || until < 0 {
        return Err(StorageError::InvalidRange { since, until });
    }
    Ok(())
}

#[async_trait]
impl Component for SqliteStorage {
    fn name(&self) -> &'static str {
        "storage"
    }

    #[instrument(skip(self), fields(filename = %self.config.filename))]
    async fn init(&self) -> events_core::Result<()> {
        debug!("Opening event store");

        if self.db.is_open() {
            return Ok(());
        }

        let schedule = if self.config.autoclean.trim().is_empty() {
            None
        } else {
            Some(self.config.autoclean.parse::<Schedule>()?)
        };

        let filename = self.config.filename.clone();
        let conn = tokio::task::spawn_blocking(move || Self::open(&filename))
            .await
            .map_err(|e| EventsError::Internal(e.to_string()))??;
        *self.db.conn.lock() = Some(conn);

        if let Some(schedule) = schedule {
            info!(autoclean = %self.config.autoclean, "Autoclean enabled");
            self.start_autoclean(schedule);
        }

        info!("Event store ready");
        Ok(())
    }

    async fn deinit(&self) -> events_core::Result<()> {
        debug!("Closing event store");

        self.stop_autoclean().await;

        if let Some(conn) = self.db.close() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "Failed to close event store cleanly");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() || records.len() > BATCH_SIZE {
            return Err(StorageError::Validation(format!(
                "invalid data length {} (want 1..={})",
                records.len(),
                BATCH_SIZE
            )));
        }

        self.db
            .call(move |conn| {
                let now = Utc::now().timestamp();
                let tx = conn.transaction()?;
                {
                    let sql = format!(
                        "INSERT INTO events (created_at, updated_at, event_base64, {}) VALUES (?1, ?2, ?3, ?4)",
                        PRIMARY_KEY
                    );
                    let mut stmt = tx.prepare_cached(&sql)?;
                    for record in &records {
                        stmt.execute(params![now, now, record.event_base64, record.event_created_on])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn read(&self, since: i64, until: i64) -> Result<Vec<Record>> {
        check_range(since, until)?;

        self.db
            .call(move |conn| {
                let sql = format!(
                    "SELECT event_base64, {key} FROM events WHERE {key} >= ?1 AND {key} < ?2 ORDER BY {key} ASC, id ASC",
                    key = PRIMARY_KEY
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![since, until], |row| {
                    Ok(Record {
                        event_base64: row.get(0)?,
                        event_created_on: row.get(1)?,
                    })
                })?;

                let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }

    async fn delete(&self, since: i64, until: i64) -> Result<usize> {
        self.db.delete(since, until).await
    }

    async fn update(&self, record: Record) -> Result<usize> {
        self.db
            .call(move |conn| {
                let sql = format!(
                    "UPDATE events SET event_base64 = ?1, updated_at = ?2 WHERE {} = ?3",
                    PRIMARY_KEY
                );
                Ok(conn.execute(
                    &sql,
                    params![record.event_base64, Utc::now().timestamp(), record.event_created_on],
                )?)
            })
            .await
    }
}
