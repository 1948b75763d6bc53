//! SQLite ledger: check history, uptime aggregates, target state and alerts.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Rows fetched per page by [`HistoryIter`].
const HISTORY_PAGE_SIZE: i64 = 256;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe ledger store.
///
/// Appends go through a single writer connection; queries use a separate
/// reader connection so that, with WAL enabled, readers never wait on writers.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the ledger at the given path and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut writer = Connection::open(path.as_ref())?;
        writer.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = writer.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        writer.execute_batch("PRAGMA synchronous=NORMAL;")?;

        embedded::migrations::runner()
            .run(&mut writer)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        let reader = Connection::open(path.as_ref())?;
        reader.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Write path ---

    /// Record one check outcome together with the state it produced.
    ///
    /// The history row, the uptime aggregate, the target state and the alert
    /// (if the transition raised one) are committed in a single transaction.
    pub fn record_check(
        &self,
        result: &ProbeResult,
        state: &TargetState,
        alert: Option<AlertKind>,
    ) -> Result<Option<AlertRecord>, DbError> {
        let conn = self.writer();
        let tx = conn.unchecked_transaction()?;

        let timestamp = format_time(result.timestamp);
        tx.execute(
            "INSERT INTO status_history (target_name, timestamp, success, response_time_ms, ip_address, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.target_name,
                timestamp,
                result.success,
                result.latency_ms(),
                result.identity,
                result.error,
            ],
        )?;

        tx.execute(
            "INSERT INTO uptime_stats (target_name, total_checks, successful_checks, first_seen)
             VALUES (?1, 1, ?2, ?3)
             ON CONFLICT(target_name) DO UPDATE SET
             total_checks = total_checks + 1,
             successful_checks = successful_checks + excluded.successful_checks",
            params![result.target_name, result.success as i64, timestamp],
        )?;

        upsert_target_state(&tx, state)?;

        let record = match alert {
            Some(kind) => {
                tx.execute(
                    "INSERT INTO alerts (target_name, kind, timestamp, outcome) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        result.target_name,
                        kind.as_str(),
                        timestamp,
                        AlertOutcome::Pending.as_str(),
                    ],
                )?;
                Some(AlertRecord {
                    id: tx.last_insert_rowid(),
                    target_name: result.target_name.clone(),
                    kind,
                    timestamp: result.timestamp,
                    outcome: AlertOutcome::Pending,
                    attempts: 0,
                    last_error: None,
                })
            }
            None => None,
        };

        tx.commit()?;
        Ok(record)
    }

    /// Persist a target state without a check (used when a target is first registered).
    pub fn save_target_state(&self, state: &TargetState) -> Result<(), DbError> {
        let conn = self.writer();
        upsert_target_state(&conn, state)?;
        Ok(())
    }

    /// Drop the persisted state of a target that is no longer monitored.
    pub fn delete_target_state(&self, target_name: &str) -> Result<(), DbError> {
        let conn = self.writer();
        conn.execute("DELETE FROM target_state WHERE target_name = ?1", params![target_name])?;
        Ok(())
    }

    /// Update the delivery outcome of an alert.
    pub fn update_alert_outcome(
        &self,
        id: i64,
        outcome: AlertOutcome,
        attempts: u32,
        last_error: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.writer();
        let changed = conn.execute(
            "UPDATE alerts SET outcome = ?1, attempts = ?2, last_error = ?3 WHERE id = ?4",
            params![outcome.as_str(), attempts, last_error, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete history rows older than `cutoff`.
    ///
    /// Deleted rows are folded into the pruned baseline of `uptime_stats` in the
    /// same transaction, so replaying the remaining history still reproduces
    /// the aggregate. Returns the number of rows removed.
    pub fn prune_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.writer();
        let tx = conn.unchecked_transaction()?;
        let cutoff = format_time(cutoff);

        tx.execute(
            "UPDATE uptime_stats SET
             pruned_checks = pruned_checks + (
                 SELECT COUNT(*) FROM status_history h
                 WHERE h.target_name = uptime_stats.target_name AND h.timestamp < ?1),
             pruned_successful = pruned_successful + (
                 SELECT COUNT(*) FROM status_history h
                 WHERE h.target_name = uptime_stats.target_name AND h.timestamp < ?1 AND h.success = 1)",
            params![cutoff],
        )?;
        let removed = tx.execute("DELETE FROM status_history WHERE timestamp < ?1", params![cutoff])?;

        tx.commit()?;
        Ok(removed)
    }

    // --- Read path ---

    /// Load the last persisted state for a target.
    pub fn load_target_state(&self, target_name: &str) -> Result<Option<TargetState>, DbError> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT status, status_changed_at, online_since, last_checked_at, last_identity,
                        suspect_since, retest_at, consecutive_failures
                 FROM target_state WHERE target_name = ?1",
                params![target_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, u32>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, changed, online_since, last_checked, identity, suspect_since, retest_at, failures)) = row
        else {
            return Ok(None);
        };

        Ok(Some(TargetState {
            target_name: target_name.to_string(),
            status: status.parse().map_err(DbError::Corrupt)?,
            status_changed_at: required_time(&changed)?,
            online_since: optional_time(online_since)?,
            last_checked_at: optional_time(last_checked)?,
            last_identity: identity,
            suspect_since: optional_time(suspect_since)?,
            retest_at: optional_time(retest_at)?,
            consecutive_failures: failures,
        }))
    }

    /// Incrementally maintained check counts: `(total, successful)`.
    pub fn uptime_counts(&self, target_name: &str) -> Result<(i64, i64), DbError> {
        let conn = self.reader();
        let counts = conn
            .query_row(
                "SELECT total_checks, successful_checks FROM uptime_stats WHERE target_name = ?1",
                params![target_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(counts.unwrap_or((0, 0)))
    }

    /// Uptime aggregate for a target; the streak comes from the live state.
    pub fn uptime(&self, target_name: &str, streak_seconds: i64) -> Result<UptimeAggregate, DbError> {
        let conn = self.reader();
        let row: Option<(i64, i64, String)> = conn
            .query_row(
                "SELECT total_checks, successful_checks, first_seen FROM uptime_stats WHERE target_name = ?1",
                params![target_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((total, successful, first_seen)) => Ok(UptimeAggregate {
                first_seen: Some(required_time(&first_seen)?),
                ..UptimeAggregate::new(target_name, total, successful, streak_seconds)
            }),
            None => Ok(UptimeAggregate::new(target_name, 0, 0, streak_seconds)),
        }
    }

    /// Recompute `(total, successful)` from the history log and the pruned baseline.
    pub fn replay_uptime(&self, target_name: &str) -> Result<(i64, i64), DbError> {
        let conn = self.reader();
        let tx = conn.unchecked_transaction()?;
        let (total, successful): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM status_history WHERE target_name = ?1",
            params![target_name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (pruned_total, pruned_successful): (i64, i64) = tx
            .query_row(
                "SELECT pruned_checks, pruned_successful FROM uptime_stats WHERE target_name = ?1",
                params![target_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((0, 0));
        tx.commit()?;
        Ok((total + pruned_total, successful + pruned_successful))
    }

    /// Time-ordered check results for a target in `[start, end)`.
    ///
    /// Rows are fetched lazily in pages. Only rows that existed when this was
    /// called are returned; later appends are never observed.
    pub fn history(
        &self,
        target_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoryIter<'_>, DbError> {
        let max_id: i64 = self.reader().query_row(
            "SELECT COALESCE(MAX(id), 0) FROM status_history",
            [],
            |row| row.get(0),
        )?;

        Ok(HistoryIter {
            store: self,
            target_name: target_name.to_string(),
            end: format_time(end),
            max_id,
            cursor: (format_time(start), 0),
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: i64) -> Result<Vec<AlertRecord>, DbError> {
        self.query_alerts(
            "SELECT id, target_name, kind, timestamp, outcome, attempts, last_error
             FROM alerts ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    /// Alerts committed but never delivered, oldest first.
    pub fn pending_alerts(&self) -> Result<Vec<AlertRecord>, DbError> {
        self.query_alerts(
            "SELECT id, target_name, kind, timestamp, outcome, attempts, last_error
             FROM alerts WHERE outcome = 'pending' ORDER BY id ASC",
            params![],
        )
    }

    fn query_alerts(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AlertRecord>, DbError> {
        let conn = self.reader();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, target_name, kind, timestamp, outcome, attempts, last_error)| {
                Ok(AlertRecord {
                    id,
                    target_name,
                    kind: kind.parse().map_err(DbError::Corrupt)?,
                    timestamp: required_time(&timestamp)?,
                    outcome: outcome.parse().map_err(DbError::Corrupt)?,
                    attempts,
                    last_error,
                })
            })
            .collect()
    }

    fn history_page(
        &self,
        target_name: &str,
        end: &str,
        max_id: i64,
        cursor: &(String, i64),
    ) -> Result<Vec<(i64, String, ProbeResult)>, DbError> {
        let conn = self.reader();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, success, response_time_ms, ip_address, error
             FROM status_history
             WHERE target_name = ?1 AND id <= ?2 AND timestamp < ?3
               AND (timestamp > ?4 OR (timestamp = ?4 AND id > ?5))
             ORDER BY timestamp ASC, id ASC
             LIMIT ?6",
        )?;

        let rows = stmt
            .query_map(
                params![target_name, max_id, end, cursor.0, cursor.1, HISTORY_PAGE_SIZE],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, time_str, success, latency_ms, identity, error)| {
                let result = ProbeResult {
                    target_name: target_name.to_string(),
                    timestamp: required_time(&time_str)?,
                    success,
                    latency: Duration::from_secs_f64(latency_ms.max(0.0) / 1000.0),
                    identity,
                    error,
                };
                Ok((id, time_str, result))
            })
            .collect()
    }
}

/// Lazy, finite, time-ordered iterator over a target's history.
pub struct HistoryIter<'a> {
    store: &'a Store,
    target_name: String,
    end: String,
    max_id: i64,
    cursor: (String, i64),
    buffer: VecDeque<ProbeResult>,
    exhausted: bool,
}

impl Iterator for HistoryIter<'_> {
    type Item = Result<ProbeResult, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(result) = self.buffer.pop_front() {
            return Some(Ok(result));
        }
        if self.exhausted {
            return None;
        }

        match self
            .store
            .history_page(&self.target_name, &self.end, self.max_id, &self.cursor)
        {
            Ok(page) => {
                if (page.len() as i64) < HISTORY_PAGE_SIZE {
                    self.exhausted = true;
                }
                for (id, time_str, result) in page {
                    self.cursor = (time_str, id);
                    self.buffer.push_back(result);
                }
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

fn upsert_target_state(conn: &Connection, state: &TargetState) -> SqlResult<usize> {
    conn.execute(
        "INSERT INTO target_state (target_name, status, status_changed_at, online_since, last_checked_at,
                                   last_identity, suspect_since, retest_at, consecutive_failures)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(target_name) DO UPDATE SET
         status=excluded.status, status_changed_at=excluded.status_changed_at,
         online_since=excluded.online_since, last_checked_at=excluded.last_checked_at,
         last_identity=excluded.last_identity, suspect_since=excluded.suspect_since,
         retest_at=excluded.retest_at, consecutive_failures=excluded.consecutive_failures",
        params![
            state.target_name,
            state.status.as_str(),
            format_time(state.status_changed_at),
            state.online_since.map(format_time),
            state.last_checked_at.map(format_time),
            state.last_identity,
            state.suspect_since.map(format_time),
            state.retest_at.map(format_time),
            state.consecutive_failures,
        ],
    )
}

fn format_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

fn required_time(s: &str) -> Result<DateTime<Utc>, DbError> {
    parse_db_time(s).ok_or_else(|| DbError::Corrupt(format!("bad timestamp: {}", s)))
}

fn optional_time(s: Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    s.as_deref().map(required_time).transpose()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
