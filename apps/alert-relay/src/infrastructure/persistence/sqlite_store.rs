//! SQLite Alert Store
//!
//! Alerts live in `alerts`; `alert_areas` indexes them by normalized area
//! name. Both rows are written in one transaction on a dedicated writer
//! connection. Queries run on a separate reader connection, which under WAL
//! sees only committed transactions and never blocks the writer.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::application::ports::{
    AlertStats, AlertStore, AppendOutcome, AreaCount, HistoryQuery, StoreError,
};
use crate::domain::alert::{Alert, AlertKind, normalize_area};

use super::schema;

/// Number of areas reported in statistics.
const TOP_AREAS: i64 = 10;

const ALERT_COLUMNS: &str =
    "a.id, a.category, a.title, a.instructions, a.areas_json, a.observed_at";

/// SQLite-backed [`AlertStore`].
pub struct SqliteAlertStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteAlertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAlertStore").finish_non_exhaustive()
    }
}

impl SqliteAlertStore {
    /// Open (or create) the store at `path`.
    ///
    /// Creates parent directories, enables WAL, and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let writer = Connection::open(path).map_err(io_error)?;
        writer
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(io_error)?;
        writer
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(io_error)?;
        writer
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(io_error)?;
        writer
            .pragma_update(None, "busy_timeout", 5000)
            .map_err(io_error)?;
        schema::initialize_schema(&writer).map_err(io_error)?;

        let reader = Connection::open(path).map_err(io_error)?;
        reader
            .pragma_update(None, "busy_timeout", 5000)
            .map_err(io_error)?;
        reader
            .pragma_update(None, "query_only", "ON")
            .map_err(io_error)?;

        tracing::info!(path = %path.display(), "Alert store opened");

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }
}

impl AlertStore for SqliteAlertStore {
    fn append(&self, alert: &Alert) -> Result<AppendOutcome, StoreError> {
        let areas_json =
            serde_json::to_string(&alert.areas).map_err(|e| StoreError::Io(e.to_string()))?;
        let observed_at = format_timestamp(alert.observed_at);

        let mut conn = self.writer.lock();
        let tx = conn.transaction().map_err(io_error)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO alerts \
                 (id, category, kind, title, instructions, areas_json, observed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.id,
                    alert.category,
                    alert.kind.as_str(),
                    alert.title,
                    alert.instructions,
                    areas_json,
                    observed_at,
                ],
            )
            .map_err(io_error)?;

        if inserted == 0 {
            return Ok(AppendOutcome::Duplicate);
        }

        let seq = tx.last_insert_rowid();
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO alert_areas (alert_seq, area, area_key, observed_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(io_error)?;
            for area in &alert.areas {
                let key = normalize_area(area);
                if key.is_empty() {
                    continue;
                }
                stmt.execute(params![seq, area.trim(), key, observed_at])
                    .map_err(io_error)?;
            }
        }

        tx.commit().map_err(io_error)?;
        drop(conn);
        Ok(AppendOutcome::Inserted)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Alert>, StoreError> {
        let conn = self.reader.lock();
        conn.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts a WHERE a.id = ?1"),
            params![id],
            parse_alert_row,
        )
        .optional()
        .map_err(read_error)
    }

    fn list_history(&self, query: &HistoryQuery) -> Result<Vec<Alert>, StoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let since = query.since.map(format_timestamp);
        let conn = self.reader.lock();

        let alerts = if let Some(area) = &query.area {
            let key = normalize_area(area);
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {ALERT_COLUMNS} FROM alert_areas x \
                     JOIN alerts a ON a.seq = x.alert_seq \
                     WHERE x.area_key = ?1 AND (?2 IS NULL OR x.observed_at >= ?2) \
                     ORDER BY x.observed_at DESC, a.seq DESC LIMIT ?3"
                ))
                .map_err(io_error)?;
            stmt.query_map(params![key, since, limit], parse_alert_row)
                .map_err(io_error)?
                .collect::<Result<Vec<_>, _>>()
        } else {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts a \
                     WHERE (?1 IS NULL OR a.observed_at >= ?1) \
                     ORDER BY a.observed_at DESC, a.seq DESC LIMIT ?2"
                ))
                .map_err(io_error)?;
            stmt.query_map(params![since, limit], parse_alert_row)
                .map_err(io_error)?
                .collect::<Result<Vec<_>, _>>()
        };

        alerts.map_err(read_error)
    }

    fn stats(&self) -> Result<AlertStats, StoreError> {
        let mut conn = self.reader.lock();
        let tx = conn.transaction().map_err(io_error)?;

        let (total_count, earliest, latest): (u64, Option<String>, Option<String>) = tx
            .query_row(
                "SELECT COUNT(*), MIN(observed_at), MAX(observed_at) FROM alerts",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(io_error)?;

        let total_area_entries: u64 = tx
            .query_row("SELECT COUNT(*) FROM alert_areas", [], |row| row.get(0))
            .map_err(io_error)?;

        let mut count_by_kind = BTreeMap::new();
        {
            let mut stmt = tx
                .prepare("SELECT kind, COUNT(*) FROM alerts GROUP BY kind")
                .map_err(io_error)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))
                .map_err(io_error)?;
            for row in rows {
                let (kind, count) = row.map_err(io_error)?;
                count_by_kind.insert(kind, count);
            }
        }

        let top_areas = {
            let mut stmt = tx
                .prepare(
                    "SELECT MIN(area), COUNT(*) AS hits FROM alert_areas \
                     GROUP BY area_key ORDER BY hits DESC, area_key ASC LIMIT ?1",
                )
                .map_err(io_error)?;
            stmt.query_map(params![TOP_AREAS], |row| {
                Ok(AreaCount {
                    area: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .map_err(io_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error)?
        };

        tx.finish().map_err(io_error)?;
        drop(conn);

        Ok(AlertStats {
            total_count,
            total_area_entries,
            count_by_kind,
            earliest: earliest.as_deref().map(parse_timestamp).transpose()?,
            latest: latest.as_deref().map(parse_timestamp).transpose()?,
            top_areas,
        })
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.reader.lock();
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM alerts WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )
        .map_err(io_error)
    }

    fn recent_ids(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.reader.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id FROM alerts ORDER BY observed_at DESC, seq DESC LIMIT ?1")
            .map_err(io_error)?;
        let ids = stmt
            .query_map(params![limit], |row| row.get(0))
            .map_err(io_error)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(io_error)?;
        Ok(ids)
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn parse_alert_row(row: &rusqlite::Row<'_>) -> Result<Alert, rusqlite::Error> {
    let id: String = row.get(0)?;
    let category: u16 = row.get(1)?;
    let title: String = row.get(2)?;
    let instructions: String = row.get(3)?;
    let areas_json: String = row.get(4)?;
    let observed_at: String = row.get(5)?;

    let areas: Vec<String> = serde_json::from_str(&areas_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let observed_at = DateTime::parse_from_rfc3339(&observed_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Alert {
        id,
        category,
        kind: AlertKind::from_category(category),
        title,
        areas,
        instructions,
        observed_at,
    })
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn io_error(e: rusqlite::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn read_error(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(..) => StoreError::Corrupt(e.to_string()),
        other => StoreError::Io(other.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
