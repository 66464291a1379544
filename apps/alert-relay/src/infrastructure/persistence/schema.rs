//! Alert history schema.

use rusqlite::Connection;

/// Create tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns `rusqlite::Error` if any statement fails.
pub fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS alerts (
            seq          INTEGER PRIMARY KEY AUTOINCREMENT,
            id           TEXT    NOT NULL UNIQUE,
            category     INTEGER NOT NULL,
            kind         TEXT    NOT NULL,
            title        TEXT    NOT NULL,
            instructions TEXT    NOT NULL,
            areas_json   TEXT    NOT NULL,
            observed_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_observed_at ON alerts(observed_at);

        CREATE TABLE IF NOT EXISTS alert_areas (
            alert_seq   INTEGER NOT NULL REFERENCES alerts(seq),
            area        TEXT    NOT NULL,
            area_key    TEXT    NOT NULL,
            observed_at TEXT    NOT NULL,
            UNIQUE(alert_seq, area_key)
        );

        CREATE INDEX IF NOT EXISTS idx_alert_areas_key
            ON alert_areas(area_key, observed_at);
        ",
    )
}
