use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, Row};

use super::{ExecutionRecord, HistoryStore, TerminalState};
use crate::error::HistoryError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable history in a single SQLite table. Each append is one INSERT, so
/// readers never observe a partial record.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db_path: PathBuf,
}

impl SqliteHistoryStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn initialize(&self) -> Result<(), HistoryError> {
        self.with_connection(|_| Ok(()))
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&Connection) -> Result<T, HistoryError>,
    {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(self.db_path.as_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&conn)?;
        func(&conn)
    }

    fn query(
        &self,
        tool_name: &str,
        limit: usize,
        only_successful: bool,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT id, tool_name, parameters_json, success, confidence, metrics_json,
                       snapshot_json, timestamp, terminal_state, attempts
                FROM execution_records
                WHERE tool_name = ?1 AND (?2 = 0 OR success = 1)
                ORDER BY seq DESC
                LIMIT ?3
                ",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(
                params![tool_name, i64::from(only_successful), limit],
                read_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(decode_row(row?)?);
            }
            Ok(out)
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), HistoryError> {
        let parameters = serde_json::to_string(&record.parameters).map_err(HistoryError::Encode)?;
        let metrics = serde_json::to_string(&record.result_metrics).map_err(HistoryError::Encode)?;
        let snapshot = serde_json::to_string(&record.image_snapshot).map_err(HistoryError::Encode)?;
        self.with_connection(|conn| {
            conn.execute(
                "
                INSERT INTO execution_records
                  (id, tool_name, parameters_json, success, confidence, metrics_json,
                   snapshot_json, timestamp, terminal_state, attempts)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
                params![
                    record.id,
                    record.tool_name,
                    parameters,
                    record.success,
                    record.confidence,
                    metrics,
                    snapshot,
                    record.timestamp,
                    record.terminal_state.as_str(),
                    record.attempts,
                ],
            )?;
            Ok(())
        })
    }

    fn recent_for_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        self.query(tool_name, limit, false)
    }

    fn successful_for_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        self.query(tool_name, limit, true)
    }

    fn len(&self) -> Result<usize, HistoryError> {
        self.with_connection(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM execution_records", [], |row| {
                row.get::<_, i64>(0)
            })?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }
}

struct RawRecord {
    id: String,
    tool_name: String,
    parameters_json: String,
    success: bool,
    confidence: f64,
    metrics_json: String,
    snapshot_json: String,
    timestamp: String,
    terminal_state: String,
    attempts: u32,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        tool_name: row.get(1)?,
        parameters_json: row.get(2)?,
        success: row.get(3)?,
        confidence: row.get(4)?,
        metrics_json: row.get(5)?,
        snapshot_json: row.get(6)?,
        timestamp: row.get(7)?,
        terminal_state: row.get(8)?,
        attempts: row.get(9)?,
    })
}

fn decode_row(raw: RawRecord) -> Result<ExecutionRecord, HistoryError> {
    let corrupt = |message: String| HistoryError::Corrupt {
        id: raw.id.clone(),
        message,
    };
    let parameters = serde_json::from_str(raw.parameters_json.as_str())
        .map_err(|e| corrupt(format!("parameters: {e}")))?;
    let result_metrics = serde_json::from_str(raw.metrics_json.as_str())
        .map_err(|e| corrupt(format!("metrics: {e}")))?;
    let image_snapshot = serde_json::from_str(raw.snapshot_json.as_str())
        .map_err(|e| corrupt(format!("snapshot: {e}")))?;
    let terminal_state = TerminalState::parse(raw.terminal_state.as_str())
        .ok_or_else(|| corrupt(format!("unknown terminal state '{}'", raw.terminal_state)))?;
    Ok(ExecutionRecord {
        id: raw.id,
        tool_name: raw.tool_name,
        parameters,
        success: raw.success,
        confidence: raw.confidence,
        result_metrics,
        image_snapshot,
        timestamp: raw.timestamp,
        terminal_state,
        attempts: raw.attempts,
    })
}

fn ensure_schema(conn: &Connection) -> Result<(), HistoryError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS execution_records (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          tool_name TEXT NOT NULL,
          parameters_json TEXT NOT NULL,
          success INTEGER NOT NULL,
          confidence REAL NOT NULL,
          metrics_json TEXT NOT NULL,
          snapshot_json TEXT NOT NULL,
          timestamp TEXT NOT NULL,
          terminal_state TEXT NOT NULL,
          attempts INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_execution_records_tool
          ON execution_records(tool_name, seq);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::tests::record;
    use serde_json::json;
    use uuid::Uuid;

    fn temp_store() -> (SqliteHistoryStore, PathBuf) {
        let suffix = Uuid::new_v4().to_string();
        let root = std::env::temp_dir().join(format!("kroma_guard_history_{suffix}"));
        let store = SqliteHistoryStore::new(root.join("var/guard/history.db"));
        (store, root)
    }

    #[test]
    fn appends_and_reads_back_records() {
        let (store, root) = temp_store();
        let first = record(
            "remove_color",
            json!({"colors": ["#ff0000"], "tolerance": 12}),
            TerminalState::Accepted,
        );
        let second = record("remove_color", json!({"colors": ["#00ff00"]}), TerminalState::Exhausted);
        store.append(&first).expect("first append");
        store.append(&second).expect("second append");

        assert_eq!(store.len().expect("len"), 2);
        let recent = store.recent_for_tool("remove_color", 10).expect("recent");
        assert_eq!(recent, vec![second, first.clone()]);
        let successes = store.successful_for_tool("remove_color", 10).expect("successes");
        assert_eq!(successes, vec![first]);
        assert!(store.recent_for_tool("crop", 10).expect("crop").is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn reopening_keeps_history() {
        let (store, root) = temp_store();
        store
            .append(&record("upscale", json!({"scale_factor": 2}), TerminalState::Accepted))
            .expect("append");
        let reopened = SqliteHistoryStore::new(store.db_path().to_path_buf());
        assert_eq!(reopened.len().expect("len"), 1);
        let _ = std::fs::remove_dir_all(root);
    }
}
