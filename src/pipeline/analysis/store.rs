//! SQLite-backed, append-only report store.
//!
//! A report is written once per run at its terminal transition and never
//! updated. The full report is kept as JSON next to a few indexed columns.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::error::AnalysisError;
use super::report::RunReport;
use super::traits::{ReportCounts, ResultStore};
use crate::db::{self, DatabaseError};

pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

impl SqliteResultStore {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, AnalysisError> {
        Ok(Self::from_connection(db::open_database(path)?))
    }

    pub fn in_memory() -> Result<Self, AnalysisError> {
        Ok(Self::from_connection(db::open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AnalysisError> {
        self.conn
            .lock()
            .map_err(|_| AnalysisError::Database(DatabaseError::LockPoisoned))
    }
}

fn sqlite_err(e: rusqlite::Error) -> AnalysisError {
    AnalysisError::Database(DatabaseError::Sqlite(e))
}

fn parse_report(json: &str) -> Result<RunReport, AnalysisError> {
    serde_json::from_str(json).map_err(|e| AnalysisError::JsonParsing(e.to_string()))
}

impl ResultStore for SqliteResultStore {
    fn save(&self, report: &RunReport) -> Result<(), AnalysisError> {
        let report_json = serde_json::to_string(report)
            .map_err(|e| AnalysisError::JsonParsing(e.to_string()))?;

        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO analysis_reports
             (run_id, subject_id, status, report_json, error_message, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.run_id,
                report.subject_id,
                report.status.as_str(),
                report_json,
                report.error,
                report.created_at.to_rfc3339(),
                report.completed_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                tracing::debug!(
                    run_id = %report.run_id,
                    subject_id = %report.subject_id,
                    status = %report.status,
                    "Analysis report stored"
                );
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == ErrorCode::ConstraintViolation
                    && msg.as_deref().is_some_and(|m| m.contains("run_id")) =>
            {
                Err(AnalysisError::DuplicateReport(report.run_id.clone()))
            }
            Err(e) => Err(sqlite_err(e)),
        }
    }

    fn load_by_subject(&self, subject_id: &str) -> Result<Vec<RunReport>, AnalysisError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT report_json FROM analysis_reports
                 WHERE subject_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(sqlite_err)?;

        let rows = stmt
            .query_map(params![subject_id], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(parse_report(&row.map_err(sqlite_err)?)?);
        }
        Ok(reports)
    }

    fn load_by_run_id(&self, run_id: &str) -> Result<Option<RunReport>, AnalysisError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT report_json FROM analysis_reports WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        json.as_deref().map(parse_report).transpose()
    }

    fn counts(&self) -> Result<ReportCounts, AnalysisError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM analysis_reports GROUP BY status")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(sqlite_err)?;

        let mut counts = ReportCounts::default();
        for row in rows {
            let (status, n) = row.map_err(sqlite_err)?;
            let n = n.max(0) as u64;
            counts.total += n;
            match status.as_str() {
                "completed" => counts.completed += n,
                "error" => counts.error += n,
                "cancelled" => counts.cancelled += n,
                other => {
                    return Err(AnalysisError::Database(DatabaseError::InvalidEnum {
                        field: "status".into(),
                        value: other.into(),
                    }))
                }
            }
        }
        Ok(counts)
    }
}
