//! rollcall-store — SQLite persistence for the enrollment gallery and the
//! attendance ledger.
//!
//! The ledger's `UNIQUE(student_id, date)` constraint is the real at-most-once
//! guarantee for attendance; the in-memory dedup set in front of it is only a
//! cache. The connection is owned here behind a mutex and locked per
//! operation, never held across a running stream.

use chrono::{NaiveDate, NaiveTime};
use rollcall_core::{
    EnrolledFace, FaceTemplate, Identity, LedgerError, MarkOutcome, PresenceLedger, TEMPLATE_SIZE,
};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("student already enrolled: {0}")]
    DuplicateStudent(String),
    #[error("student not found: {0}")]
    StudentNotFound(String),
}

/// One attendance ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub display_name: String,
    pub department: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: String,
}

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

/// SQLite-backed enrollment gallery and attendance ledger.
pub struct AttendanceStore {
    conn: Mutex<Connection>,
}

impl AttendanceStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS students (
                student_id   TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                department   TEXT NOT NULL,
                year         TEXT NOT NULL,
                section      TEXT NOT NULL,
                template     BLOB NOT NULL,
                enrolled_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS attendance (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id   TEXT NOT NULL,
                display_name TEXT NOT NULL,
                department   TEXT NOT NULL,
                date         TEXT NOT NULL,
                time         TEXT NOT NULL,
                status       TEXT NOT NULL DEFAULT 'Present',
                UNIQUE(student_id, date)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another caller panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enroll a student with their face template. Fails on a duplicate id.
    pub fn enroll(&self, identity: &Identity, template: &FaceTemplate) -> Result<(), StoreError> {
        let result = self.conn().execute(
            "INSERT INTO students (student_id, display_name, department, year, section, template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.student_id,
                identity.display_name,
                identity.department,
                identity.year,
                identity.section,
                template.as_bytes(),
            ],
        );
        match result {
            Ok(_) => {
                tracing::info!(student_id = %identity.student_id, "student enrolled");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateStudent(identity.student_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load the full enrollment gallery. Rows whose stored template does not
    /// have the expected patch size are skipped with a warning rather than
    /// failing the whole load.
    pub fn load_gallery(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT student_id, display_name, department, year, section, template
             FROM students ORDER BY student_id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                Identity {
                    student_id: row.get(0)?,
                    display_name: row.get(1)?,
                    department: row.get(2)?,
                    year: row.get(3)?,
                    section: row.get(4)?,
                },
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;

        let mut gallery = Vec::new();
        for row in rows {
            let (identity, blob) = row?;
            match FaceTemplate::from_pixels(blob) {
                Ok(template) => gallery.push(EnrolledFace { identity, template }),
                Err(err) => {
                    tracing::warn!(
                        student_id = %identity.student_id,
                        error = %err,
                        expected = TEMPLATE_SIZE * TEMPLATE_SIZE,
                        "skipping enrollment with malformed template"
                    );
                }
            }
        }
        Ok(gallery)
    }

    /// All enrolled identities, without templates.
    pub fn students(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT student_id, display_name, department, year, section
             FROM students ORDER BY display_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Identity {
                student_id: row.get(0)?,
                display_name: row.get(1)?,
                department: row.get(2)?,
                year: row.get(3)?,
                section: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn student_count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Remove an enrollment. Ledger rows are append-only and stay.
    pub fn remove_student(&self, student_id: &str) -> Result<(), StoreError> {
        let affected = self.conn().execute(
            "DELETE FROM students WHERE student_id = ?1",
            params![student_id],
        )?;
        if affected == 0 {
            return Err(StoreError::StudentNotFound(student_id.to_string()));
        }
        tracing::info!(student_id, "student removed");
        Ok(())
    }

    /// Insert-if-absent attendance write; the uniqueness constraint decides.
    pub fn insert_if_absent(
        &self,
        student_id: &str,
        display_name: &str,
        department: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<MarkOutcome, StoreError> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO attendance (student_id, display_name, department, date, time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                student_id,
                display_name,
                department,
                date.format(DATE_FMT).to_string(),
                time.format(TIME_FMT).to_string(),
            ],
        )?;
        Ok(if affected == 1 {
            MarkOutcome::Created
        } else {
            MarkOutcome::AlreadyExists
        })
    }

    /// Student ids with a ledger row on `date`.
    pub fn marked_on(&self, date: NaiveDate) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT student_id FROM attendance WHERE date = ?1")?;
        let rows = stmt.query_map(params![date.format(DATE_FMT).to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Full ledger rows for `date`, most recent first.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT student_id, display_name, department, date, time, status
             FROM attendance WHERE date = ?1 ORDER BY time DESC",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FMT).to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (student_id, display_name, department, date_s, time_s, status) = row?;
            let Ok(date) = NaiveDate::parse_from_str(&date_s, DATE_FMT) else {
                tracing::warn!(student_id, raw = date_s, "skipping row with unparseable date");
                continue;
            };
            let Ok(time) = NaiveTime::parse_from_str(&time_s, TIME_FMT) else {
                tracing::warn!(student_id, raw = time_s, "skipping row with unparseable time");
                continue;
            };
            records.push(AttendanceRecord {
                student_id,
                display_name,
                department,
                date,
                time,
                status,
            });
        }
        Ok(records)
    }
}

impl PresenceLedger for AttendanceStore {
    fn mark_present(
        &self,
        student_id: &str,
        display_name: &str,
        department: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<MarkOutcome, LedgerError> {
        self.insert_if_absent(student_id, display_name, department, date, time)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }

    fn marked_on(&self, date: NaiveDate) -> Result<HashSet<String>, LedgerError> {
        AttendanceStore::marked_on(self, date).map_err(|e| LedgerError::Unavailable(e.to_string()))
    }
}
