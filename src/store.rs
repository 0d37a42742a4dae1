//! SQLite-backed run store, the system of record for every ingested row.
//!
//! Layout:
//!   - one table, `Run`, with `Run Number` INTEGER plus one TEXT column per upload column
//!   - insertion order is the SQLite rowid
//!   - WAL mode so readers never block on, or observe, an in-flight upload
//!
//! Writers are serialized by a process-wide lock held across seed → stamp → persist, and
//! the whole upload is one IMMEDIATE transaction: it commits completely or not at all.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior, params};

use crate::config::IngestionPolicy;
use crate::error::{IngestError, Result};
use crate::segment::{label_column, stamp_runs};
use crate::types::{
    IngestReport, RUN_NUMBER_COLUMN, RunTable, SOLUTION_LABEL_COLUMN, StampedTable, StoredRow,
    Table, is_reserved_column,
};

pub(crate) const RUN_TABLE: &str = "Run";

// ── RunStore ─────────────────────────────────────────────────────────────

/// Handle to the run database. Cloning shares the write lock; connections are opened
/// per operation and released when it returns.
#[derive(Debug, Clone)]
pub(crate) struct RunStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl RunStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Open or create the database file.
    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.unavailable(e))?;
        }
        let conn = Connection::open(&self.path).map_err(|e| self.unavailable(e))?;
        apply_pragmas(&conn).map_err(|e| self.unavailable(e))?;
        Ok(conn)
    }

    /// Open the database only if the file is already there; reads never create it.
    fn open_existing(&self) -> Result<Option<Connection>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| self.unavailable(e))?;
        apply_pragmas(&conn).map_err(|e| self.unavailable(e))?;
        Ok(Some(conn))
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> IngestError {
        IngestError::StoreUnavailable {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }

    /// True once the database file holds a `Run` table.
    pub(crate) fn exists(&self) -> bool {
        match self.open_existing() {
            Ok(Some(conn)) => table_exists(&conn).unwrap_or(false),
            _ => false,
        }
    }

    // ── Write path ───────────────────────────────────────────────────

    /// Segment `table` and persist it atomically under `policy`.
    ///
    /// The run-number seed is read inside the same transaction that writes the rows, with
    /// the write lock held, so concurrent uploads cannot hand out the same run number.
    pub(crate) fn ingest(&self, table: Table, policy: IngestionPolicy) -> Result<IngestReport> {
        let rows_received = table.len();
        if label_column(&table.columns).is_none() {
            return Err(IngestError::SchemaMismatch {
                missing: SOLUTION_LABEL_COLUMN.to_string(),
            });
        }
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(ingest_failed)?;

        let seed = match policy {
            IngestionPolicy::Append => max_run(&tx).map_err(ingest_failed)?,
            IngestionPolicy::Replace => 0,
        };
        // Dropping `tx` on any error below rolls back.
        let stamped = stamp_runs(table, seed)?;
        let added_columns = Self::write(&tx, &stamped, policy).map_err(ingest_failed)?;
        tx.commit().map_err(ingest_failed)?;

        let report = IngestReport {
            policy,
            rows_received,
            rows_dropped: stamped.dropped_rows,
            rows_written: stamped.rows.len(),
            first_run: stamped.first_run(),
            last_run: stamped.last_run(),
            added_columns,
        };
        tracing::info!(
            db = %self.path.display(),
            policy = %policy,
            seed,
            rows = report.rows_written,
            dropped = report.rows_dropped,
            last_run = ?report.last_run,
            "upload committed"
        );
        Ok(report)
    }

    /// Write an already-stamped table inside `tx`. Returns the columns that were added to
    /// the stored schema.
    ///
    /// Replace drops the old table first. Append keeps it and widens the schema with any
    /// column the upload introduces; rows missing a column read back as NULL.
    pub(crate) fn write(
        tx: &Transaction<'_>,
        stamped: &StampedTable,
        policy: IngestionPolicy,
    ) -> rusqlite::Result<Vec<String>> {
        if policy == IngestionPolicy::Replace {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(RUN_TABLE)))?;
        }

        let existing = table_columns(tx)?;
        let added: Vec<String> = if existing.is_empty() {
            let mut ddl = format!(
                "CREATE TABLE {} ({} INTEGER NOT NULL",
                quote_ident(RUN_TABLE),
                quote_ident(RUN_NUMBER_COLUMN)
            );
            for col in &stamped.columns {
                ddl.push_str(&format!(", {} TEXT", quote_ident(col)));
            }
            ddl.push_str(");");
            ddl.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_run_number ON {}({});",
                quote_ident(RUN_TABLE),
                quote_ident(RUN_NUMBER_COLUMN)
            ));
            tx.execute_batch(&ddl)?;
            stamped.columns.clone()
        } else {
            let known: Vec<String> = existing.iter().map(|c| c.to_ascii_lowercase()).collect();
            let missing: Vec<String> = stamped
                .columns
                .iter()
                .filter(|c| !known.contains(&c.to_ascii_lowercase()))
                .cloned()
                .collect();
            for col in &missing {
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} TEXT",
                    quote_ident(RUN_TABLE),
                    quote_ident(col)
                ))?;
            }
            missing
        };
        if !added.is_empty() {
            tracing::debug!(columns = ?added, "extended run table schema");
        }

        let mut sql = format!(
            "INSERT INTO {} ({}",
            quote_ident(RUN_TABLE),
            quote_ident(RUN_NUMBER_COLUMN)
        );
        for col in &stamped.columns {
            sql.push_str(", ");
            sql.push_str(&quote_ident(col));
        }
        sql.push_str(") VALUES (?1");
        for idx in 0..stamped.columns.len() {
            sql.push_str(&format!(", ?{}", idx + 2));
        }
        sql.push(')');

        let mut stmt = tx.prepare(&sql)?;
        for row in &stamped.rows {
            let run_number = row.run_number as i64;
            let mut values: Vec<&dyn rusqlite::types::ToSql> =
                Vec::with_capacity(row.cells.len() + 1);
            values.push(&run_number);
            for cell in &row.cells {
                values.push(cell);
            }
            stmt.execute(values.as_slice())?;
        }
        Ok(added)
    }

    // ── Read path ────────────────────────────────────────────────────

    /// The full table in insertion order; empty when nothing has been stored yet.
    pub(crate) fn read_all(&self) -> Result<RunTable> {
        let Some(conn) = self.open_existing()? else {
            return Ok(RunTable::default());
        };
        read_run_table(&conn).map_err(|e| self.unavailable(e))
    }

    pub(crate) fn max_run_number(&self) -> Result<u64> {
        let Some(conn) = self.open_existing()? else {
            return Ok(0);
        };
        max_run(&conn).map_err(|e| self.unavailable(e))
    }

    /// Element columns in stored order, reserved columns excluded.
    pub(crate) fn column_names(&self) -> Result<Vec<String>> {
        let Some(conn) = self.open_existing()? else {
            return Ok(Vec::new());
        };
        let columns = table_columns(&conn).map_err(|e| self.unavailable(e))?;
        Ok(columns
            .into_iter()
            .filter(|c| !is_reserved_column(c))
            .collect())
    }
}

// ── Connection helpers ───────────────────────────────────────────────────

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
}

fn ingest_failed(source: rusqlite::Error) -> IngestError {
    tracing::error!(error = %source, "upload rolled back");
    IngestError::IngestFailed { source }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![RUN_TABLE],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

/// Stored column names in declaration order; empty when the table is absent.
fn table_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map(params![RUN_TABLE], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn max_run(conn: &Connection) -> rusqlite::Result<u64> {
    if !table_exists(conn)? {
        return Ok(0);
    }
    let max: i64 = conn.query_row(
        &format!(
            "SELECT COALESCE(MAX({}), 0) FROM {}",
            quote_ident(RUN_NUMBER_COLUMN),
            quote_ident(RUN_TABLE)
        ),
        [],
        |row| row.get(0),
    )?;
    Ok(max.max(0) as u64)
}

fn read_run_table(conn: &Connection) -> rusqlite::Result<RunTable> {
    let columns: Vec<String> = table_columns(conn)?
        .into_iter()
        .filter(|c| c != RUN_NUMBER_COLUMN)
        .collect();
    if columns.is_empty() && !table_exists(conn)? {
        return Ok(RunTable::default());
    }

    let mut sql = format!("SELECT {}", quote_ident(RUN_NUMBER_COLUMN));
    for col in &columns {
        sql.push_str(", ");
        sql.push_str(&quote_ident(col));
    }
    sql.push_str(&format!(" FROM {} ORDER BY rowid", quote_ident(RUN_TABLE)));

    let width = columns.len();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let run_number: i64 = row.get(0)?;
        let mut cells = Vec::with_capacity(width);
        for idx in 0..width {
            cells.push(row.get::<_, Option<String>>(idx + 1)?);
        }
        Ok(StoredRow {
            run_number: run_number.max(0) as u64,
            cells,
        })
    })?;
    let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(RunTable { columns, rows })
}
