//! Storage executor: the single SQL thread.
//!
//! One dedicated OS thread owns the `rusqlite::Connection` and executes one
//! statement at a time; jobs arrive over a channel from the broker core and
//! results return the same way.  Keeping SQL off the event-loop thread is
//! what lets request intake keep enqueueing while a statement runs.
//!
//! Errors never leave this module as engine errors: they are classified into
//! the wire `ErrorCode` by matching the engine's message text, the same
//! contract old peers rely on.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use rusqlite::Connection;
use rusqlite::types::ValueRef;
use sqlapi_protocol::{ErrorCode, Request, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Materialised result of one SQL execution, iterated row-major.
#[derive(Debug, Default)]
pub struct Cursor {
    columns: Vec<String>,
    cells: VecDeque<Value>,
    row_count: usize,
}

impl Cursor {
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Next cell in row-major order (all columns of row 0, then row 1, ...).
    pub fn next_cell(&mut self) -> Option<Value> {
        self.cells.pop_front()
    }

    /// Take the next full row, or `None` once the cursor is exhausted.
    pub fn next_row(&mut self) -> Option<Vec<Value>> {
        if self.cells.is_empty() {
            return None;
        }
        let width = self.columns.len().max(1);
        let mut row = Vec::with_capacity(width);
        for _ in 0..width {
            match self.next_cell() {
                Some(cell) => row.push(cell),
                None => break,
            }
        }
        Some(row)
    }

    /// Drain every remaining cell.
    pub fn into_cells(self) -> Vec<Value> {
        self.cells.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Execution outcome
// ---------------------------------------------------------------------------

/// Result of one executed request, routed back to the broker core.
#[derive(Debug)]
pub struct ExecOutcome {
    /// Which storage incarnation produced this (stale after a ChangeDB).
    pub generation: u64,
    pub request: Request,
    pub status: ErrorCode,
    pub cursor: Cursor,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Handle to the SQL thread.  Dropping it shuts the thread down.
pub struct Storage {
    job_tx: Option<mpsc::UnboundedSender<Request>>,
    thread: Option<JoinHandle<()>>,
    generation: u64,
}

impl Storage {
    /// Spawn the SQL thread bound to `db_path`.  Open failure is reported
    /// per job as `InitializationError` rather than tearing the broker down.
    pub fn spawn(
        db_path: PathBuf,
        generation: u64,
        results_tx: mpsc::UnboundedSender<ExecOutcome>,
    ) -> Storage {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let thread = std::thread::spawn(move || sql_thread(db_path, generation, job_rx, results_tx));
        Storage {
            job_tx: Some(job_tx),
            thread: Some(thread),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue one request for execution.
    pub fn submit(&self, request: Request) {
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(request);
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // Closing the job channel ends the thread's receive loop; join so the
        // connection is fully closed before a successor opens the next file.
        drop(self.job_tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// SQL thread
// ---------------------------------------------------------------------------

fn sql_thread(
    db_path: PathBuf,
    generation: u64,
    mut job_rx: mpsc::UnboundedReceiver<Request>,
    results_tx: mpsc::UnboundedSender<ExecOutcome>,
) {
    let conn = match Connection::open(&db_path) {
        Ok(conn) => {
            info!(db = %db_path.display(), "storage open");
            Some(conn)
        }
        Err(e) => {
            error!(db = %db_path.display(), error = %e, "unable to open database");
            None
        }
    };

    while let Some(request) = job_rx.blocking_recv() {
        let (status, cursor) = match &conn {
            Some(conn) => match execute(conn, &request.payload) {
                Ok(cursor) => (ErrorCode::NoError, cursor),
                Err(e) => {
                    debug!(error = %e, sql = %request.payload, "statement failed");
                    (classify(&e), Cursor::default())
                }
            },
            None => (ErrorCode::InitializationError, Cursor::default()),
        };
        if results_tx
            .send(ExecOutcome {
                generation,
                request,
                status,
                cursor,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Prepare and run one statement, materialising every row.
///
/// Queries and mutations go through the same path; a mutation simply yields
/// zero columns and zero rows.
fn execute(conn: &Connection, sql: &str) -> Result<Cursor, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_owned()).collect();
    let width = columns.len();

    let mut cells = VecDeque::new();
    let mut row_count = 0;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        row_count += 1;
        for index in 0..width {
            cells.push_back(cell_value(row.get_ref(index)?));
        }
    }
    Ok(Cursor {
        columns,
        cells,
        row_count,
    })
}

fn cell_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Double(v),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Map an engine error onto the wire error codes by message text.
fn classify(err: &StorageError) -> ErrorCode {
    let text = err.to_string().to_lowercase();
    if text.contains("already exists") {
        ErrorCode::AlreadyExistError
    } else if text.contains("no such table") {
        ErrorCode::NotFoundError
    } else {
        ErrorCode::UndefinedError
    }
}

/// Resolve the database file path for `name` under `db_dir`.
pub fn db_path(db_dir: &Path, name: &str) -> PathBuf {
    db_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        Connection::open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn create_twice_classifies_as_already_exist() {
        let conn = memory_conn();
        execute(&conn, "CREATE TABLE t (k VARCHAR(8) NOT NULL PRIMARY KEY)").unwrap();
        let err = execute(&conn, "CREATE TABLE t (k VARCHAR(8) NOT NULL PRIMARY KEY)")
            .expect_err("second create must fail");
        assert_eq!(classify(&err), ErrorCode::AlreadyExistError);
    }

    #[test]
    fn missing_table_classifies_as_not_found() {
        let conn = memory_conn();
        let err = execute(&conn, "SELECT * FROM nothere").expect_err("must fail");
        assert_eq!(classify(&err), ErrorCode::NotFoundError);
    }

    #[test]
    fn syntax_error_classifies_as_undefined() {
        let conn = memory_conn();
        let err = execute(&conn, "NOT SQL AT ALL").expect_err("must fail");
        assert_eq!(classify(&err), ErrorCode::UndefinedError);
    }

    #[test]
    fn cursor_iterates_row_major() {
        let conn = memory_conn();
        execute(&conn, "CREATE TABLE t (k VARCHAR(8) NOT NULL PRIMARY KEY, n INTEGER)").unwrap();
        execute(&conn, "INSERT INTO t VALUES ('a','1')").unwrap();
        execute(&conn, "INSERT INTO t VALUES ('b','2')").unwrap();

        let mut cursor = execute(&conn, "SELECT * FROM t").unwrap();
        assert_eq!(cursor.row_count(), 2);
        assert_eq!(cursor.columns(), ["k", "n"]);
        assert_eq!(cursor.next_cell(), Some(Value::Text("a".to_owned())));
        assert_eq!(cursor.next_cell(), Some(Value::Int(1)));
        assert_eq!(cursor.next_row(), Some(vec![Value::Text("b".to_owned()), Value::Int(2)]));
        assert_eq!(cursor.next_row(), None);
    }

    #[test]
    fn quoted_integers_take_integer_affinity() {
        let conn = memory_conn();
        execute(&conn, "CREATE TABLE t (k VARCHAR(8) NOT NULL PRIMARY KEY, n INTEGER)").unwrap();
        execute(&conn, "INSERT INTO t VALUES ('a','7')").unwrap();
        let cells = execute(&conn, "SELECT n FROM t").unwrap().into_cells();
        assert_eq!(cells, vec![Value::Int(7)]);
    }

    #[test]
    fn mutations_yield_an_empty_cursor() {
        let conn = memory_conn();
        execute(&conn, "CREATE TABLE t (k VARCHAR(8) NOT NULL PRIMARY KEY)").unwrap();
        let cursor = execute(&conn, "INSERT INTO t VALUES ('a')").unwrap();
        assert_eq!(cursor.row_count(), 0);
        assert!(cursor.columns().is_empty());
    }
}
