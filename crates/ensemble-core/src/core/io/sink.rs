//! Durable, append-only destinations for result tuples.

use crate::core::models::results::{ResultTuple, ResultValue};
use rusqlite::Connection;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error on result sink: {0}")]
    Io(#[from] std::io::Error),

    #[error("Result has {found} field(s), table expects {expected}")]
    Arity { expected: usize, found: usize },
}

pub trait ResultSink: Send {
    fn insert(&mut self, row: &ResultTuple) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}

impl<S: ResultSink + ?Sized> ResultSink for Box<S> {
    fn insert(&mut self, row: &ResultTuple) -> Result<(), SinkError> {
        (**self).insert(row)
    }
    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "int",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// Table name plus ordered, typed columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSchema {
    pub table: String,
    pub columns: Vec<Column>,
}

impl SinkSchema {
    pub fn new(table: impl Into<String>, columns: &[(&str, ColumnType)]) -> Self {
        Self {
            table: table.into(),
            columns: columns
                .iter()
                .map(|(name, kind)| Column {
                    name: name.to_string(),
                    kind: *kind,
                })
                .collect(),
        }
    }

    /// The free-energy results table of a CADEE run.
    pub fn cadee_results() -> Self {
        use ColumnType::*;
        Self::new(
            "results",
            &[
                ("time", Integer),
                ("mutant", Text),
                ("replik", Integer),
                ("name", Text),
                ("feptype", Text),
                ("barr_forw", Real),
                ("exo", Real),
                ("barr_back", Real),
                ("ttot", Real),
                ("tfree", Real),
                ("tfreesolute", Real),
                ("tfreesolvent", Real),
                ("ene_kin", Real),
                ("ene_pot", Real),
                ("ene_tot", Real),
            ],
        )
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    fn check(&self, row: &ResultTuple) -> Result<(), SinkError> {
        if row.arity() != self.arity() {
            return Err(SinkError::Arity {
                expected: self.arity(),
                found: row.arity(),
            });
        }
        Ok(())
    }

    fn create_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.kind.sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            cols.join(", ")
        )
    }

    fn insert_sql(&self) -> String {
        let slots = vec!["?"; self.arity()].join(",");
        format!("INSERT INTO {} VALUES ({})", self.table, slots)
    }
}

impl ToSql for ResultValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ResultValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            ResultValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            ResultValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            ResultValue::Null => ToSqlOutput::Owned(Value::Null),
        })
    }
}

/// SQLite table that batches inserts into transactions committed every `commit_interval`.
pub struct SqliteSink {
    conn: Connection,
    schema: SinkSchema,
    insert_sql: String,
    commit_interval: Duration,
    last_commit: Instant,
    in_transaction: bool,
}

impl SqliteSink {
    pub fn open(
        path: &Path,
        schema: SinkSchema,
        commit_interval: Duration,
    ) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, schema, commit_interval)
    }

    pub fn with_connection(
        conn: Connection,
        schema: SinkSchema,
        commit_interval: Duration,
    ) -> Result<Self, SinkError> {
        conn.execute_batch(&schema.create_sql())?;
        debug!("Result table '{}' ready", schema.table);
        Ok(Self {
            conn,
            insert_sql: schema.insert_sql(),
            schema,
            commit_interval,
            last_commit: Instant::now(),
            in_transaction: false,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn commit(&mut self) -> Result<(), SinkError> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
            info!("Committed result database.");
        }
        self.last_commit = Instant::now();
        Ok(())
    }
}

impl ResultSink for SqliteSink {
    fn insert(&mut self, row: &ResultTuple) -> Result<(), SinkError> {
        self.schema.check(row)?;
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        let mut stmt = self.conn.prepare_cached(&self.insert_sql)?;
        stmt.execute(rusqlite::params_from_iter(row.values()))?;
        drop(stmt);

        if self.last_commit.elapsed() >= self.commit_interval {
            self.commit()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.commit()
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.commit()
    }
}

/// Comma-separated export with a header line written once per file.
pub struct CsvSink {
    writer: csv::Writer<std::fs::File>,
    schema: SinkSchema,
}

impl CsvSink {
    pub fn open(path: &Path, schema: SinkSchema) -> Result<Self, SinkError> {
        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::Writer::from_writer(file);
        if fresh {
            writer.write_record(schema.columns.iter().map(|c| c.name.as_str()))?;
            writer.flush()?;
        }
        Ok(Self { writer, schema })
    }
}

impl ResultSink for CsvSink {
    fn insert(&mut self, row: &ResultTuple) -> Result<(), SinkError> {
        self.schema.check(row)?;
        self.writer
            .write_record(row.values().iter().map(ResultValue::to_string))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// Keeps rows in memory behind a shared handle, so callers can inspect them after the sink was
/// moved into a coordinator.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<ResultTuple>>>,
    schema: Option<SinkSchema>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: SinkSchema) -> Self {
        Self {
            rows: Arc::default(),
            schema: Some(schema),
        }
    }

    pub fn rows(&self) -> Vec<ResultTuple> {
        self.rows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl ResultSink for MemorySink {
    fn insert(&mut self, row: &ResultTuple) -> Result<(), SinkError> {
        if let Some(schema) = &self.schema {
            schema.check(row)?;
        }
        self.rows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Moves an existing database out of the way as `<path>N`, using the first free `N`.
pub fn backup_existing(path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    warn!("Database would be overwritten: {}", path.display());

    let mut n = 0;
    let backup = loop {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(n.to_string());
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };

    std::fs::rename(path, &backup)?;
    info!("Created backup: {}", backup.display());
    Ok(Some(backup))
}

/// Opens a CSV sink for `.csv` paths and a SQLite sink otherwise.
pub fn open_sink(
    path: &Path,
    schema: SinkSchema,
    commit_interval: Duration,
) -> Result<Box<dyn ResultSink>, SinkError> {
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        Ok(Box::new(CsvSink::open(path, schema)?))
    } else {
        Ok(Box::new(SqliteSink::open(path, schema, commit_interval)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tiny_schema() -> SinkSchema {
        SinkSchema::new(
            "results",
            &[
                ("time", ColumnType::Integer),
                ("mutant", ColumnType::Text),
                ("barr_forw", ColumnType::Real),
            ],
        )
    }

    fn row(time: i64, mutant: &str, barrier: Option<f64>) -> ResultTuple {
        ResultTuple::new(vec![time.into(), mutant.into(), barrier.into()])
    }

    #[test]
    fn sqlite_rows_are_visible_after_flush() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("cadee.db");

        let mut sink = SqliteSink::open(&db, tiny_schema(), Duration::from_secs(3600)).unwrap();
        sink.insert(&row(1, "wt", Some(12.5))).unwrap();
        sink.insert(&row(2, "A12G", None)).unwrap();
        sink.close().unwrap();
        drop(sink);

        let conn = Connection::open(&db).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let barrier: Option<f64> = conn
            .query_row("SELECT barr_forw FROM results WHERE time = 2", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(barrier, None);
    }

    #[test]
    fn sqlite_commits_once_interval_elapsed() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("cadee.db");

        let mut sink = SqliteSink::open(&db, tiny_schema(), Duration::ZERO).unwrap();
        sink.insert(&row(1, "wt", Some(1.0))).unwrap();

        let reader = Connection::open(&db).unwrap();
        let count: i64 = reader
            .query_row("SELECT count(*) FROM results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn wrong_arity_is_rejected_without_writing() {
        let mut sink = MemorySink::with_schema(tiny_schema());
        let err = sink
            .insert(&ResultTuple::new(vec![1_i64.into()]))
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::Arity {
                expected: 3,
                found: 1
            }
        ));
        assert!(sink.rows().is_empty());
    }

    #[test]
    fn cadee_results_has_fifteen_columns() {
        let schema = SinkSchema::cadee_results();
        assert_eq!(schema.arity(), 15);
        assert!(schema.create_sql().starts_with(
            "CREATE TABLE IF NOT EXISTS results (time int, mutant text, replik int"
        ));
    }

    #[test]
    fn csv_header_is_written_only_for_new_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        for i in 0..2 {
            let mut sink = open_sink(&path, tiny_schema(), DEFAULT_COMMIT_INTERVAL).unwrap();
            sink.insert(&row(i, "wt", Some(0.5))).unwrap();
            sink.close().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "time,mutant,barr_forw\n0,wt,0.5\n1,wt,0.5\n");
    }

    #[test]
    fn backup_picks_first_free_suffix() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("cadee.db");
        assert!(backup_existing(&db).unwrap().is_none());

        std::fs::write(&db, b"first").unwrap();
        std::fs::write(dir.path().join("cadee.db0"), b"older").unwrap();

        let backup = backup_existing(&db).unwrap().unwrap();
        assert_eq!(backup, dir.path().join("cadee.db1"));
        assert!(!db.exists());
        assert_eq!(std::fs::read(&backup).unwrap(), b"first");
    }
}
