use super::{
    parse_declared, Connection, Connector, Dialect, Error, QueryColumn, RowSink, SinkSnafu, SqliteSnafu, Value,
    BATCH_SAVEPOINT, DATE_TIME,
};
use crate::convert::ValueKind;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, ToSql};
use snafu::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) | Value::Clob(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) | Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Date(dt) => ToSqlOutput::Owned(SqlValue::Text(dt.format(DATE_TIME).to_string())),
        })
    }
}

// Dates are stored as text; columns declared as dates scan back into dates.
fn scan(value: ValueRef<'_>, date: bool) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t);
            match date.then(|| parse_stored_date(&text)).flatten() {
                Some(dt) => Value::Date(dt),
                None => Value::Text(text.into_owned()),
            }
        }
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn parse_stored_date(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, DATE_TIME)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?.and_hms_opt(0, 0, 0))
}

fn is_date(column: &QueryColumn) -> bool {
    ValueKind::resolve(&column.native, 0, 0) == ValueKind::Date
}

fn query_column(name: &str, declared: Option<&str>) -> QueryColumn {
    let declared = declared.unwrap_or_default();
    let (base, first, second) = parse_declared(declared);
    let mut column = QueryColumn::new(name, declared);
    if matches!(base.as_str(), "NUMBER" | "NUMERIC" | "DECIMAL") {
        column.precision = first;
        column.scale = second;
    }
    column
}

/// SQLite allows one writer, so every connection of a connector shares a
/// single handle behind a mutex.
#[derive(Clone)]
pub struct SqliteConnector {
    shared: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteConnector {
    pub fn open(path: &str) -> Result<SqliteConnector, Error> {
        let conn = rusqlite::Connection::open(path).context(SqliteSnafu {
            sql: format!("open {path}"),
        })?;
        conn.busy_timeout(Duration::from_secs(30)).context(SqliteSnafu { sql: "busy_timeout" })?;
        log::debug!("opened sqlite database {path}");
        Ok(SqliteConnector {
            shared: Arc::new(Mutex::new(conn)),
        })
    }
}

impl Connector for SqliteConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(SqliteConnection {
            shared: Arc::clone(&self.shared),
            in_tx: false,
        }))
    }
}

struct SqliteConnection {
    shared: Arc<Mutex<rusqlite::Connection>>,
    // whether this handle opened the running transaction
    in_tx: bool,
}

impl SqliteConnection {
    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, Error> {
        self.shared.lock().map_err(|_| Error::Poisoned)
    }

    fn batch(&self, sql: &str) -> Result<(), Error> {
        self.lock()?.execute_batch(sql).context(SqliteSnafu { sql })
    }
}

fn execute_rows(conn: &rusqlite::Connection, sql: &str, rows: &[Vec<Value>]) -> rusqlite::Result<u64> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut affected = 0;
    for row in rows {
        affected += stmt.execute(params_from_iter(row.iter()))? as u64;
    }
    Ok(affected)
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql).context(SqliteSnafu { sql })?;
        let n = stmt.execute(params_from_iter(params.iter())).context(SqliteSnafu { sql })?;
        Ok(n as u64)
    }

    // Rows are collected before the sink sees them so that the sink may use
    // another handle of the same database.
    fn query(&mut self, sql: &str, params: &[Value], sink: &mut dyn RowSink) -> Result<(), Error> {
        let (columns, rows) = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare_cached(sql).context(SqliteSnafu { sql })?;
            let columns: Vec<QueryColumn> = stmt
                .columns()
                .iter()
                .map(|c| query_column(c.name(), c.decl_type()))
                .collect();
            let dates: Vec<bool> = columns.iter().map(is_date).collect();
            let mut rows = Vec::new();
            let mut cursor = stmt.query(params_from_iter(params.iter())).context(SqliteSnafu { sql })?;
            while let Some(row) = cursor.next().context(SqliteSnafu { sql })? {
                let mut values = Vec::with_capacity(columns.len());
                for (i, date) in dates.iter().enumerate() {
                    values.push(scan(row.get_ref(i).context(SqliteSnafu { sql })?, *date));
                }
                rows.push(values);
            }
            (columns, rows)
        };
        sink.columns(&columns).context(SinkSnafu)?;
        for row in rows {
            sink.row(&row).context(SinkSnafu)?;
        }
        Ok(())
    }

    fn query_columns(&mut self, sql: &str) -> Result<Vec<QueryColumn>, Error> {
        let conn = self.lock()?;
        let stmt = conn.prepare_cached(sql).context(SqliteSnafu { sql })?;
        Ok(stmt
            .columns()
            .iter()
            .map(|c| query_column(c.name(), c.decl_type()))
            .collect())
    }

    fn begin(&mut self) -> Result<(), Error> {
        let conn = self.lock()?;
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN").context(SqliteSnafu { sql: "BEGIN" })?;
            drop(conn);
            self.in_tx = true;
        }
        Ok(())
    }

    // readers see committed data without a transaction
    fn begin_read_only(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        if self.in_tx {
            self.in_tx = false;
            self.batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if self.in_tx {
            self.in_tx = false;
            self.batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<(), Error> {
        self.batch(&format!("SAVEPOINT {name}"))
    }

    fn rollback_to(&mut self, name: &str) -> Result<(), Error> {
        self.batch(&format!("ROLLBACK TO SAVEPOINT {name}"))
    }

    fn release(&mut self, name: &str) -> Result<(), Error> {
        self.batch(&format!("RELEASE SAVEPOINT {name}"))
    }

    // The lock is held for the whole batch so no other handle interleaves.
    fn execute_many(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, Error> {
        let conn = self.lock()?;
        let savepoint = format!("SAVEPOINT {BATCH_SAVEPOINT}");
        conn.execute_batch(&savepoint).context(SqliteSnafu { sql: savepoint.as_str() })?;
        match execute_rows(&conn, sql, rows) {
            Ok(n) => {
                let release = format!("RELEASE SAVEPOINT {BATCH_SAVEPOINT}");
                conn.execute_batch(&release).context(SqliteSnafu { sql: release.as_str() })?;
                Ok(n)
            }
            Err(source) => {
                let undo = format!("ROLLBACK TO SAVEPOINT {BATCH_SAVEPOINT}; RELEASE SAVEPOINT {BATCH_SAVEPOINT}");
                if let Err(err) = conn.execute_batch(&undo) {
                    log::warn!("{undo}: {err}");
                }
                Err(Error::Sqlite {
                    sql: sql.to_owned(),
                    source,
                })
            }
        }
    }

    fn commit_per_batch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Rows;

    fn memory() -> Box<dyn Connection> {
        SqliteConnector::open(":memory:").unwrap().connect().unwrap()
    }

    #[test]
    fn round_trip_values() {
        let mut conn = memory();
        conn.execute("CREATE TABLE t (i NUMBER(5), f NUMBER, s VARCHAR2(10), d DATE, b BLOB)", &[])
            .unwrap();
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let row = vec![
            Value::Int(7),
            Value::Float(1.5),
            Value::Text("alma".into()),
            Value::Date(dt),
            Value::Blob(vec![0xca, 0xfe]),
        ];
        assert_eq!(conn.execute("INSERT INTO t VALUES (?1, ?2, ?3, ?4, ?5)", &row).unwrap(), 1);

        let rows = conn.query_rows("SELECT i, f, s, d, b FROM t", &[]).unwrap();
        assert_eq!(
            rows.rows,
            vec![vec![
                Value::Int(7),
                Value::Float(1.5),
                Value::Text("alma".into()),
                Value::Date(dt),
                Value::Bytes(vec![0xca, 0xfe]),
            ]]
        );
        let names: Vec<_> = rows.columns.iter().map(|c| (c.name.as_str(), c.native.as_str())).collect();
        assert_eq!(
            names,
            vec![("i", "NUMBER(5)"), ("f", "NUMBER"), ("s", "VARCHAR2(10)"), ("d", "DATE"), ("b", "BLOB")]
        );
        assert_eq!(rows.columns[0].precision, 5);
    }

    #[test]
    fn batches_are_atomic() {
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        conn.execute("CREATE TABLE t (n INTEGER CHECK (n < 5))", &[]).unwrap();
        let rows: Vec<Vec<Value>> = (0..7).map(|i| vec![Value::Int(i)]).collect();
        assert!(conn.execute_many("INSERT INTO t VALUES (?1)", &rows).is_err());
        assert_eq!(conn.execute_many("INSERT INTO t VALUES (?1)", &rows[..5]).unwrap(), 5);

        let mut other = connector.connect().unwrap();
        let mut count = Rows::default();
        other.query("SELECT COUNT(0) FROM t", &[], &mut count).unwrap();
        assert_eq!(count.rows, vec![vec![Value::Int(5)]]);
    }

    #[test]
    fn transactions() {
        let mut conn = memory();
        conn.execute("CREATE TABLE t (n INTEGER)", &[]).unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.rollback().unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
        conn.commit().unwrap();
        let status = conn.call("SELECT SUM(n) FROM t", &[], true).unwrap();
        assert_eq!(status, Some(2));
    }

    #[test]
    fn catalog() {
        let mut conn = memory();
        conn.execute("CREATE TABLE Tab (a VARCHAR2(3), b NUMBER(4) NOT NULL)", &[]).unwrap();
        let (sql, params) = Dialect::Sqlite.table_exists("", "TAB");
        let got = conn.query_rows(&sql, &params).unwrap();
        assert_eq!(got.rows, vec![vec![Value::Int(1)]]);

        let (sql, params) = Dialect::Sqlite.table_columns("", "tab");
        let got = conn.query_rows(&sql, &params).unwrap();
        let names: Vec<_> = got.rows.iter().map(|r| r[0].to_string()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(got.rows[0][5], Value::Text("N".into()));
    }
}
