//! Bulk load of a row source into a table: one reader thread feeding batches
//! through a bounded channel to a fixed set of database workers.

use crate::context::{Canceled, Cancellation, Context, Group};
use crate::convert::{spreadsheet_day, Column, ConvertError, ValueKind, DEFAULT_DATE_LAYOUT};
use crate::db::{self, rewrite_placeholders, Connection, Connector, Value};
use crate::provision::{self, filter_cols};
use crate::source;
use crossbeam_channel::{bounded, Receiver, Sender};
use snafu::prelude::*;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;
use typed_builder::TypedBuilder;

pub const DEFAULT_BATCH_SIZE: usize = 1024;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_TABLESPACE: &str = "DATA";

const FULL_INSERT: &str = "INSERT /*+ APPEND */ INTO ";

lazy_static::lazy_static! {
    static ref POSITIONAL: regex::Regex = regex::Regex::new(r":(\d+)").expect("valid regex");
}

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Db { source: db::Error },

    #[snafu(display("{}", source))]
    Provision { source: provision::Error },

    #[snafu(display("Error reading source: {}", source))]
    Read { source: source::Error },

    #[snafu(display("{}", source))]
    Convert { source: ConvertError },

    #[snafu(display("row {}: more elements ({}) than columns ({})", row, len, columns))]
    TooManyFields { row: usize, len: usize, columns: usize },

    #[snafu(display("row {}: {} [{}]: {}", row, sql, values, source))]
    Exec {
        row: usize,
        sql: String,
        values: String,
        source: db::Error,
    },

    #[snafu(display("{}", source))]
    Canceled { source: Canceled },

    #[snafu(display("Error writing insert script: {}", source))]
    Write { source: io::Error },

    #[snafu(display("No destination columns for {}", table))]
    NoColumns { table: String },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        match self {
            Error::Db { source } => source.is_cancellation(),
            Error::Provision { source } => source.is_cancellation(),
            Error::Read { source } => source.is_cancellation(),
            Error::Canceled { .. } => true,
            _ => false,
        }
    }
}

impl From<Canceled> for Error {
    fn from(source: Canceled) -> Self {
        Error::Canceled { source }
    }
}

impl From<db::Error> for Error {
    fn from(source: db::Error) -> Self {
        Error::Db { source }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Options {
    /// Destination table, or a complete `INSERT /*+ APPEND */ INTO … VALUES (:1, …)`.
    #[builder(setter(into))]
    pub table: String,
    /// Destination field names in source column order; the header when empty.
    #[builder(default)]
    pub fields: Vec<String>,
    #[builder(default = DEFAULT_TABLESPACE.to_owned(), setter(into))]
    pub tablespace: String,
    #[builder(default, setter(into))]
    pub copy: String,
    #[builder(default)]
    pub truncate: bool,
    #[builder(default)]
    pub force_string: bool,
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    #[builder(default = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
    #[builder(default = DEFAULT_DATE_LAYOUT.to_owned(), setter(into))]
    pub date_layout: String,
}

impl Options {
    fn full_insert(&self) -> bool {
        self.table
            .get(..FULL_INSERT.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(FULL_INSERT))
    }
}

/// Field names separated by `,`, `;` or whitespace.
pub fn split_fields(fields: &str) -> Vec<String> {
    fields
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub read: u64,
    pub inserted: u64,
}

/// Rows of one batch; `start` is the index of its first data row.
#[derive(Debug)]
struct Batch {
    start: usize,
    rows: Vec<Vec<String>>,
}

struct BatchPool {
    capacity: usize,
    free: Mutex<Vec<Vec<Vec<String>>>>,
}

impl BatchPool {
    fn new(capacity: usize) -> BatchPool {
        BatchPool {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Vec<Vec<String>> {
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    fn put(&self, mut rows: Vec<Vec<String>>) {
        rows.clear();
        if let Ok(mut free) = self.free.lock() {
            free.push(rows);
        }
    }
}

/// Hands the rows of a batch back to the pool however the worker exits.
struct Pooled<'a> {
    pool: &'a BatchPool,
    batch: Batch,
}

impl Drop for Pooled<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.batch.rows));
    }
}

/// Values of the first surfaced row.
fn header(ctx: &Context, src: &source::Config) -> Result<Vec<String>, Error> {
    let mut header = None;
    let res = src.read_rows(ctx, |_, row| {
        header = Some(row.values);
        Err(Canceled::Canceled.into())
    });
    match (header, res) {
        (Some(header), _) => Ok(header),
        (None, Ok(())) => Ok(Vec::new()),
        (None, Err(source)) => Err(Error::Read { source }),
    }
}

fn join_values(values: &[Value]) -> String {
    values.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
}

/// The insert statement and its columns, provisioning the table on the way.
fn prepare(
    ctx: &Context,
    conn: &mut dyn Connection,
    opts: &Options,
    src: &source::Config,
) -> Result<(String, Vec<Column>), Error> {
    let dialect = conn.dialect();
    if opts.full_insert() {
        let (sql, names) = rewrite_placeholders(&opts.table, dialect);
        let columns = names
            .iter()
            .map(|name| Column::new(name, "VARCHAR2", 0, 0, 0, true))
            .collect();
        return Ok((sql, columns));
    }
    let mut fields = opts.fields.clone();
    if fields.is_empty() {
        fields = header(ctx, src)?;
    }
    log::debug!("fields={fields:?}");
    let provision_opts = provision::Options::builder()
        .table(opts.table.clone())
        .tablespace(opts.tablespace.clone())
        .copy(opts.copy.clone())
        .truncate(opts.truncate)
        .force_string(opts.force_string)
        .date_layout(opts.date_layout.clone())
        .build();
    let columns = provision::provision(ctx, conn, &provision_opts, src).context(ProvisionSnafu)?;
    let columns = filter_cols(columns, &fields);
    let table = opts.table.to_uppercase();
    ensure!(!columns.is_empty(), NoColumnsSnafu { table: &table });

    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
    let sql = format!(
        "{FULL_INSERT}{table} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, columns))
}

/// Loads the configured sheet of `src` into `opts.table`.
///
/// Each worker commits its own transaction when the input is exhausted, so a
/// failing worker does not undo what its siblings have already committed.
pub fn load(
    ctx: &Context,
    connector: &dyn Connector,
    opts: &Options,
    src: &source::Config,
) -> Result<Summary, Error> {
    let (sql, columns) = {
        let mut conn = connector.connect()?;
        prepare(ctx, conn.as_mut(), opts, src)?
    };
    log::info!("synthetized qry={sql}");

    let mut batch_size = opts.batch_size.max(1);
    if columns.iter().any(Column::is_lob) {
        batch_size = 1;
    }
    let concurrency = opts.concurrency.max(1);
    let start = Instant::now();

    let group: Group<Error> = Group::new(ctx);
    let (tx, rx) = bounded::<Batch>(concurrency);
    let pool = BatchPool::new(batch_size);
    let inserted = AtomicU64::new(0);
    let mut read = 0;

    thread::scope(|s| {
        for _ in 0..concurrency {
            let rx = rx.clone();
            let worker = Worker {
                ctx: group.context(),
                sql: &sql,
                columns: &columns,
                date_layout: &opts.date_layout,
                pool: &pool,
                inserted: &inserted,
            };
            let group = &group;
            s.spawn(move || group.report(worker.run(connector, &rx)));
        }
        drop(rx);
        group.report(produce(group.context(), src, tx, &pool, batch_size, &mut read));
    });
    let result = group.finish();

    let summary = Summary {
        read: read as u64,
        inserted: inserted.load(Ordering::SeqCst),
    };
    log::info!(
        "timing read={} inserted={} tbl={} dur={:?}",
        summary.read,
        summary.inserted,
        opts.table,
        start.elapsed()
    );
    if let Err(err) = &result {
        log::error!("load {}: {err}", opts.table);
    }
    result.map(|()| summary)
}

// Reads the data rows (header and empty rows dropped) into batches.
fn produce(
    ctx: &Context,
    src: &source::Config,
    tx: Sender<Batch>,
    pool: &BatchPool,
    batch_size: usize,
    read: &mut usize,
) -> Result<(), Error> {
    let mut header_seen = false;
    let mut rows = pool.get();
    let mut sent = 0;
    src.read_rows(ctx, |_, row| {
        if !header_seen {
            header_seen = true;
            return Ok(());
        }
        if row.is_empty() {
            return Ok(());
        }
        rows.push(row.values);
        if rows.len() < batch_size {
            return Ok(());
        }
        let full = std::mem::replace(&mut rows, pool.get());
        let n = full.len();
        if !ctx.send(&tx, Batch { start: sent, rows: full })? {
            return Err(Canceled::Canceled.into());
        }
        sent += n;
        *read = sent;
        Ok(())
    })
    .context(ReadSnafu)?;
    if !rows.is_empty() {
        let n = rows.len();
        if !ctx.send(&tx, Batch { start: sent, rows })? {
            return Err(Canceled::Canceled.into());
        }
        sent += n;
        *read = sent;
    }
    Ok(())
}

struct Worker<'a> {
    ctx: &'a Context,
    sql: &'a str,
    columns: &'a [Column],
    date_layout: &'a str,
    pool: &'a BatchPool,
    inserted: &'a AtomicU64,
}

impl Worker<'_> {
    fn run(&self, connector: &dyn Connector, rx: &Receiver<Batch>) -> Result<(), Error> {
        let mut conn = connector.connect()?;
        let per_batch = conn.commit_per_batch();
        if !per_batch {
            conn.begin()?;
        }
        match self.consume(conn.as_mut(), rx) {
            Ok(()) => {
                if !per_batch {
                    conn.commit()?;
                }
                Ok(())
            }
            Err(err) => {
                if !per_batch {
                    if let Err(undo) = conn.rollback() {
                        log::warn!("ROLLBACK: {undo}");
                    }
                }
                Err(err)
            }
        }
    }

    fn consume(&self, conn: &mut dyn Connection, rx: &Receiver<Batch>) -> Result<(), Error> {
        while let Some(batch) = self.ctx.recv(rx)? {
            let batch = Pooled { pool: self.pool, batch };
            if batch.batch.rows.is_empty() {
                continue;
            }
            let rows = self.convert(&batch.batch)?;
            self.insert(conn, batch.batch.start, &rows)?;
        }
        Ok(())
    }

    /// Binds every column of the batch; the result is row major.
    fn convert(&self, batch: &Batch) -> Result<Vec<Vec<Value>>, Error> {
        let ncols = self.columns.len();
        for (k, row) in batch.rows.iter().enumerate() {
            if row.get(ncols..).is_some_and(|extra| extra.iter().any(|v| !v.is_empty())) {
                return TooManyFieldsSnafu {
                    row: batch.start + k,
                    len: row.len(),
                    columns: ncols,
                }
                .fail();
            }
        }
        let mut by_column = Vec::with_capacity(ncols);
        for (j, column) in self.columns.iter().enumerate() {
            let values = batch.rows.iter().map(|row| row.get(j).map_or("", String::as_str));
            let converted = column
                .from_strings(values, batch.start, self.date_layout)
                .map_err(|source| {
                    log::error!("FromString column={} error={source}", column.name);
                    Error::Convert { source }
                })?;
            by_column.push(converted.into_iter());
        }
        Ok((0..batch.rows.len())
            .map(|_| {
                by_column
                    .iter_mut()
                    .map(|column| column.next().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    fn insert(&self, conn: &mut dyn Connection, start: usize, rows: &[Vec<Value>]) -> Result<(), Error> {
        let err = match conn.execute_many(self.sql, rows) {
            Ok(_) => {
                self.inserted.fetch_add(rows.len() as u64, Ordering::SeqCst);
                return Ok(());
            }
            Err(err) => err,
        };
        if rows.len() == 1 {
            log::error!("exec qry={} row={start} values=[{}] error={err}", self.sql, join_values(&rows[0]));
            return Err(Error::Exec {
                row: start,
                sql: self.sql.to_owned(),
                values: join_values(&rows[0]),
                source: err,
            });
        }
        log::error!("exec qry={} rows={}..{} error={err}, retrying row by row", self.sql, start, start + rows.len());
        for (k, row) in rows.iter().enumerate() {
            self.ctx.check()?;
            if let Err(source) = conn.execute_many(self.sql, std::slice::from_ref(row)) {
                log::error!("exec row={} values=[{}] error={source}", start + k, join_values(row));
                return Err(Error::Exec {
                    row: start + k,
                    sql: self.sql.to_owned(),
                    values: join_values(row),
                    source,
                });
            }
            self.inserted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// `'…'` with quotes doubled and `&` kept out of SQL*Plus substitution.
fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''").replace('&', "'||CHR(38)||'"))
}

fn date_literal(s: &str) -> String {
    let mut d: String = s.chars().filter(|c| *c != '.' && *c != '-').collect();
    if d.len() == 6 {
        d.insert_str(0, "20");
    } else if d.len() < 8 {
        if let Some(day) = d.parse::<i64>().ok().and_then(spreadsheet_day) {
            d = day.format("%Y%m%d").to_string();
        }
    }
    if d.len() > 8 && d.is_char_boundary(8) {
        d.truncate(8);
    }
    format!("TO_DATE('{d}','YYYYMMDD')")
}

enum Piece {
    Text(String),
    Param(usize),
}

fn split_pattern(pattern: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for caps in POSITIONAL.captures_iter(pattern) {
        let Some(whole) = caps.get(0) else { continue };
        pieces.push(Piece::Text(pattern[last..whole.start()].to_owned()));
        pieces.push(Piece::Param(caps[1].parse::<usize>().unwrap_or(1).saturating_sub(1)));
        last = whole.end();
    }
    pieces.push(Piece::Text(pattern[last..].to_owned()));
    pieces
}

/// Writes an Oracle `INSERT ALL` script of the data rows instead of loading them.
pub fn print_inserts(
    ctx: &Context,
    conn: &mut dyn Connection,
    opts: &Options,
    src: &source::Config,
    w: &mut dyn Write,
) -> Result<u64, Error> {
    let table = opts.table.to_uppercase();
    let head = header(ctx, src)?;
    let (pattern, columns) = if opts.full_insert() {
        let into = opts.table[FULL_INSERT.len()..].trim();
        let n = POSITIONAL.find_iter(into).count();
        let columns = (1..=n)
            .map(|i| Column::new(&i.to_string(), "VARCHAR2", 0, 0, 0, true))
            .collect::<Vec<_>>();
        (format!("  INTO {into}\n"), columns)
    } else {
        let fields = if opts.fields.is_empty() { head.clone() } else { opts.fields.clone() };
        let mut columns = filter_cols(provision::table_columns(conn, &table).context(ProvisionSnafu)?, &fields);
        if columns.is_empty() {
            columns = head
                .iter()
                .map(|name| Column::new(name, "VARCHAR2", 0, 0, 0, true))
                .collect();
        }
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!(":{i}")).collect();
        (
            format!("  INTO {table} ({}) VALUES ({})\n", names.join(", "), placeholders.join(", ")),
            columns,
        )
    };
    let pieces = split_pattern(&pattern);

    w.write_all(b"INSERT ALL\n").context(WriteSnafu)?;
    let mut header_seen = false;
    let mut written = 0;
    src.read_rows(ctx, |_, row| {
        if !header_seen {
            header_seen = true;
            return Ok(());
        }
        if row.is_empty() {
            return Ok(());
        }
        let literals: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(j, column)| {
                let value = row.values.get(j).map_or("", String::as_str);
                if column.kind == ValueKind::Date {
                    date_literal(value)
                } else {
                    quote_literal(value)
                }
            })
            .collect();
        let mut line = String::new();
        for piece in &pieces {
            match piece {
                Piece::Text(text) => line.push_str(text),
                Piece::Param(i) => line.push_str(literals.get(*i).map_or("NULL", String::as_str)),
            }
        }
        written += 1;
        w.write_all(line.as_bytes())
            .map_err(|err| source::Error::Callback { source: Box::new(err) })
    })
    .context(ReadSnafu)?;
    w.write_all(b"SELECT 1 FROM DUAL;\n").context(WriteSnafu)?;
    w.flush().context(WriteSnafu)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteConnector;

    #[test]
    fn literals() {
        assert_eq!(quote_literal("it's A&B"), "'it''s A'||CHR(38)||'B'");
        assert_eq!(date_literal("2024-03-15"), "TO_DATE('20240315','YYYYMMDD')");
        assert_eq!(date_literal("24.03.15"), "TO_DATE('20240315','YYYYMMDD')");
        assert_eq!(date_literal("45366"), "TO_DATE('20240315','YYYYMMDD')");
        assert_eq!(date_literal(""), "TO_DATE('','YYYYMMDD')");
    }

    #[test]
    fn full_insert_detection() {
        let opts = Options::builder()
            .table("insert /*+ APPEND */ into t (a, b) VALUES (:1, :2)")
            .build();
        assert!(opts.full_insert());
        assert!(!Options::builder().table("t").build().full_insert());
        assert_eq!(split_fields("a, b;c  d"), ["a", "b", "c", "d"]);
        let pieces = split_pattern("(:1, ':x', :12)");
        assert_eq!(pieces.len(), 5);
        assert!(matches!(pieces[3], Piece::Param(11)));
    }

    #[test]
    fn pool_reuses_batches() {
        let pool = BatchPool::new(4);
        let mut rows = pool.get();
        rows.push(vec!["a".into()]);
        {
            let _guard = Pooled {
                pool: &pool,
                batch: Batch { start: 0, rows },
            };
        }
        let again = pool.get();
        assert!(again.is_empty());
        assert!(again.capacity() >= 4);
        assert!(pool.free.lock().unwrap().is_empty());
    }

    fn worker<'a>(columns: &'a [Column], pool: &'a BatchPool, inserted: &'a AtomicU64, ctx: &'a Context) -> Worker<'a> {
        Worker {
            ctx,
            sql: "",
            columns,
            date_layout: DEFAULT_DATE_LAYOUT,
            pool,
            inserted,
        }
    }

    #[test]
    fn row_shape() {
        let columns = [
            Column::new("A", "NUMBER", 0, 5, 0, true),
            Column::new("B", "VARCHAR2", 10, 0, 0, true),
        ];
        let (pool, inserted, ctx) = (BatchPool::new(1), AtomicU64::new(0), Context::background());
        let w = worker(&columns, &pool, &inserted, &ctx);
        let batch = Batch {
            start: 10,
            rows: vec![vec!["1".into(), "x".into(), "".into()], vec!["2".into()]],
        };
        assert_eq!(
            w.convert(&batch).unwrap(),
            vec![
                vec![Value::Int(1), Value::Text("x".into())],
                vec![Value::Int(2), Value::Null]
            ]
        );
        let batch = Batch {
            start: 10,
            rows: vec![vec!["1".into()], vec!["2".into(), "y".into(), "extra".into()]],
        };
        assert!(matches!(
            w.convert(&batch),
            Err(Error::TooManyFields { row: 11, len: 3, columns: 2 })
        ));
        let batch = Batch {
            start: 10,
            rows: vec![vec!["1".into()], vec!["x2".into()]],
        };
        match w.convert(&batch) {
            Err(Error::Convert { source }) => {
                assert_eq!(source.row, 11);
                assert_eq!(source.column, "A");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn prints_insert_all() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("in.csv");
        std::fs::write(&csv, "id;name;day\n1;A&B;2024-01-02\n;;\n2;it's;\n").unwrap();
        let mut src = source::Config::builder().build();
        src.open(csv.to_str().unwrap()).unwrap();
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        conn.execute("CREATE TABLE T (ID NUMBER(5), NAME VARCHAR2(10), DAY DATE)", &[])
            .unwrap();

        let mut out = Vec::new();
        let opts = Options::builder().table("t").build();
        let n = print_inserts(&Context::background(), conn.as_mut(), &opts, &src, &mut out).unwrap();
        assert_eq!(n, 2);
        insta::assert_snapshot!(String::from_utf8(out).unwrap(), @r###"
        INSERT ALL
          INTO T (ID, NAME, DAY) VALUES ('1', 'A'||CHR(38)||'B', TO_DATE('20240102','YYYYMMDD'))
          INTO T (ID, NAME, DAY) VALUES ('2', 'it''s', TO_DATE('','YYYYMMDD'))
        SELECT 1 FROM DUAL;
        "###);
    }
}
