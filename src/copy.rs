//! Table copy between two databases.
//!
//! Every task reads through its own source connection; all of them insert
//! through one destination connection whose transaction is committed only
//! when every task succeeded.

use crate::context::{Canceled, Cancellation, Context};
use crate::db::{self, BoxError, Connection, Connector, QueryColumn, RowSink, Value};
use crate::provision;
use crossbeam_channel::{unbounded, SendError};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use threadpool::ThreadPool;
use typed_builder::TypedBuilder;

pub const DEFAULT_BATCH_SIZE: usize = 8192;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_TABLE_TIMEOUT: Duration = Duration::from_secs(10);

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Db { source: db::Error },

    #[snafu(display("{}: {}", table, source))]
    Table { table: String, source: db::Error },

    #[snafu(display("TRUNCATE TABLE {}: {}", table, source))]
    Truncate { table: String, source: provision::Error },

    #[snafu(display("No common columns between {} and {}", src, dst))]
    NoColumns { src: String, dst: String },

    #[snafu(display("{}", source))]
    Canceled { source: Canceled },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        match self {
            Error::Db { source } | Error::Table { source, .. } => source.is_cancellation(),
            Error::Truncate { source, .. } => source.is_cancellation(),
            Error::Canceled { .. } => true,
            _ => false,
        }
    }
}

impl From<db::Error> for Error {
    fn from(source: db::Error) -> Self {
        Error::Db { source }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyTask {
    pub src: String,
    /// Defaults to `src`.
    pub dst: String,
    pub where_: String,
    /// Destination fields (upper case) set to a literal instead of the source value.
    pub replace: BTreeMap<String, String>,
    pub truncate: bool,
}

impl CopyTask {
    /// `src [where [dst]]` as given on the command line.
    pub fn from_args(args: &[String], replace: &BTreeMap<String, String>, truncate: bool) -> Option<CopyTask> {
        let src = args.first()?.trim();
        if src.is_empty() {
            return None;
        }
        Some(CopyTask {
            src: src.to_owned(),
            where_: args.get(1).cloned().unwrap_or_default(),
            dst: args.get(2).cloned().unwrap_or_default(),
            replace: replace.clone(),
            truncate,
        })
    }

    /// `src[=dst] [where]`, one per line.
    pub fn from_line(line: &str, replace: &BTreeMap<String, String>, truncate: bool) -> Option<CopyTask> {
        let (tables, where_) = line.split_once(' ').unwrap_or((line, ""));
        let (src, dst) = tables.split_once('=').unwrap_or((tables, ""));
        if src.is_empty() {
            return None;
        }
        Some(CopyTask {
            src: src.to_owned(),
            dst: dst.to_owned(),
            where_: where_.to_owned(),
            replace: replace.clone(),
            truncate,
        })
    }

    fn dst(&self) -> &str {
        if self.dst.is_empty() {
            &self.src
        } else {
            &self.dst
        }
    }
}

/// `FIELD=VALUE,OTHER=NEXT`; items without `=` are ignored.
pub fn parse_replace(spec: &str) -> BTreeMap<String, String> {
    spec.split(',')
        .filter_map(|item| item.split_once('='))
        .map(|(k, v)| (k.to_uppercase(), v.to_owned()))
        .collect()
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Options {
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    #[builder(default = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
    #[builder(default = DEFAULT_TABLE_TIMEOUT)]
    pub table_timeout: Duration,
    /// Statements run on every new source connection, separated by `;\n`.
    #[builder(default, setter(into))]
    pub src_prep: String,
    #[builder(default, setter(into))]
    pub dst_prep: String,
    /// Source and destination are the same database.
    #[builder(default)]
    pub same_db: bool,
}

fn connect(connector: &dyn Connector, prep: &str) -> Result<Box<dyn Connection>, Error> {
    let mut conn = connector.connect()?;
    for sql in prep.split(";\n").map(str::trim).filter(|s| !s.is_empty()) {
        conn.execute(sql, &[]).context(TableSnafu { table: sql })?;
    }
    Ok(conn)
}

fn columns_of(conn: &mut dyn Connection, table: &str) -> Result<Vec<QueryColumn>, Error> {
    conn.query_columns(&format!("SELECT * FROM {table} WHERE 1=0"))
        .context(TableSnafu { table })
}

/// The source query and the destination insert over the common columns.
fn statements(
    src_cols: &[QueryColumn],
    dst_cols: &[QueryColumn],
    task: &CopyTask,
    dst_dialect: db::Dialect,
) -> Result<(String, String), Error> {
    let dst = task.dst();
    let mut selected = Vec::new();
    let mut replaced = Vec::new();
    for column in src_cols {
        let name = column.name.to_uppercase();
        if !dst_cols.iter().any(|c| c.name.eq_ignore_ascii_case(&name)) {
            continue;
        }
        if task.replace.contains_key(&name) {
            replaced.push(name);
        } else {
            selected.push(name);
        }
    }
    ensure!(!selected.is_empty() || !replaced.is_empty(), NoColumnsSnafu { src: &task.src, dst });

    let mut src_sql = format!("SELECT {} FROM {}", selected.join(","), task.src);
    if !task.where_.is_empty() {
        src_sql.push_str(" WHERE ");
        src_sql.push_str(&task.where_);
    }
    let mut fields = selected.clone();
    let mut values: Vec<String> = (1..=selected.len()).map(|i| dst_dialect.placeholder(i)).collect();
    for name in replaced {
        values.push(format!("'{}'", task.replace[&name].replace('\'', "''")));
        fields.push(name);
    }
    let dst_sql = format!("INSERT INTO {dst} ({}) VALUES ({})", fields.join(","), values.join(","));
    Ok((src_sql, dst_sql))
}

struct BatchInsert<'a> {
    ctx: &'a Context,
    dst: &'a Mutex<Box<dyn Connection>>,
    sql: &'a str,
    batch: Vec<Vec<Value>>,
    batch_size: usize,
    inserted: u64,
}

impl BatchInsert<'_> {
    fn flush(&mut self) -> Result<(), BoxError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut dst = self.dst.lock().map_err(|_| db::Error::Poisoned)?;
        dst.execute_many(self.sql, &self.batch)?;
        self.inserted += self.batch.len() as u64;
        self.batch.clear();
        Ok(())
    }
}

impl RowSink for BatchInsert<'_> {
    fn columns(&mut self, _: &[QueryColumn]) -> Result<(), BoxError> {
        Ok(())
    }

    fn row(&mut self, values: &[Value]) -> Result<(), BoxError> {
        self.ctx.check()?;
        self.batch.push(values.to_vec());
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }
}

/// Copies one table, returning the number of rows inserted.
pub fn copy_one(
    ctx: &Context,
    src: &mut dyn Connection,
    dst: &Mutex<Box<dyn Connection>>,
    task: &CopyTask,
    batch_size: usize,
) -> Result<u64, Error> {
    log::debug!("copy task={task:?}");
    let src_cols = columns_of(src, &task.src)?;
    let (dst_cols, dialect) = {
        let mut conn = dst.lock().map_err(|_| db::Error::Poisoned)?;
        (columns_of(conn.as_mut(), task.dst())?, conn.dialect())
    };
    let (src_sql, dst_sql) = statements(&src_cols, &dst_cols, task, dialect)?;
    log::info!("src={src_sql}");
    log::info!("dst={dst_sql}");

    let mut sink = BatchInsert {
        ctx,
        dst,
        sql: &dst_sql,
        batch: Vec::with_capacity(batch_size),
        batch_size: batch_size.max(1),
        inserted: 0,
    };
    src.query(&src_sql, &[], &mut sink).context(TableSnafu { table: &task.src })?;
    sink.flush()
        .map_err(|source| db::Error::Sink { source })
        .context(TableSnafu { table: task.dst() })?;
    Ok(sink.inserted)
}

/// Creates and truncates destinations that differ from their source.
fn prepare_destinations(conn: &mut dyn Connection, tasks: &[CopyTask], same_db: bool) -> Result<(), Error> {
    for task in tasks {
        let dst = task.dst();
        if dst.eq_ignore_ascii_case(&task.src) && same_db {
            continue;
        }
        let ddl = format!("CREATE TABLE {dst} AS SELECT * FROM {} WHERE 1=0", task.src);
        if let Err(err) = conn.execute(&ddl, &[]) {
            log::debug!("{ddl}: {err}");
        }
        if task.truncate {
            log::info!("TRUNCATE table={dst}");
            provision::truncate(conn, dst).context(TruncateSnafu { table: dst })?;
        }
    }
    Ok(())
}

/// Runs every task on a pool of `opts.concurrency` threads. Returns the
/// rows copied per source table, in completion order.
pub fn copy_tables(
    ctx: &Context,
    src: Arc<dyn Connector>,
    dst: Arc<dyn Connector>,
    tasks: Vec<CopyTask>,
    opts: &Options,
) -> Result<Vec<(String, u64)>, Error> {
    let tasks: Vec<CopyTask> = tasks.into_iter().filter(|t| !t.src.is_empty()).collect();
    let mut dst_conn = connect(dst.as_ref(), &opts.dst_prep)?;
    prepare_destinations(dst_conn.as_mut(), &tasks, opts.same_db)?;
    dst_conn.begin()?;
    let dst_conn = Arc::new(Mutex::new(dst_conn));

    let ctx = ctx.with_cancel();
    let table_timeout = match ctx.deadline() {
        Some(deadline) => opts
            .table_timeout
            .min(deadline.saturating_duration_since(Instant::now())),
        None => opts.table_timeout,
    };
    let pool = ThreadPool::new(opts.concurrency.max(1));
    let (results, done) = unbounded();
    for task in &tasks {
        let (ctx, src, dst_conn, results) = (ctx.clone(), Arc::clone(&src), Arc::clone(&dst_conn), results.clone());
        let (task, batch_size, prep) = (task.clone(), opts.batch_size, opts.src_prep.clone());
        pool.execute(move || {
            let start = Instant::now();
            let one = ctx.with_timeout(table_timeout);
            let res = one.check().map_err(|source| Error::Canceled { source }).and_then(|()| {
                let mut conn = connect(src.as_ref(), &prep)?;
                if let Err(err) = conn.begin_read_only() {
                    log::warn!("read-only transaction: {err}");
                }
                let res = copy_one(&one, conn.as_mut(), &dst_conn, &task, batch_size);
                if let Err(err) = conn.rollback() {
                    log::debug!("source rollback: {err}");
                }
                res
            });
            if let Ok(n) = &res {
                log::info!("{} {n} {:?}", task.src, start.elapsed());
            }
            if let Err(SendError((table, _))) = results.send((task.src, res)) {
                log::warn!("result of {table} dropped");
            }
        });
    }
    drop(results);

    let mut copied = Vec::with_capacity(tasks.len());
    let mut first = None;
    for (table, res) in done.iter() {
        match res {
            Ok(n) => copied.push((table, n)),
            Err(err) => {
                if !err.is_cancellation() {
                    log::error!("copy {table}: {err}");
                }
                if first.as_ref().map_or(true, Cancellation::is_cancellation) {
                    first = Some(err);
                }
                ctx.cancel();
            }
        }
    }
    pool.join();

    let mut dst_conn = dst_conn.lock().map_err(|_| db::Error::Poisoned)?;
    if let Some(err) = first {
        if let Err(undo) = dst_conn.rollback() {
            log::warn!("ROLLBACK: {undo}");
        }
        return Err(err);
    }
    dst_conn.commit()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteConnector;

    fn fixture() -> Arc<dyn Connector> {
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        conn.execute("CREATE TABLE src (id INTEGER, name TEXT, owner TEXT)", &[]).unwrap();
        for i in 0..25 {
            conn.execute(
                "INSERT INTO src VALUES (?1, ?2, 'x')",
                &[Value::Int(i), Value::Text(format!("n{i}"))],
            )
            .unwrap();
        }
        conn.execute("CREATE TABLE other (id INTEGER, extra TEXT)", &[]).unwrap();
        Arc::new(connector)
    }

    #[test]
    fn tasks() {
        let replace = parse_replace("owner=it's,bad,x=1");
        assert_eq!(replace.get("OWNER").map(String::as_str), Some("it's"));
        assert_eq!(replace.len(), 2);

        let task = CopyTask::from_line("a=b id > 3", &replace, true).unwrap();
        assert_eq!((task.src.as_str(), task.dst.as_str(), task.where_.as_str()), ("a", "b", "id > 3"));
        assert_eq!(task.dst(), "b");
        let task = CopyTask::from_line("a", &BTreeMap::new(), false).unwrap();
        assert_eq!(task.dst(), "a");
        assert!(CopyTask::from_line("", &replace, false).is_none());

        let args = vec!["t".to_owned(), "1=1".to_owned(), "u".to_owned()];
        let task = CopyTask::from_args(&args, &BTreeMap::new(), false).unwrap();
        assert_eq!((task.where_.as_str(), task.dst()), ("1=1", "u"));
    }

    #[test]
    fn common_columns() {
        let cols = |names: &[&str]| names.iter().map(|n| QueryColumn::new(n, "TEXT")).collect::<Vec<_>>();
        let task = CopyTask {
            src: "s".into(),
            dst: "d".into(),
            where_: "id < 3".into(),
            replace: parse_replace("OWNER=it's"),
            truncate: false,
        };
        let (src_sql, dst_sql) = statements(
            &cols(&["id", "name", "owner", "gone"]),
            &cols(&["ID", "OWNER", "NAME"]),
            &task,
            db::Dialect::Postgres,
        )
        .unwrap();
        assert_eq!(src_sql, "SELECT ID,NAME FROM s WHERE id < 3");
        assert_eq!(dst_sql, "INSERT INTO d (ID,NAME,OWNER) VALUES ($1,$2,'it''s')");
        assert!(statements(&cols(&["a"]), &cols(&["b"]), &task, db::Dialect::Sqlite).is_err());
    }

    #[test]
    fn copies_with_replacement() {
        let connector = fixture();
        let tasks = vec![
            CopyTask {
                src: "src".into(),
                dst: "dst".into(),
                where_: "id >= 5".into(),
                replace: parse_replace("OWNER=y"),
                truncate: true,
            },
            CopyTask {
                src: "src".into(),
                dst: "other".into(),
                ..Default::default()
            },
        ];
        let opts = Options::builder().batch_size(4).concurrency(2).same_db(true).build();
        let mut copied = copy_tables(
            &Context::background(),
            Arc::clone(&connector),
            Arc::clone(&connector),
            tasks,
            &opts,
        )
        .unwrap();
        copied.sort();
        assert_eq!(copied, vec![("src".to_owned(), 20), ("src".to_owned(), 25)]);

        let mut conn = connector.connect().unwrap();
        let rows = conn
            .query_rows("SELECT COUNT(*), MIN(id), MIN(owner), MAX(owner) FROM dst", &[])
            .unwrap();
        assert_eq!(
            rows.rows,
            vec![vec![Value::Int(20), Value::Int(5), Value::Text("y".into()), Value::Text("y".into())]]
        );
        let rows = conn.query_rows("SELECT COUNT(*), COUNT(extra) FROM other", &[]).unwrap();
        assert_eq!(rows.rows, vec![vec![Value::Int(25), Value::Int(0)]]);
    }

    #[test]
    fn failure_rolls_back_everything() {
        let connector = fixture();
        let mut conn = connector.connect().unwrap();
        conn.execute("CREATE TABLE strict (id INTEGER CHECK (id < 10), name TEXT)", &[]).unwrap();
        let tasks = vec![
            CopyTask::from_line("src=other", &BTreeMap::new(), false).unwrap(),
            CopyTask::from_line("src=strict", &BTreeMap::new(), false).unwrap(),
        ];
        let opts = Options::builder().concurrency(1).same_db(true).build();
        let err = copy_tables(&Context::background(), Arc::clone(&connector), Arc::clone(&connector), tasks, &opts)
            .unwrap_err();
        assert!(!err.is_cancellation(), "{err}");
        let rows = conn.query_rows("SELECT COUNT(*) FROM other", &[]).unwrap();
        assert_eq!(rows.rows, vec![vec![Value::Int(0)]]);
    }
}
