//! Runs named queries in parallel and dumps their rows as one JSON array.

use crate::context::{Canceled, Cancellation, Context};
use crate::db::{self, rewrite_placeholders, BoxError, Connector, QueryColumn, RowSink, Value};
use crate::dump::{begin_read, DEFAULT_DATE_LAYOUT};
use crossbeam_channel::unbounded;
use serde_json::{json, Map};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;
use std::thread;

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{:?} is not in name:SELECT form", arg))]
    BadQuery { arg: String },

    #[snafu(display("{:?} does not contain a separator", arg))]
    BadValue { arg: String },

    #[snafu(display("no value given for :{}", name))]
    MissingValue { name: String },

    #[snafu(display("{}", source))]
    Db { source: db::Error },

    #[snafu(display("write JSON: {}", source))]
    Write { source: io::Error },

    #[snafu(display("queries failed: {}", names.join(", ")))]
    Failed { names: Vec<String> },

    #[snafu(display("{}", source))]
    Canceled { source: Canceled },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        match self {
            Error::Db { source } => source.is_cancellation(),
            Error::Canceled { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub sql: String,
}

impl Query {
    pub fn parse(arg: &str) -> Result<Query, Error> {
        match arg.split_once(':') {
            Some((name, sql)) if !name.is_empty() && !sql.trim().is_empty() => Ok(Query {
                name: name.to_owned(),
                sql: sql.to_owned(),
            }),
            _ => BadQuerySnafu { arg }.fail(),
        }
    }
}

/// `name=value` (or `name:value`, `name-value`, whitespace separated); the
/// name is matched case-insensitively.
pub fn parse_value(arg: &str) -> Result<(String, String), Error> {
    let i = arg
        .find(|c| matches!(c, '-' | ':' | '=' | ' ' | '\t'))
        .context(BadValueSnafu { arg })?;
    Ok((arg[..i].to_lowercase(), arg[i + 1..].to_owned()))
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Text(s) | Value::Clob(s) => json!(s),
        Value::Bytes(b) | Value::Blob(b) => json!(b),
        Value::Date(d) => json!(d.format(DEFAULT_DATE_LAYOUT).to_string()),
    }
}

struct JsonRows<'a> {
    ctx: &'a Context,
    columns: Vec<String>,
    rows: Vec<serde_json::Value>,
}

impl RowSink for JsonRows<'_> {
    fn columns(&mut self, columns: &[QueryColumn]) -> Result<(), BoxError> {
        self.columns = columns.iter().map(|c| c.name.clone()).collect();
        Ok(())
    }

    fn row(&mut self, values: &[Value]) -> Result<(), BoxError> {
        self.ctx.check()?;
        let row: Map<String, serde_json::Value> = self
            .columns
            .iter()
            .cloned()
            .zip(values.iter().map(json_value))
            .collect();
        self.rows.push(serde_json::Value::Object(row));
        Ok(())
    }
}

fn run_query(
    ctx: &Context,
    connector: &dyn Connector,
    query: &Query,
    values: &BTreeMap<String, String>,
) -> Result<Vec<serde_json::Value>, Error> {
    let (sql, names) = rewrite_placeholders(&query.sql, connector.dialect());
    let params = names
        .iter()
        .map(|name| {
            values
                .get(&name.to_lowercase())
                .map(|v| Value::Text(v.clone()))
                .context(MissingValueSnafu { name })
        })
        .collect::<Result<Vec<_>, _>>()?;
    log::debug!("name={} qry={sql:?} params={params:?}", query.name);

    let mut conn = connector.connect().context(DbSnafu)?;
    begin_read(conn.as_mut()).context(DbSnafu)?;
    let mut sink = JsonRows {
        ctx,
        columns: Vec::new(),
        rows: Vec::new(),
    };
    let res = conn.query(&sql, &params, &mut sink).context(DbSnafu);
    if let Err(err) = conn.rollback() {
        log::debug!("rollback: {err}");
    }
    res.map(|()| sink.rows)
}

struct Output<W> {
    out: W,
    written: usize,
}

impl<W: Write> Output<W> {
    fn table(&mut self, name: &str, res: &Result<Vec<serde_json::Value>, Error>) -> io::Result<()> {
        let table = match res {
            Ok(rows) => json!({"Name": name, "Error": null, "Rows": rows}),
            Err(err) => json!({"Name": name, "Error": err.to_string(), "Rows": []}),
        };
        if self.written > 0 {
            self.out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.out, &table)?;
        self.written += 1;
        Ok(())
    }
}

/// Runs `queries` on `concurrency` connections and writes each result as
/// soon as it is complete. Failed queries are written with their error and
/// reported together once the array is closed.
pub fn export<W: Write + Send>(
    ctx: &Context,
    connector: &dyn Connector,
    queries: &[Query],
    values: &BTreeMap<String, String>,
    concurrency: usize,
    out: W,
) -> Result<W, Error> {
    let ctx = &ctx.with_cancel();
    let (tx, rx) = unbounded::<&Query>();
    for query in queries {
        let _ = tx.send(query);
    }
    drop(tx);

    let mut out = out;
    out.write_all(b"[\n").context(WriteSnafu)?;
    let output = Mutex::new(Output { out, written: 0 });
    let failed = Mutex::new(Vec::new());
    let write_err: Mutex<Option<io::Error>> = Mutex::new(None);

    thread::scope(|s| {
        for _ in 0..concurrency.max(1).min(queries.len().max(1)) {
            let (rx, output, failed, write_err) = (rx.clone(), &output, &failed, &write_err);
            s.spawn(move || {
                while let Ok(Some(query)) = ctx.recv(&rx) {
                    let res = run_query(ctx, connector, query, values);
                    if let Err(err) = &res {
                        log::error!("{}: {err}", query.name);
                        if let Ok(mut failed) = failed.lock() {
                            failed.push(query.name.clone());
                        }
                    }
                    let written = match output.lock() {
                        Ok(mut output) => output.table(&query.name, &res),
                        Err(_) => Err(io::Error::other("output lock poisoned")),
                    };
                    if let Err(err) = written {
                        if let Ok(mut slot) = write_err.lock() {
                            slot.get_or_insert(err);
                        }
                        ctx.cancel();
                        return;
                    }
                }
            });
        }
    });

    if let Some(err) = write_err.into_inner().ok().flatten() {
        return Err(Error::Write { source: err });
    }
    let mut out = output
        .into_inner()
        .map_err(|_| Error::Write {
            source: io::Error::other("output lock poisoned"),
        })?
        .out;
    out.write_all(b"\n]\n").context(WriteSnafu)?;
    out.flush().context(WriteSnafu)?;
    if let Some(source) = ctx.err() {
        return Err(Error::Canceled { source });
    }
    let names = failed.into_inner().unwrap_or_default();
    ensure!(names.is_empty(), FailedSnafu { names });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteConnector;
    use assert_json_diff::assert_json_eq;
    use chrono::NaiveDate;

    fn connector() -> SqliteConnector {
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER, name TEXT, day DATE)", &[]).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap().and_hms_opt(10, 0, 0).unwrap();
        conn.execute(
            "INSERT INTO t VALUES (1, 'one', ?1), (2, 'two', NULL)",
            &[Value::Date(day)],
        )
        .unwrap();
        connector
    }

    #[test]
    fn arguments() {
        assert_eq!(
            Query::parse("a:SELECT 1 FROM DUAL").unwrap(),
            Query {
                name: "a".into(),
                sql: "SELECT 1 FROM DUAL".into()
            }
        );
        assert!(Query::parse("SELECT 1").is_err());
        assert!(Query::parse(":SELECT 1").is_err());
        assert_eq!(parse_value("V_Id=3.14").unwrap(), ("v_id".to_owned(), "3.14".to_owned()));
        assert_eq!(parse_value("x:a=b").unwrap(), ("x".to_owned(), "a=b".to_owned()));
        assert!(parse_value("novalue").is_err());
    }

    #[test]
    fn exports_json() {
        let connector = connector();
        let queries = vec![
            Query::parse("first:SELECT id, name, day FROM t WHERE id = :v_id").unwrap(),
            Query::parse("all:SELECT id FROM t ORDER BY id").unwrap(),
        ];
        let values = BTreeMap::from([("v_id".to_owned(), "1".to_owned())]);
        let out = export(&Context::background(), &connector, &queries, &values, 1, Vec::new()).unwrap();
        let got: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_json_eq!(
            got,
            json!([
                {"Name": "first", "Error": null, "Rows": [
                    {"id": 1, "name": "one", "day": "2024-03-15T10:00:00"}
                ]},
                {"Name": "all", "Error": null, "Rows": [{"id": 1}, {"id": 2}]}
            ])
        );
    }

    #[test]
    fn failures_are_written() {
        let connector = connector();
        let queries = vec![
            Query::parse("bad:SELECT nope FROM t").unwrap(),
            Query::parse("unbound:SELECT id FROM t WHERE id = :other").unwrap(),
            Query::parse("ok:SELECT COUNT(*) AS n FROM t").unwrap(),
        ];
        let mut out = Vec::new();
        let err = export(&Context::background(), &connector, &queries, &BTreeMap::new(), 2, &mut out).unwrap_err();
        assert!(matches!(&err, Error::Failed { names } if names.len() == 2), "{err}");

        let got: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let tables = got.as_array().unwrap();
        assert_eq!(tables.len(), 3);
        let ok = tables.iter().find(|t| t["Name"] == "ok").unwrap();
        assert_json_eq!(ok, json!({"Name": "ok", "Error": null, "Rows": [{"n": 2}]}));
        let unbound = tables.iter().find(|t| t["Name"] == "unbound").unwrap();
        assert_eq!(unbound["Error"], "no value given for :other");
    }
}
