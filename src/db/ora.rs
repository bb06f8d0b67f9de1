use super::{Connection, Connector, Dialect, Error, QueryColumn, RowSink, SinkSnafu, Value, BATCH_SAVEPOINT};
use chrono::NaiveDateTime;
use oracle::sql_type::{OracleType, ToSql};
use oracle::Row;
use snafu::prelude::*;

fn ora<T>(sql: &str, res: oracle::Result<T>) -> Result<T, Error> {
    res.map_err(|source| Error::Oracle {
        sql: sql.to_owned(),
        source: Box::new(source),
    })
}

// Empty strings are NULL for Oracle anyway.
fn bind_value(value: &Value) -> Box<dyn ToSql> {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Int(i) => Box::new(*i),
        Value::Float(f) => Box::new(*f),
        Value::Text(s) | Value::Clob(s) => Box::new(s.clone()),
        Value::Bytes(b) | Value::Blob(b) => Box::new(b.clone()),
        Value::Date(dt) => Box::new(*dt),
    }
}

fn with_binds<T>(params: &[Value], f: impl FnOnce(&[&dyn ToSql]) -> T) -> T {
    let owned: Vec<Box<dyn ToSql>> = params.iter().map(bind_value).collect();
    let refs: Vec<&dyn ToSql> = owned.iter().map(|b| b.as_ref()).collect();
    f(&refs)
}

fn describe(name: &str, typ: &OracleType, nullable: bool) -> QueryColumn {
    let mut column = QueryColumn::new(name, &typ.to_string());
    column.nullable = nullable;
    if let OracleType::Number(precision, scale) = typ {
        if *precision > 0 {
            column.precision = (*precision).into();
            column.scale = (*scale).into();
        }
    }
    column
}

fn scan(row: &Row, i: usize, typ: &OracleType) -> oracle::Result<Value> {
    let value = match typ {
        OracleType::Number(p, 0) if (1..=18).contains(p) => row.get::<_, Option<i64>>(i)?.map(Value::Int),
        OracleType::BinaryFloat | OracleType::BinaryDouble | OracleType::Float(_) => {
            row.get::<_, Option<f64>>(i)?.map(Value::Float)
        }
        OracleType::Date
        | OracleType::Timestamp(_)
        | OracleType::TimestampTZ(_)
        | OracleType::TimestampLTZ(_) => row.get::<_, Option<NaiveDateTime>>(i)?.map(Value::Date),
        OracleType::BLOB | OracleType::Raw(_) | OracleType::LongRaw => {
            row.get::<_, Option<Vec<u8>>>(i)?.map(Value::Bytes)
        }
        _ => row.get::<_, Option<String>>(i)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

pub struct OracleConnector {
    user: String,
    password: String,
    connect: String,
}

impl OracleConnector {
    pub fn new(user: String, password: String, connect: String) -> OracleConnector {
        OracleConnector {
            user,
            password,
            connect,
        }
    }
}

impl Connector for OracleConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let conn = ora(
            "connect",
            oracle::Connection::connect(&self.user, &self.password, &self.connect),
        )?;
        log::debug!("connected to {}@{}", self.user, self.connect);
        Ok(Box::new(OracleConnection { conn }))
    }
}

// Statements are cached by the driver's statement cache, keyed by SQL text.
struct OracleConnection {
    conn: oracle::Connection,
}

impl Connection for OracleConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let mut stmt = ora(sql, self.conn.statement(sql).build())?;
        ora(sql, with_binds(params, |binds| stmt.execute(binds)))?;
        ora(sql, stmt.row_count())
    }

    fn query(&mut self, sql: &str, params: &[Value], sink: &mut dyn RowSink) -> Result<(), Error> {
        let mut stmt = ora(sql, self.conn.statement(sql).build())?;
        let rows = ora(sql, with_binds(params, |binds| stmt.query(binds)))?;
        let types: Vec<OracleType> = rows.column_info().iter().map(|c| c.oracle_type().clone()).collect();
        let columns: Vec<QueryColumn> = rows
            .column_info()
            .iter()
            .map(|c| describe(c.name(), c.oracle_type(), c.nullable()))
            .collect();
        sink.columns(&columns).context(SinkSnafu)?;
        let mut values = Vec::with_capacity(types.len());
        for row in rows {
            let row = ora(sql, row)?;
            values.clear();
            for (i, typ) in types.iter().enumerate() {
                values.push(ora(sql, scan(&row, i, typ))?);
            }
            sink.row(&values).context(SinkSnafu)?;
        }
        Ok(())
    }

    fn query_columns(&mut self, sql: &str) -> Result<Vec<QueryColumn>, Error> {
        let probe = format!("SELECT * FROM ({sql}) WHERE 1=0");
        let mut stmt = ora(&probe, self.conn.statement(&probe).build())?;
        let rows = ora(&probe, stmt.query(&[]))?;
        Ok(rows
            .column_info()
            .iter()
            .map(|c| describe(c.name(), c.oracle_type(), c.nullable()))
            .collect())
    }

    // transactions start implicitly
    fn begin(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn begin_read_only(&mut self) -> Result<(), Error> {
        self.execute("SET TRANSACTION READ ONLY", &[]).map(drop)
    }

    fn commit(&mut self) -> Result<(), Error> {
        ora("COMMIT", self.conn.commit())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        ora("ROLLBACK", self.conn.rollback())
    }

    fn release(&mut self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn execute_many(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, Error> {
        self.savepoint(BATCH_SAVEPOINT)?;
        let res = (|| {
            let mut batch = self.conn.batch(sql, rows.len().max(1)).build()?;
            for row in rows {
                with_binds(row, |binds| batch.append_row(binds))?;
            }
            batch.execute()
        })();
        if let Err(source) = res {
            if let Err(err) = self.rollback_to(BATCH_SAVEPOINT) {
                log::warn!("rollback to savepoint: {err}");
            }
            return Err(Error::Oracle {
                sql: sql.to_owned(),
                source: Box::new(source),
            });
        }
        Ok(rows.len() as u64)
    }

    fn call(&mut self, sql: &str, params: &[Value], returns: bool) -> Result<Option<i64>, Error> {
        let mut stmt = ora(sql, self.conn.statement(sql).build())?;
        let offset = usize::from(returns);
        if returns {
            ora(sql, stmt.bind(1, &OracleType::Int64))?;
        }
        for (i, param) in params.iter().enumerate() {
            let value = bind_value(param);
            ora(sql, stmt.bind(i + 1 + offset, value.as_ref()))?;
        }
        ora(sql, stmt.execute(&[]))?;
        if !returns {
            return Ok(None);
        }
        ora(sql, stmt.bind_value::<_, Option<i64>>(1))
    }
}
