use super::{BoxError, Connection, Connector, Dialect, Error, PostgresSnafu, QueryColumn, RowSink, SinkSnafu, Value};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres::fallible_iterator::FallibleIterator;
use postgres::types::{FromSql, IsNull, ToSql, Type};
use postgres::{Client, Config, NoTls, Row, Statement};
use postgres_types::Format;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt::Write;

/// Every bind travels in the text format, so the server parses it into
/// whatever type the placeholder has.
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bytes(b) | Value::Blob(b) => format!("\\x{}", hex::encode(b)).as_str().to_sql(ty, out),
            value => match value.as_text() {
                Some(text) => text.as_ref().to_sql(ty, out),
                None => Ok(IsNull::Yes),
            },
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    fn encode_format(&self, _: &Type) -> Format {
        Format::Text
    }

    postgres_types::to_sql_checked!();
}

/// Fallback text decoding of any type without a native mapping.
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if *ty == Type::NUMERIC {
            return decode_numeric(raw).map(PgText);
        }
        if *ty == Type::JSONB && raw.first() == Some(&1) {
            return Ok(PgText(String::from_utf8_lossy(&raw[1..]).into_owned()));
        }
        if *ty == Type::UUID && raw.len() == 16 {
            let h = hex::encode(raw);
            return Ok(PgText(format!(
                "{}-{}-{}-{}-{}",
                &h[..8],
                &h[8..12],
                &h[12..16],
                &h[16..20],
                &h[20..]
            )));
        }
        Ok(PgText(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let word = |i: usize| -> Result<u16, BoxError> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC".into())
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i64;
    let sign = word(2)?;
    let dscale = word(3)? as usize;
    match sign {
        0xC000 => return Ok("NaN".to_owned()),
        0xD000 => return Ok("Infinity".to_owned()),
        0xF000 => return Ok("-Infinity".to_owned()),
        _ => (),
    }
    let digits = (0..ndigits).map(|i| word(4 + i)).collect::<Result<Vec<_>, _>>()?;
    let digit = |i: i64| usize::try_from(i).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0);

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                write!(out, "{}", digit(i))?;
            } else {
                write!(out, "{:04}", digit(i))?;
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            write!(frac, "{:04}", digit(i))?;
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

fn scan(row: &Row, i: usize, ty: &Type) -> Result<Value, postgres::Error> {
    let value = if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(i)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(i)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(i)?.map(Value::Int)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(i)?.map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(i)?.map(Value::Float)
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(i)?.map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(i)?.map(Value::Date)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(i)?
            .map(|v| Value::Date(v.naive_utc()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(i)?
            .map(|v| Value::Date(v.and_time(chrono::NaiveTime::MIN)))
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(i)?.map(Value::Bytes)
    } else {
        row.try_get::<_, Option<PgText>>(i)?.map(|v| Value::Text(v.0))
    };
    Ok(value.unwrap_or(Value::Null))
}

fn query_column(column: &postgres::Column) -> QueryColumn {
    QueryColumn::new(column.name(), &column.type_().name().to_ascii_uppercase())
}

pub struct PostgresConnector {
    config: Config,
}

impl PostgresConnector {
    pub fn new(dsn: &str) -> Result<PostgresConnector, Error> {
        let config = dsn.parse::<Config>().context(PostgresSnafu { sql: "parse connection string" })?;
        Ok(PostgresConnector { config })
    }
}

impl Connector for PostgresConnector {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let client = self.config.connect(NoTls).context(PostgresSnafu { sql: "connect" })?;
        Ok(Box::new(PostgresConnection {
            client,
            statements: HashMap::new(),
        }))
    }
}

struct PostgresConnection {
    client: Client,
    statements: HashMap<String, Statement>,
}

impl PostgresConnection {
    fn statement(&mut self, sql: &str) -> Result<Statement, Error> {
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(stmt.clone());
        }
        let stmt = self.client.prepare(sql).context(PostgresSnafu { sql })?;
        self.statements.insert(sql.to_owned(), stmt.clone());
        Ok(stmt)
    }

    fn batch(&mut self, sql: &str) -> Result<(), Error> {
        self.client.batch_execute(sql).context(PostgresSnafu { sql })
    }
}

impl Connection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let stmt = self.statement(sql)?;
        let params: Vec<PgParam> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.client.execute(&stmt, &refs).context(PostgresSnafu { sql })
    }

    fn query(&mut self, sql: &str, params: &[Value], sink: &mut dyn RowSink) -> Result<(), Error> {
        let stmt = self.statement(sql)?;
        let columns: Vec<QueryColumn> = stmt.columns().iter().map(query_column).collect();
        let types: Vec<Type> = stmt.columns().iter().map(|c| c.type_().clone()).collect();
        sink.columns(&columns).context(SinkSnafu)?;
        let mut rows = self
            .client
            .query_raw(&stmt, params.iter().map(PgParam))
            .context(PostgresSnafu { sql })?;
        let mut values = Vec::with_capacity(types.len());
        while let Some(row) = rows.next().context(PostgresSnafu { sql })? {
            values.clear();
            for (i, ty) in types.iter().enumerate() {
                values.push(scan(&row, i, ty).context(PostgresSnafu { sql })?);
            }
            sink.row(&values).context(SinkSnafu)?;
        }
        Ok(())
    }

    fn query_columns(&mut self, sql: &str) -> Result<Vec<QueryColumn>, Error> {
        let stmt = self.statement(sql)?;
        Ok(stmt.columns().iter().map(query_column).collect())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.batch("BEGIN")
    }

    fn begin_read_only(&mut self) -> Result<(), Error> {
        self.batch("BEGIN READ ONLY")
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.batch("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.batch("ROLLBACK")
    }
}
