//! Makes sure the destination table of a load exists and reads back its
//! columns from the catalog.

use crate::context::{Cancellation, Context};
use crate::convert::{Column, DEFAULT_DATE_LAYOUT};
use crate::db::{self, parse_declared, split_owner, Connection, Value};
use crate::infer::{Inferencer, Inferred};
use crate::source;
use minijinja::Environment;
use serde_json::json;
use snafu::prelude::*;
use typed_builder::TypedBuilder;

/// Longest identifier Oracle accepts.
const MAX_NAME_LEN: usize = 30;
const HASH_LEN: usize = 7;

const CREATE_TABLE: &str = r#"CREATE TABLE {{ table }} (
{%- for column in columns %}
  {{ column.name }} {{ column.type }}{% if not loop.last %},{% endif %}
{%- endfor %}
){% if tablespace %} TABLESPACE {{ tablespace }}{% endif %}"#;

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Db { source: db::Error },

    #[snafu(display("Error sampling rows for {}: {}", table, source))]
    Sample { table: String, source: source::Error },

    #[snafu(display("No header row to create {} from", table))]
    NoHeader { table: String },

    #[snafu(display("Error rendering CREATE TABLE {}: {}", table, source))]
    Jinja { table: String, source: minijinja::Error },

    #[snafu(display("Table {} has no columns", table))]
    NoColumns { table: String },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        match self {
            Error::Db { source } => source.is_cancellation(),
            Error::Sample { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

impl From<db::Error> for Error {
    fn from(source: db::Error) -> Self {
        Error::Db { source }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Options {
    /// Destination, optionally `owner.table`.
    #[builder(setter(into))]
    pub table: String,
    /// Oracle tablespace of a created table; empty for the default.
    #[builder(default, setter(into))]
    pub tablespace: String,
    /// Table whose structure a missing destination is created from.
    #[builder(default, setter(into))]
    pub copy: String,
    #[builder(default)]
    pub truncate: bool,
    #[builder(default)]
    pub force_string: bool,
    #[builder(default = DEFAULT_DATE_LAYOUT.to_owned(), setter(into))]
    pub date_layout: String,
}

// FNV-1 over 32 bits
fn fnv32(data: &[u8]) -> u32 {
    data.iter()
        .fold(0x811c_9dc5u32, |h, b| h.wrapping_mul(0x0100_0193) ^ u32::from(*b))
}

// RFC 4648 alphabet, no padding
fn base32(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer = 0u32;
    let mut bits = 0;
    for byte in data {
        buffer = (buffer << 8) | u32::from(*byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 31) as usize] as char);
    }
    out
}

/// Turns a header into an identifier: uppercase ASCII letters, digits and
/// `_`, Hungarian accents dropped, at most 30 characters. Longer names keep
/// 23 characters and get a hash of the whole name appended.
pub fn mk_col_name(header: &str) -> String {
    let mut name: String = header
        .chars()
        .flat_map(char::to_uppercase)
        .map(|c| match c {
            'Á' => 'A',
            'É' => 'E',
            'Í' => 'I',
            'Ö' | 'Ő' | 'Ó' => 'O',
            'Ü' | 'Ű' | 'Ú' => 'U',
            c if c.is_ascii_uppercase() || c.is_ascii_digit() => c,
            _ => '_',
        })
        .collect();
    if name.is_empty() {
        return "X".to_owned();
    }
    if name.starts_with('_') {
        name.insert(0, 'X');
    }
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let hash = base32(&fnv32(name.as_bytes()).to_be_bytes());
    name.truncate(MAX_NAME_LEN - HASH_LEN);
    name + &hash
}

/// Keeps the columns named by `fields`, in the order of `fields`. A field
/// matches a column by its uppercase name, by the name without an `F_`
/// prefix, or by its [`mk_col_name`] form.
pub fn filter_cols(columns: Vec<Column>, fields: &[String]) -> Vec<Column> {
    if fields.is_empty() || columns.is_empty() {
        return columns;
    }
    let lookup = |name: &str| -> Option<&Column> {
        columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .or_else(|| {
                columns.iter().find(|c| {
                    c.name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("F_"))
                        && c.name.get(2..).is_some_and(|rest| rest.eq_ignore_ascii_case(name))
                })
            })
    };
    let mut kept = Vec::with_capacity(fields.len());
    for field in fields {
        match lookup(field).or_else(|| lookup(&mk_col_name(field))) {
            Some(column) => kept.push(column.clone()),
            None => log::info!("filter out field={field:?} col={}", mk_col_name(field)),
        }
    }
    kept
}

/// Folds sample rows into named, typed columns one row at a time. The first
/// non-empty row is the header.
pub struct ColumnSampler {
    header: Option<Vec<String>>,
    inferencer: Option<Inferencer>,
    force_string: bool,
    date_layout: String,
}

impl ColumnSampler {
    pub fn new(force_string: bool, date_layout: &str) -> Self {
        ColumnSampler {
            header: None,
            inferencer: None,
            force_string,
            date_layout: date_layout.to_owned(),
        }
    }

    pub fn observe(&mut self, row: &[String]) {
        if let Some(inferencer) = &mut self.inferencer {
            inferencer.observe(row);
            return;
        }
        if row.iter().all(String::is_empty) {
            return;
        }
        self.inferencer = Some(Inferencer::new(row.len(), self.force_string, &self.date_layout));
        self.header = Some(row.to_vec());
    }

    /// `None` when no header was seen.
    pub fn finish(self) -> Option<Vec<(String, Inferred)>> {
        let header = self.header?;
        let inferred = self.inferencer?.finish();
        Some(header.iter().map(|h| mk_col_name(h)).zip(inferred).collect())
    }
}

pub fn infer_columns<I>(rows: I, force_string: bool, date_layout: &str) -> Option<Vec<(String, Inferred)>>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut sampler = ColumnSampler::new(force_string, date_layout);
    for row in rows {
        sampler.observe(&row);
    }
    sampler.finish()
}

/// Renders the CREATE TABLE statement for inferred columns.
pub fn create_table_sql(
    dialect: db::Dialect,
    table: &str,
    tablespace: &str,
    columns: &[(String, Inferred)],
) -> Result<String, Error> {
    let columns: Vec<_> = columns
        .iter()
        .map(|(name, inferred)| json!({"name": name, "type": dialect.column_type(inferred.kind, inferred.width)}))
        .collect();
    let tablespace = if dialect.has_tablespaces() { tablespace } else { "" };
    let mut env = Environment::new();
    env.add_template("create_table", CREATE_TABLE)
        .context(JinjaSnafu { table })?;
    let tmpl = env.get_template("create_table").context(JinjaSnafu { table })?;
    tmpl.render(json!({"table": table, "columns": columns, "tablespace": tablespace}))
        .context(JinjaSnafu { table })
}

pub fn table_exists(conn: &mut dyn Connection, table: &str) -> Result<bool, Error> {
    let (owner, name) = split_owner(table);
    let (sql, params) = conn.dialect().table_exists(owner, name);
    let rows = conn.query_rows(&sql, &params)?;
    let n = rows.rows.first().and_then(|r| r.first()).and_then(Value::as_i64).unwrap_or(0);
    Ok(n > 0)
}

/// Empties `table`, falling back to DELETE when TRUNCATE is refused.
pub fn truncate(conn: &mut dyn Connection, table: &str) -> Result<(), Error> {
    let sql = conn.dialect().truncate(table);
    if let Err(err) = conn.execute(&sql, &[]) {
        log::warn!("{sql}: {err}, deleting instead");
        conn.execute(&format!("DELETE FROM {table}"), &[])
            .map_err(|_| Error::Db { source: err })?;
    }
    Ok(())
}

fn text(value: Option<&Value>) -> String {
    value.and_then(Value::as_text).map(|t| t.into_owned()).unwrap_or_default()
}

fn number(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

/// Catalog columns of `table`, not-null columns first.
pub fn table_columns(conn: &mut dyn Connection, table: &str) -> Result<Vec<Column>, Error> {
    let (owner, name) = split_owner(table);
    let (sql, params) = conn.dialect().table_columns(owner, name);
    let rows = conn.query_rows(&sql, &params)?;
    Ok(rows
        .rows
        .iter()
        .map(|row| {
            let mut native = text(row.get(1));
            let mut length = number(row.get(2));
            let (mut precision, mut scale) = (number(row.get(3)), number(row.get(4)));
            if native.contains('(') {
                let (base, first, second) = parse_declared(&native);
                if matches!(base.as_str(), "NUMBER" | "NUMERIC" | "DECIMAL") {
                    (precision, scale) = (first, second);
                } else {
                    length = first;
                }
                native = base;
            }
            Column::new(
                &text(row.first()),
                &native,
                usize::try_from(length).unwrap_or(0),
                precision,
                scale,
                text(row.get(5)) != "N",
            )
        })
        .collect())
}

/// Creates, copies or truncates the destination as `opts` asks, then returns
/// its catalog columns. A missing table is created from the header and the
/// inferred types of `src`, which is read through once for that.
pub fn provision(
    ctx: &Context,
    conn: &mut dyn Connection,
    opts: &Options,
    src: &source::Config,
) -> Result<Vec<Column>, Error> {
    let table = opts.table.to_uppercase();
    let exists = table_exists(conn, &table)?;
    if exists && opts.truncate {
        truncate(conn, &table)?;
    }
    if !exists {
        let tablespace = if opts.tablespace.is_empty() || !conn.dialect().has_tablespaces() {
            String::new()
        } else {
            format!(" TABLESPACE {}", opts.tablespace)
        };
        let sql = if !opts.copy.is_empty() {
            format!("CREATE TABLE {table}{tablespace} AS SELECT * FROM {} WHERE 1=0", opts.copy)
        } else {
            let mut sampler = ColumnSampler::new(opts.force_string, &opts.date_layout);
            src.read_rows(ctx, |_, row| {
                sampler.observe(&row.values);
                Ok(())
            })
            .context(SampleSnafu { table: &table })?;
            let columns = sampler.finish().context(NoHeaderSnafu { table: &table })?;
            create_table_sql(conn.dialect(), &table, &opts.tablespace, &columns)?
        };
        log::debug!("exec qry={sql}");
        conn.execute(&sql, &[])?;
    }
    let columns = table_columns(conn, &table)?;
    ensure!(!columns.is_empty(), NoColumnsSnafu { table });
    Ok(columns)
}
