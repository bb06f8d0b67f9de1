//! Conversion between database values and text, in both directions.
//!
//! The value kind of a column is resolved once from its catalog metadata
//! ([`ValueKind::resolve`]); rendering and parsing then only look at that kind.

use crate::db::{QueryColumn, Value};
use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta};
use std::borrow::Cow;
use std::fmt::Write;
use thiserror::Error;

pub const DEFAULT_DATE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Integer,
    Float,
    String,
    Bytes,
    Date,
    /// Arbitrary precision decimal handed over as text.
    OpaqueNumeric,
}

/// `VARCHAR2(10 CHAR)` → `VARCHAR2`.
pub fn base_type(native: &str) -> String {
    native
        .split('(')
        .next()
        .unwrap_or(native)
        .trim()
        .to_ascii_uppercase()
}

pub fn is_lob(native: &str) -> bool {
    matches!(base_type(native).as_str(), "CLOB" | "NCLOB" | "BLOB")
}

impl ValueKind {
    pub fn resolve(native: &str, precision: i64, scale: i64) -> ValueKind {
        let base = base_type(native);
        match base.as_str() {
            "NUMBER" | "NUMERIC" | "DECIMAL" => {
                if precision == 0 && scale == 0 {
                    ValueKind::OpaqueNumeric
                } else if scale == 0 && precision <= 19 {
                    ValueKind::Integer
                } else {
                    ValueKind::Float
                }
            }
            "FLOAT" | "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "BINARY_FLOAT"
            | "BINARY_DOUBLE" => ValueKind::Float,
            "DATE" | "DATETIME" => ValueKind::Date,
            "BLOB" | "RAW" | "LONG RAW" | "BYTEA" => ValueKind::Bytes,
            b if b.starts_with("TIMESTAMP") => ValueKind::Date,
            b if b.contains("INT") && !b.contains("INTERVAL") => ValueKind::Integer,
            _ => ValueKind::String,
        }
    }
}

fn reference_date() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2000, 1, 1)?.and_hms_opt(0, 0, 0)
}

// what an unset date scans as
fn zero_date() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1, 1, 1)?.and_hms_opt(0, 0, 0)
}

fn end_of_time() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(9999, 12, 31)?.and_hms_opt(23, 59, 59)
}

/// Formats without panicking on a bad layout.
pub fn format_date(dt: &NaiveDateTime, layout: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(layout)).ok()?;
    Some(out)
}

pub fn check_layout(layout: &str) -> Result<(), BadLayout> {
    if layout.is_empty() || StrftimeItems::new(layout).any(|item| matches!(item, Item::Error)) {
        return Err(BadLayout {
            layout: layout.to_owned(),
        });
    }
    Ok(())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bad date layout {layout:?}")]
pub struct BadLayout {
    pub layout: String,
}

/// Length of a date rendered with `layout`.
pub fn reference_width(layout: &str) -> Option<usize> {
    format_date(&reference_date()?, layout).map(|s| s.len())
}

/// Parses `s` with `layout` cut to the length of `s`: the missing tail is taken
/// from a midnight reference date, so `2024-03-15` matches `%Y-%m-%d %H:%M:%S`.
pub fn parse_date(s: &str, layout: &str) -> Option<NaiveDateTime> {
    let full = format_date(&reference_date()?, layout)?;
    let s: Cow<str> = if s.len() < full.len() && full.is_char_boundary(s.len()) {
        Cow::Owned(format!("{s}{}", &full[s.len()..]))
    } else {
        Cow::Borrowed(s)
    };
    NaiveDateTime::parse_from_str(&s, layout).ok().or_else(|| {
        NaiveDate::parse_from_str(&s, layout)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

/// Day `days` counted from the spreadsheet epoch, 1899-12-30.
pub fn spreadsheet_day(days: i64) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1899, 12, 30)?
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(TimeDelta::try_days(days)?)
}

/// Quotes `s` iff it contains `sep`, `"` or a newline.
pub fn csv_quote<'a>(s: &'a str, sep: &str) -> Cow<'a, str> {
    if (!sep.is_empty() && s.contains(sep)) || s.contains(['"', '\n']) {
        Cow::Owned(format!("\"{}\"", s.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(s)
    }
}

/// Date layout, end-of-time sentinel and field separator of one dump.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOptions {
    pub date_layout: String,
    /// Rendered for dates with a negative year.
    pub date_end: String,
    pub sep: String,
}

impl FormatOptions {
    pub fn new(date_layout: &str, sep: &str) -> Result<FormatOptions, BadLayout> {
        check_layout(date_layout)?;
        let end = end_of_time()
            .and_then(|end| format_date(&end, date_layout))
            .ok_or_else(|| BadLayout {
                layout: date_layout.to_owned(),
            })?;
        Ok(FormatOptions {
            date_layout: date_layout.to_owned(),
            date_end: csv_quote(&end, sep).into_owned(),
            sep: sep.to_owned(),
        })
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            date_layout: DEFAULT_DATE_LAYOUT.to_owned(),
            date_end: "9999-12-31 23:59:59".to_owned(),
            sep: ",".to_owned(),
        }
    }
}

/// Turns the scanned values of one result column into text.
#[derive(Debug, Clone, PartialEq)]
pub struct Renderer {
    pub name: String,
    pub kind: ValueKind,
}

impl Renderer {
    pub fn for_column(column: &QueryColumn) -> Renderer {
        Renderer {
            name: column.name.clone(),
            kind: ValueKind::resolve(&column.native, column.precision, column.scale),
        }
    }

    fn date(&self, dt: &NaiveDateTime, opts: &FormatOptions, quoted: bool) -> String {
        if dt.year() < 0 {
            return if quoted {
                opts.date_end.clone()
            } else {
                opts.date_end.trim_matches('"').to_owned()
            };
        }
        if Some(*dt) == zero_date() {
            return String::new();
        }
        format_date(dt, &opts.date_layout).unwrap_or_default()
    }

    fn text(&self, value: &Value, opts: &FormatOptions, quoted: bool) -> String {
        match value {
            Value::Null => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => match self.kind {
                ValueKind::Integer if f.fract() == 0.0 && f.abs() < 1e18 => (*f as i64).to_string(),
                _ => f.to_string(),
            },
            Value::Text(s) | Value::Clob(s) => s.clone(),
            Value::Bytes(b) | Value::Blob(b) => hex::encode(b),
            Value::Date(dt) => self.date(dt, opts, quoted),
        }
    }

    /// CSV field text: quoted when it holds the separator, a quote or a newline.
    pub fn render(&self, value: &Value, opts: &FormatOptions) -> String {
        let text = self.text(value, opts, true);
        if matches!(value, Value::Date(dt) if dt.year() < 0) {
            return text;
        }
        csv_quote(&text, &opts.sep).into_owned()
    }

    /// The same text without any quoting.
    pub fn render_raw(&self, value: &Value, opts: &FormatOptions) -> String {
        self.text(value, opts, false)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    #[error("does not match date layout {layout:?}")]
    Date { layout: String },
    #[error("is longer ({len}) than allowed ({max})")]
    TooLong { len: usize, max: usize },
    #[error("is not an integer ({bad:?})")]
    NotInteger { bad: String },
    #[error("is not a number ({bad:?})")]
    NotNumber { bad: String },
}

/// A cell that cannot be bound to its destination column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {row}, column {column}: {value:?} {problem}")]
pub struct ConvertError {
    pub row: usize,
    pub column: String,
    pub value: String,
    pub problem: Problem,
}

/// A destination column of a load, as read from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// Native type name, like `VARCHAR2`, `NUMBER` or `DATE`.
    pub native: String,
    /// Maximal length in bytes for character columns, 0 when unbounded.
    pub length: usize,
    pub precision: i64,
    pub scale: i64,
    pub nullable: bool,
    pub kind: ValueKind,
}

impl Column {
    pub fn new(name: &str, native: &str, length: usize, precision: i64, scale: i64, nullable: bool) -> Column {
        Column {
            name: name.to_owned(),
            native: native.to_owned(),
            length,
            precision,
            scale,
            nullable,
            kind: ValueKind::resolve(native, precision, scale),
        }
    }

    pub fn is_lob(&self) -> bool {
        is_lob(&self.native)
    }

    fn err(&self, row: usize, value: &str, problem: Problem) -> ConvertError {
        ConvertError {
            row,
            column: self.name.clone(),
            value: value.to_owned(),
            problem,
        }
    }

    fn parse_one(&self, s: &str, row: usize, date_layout: &str) -> Result<Value, ConvertError> {
        if s.is_empty() {
            return Ok(Value::Null);
        }
        let base = base_type(&self.native);
        match base.as_str() {
            "CLOB" | "NCLOB" => return Ok(Value::Clob(s.to_owned())),
            "BLOB" => {
                return Ok(Value::Blob(
                    hex::decode(s).unwrap_or_else(|_| s.as_bytes().to_vec()),
                ))
            }
            _ => (),
        }
        match self.kind {
            ValueKind::Date => {
                if s.len() < 8 {
                    if let Some(day) = s.parse::<i64>().ok().and_then(spreadsheet_day) {
                        return Ok(Value::Date(day));
                    }
                }
                parse_date(s, date_layout).map(Value::Date).ok_or_else(|| {
                    self.err(
                        row,
                        s,
                        Problem::Date {
                            layout: date_layout.to_owned(),
                        },
                    )
                })
            }
            ValueKind::Integer => {
                let bad: String = s.chars().filter(|c| !(c.is_ascii_digit() || *c == '-')).collect();
                if !bad.is_empty() {
                    return Err(self.err(row, s, Problem::NotInteger { bad }));
                }
                Ok(s.parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::Text(s.to_owned())))
            }
            ValueKind::Float | ValueKind::OpaqueNumeric => {
                let bad: String = s
                    .chars()
                    .filter(|c| !(c.is_ascii_digit() || *c == '-' || *c == '.'))
                    .collect();
                if !bad.is_empty() {
                    return Err(self.err(row, s, Problem::NotNumber { bad }));
                }
                Ok(Value::Text(s.to_owned()))
            }
            ValueKind::Bytes => Ok(Value::Bytes(
                hex::decode(s).unwrap_or_else(|_| s.as_bytes().to_vec()),
            )),
            ValueKind::String => {
                // room for multi-byte expansion of a character-length limit
                if self.length > 0 && s.len() > self.length * 4 {
                    let mut end = self.length;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    return Err(self.err(
                        row,
                        &s[..end],
                        Problem::TooLong {
                            len: s.len(),
                            max: self.length,
                        },
                    ));
                }
                Ok(Value::Text(s.to_owned()))
            }
        }
    }

    /// Converts the values of this column in a batch whose first row is `first_row`.
    pub fn from_strings<'a, I>(&self, values: I, first_row: usize, date_layout: &str) -> Result<Vec<Value>, ConvertError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        values
            .into_iter()
            .enumerate()
            .map(|(i, s)| self.parse_one(s, first_row + i, date_layout))
            .collect()
    }
}
