//! Query results to CSV, or to the sheets of an XLSX/ODS workbook.

use crate::charset::{self, EncodeWriter, UnknownCharset};
use crate::context::{Cancellation, Context};
use crate::convert::{csv_quote, BadLayout, FormatOptions, Renderer};
use crate::db::{self, BoxError, Connection, QueryColumn, RowSink, Value};
use flate2::write::GzEncoder;
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use snafu::prelude::*;
use spreadsheet_ods::OdsError;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use typed_builder::TypedBuilder;

pub const DEFAULT_DATE_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const MAX_SHEET_ROWS: u32 = 1_048_575;
const MAX_SHEET_NAME: usize = 31;

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Db { source: db::Error },

    #[snafu(display("Error writing {}: {}", filename, source))]
    Io { filename: String, source: io::Error },

    #[snafu(display("{}", source))]
    Xlsx { source: XlsxError },

    #[snafu(display("{}", source))]
    Ods { source: OdsError },

    #[snafu(display("{}", source))]
    Layout { source: BadLayout },

    #[snafu(display("{}", source))]
    Charset { source: UnknownCharset },

    #[snafu(display("Unknown compression {:?} (gz/gzip or zst/zstd/zstandard)", name))]
    Compression { name: String },

    #[snafu(display("Number of rows is too large for sheet {}", sheet))]
    TooManyRows { sheet: String },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        matches!(self, Error::Db { source } if source.is_cancellation())
    }
}

impl From<db::Error> for Error {
    fn from(source: db::Error) -> Self {
        Error::Db { source }
    }
}

/// `SELECT …` verbatim, else `SELECT <columns> FROM <table> [WHERE <where>]`.
/// `None` when nothing is given and the query has to come from elsewhere.
pub fn build_query(table: &str, where_: &str, columns: &[String]) -> Option<String> {
    let table = table.trim();
    if table.is_empty() && where_.is_empty() && columns.is_empty() {
        return None;
    }
    if table.len() > 6 && table[..7].eq_ignore_ascii_case("SELECT ") {
        return Some(table.to_owned());
    }
    let cols = if columns.is_empty() {
        "*".to_owned()
    } else {
        columns.join(", ")
    };
    if where_.is_empty() {
        return Some(format!("SELECT {cols} FROM {table}"));
    }
    Some(format!("SELECT {cols} FROM {table} WHERE {where_}"))
}

/// Appends `ORDER BY` over every non-LOB column of a `SELECT * FROM` query.
pub fn sorted_query(conn: &mut dyn Connection, sql: &str) -> Result<String, Error> {
    if !sql.starts_with("SELECT * FROM") {
        return Ok(sql.to_owned());
    }
    let columns = conn.query_columns(sql)?;
    let order: Vec<String> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.native.to_ascii_uppercase().ends_with("LOB"))
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    if order.is_empty() {
        return Ok(sql.to_owned());
    }
    Ok(format!("{sql} ORDER BY {}", order.join(",")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn parse(name: &str) -> Result<Compression, Error> {
        let lower = name.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return Ok(Compression::None);
        }
        match lower.get(..2) {
            Some("gz") => Ok(Compression::Gzip),
            Some("zs") => Ok(Compression::Zstd),
            _ => CompressionSnafu { name }.fail(),
        }
    }
}

enum Compressed {
    Plain(BufWriter<Box<dyn Write + Send>>),
    Gzip(GzEncoder<BufWriter<Box<dyn Write + Send>>>),
    Zstd(zstd::Encoder<'static, BufWriter<Box<dyn Write + Send>>>),
}

impl Write for Compressed {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressed::Plain(w) => w.write(buf),
            Compressed::Gzip(w) => w.write(buf),
            Compressed::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressed::Plain(w) => w.flush(),
            Compressed::Gzip(w) => w.flush(),
            Compressed::Zstd(w) => w.flush(),
        }
    }
}

/// Charset-encoding, optionally compressing writer over a file or stdout.
pub struct Output {
    name: String,
    inner: EncodeWriter<Compressed>,
}

impl Output {
    /// `path` empty or `-` is standard output; parent directories are created.
    pub fn create(path: &str, compression: Compression, charset: &str) -> Result<Output, Error> {
        let encoding = charset::lookup(charset).context(CharsetSnafu)?;
        let (name, sink): (String, Box<dyn Write + Send>) = if path.is_empty() || path == "-" {
            ("stdout".to_owned(), Box::new(io::stdout()))
        } else {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).context(IoSnafu { filename: path })?;
            }
            let file = File::create(path).context(IoSnafu { filename: path })?;
            (path.to_owned(), Box::new(file))
        };
        let buffered = BufWriter::with_capacity(65536, sink);
        let compressed = match compression {
            Compression::None => Compressed::Plain(buffered),
            Compression::Gzip => Compressed::Gzip(GzEncoder::new(buffered, flate2::Compression::default())),
            Compression::Zstd => {
                Compressed::Zstd(zstd::Encoder::new(buffered, 0).context(IoSnafu { filename: &name })?)
            }
        };
        log::debug!("writing file={name} encoding={}", encoding.name());
        Ok(Output {
            inner: EncodeWriter::new(compressed, encoding),
            name,
        })
    }

    pub fn finish(self) -> Result<(), Error> {
        let name = self.name;
        let compressed = self.inner.finish().context(IoSnafu { filename: &name })?;
        let mut plain = match compressed {
            Compressed::Plain(w) => w,
            Compressed::Gzip(w) => w.finish().context(IoSnafu { filename: &name })?,
            Compressed::Zstd(w) => w.finish().context(IoSnafu { filename: &name })?,
        };
        plain.flush().context(IoSnafu { filename: name })
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct CsvOptions {
    #[builder(default = true)]
    pub header: bool,
    #[builder(default = ",".to_owned(), setter(into))]
    pub sep: String,
    /// Values concatenated without separators or quoting.
    #[builder(default)]
    pub raw: bool,
    #[builder(default = DEFAULT_DATE_LAYOUT.to_owned(), setter(into))]
    pub date_layout: String,
}

struct CsvSink<'a> {
    ctx: &'a Context,
    w: &'a mut dyn Write,
    opts: &'a CsvOptions,
    format: FormatOptions,
    renderers: Vec<Renderer>,
    rows: u64,
}

impl RowSink for CsvSink<'_> {
    fn columns(&mut self, columns: &[QueryColumn]) -> Result<(), BoxError> {
        self.renderers = columns.iter().map(Renderer::for_column).collect();
        if self.opts.header && !self.opts.raw {
            let names: Vec<_> = columns.iter().map(|c| csv_quote(&c.name, &self.opts.sep)).collect();
            writeln!(self.w, "{}", names.join(&self.opts.sep))?;
        }
        Ok(())
    }

    fn row(&mut self, values: &[Value]) -> Result<(), BoxError> {
        self.ctx.check()?;
        let mut line = String::new();
        for (i, (renderer, value)) in self.renderers.iter().zip(values).enumerate() {
            if self.opts.raw {
                line.push_str(&renderer.render_raw(value, &self.format));
                continue;
            }
            if i > 0 {
                line.push_str(&self.opts.sep);
            }
            line.push_str(&renderer.render(value, &self.format));
        }
        line.push('\n');
        self.w.write_all(line.as_bytes())?;
        self.rows += 1;
        Ok(())
    }
}

/// Writes the result of `sql` as CSV, returning the number of rows.
pub fn dump_csv(
    ctx: &Context,
    conn: &mut dyn Connection,
    sql: &str,
    params: &[Value],
    opts: &CsvOptions,
    w: &mut dyn Write,
) -> Result<u64, Error> {
    let sep = if opts.raw { "" } else { opts.sep.as_str() };
    let format = FormatOptions::new(&opts.date_layout, sep).context(LayoutSnafu)?;
    let start = Instant::now();
    let mut sink = CsvSink {
        ctx,
        w,
        opts,
        format,
        renderers: Vec::new(),
        rows: 0,
    };
    let res = conn.query(sql, params, &mut sink);
    let rows = sink.rows;
    let dur = start.elapsed();
    log::info!(
        "dump finished rows={rows} dur={dur:?} speed={:.3}/s",
        rows as f64 / dur.as_secs_f64().max(1e-9)
    );
    res?;
    Ok(rows)
}

/// Opens a read-only transaction, or a plain one where that is refused.
pub fn begin_read(conn: &mut dyn Connection) -> Result<(), db::Error> {
    if let Err(err) = conn.begin_read_only() {
        log::warn!("read-only transaction: {err}");
        conn.begin()?;
    }
    Ok(())
}

/// `name:SELECT …`; unnamed sheets are numbered from 1.
pub fn parse_sheet(index: usize, arg: &str) -> (String, String) {
    match arg.split_once(':') {
        Some((name, sql)) if !name.trim().is_empty() && !name.contains(char::is_whitespace) => {
            (name.to_owned(), sql.to_owned())
        }
        Some((name, sql)) if name.trim().is_empty() => ((index + 1).to_string(), sql.to_owned()),
        _ => ((index + 1).to_string(), arg.to_owned()),
    }
}

fn sheet_name(name: &str) -> String {
    name.chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .take(MAX_SHEET_NAME)
        .collect()
}

// Spreadsheet cells are doubles: wider integers are written as text.
const MAX_EXACT_INT: i64 = 1 << 53;

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) if i.unsigned_abs() <= MAX_EXACT_INT as u64 => Some(*i as f64),
        Value::Float(f) if f.is_finite() => Some(*f),
        _ => None,
    }
}

struct XlsxSink<'a> {
    ctx: &'a Context,
    sheet: &'a mut Worksheet,
    bold: Format,
    header: bool,
    format: FormatOptions,
    renderers: Vec<Renderer>,
    row: u32,
}

impl RowSink for XlsxSink<'_> {
    fn columns(&mut self, columns: &[QueryColumn]) -> Result<(), BoxError> {
        self.renderers = columns.iter().map(Renderer::for_column).collect();
        if self.header {
            for (col, column) in columns.iter().enumerate() {
                self.sheet
                    .write_string_with_format(0, u16::try_from(col)?, &column.name, &self.bold)?;
            }
            self.row = 1;
        }
        Ok(())
    }

    fn row(&mut self, values: &[Value]) -> Result<(), BoxError> {
        self.ctx.check()?;
        if self.row >= MAX_SHEET_ROWS {
            return Err("Number of rows is too large for XLSX file".into());
        }
        for (col, (renderer, value)) in self.renderers.iter().zip(values).enumerate() {
            let col = u16::try_from(col)?;
            if value.is_null() {
                continue;
            }
            match number(value) {
                Some(n) => self.sheet.write_number(self.row, col, n)?,
                None => self.sheet.write_string(self.row, col, renderer.render_raw(value, &self.format))?,
            };
        }
        self.row += 1;
        Ok(())
    }
}

struct OdsSink<'a> {
    ctx: &'a Context,
    sheet: spreadsheet_ods::Sheet,
    bold: spreadsheet_ods::CellStyleRef,
    header: bool,
    format: FormatOptions,
    renderers: Vec<Renderer>,
    row: u32,
}

impl RowSink for OdsSink<'_> {
    fn columns(&mut self, columns: &[QueryColumn]) -> Result<(), BoxError> {
        self.renderers = columns.iter().map(Renderer::for_column).collect();
        if self.header {
            for (col, column) in columns.iter().enumerate() {
                self.sheet
                    .set_styled_value(0, u32::try_from(col)?, column.name.as_str(), &self.bold);
            }
            self.row = 1;
        }
        Ok(())
    }

    fn row(&mut self, values: &[Value]) -> Result<(), BoxError> {
        self.ctx.check()?;
        if self.row >= MAX_SHEET_ROWS {
            return Err("Number of rows is too large for ods file".into());
        }
        for (col, (renderer, value)) in self.renderers.iter().zip(values).enumerate() {
            let col = u32::try_from(col)?;
            if value.is_null() {
                continue;
            }
            match number(value) {
                Some(n) => self.sheet.set_value(self.row, col, n),
                None => self.sheet.set_value(self.row, col, renderer.render_raw(value, &self.format)),
            }
        }
        self.row += 1;
        Ok(())
    }
}

/// Writes one sheet per `(name, query)` into `path`: ODS unless it ends in `.xlsx`.
pub fn dump_sheets(
    ctx: &Context,
    conn: &mut dyn Connection,
    sheets: &[(String, String)],
    header: bool,
    date_layout: &str,
    path: &str,
) -> Result<(), Error> {
    let format = FormatOptions::new(date_layout, "").context(LayoutSnafu)?;
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).context(IoSnafu { filename: path })?;
    }
    if path.to_ascii_lowercase().ends_with(".xlsx") {
        let mut workbook = Workbook::new();
        for (name, sql) in sheets {
            log::info!("sheet={name} qry={sql}");
            let sheet = workbook.add_worksheet_with_low_memory();
            sheet.set_name(sheet_name(name)).context(XlsxSnafu)?;
            let mut sink = XlsxSink {
                ctx,
                sheet,
                bold: Format::new().set_bold(),
                header,
                format: format.clone(),
                renderers: Vec::new(),
                row: 0,
            };
            conn.query(sql, &[], &mut sink)?;
        }
        workbook.save(path).context(XlsxSnafu)?;
        return Ok(());
    }

    let mut workbook = spreadsheet_ods::WorkBook::new_empty();
    let mut bold = spreadsheet_ods::CellStyle::new_empty();
    bold.set_font_bold();
    let bold = workbook.add_cellstyle(bold);
    for (name, sql) in sheets {
        log::info!("sheet={name} qry={sql}");
        let mut sink = OdsSink {
            ctx,
            sheet: spreadsheet_ods::Sheet::new(sheet_name(name)),
            bold: bold.clone(),
            header,
            format: format.clone(),
            renderers: Vec::new(),
            row: 0,
        };
        conn.query(sql, &[], &mut sink)?;
        workbook.push_sheet(sink.sheet);
    }
    spreadsheet_ods::write_ods(&mut workbook, path).context(OdsSnafu)?;
    Ok(())
}
