//! Row source: turns a CSV, XLS, XLSX or ODS file (possibly compressed, possibly
//! standard input) into a stream of [`Row`]s.

use crate::charset::{self, DecodeReader, UnknownCharset};
use crate::context::{Canceled, Cancellation, Context};
use crate::detect::{self, Compression, Container, FileType};
use crate::xlsx::{self, XlsxBook, XlsxError};
use calamine::{open_workbook, Data, Ods, Reader, Sheets, Xls};
use csv::{ByteRecord, ReaderBuilder};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use typed_builder::TypedBuilder;

const SNIFF_LEN: usize = 1024;
const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b' '];
const ODS_MIME: &str = "application/vnd.oasis.opendocument.spreadsheet";

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("open {}: {}", path.display(), source))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("copy {} into a temporary file: {}", name, source))]
    Spool { name: String, source: io::Error },

    #[snafu(display("detect type of {}: {}", name, source))]
    Detect { name: String, source: io::Error },

    #[snafu(display("no file has been opened"))]
    NotOpened,

    #[snafu(display("{} has an unsupported format", name))]
    Unsupported { name: String },

    #[snafu(display("{}", source))]
    Charset { source: UnknownCharset },

    #[snafu(display("bad column number {:?} in {:?}", item, columns))]
    ColumnNumber { item: String, columns: String },

    #[snafu(display("delimiter {:?} is not a single byte", delim))]
    Delimiter { delim: String },

    #[snafu(display("read CSV record {}: {}", line, source))]
    Csv { line: usize, source: csv::Error },

    #[snafu(display("read CSV sample: {}", source))]
    Sample { source: io::Error },

    #[snafu(display("read {}: {}", name, source))]
    Xlsx { name: String, source: XlsxError },

    #[snafu(display("read {}: {}", name, source))]
    Spreadsheet { name: String, source: calamine::Error },

    #[snafu(display("unknown sheet {} (have {:?})", sheet, available))]
    UnknownSheet { sheet: usize, available: Vec<String> },

    #[snafu(display("{}", source))]
    Canceled { source: Canceled },

    #[snafu(display("{}", source))]
    Callback {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        match self {
            Error::Canceled { .. } => true,
            Error::Callback { source } => source.downcast_ref::<Canceled>().is_some(),
            _ => false,
        }
    }
}

impl From<Canceled> for Error {
    fn from(source: Canceled) -> Self {
        Error::Canceled { source }
    }
}

/// One record of the source. `columns` is shared by every row of a sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub line: usize,
    pub columns: Arc<[String]>,
    pub values: Vec<String>,
}

impl Row {
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| v.is_empty())
    }
}

#[derive(Debug)]
struct Opened {
    name: String,
    path: PathBuf,
    typ: FileType,
    _spool: Option<NamedTempFile>,
}

#[derive(Debug, Default, TypedBuilder)]
pub struct Config {
    /// Zero-based sheet index for spreadsheets.
    #[builder(default)]
    pub sheet: usize,
    /// Records skipped before the first surfaced one.
    #[builder(default)]
    pub skip: usize,
    /// Empty means auto-detect; `\t` may be written as the two characters `\t`.
    #[builder(default, setter(into))]
    pub delim: String,
    /// Empty means the locale default.
    #[builder(default, setter(into))]
    pub charset: String,
    /// 1-based source column numbers, like `3,1,2`.
    #[builder(default, setter(into))]
    pub columns: String,
    #[builder(default, setter(skip))]
    opened: Option<Opened>,
}

/// Parses a 1-based `3,1,2` list into zero-based indexes.
pub fn parse_columns(columns: &str) -> Result<Vec<usize>, Error> {
    columns
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .context(ColumnNumberSnafu { item, columns })
        })
        .collect()
}

fn project(values: Vec<String>, columns: &[usize]) -> Vec<String> {
    if columns.is_empty() {
        return values;
    }
    columns
        .iter()
        .map(|&i| values.get(i).cloned().unwrap_or_default())
        .collect()
}

/// The candidate delimiter giving the most fields in the first record of `sample`.
pub fn detect_delimiter(sample: &[u8]) -> u8 {
    let mut best = (DELIMITERS[0], 0);
    let mut record = ByteRecord::new();
    for delim in DELIMITERS {
        let mut rdr = ReaderBuilder::new()
            .delimiter(delim)
            .has_headers(false)
            .flexible(true)
            .from_reader(sample);
        let fields = match rdr.read_byte_record(&mut record) {
            Ok(true) => record.len(),
            _ => 0,
        };
        if fields > best.1 {
            best = (delim, fields);
        }
    }
    best.0
}

fn read_sample(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut sample = Vec::with_capacity(SNIFF_LEN);
    r.take(SNIFF_LEN as u64).read_to_end(&mut sample)?;
    Ok(sample)
}

/// Streams the CSV records of `r`. The delimiter is detected when `delim` is empty.
pub fn read_csv<R, F>(
    ctx: &Context,
    mut r: R,
    delim: &str,
    columns: &[usize],
    skip: usize,
    mut on_row: F,
) -> Result<(), Error>
where
    R: Read,
    F: FnMut(Row) -> Result<(), Error>,
{
    ctx.check()?;
    let sample = read_sample(&mut r).context(SampleSnafu)?;
    let delim = match delim {
        "" => {
            let delim = detect_delimiter(&sample);
            log::debug!("detected delimiter {:?}", delim as char);
            delim
        }
        "\\t" => b'\t',
        d if d.len() == 1 => d.as_bytes()[0],
        d => return DelimiterSnafu { delim: d }.fail(),
    };
    let mut rdr = ReaderBuilder::new()
        .delimiter(delim)
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(sample).chain(r));

    let mut record = ByteRecord::new();
    let mut header: Option<Arc<[String]>> = None;
    let mut line = 0;
    while rdr
        .read_byte_record(&mut record)
        .context(CsvSnafu { line })?
    {
        let n = line;
        line += 1;
        if n < skip {
            continue;
        }
        ctx.check()?;
        let values = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();
        let values = project(values, columns);
        let columns = header
            .get_or_insert_with(|| Arc::from(values.clone()))
            .clone();
        on_row(Row {
            line: n,
            columns,
            values,
        })?;
    }
    Ok(())
}

/// Index of `sheet` among `names`: itself, then one less, then the only sheet.
pub fn resolve_sheet(names: &[String], sheet: usize) -> Result<usize, Error> {
    if sheet < names.len() {
        Ok(sheet)
    } else if sheet >= 1 && sheet - 1 < names.len() {
        Ok(sheet - 1)
    } else if names.len() == 1 {
        Ok(0)
    } else {
        UnknownSheetSnafu {
            sheet,
            available: names.to_vec(),
        }
        .fail()
    }
}

fn cell_text(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_owned(),
        Data::DateTime(dt) => xlsx::serial_to_string(dt.as_f64(), false).unwrap_or_default(),
        other => other.to_string(),
    }
}

// Shared by the spreadsheet readers: skip, projection, header capture.
struct SheetRows<'a> {
    ctx: &'a Context,
    columns: &'a [usize],
    skip: usize,
    header: Option<Arc<[String]>>,
}

impl SheetRows<'_> {
    fn surface<F>(&mut self, line: usize, values: Vec<String>, on_row: &mut F) -> Result<(), Error>
    where
        F: FnMut(Row) -> Result<(), Error>,
    {
        if line < self.skip {
            return Ok(());
        }
        self.ctx.check()?;
        let values = project(values, self.columns);
        let columns = self
            .header
            .get_or_insert_with(|| Arc::from(values.clone()))
            .clone();
        on_row(Row {
            line,
            columns,
            values,
        })
    }
}

fn is_ods(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(mut zip) = zip::ZipArchive::new(BufReader::new(file)) else {
        return false;
    };
    let mut mime = String::new();
    let ods = match zip.by_name("mimetype") {
        Ok(mut entry) => entry.read_to_string(&mut mime).is_ok() && mime.trim() == ODS_MIME,
        Err(_) => false,
    };
    ods
}

fn open_sheets(path: &Path, container: Container, name: &str) -> Result<Sheets<BufReader<File>>, Error> {
    let sheets = match container {
        Container::Xls => open_workbook::<Xls<_>, _>(path)
            .map(Sheets::Xls)
            .map_err(calamine::Error::from),
        _ => open_workbook::<Ods<_>, _>(path)
            .map(Sheets::Ods)
            .map_err(calamine::Error::from),
    };
    sheets.context(SpreadsheetSnafu { name })
}

impl Config {
    /// Opens `name`; `-` or an empty name is standard input. Compressed and
    /// non-regular sources are decompressed into a temporary file first.
    pub fn open(&mut self, name: &str) -> Result<(), Error> {
        self.opened = None;
        let (display, source): (String, Box<dyn Read>) = if name.is_empty() || name == "-" {
            ("-".to_owned(), Box::new(io::stdin()))
        } else {
            let path = PathBuf::from(name);
            let file = File::open(&path).context(OpenSnafu { path: &path })?;
            let regular = file
                .metadata()
                .context(OpenSnafu { path: &path })?
                .is_file();
            if regular {
                let (typ, _) = detect::detect_reader_type(BufReader::new(&file), name)
                    .context(DetectSnafu { name })?;
                if typ.compression == Compression::None {
                    self.finish_open(name.to_owned(), path, typ, None);
                    return Ok(());
                }
                drop(file);
                let file = File::open(&path).context(OpenSnafu { path: &path })?;
                (name.to_owned(), Box::new(file))
            } else {
                (name.to_owned(), Box::new(file))
            }
        };

        let (typ, replay) =
            detect::detect_reader_type(source, &display).context(DetectSnafu { name: &display })?;
        let mut spool = tempfile::Builder::new()
            .prefix("read-rows-")
            .tempfile()
            .context(SpoolSnafu { name: &display })?;
        log::info!("copying {} ({}) into {}", display, typ, spool.path().display());
        let mut plain = detect::decompress(replay).context(SpoolSnafu { name: &display })?;
        io::copy(&mut plain, spool.as_file_mut()).context(SpoolSnafu { name: &display })?;
        let path = spool.path().to_path_buf();
        self.finish_open(display, path, typ, Some(spool));
        Ok(())
    }

    fn finish_open(&mut self, name: String, path: PathBuf, mut typ: FileType, spool: Option<NamedTempFile>) {
        if typ.container == Container::Xlsx && is_ods(&path) {
            typ.container = Container::Ods;
        }
        log::debug!("opened {} as {}", name, typ);
        self.opened = Some(Opened {
            name,
            path,
            typ,
            _spool: spool,
        });
    }

    /// Type of the opened file; [`Container::Unknown`] before [`Config::open`].
    pub fn file_type(&self) -> FileType {
        self.opened.as_ref().map(|o| o.typ).unwrap_or_default()
    }

    fn opened(&self) -> Result<&Opened, Error> {
        self.opened.as_ref().context(NotOpenedSnafu)
    }

    /// Sheet index to name; a CSV has the single sheet `0 → file name`.
    pub fn read_sheets(&self) -> Result<BTreeMap<usize, String>, Error> {
        let opened = self.opened()?;
        let names = match opened.typ.container {
            Container::Csv => vec![opened.name.clone()],
            Container::Xlsx => XlsxBook::open(&opened.path)
                .context(XlsxSnafu { name: &opened.name })?
                .sheet_names(),
            Container::Xls | Container::Ods => {
                open_sheets(&opened.path, opened.typ.container, &opened.name)?.sheet_names()
            }
            Container::Unknown => return UnsupportedSnafu { name: &opened.name }.fail(),
        };
        Ok(names.into_iter().enumerate().collect())
    }

    /// Calls `on_row` with the sheet name and each row of the configured sheet.
    /// An error returned by `on_row` stops reading and is returned as is.
    pub fn read_rows<F>(&self, ctx: &Context, mut on_row: F) -> Result<(), Error>
    where
        F: FnMut(&str, Row) -> Result<(), Error>,
    {
        ctx.check()?;
        let columns = parse_columns(&self.columns)?;
        let opened = self.opened()?;
        match opened.typ.container {
            Container::Csv => {
                let encoding = charset::lookup(&self.charset).context(CharsetSnafu)?;
                let file = File::open(&opened.path).context(OpenSnafu { path: &opened.path })?;
                let r = DecodeReader::new(BufReader::new(file), encoding);
                read_csv(ctx, r, &self.delim, &columns, self.skip, |row| {
                    on_row(&opened.name, row)
                })
            }
            Container::Xlsx => self.read_xlsx(ctx, opened, &columns, &mut on_row),
            Container::Xls | Container::Ods => self.read_spreadsheet(ctx, opened, &columns, &mut on_row),
            Container::Unknown => UnsupportedSnafu { name: &opened.name }.fail(),
        }
    }

    fn read_xlsx<F>(&self, ctx: &Context, opened: &Opened, columns: &[usize], on_row: &mut F) -> Result<(), Error>
    where
        F: FnMut(&str, Row) -> Result<(), Error>,
    {
        let mut book = XlsxBook::open(&opened.path).context(XlsxSnafu { name: &opened.name })?;
        let names = book.sheet_names();
        let index = resolve_sheet(&names, self.sheet)?;
        let sheet_name = &names[index];
        let mut rows = SheetRows {
            ctx,
            columns,
            skip: self.skip,
            header: None,
        };
        book.read_rows(index, |line, values| {
            rows.surface(line, values, &mut |row| on_row(sheet_name, row))
                .map(|()| true)
        })
        .context(XlsxSnafu { name: &opened.name })?
    }

    fn read_spreadsheet<F>(
        &self,
        ctx: &Context,
        opened: &Opened,
        columns: &[usize],
        on_row: &mut F,
    ) -> Result<(), Error>
    where
        F: FnMut(&str, Row) -> Result<(), Error>,
    {
        let mut book = open_sheets(&opened.path, opened.typ.container, &opened.name)?;
        let names = book.sheet_names();
        let index = resolve_sheet(&names, self.sheet)?;
        let sheet_name = &names[index];
        let range = book
            .worksheet_range(sheet_name)
            .context(SpreadsheetSnafu { name: &opened.name })?;
        let (first_row, first_col) = range
            .start()
            .map(|(row, col)| (row as usize, col as usize))
            .unwrap_or_default();

        let mut rows = SheetRows {
            ctx,
            columns,
            skip: self.skip,
            header: None,
        };
        for (i, cells) in range.rows().enumerate() {
            let mut values = vec![String::new(); first_col];
            values.extend(cells.iter().map(cell_text));
            while values.last().is_some_and(|v| v.is_empty()) {
                values.pop();
            }
            if values.is_empty() {
                continue;
            }
            rows.surface(first_row + i, values, &mut |row| on_row(sheet_name, row))?;
        }
        Ok(())
    }

    /// Opens `name` and streams every sheet of it in order.
    pub fn read_file<F>(&mut self, ctx: &Context, name: &str, mut on_row: F) -> Result<(), Error>
    where
        F: FnMut(&str, Row) -> Result<(), Error>,
    {
        self.open(name)?;
        for index in self.read_sheets()?.into_keys() {
            self.sheet = index;
            self.read_rows(ctx, &mut on_row)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect(data: &str, delim: &str, columns: &[usize], skip: usize) -> Vec<Row> {
        let mut rows = Vec::new();
        read_csv(&Context::background(), data.as_bytes(), delim, columns, skip, |row| {
            rows.push(row);
            Ok(())
        })
        .unwrap();
        rows
    }

    fn values(rows: &[Row]) -> Vec<Vec<String>> {
        rows.iter().map(|r| r.values.clone()).collect()
    }

    #[test]
    fn header_without_delimiter() {
        let rows = collect("HEADER_NO_DELIM\n123\n", "", &[], 0);
        assert_eq!(values(&rows), vec![vec!["HEADER_NO_DELIM"], vec!["123"]]);
        assert_eq!(rows[1].line, 1);
        assert_eq!(&*rows[1].columns, ["HEADER_NO_DELIM".to_owned()]);
    }

    #[test]
    fn quoted_delimiter_does_not_win() {
        let rows = collect("\"COL1,\";COL2\na;b\n", "", &[], 0);
        assert_eq!(values(&rows), vec![vec!["COL1,", "COL2"], vec!["a", "b"]]);
    }

    #[test]
    fn delimiter_ties_keep_enumeration_order() {
        assert_eq!(detect_delimiter(b"a,b;c\n"), b',');
        assert_eq!(detect_delimiter(b"a\tb\tc\n"), b'\t');
        assert_eq!(detect_delimiter(b""), b',');
    }

    #[test]
    fn skip_and_projection() {
        let rows = collect("junk\nid;name;x\n1;alma\n", ";", &[1, 0, 5], 1);
        assert_eq!(
            values(&rows),
            vec![vec!["name", "id", ""], vec!["alma", "1", ""]]
        );
        assert_eq!(rows[0].line, 1);
        assert_eq!(&*rows[1].columns, ["name", "id", ""].map(String::from));
    }

    #[test]
    fn ragged_rows_and_lenient_quotes() {
        let rows = collect("a,b,c\n1\n2,x\"y,3,4\n", ",", &[], 0);
        assert_eq!(
            values(&rows),
            vec![vec!["a", "b", "c"], vec!["1"], vec!["2", "x\"y", "3", "4"]]
        );
    }

    #[test]
    fn escaped_tab() {
        let rows = collect("a\tb\n", "\\t", &[], 0);
        assert_eq!(values(&rows), vec![vec!["a", "b"]]);
    }

    #[test]
    fn column_numbers() {
        assert_eq!(parse_columns("3,1, 2").unwrap(), vec![2, 0, 1]);
        assert!(parse_columns("").unwrap().is_empty());
        let err = parse_columns("1,x").unwrap_err();
        assert!(err.to_string().contains("\"x\""), "{err}");
        assert!(parse_columns("0").is_err());
    }

    #[test]
    fn sheet_resolution() {
        let names: Vec<String> = vec!["a".into(), "b".into()];
        assert_eq!(resolve_sheet(&names, 1).unwrap(), 1);
        assert_eq!(resolve_sheet(&names, 2).unwrap(), 1);
        assert!(matches!(
            resolve_sheet(&names, 3),
            Err(Error::UnknownSheet { sheet: 3, .. })
        ));
        assert_eq!(resolve_sheet(&names[..1], 7).unwrap(), 0);
    }

    #[test]
    fn canceled_before_first_row() {
        let ctx = Context::background();
        ctx.cancel();
        let err = read_csv(&ctx, "a\n".as_bytes(), ",", &[], 0, |_| Ok(())).unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn callback_error_stops_reading() {
        let mut seen = 0;
        let err = read_csv(&Context::background(), "1\n2\n3\n".as_bytes(), ",", &[], 0, |_| {
            seen += 1;
            Err(Error::Callback {
                source: "enough".into(),
            })
        })
        .unwrap_err();
        assert_eq!(seen, 1);
        assert!(!err.is_cancellation());
    }

    #[test]
    fn opens_gzipped_csv_through_a_temporary_file() {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all("id;str\n1;alma\n".as_bytes()).unwrap();
        let mut file = tempfile::Builder::new().suffix(".csv.gz").tempfile().unwrap();
        file.write_all(&gz.finish().unwrap()).unwrap();
        let name = file.path().to_string_lossy().into_owned();

        let mut cfg = Config::builder().charset("utf-8").build();
        cfg.open(&name).unwrap();
        assert_eq!(cfg.file_type().to_string(), "csv+gzip");
        assert_eq!(cfg.read_sheets().unwrap(), BTreeMap::from([(0, name.clone())]));

        let mut rows = Vec::new();
        cfg.read_rows(&Context::background(), |sheet, row| {
            assert_eq!(sheet, name);
            rows.push(row.values);
            Ok(())
        })
        .unwrap();
        assert_eq!(rows, vec![vec!["id", "str"], vec!["1", "alma"]]);
    }

    #[test]
    fn reads_every_sheet_of_a_workbook() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        for (name, value) in [("egy", "1"), ("kettő", "2")] {
            let sheet = workbook.add_worksheet();
            sheet.set_name(name).unwrap();
            sheet.write_string(0, 0, "n").unwrap();
            sheet.write_string(1, 0, value).unwrap();
        }
        let mut file = tempfile::Builder::new().suffix(".xlsx").tempfile().unwrap();
        file.write_all(&workbook.save_to_buffer().unwrap()).unwrap();

        let mut cfg = Config::builder().build();
        let mut seen = Vec::new();
        cfg.read_file(&Context::background(), &file.path().to_string_lossy(), |sheet, row| {
            seen.push((sheet.to_owned(), row.line, row.values.join("|")));
            Ok(())
        })
        .unwrap();
        assert_eq!(cfg.file_type().container, Container::Xlsx);
        assert_eq!(
            seen,
            vec![
                ("egy".to_owned(), 0, "n".to_owned()),
                ("egy".to_owned(), 1, "1".to_owned()),
                ("kettő".to_owned(), 0, "n".to_owned()),
                ("kettő".to_owned(), 1, "2".to_owned()),
            ]
        );
    }

    #[test]
    fn zip_with_ods_mimetype_is_ods() {
        let mut workbook = spreadsheet_ods::WorkBook::new_empty();
        let mut sheet = spreadsheet_ods::Sheet::new("lap");
        sheet.set_value(0, 0, "n");
        sheet.set_value(1, 0, "alma");
        workbook.push_sheet(sheet);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.ods");
        spreadsheet_ods::write_ods(&mut workbook, &path).unwrap();

        let mut cfg = Config::builder().build();
        cfg.open(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.file_type().container, Container::Ods);
        assert_eq!(cfg.read_sheets().unwrap(), BTreeMap::from([(0, "lap".to_owned())]));
    }
}
