//! Native reader for Office Open XML workbooks.
//!
//! Only what the row source needs: sheet names in workbook order, shared and
//! inline strings, and the number format of every cell style so date serials can
//! be turned back into calendar dates.

use chrono::{NaiveDate, TimeDelta, Timelike};
use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek};
use std::path::Path;
use thiserror::Error;
use zip::ZipArchive;

const TAG_SHEET: QName = QName(b"sheet");
const TAG_WORKBOOK_PROPERTIES: QName = QName(b"workbookPr");
const TAG_CUSTOM_FORMATS: QName = QName(b"numFmts");
const TAG_CUSTOM_FORMAT: QName = QName(b"numFmt");
const TAG_FORMAT_INDEXES: QName = QName(b"cellXfs");
const TAG_FORMAT_INDEX: QName = QName(b"xf");
const TAG_SHARED_STRING_ITEM: QName = QName(b"si");
const TAG_PHONETIC_TEXT: QName = QName(b"rPh");
const TAG_TEXT: QName = QName(b"t");
const TAG_ROW: QName = QName(b"row");
const TAG_CELL: QName = QName(b"c");
const TAG_INLINE_STRING: QName = QName(b"is");
const TAG_VALUE: QName = QName(b"v");

#[derive(Error, Debug)]
pub enum XlsxError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{0}")]
    Xml(#[from] quick_xml::Error),
    #[error("{0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("{0}")]
    XmlEncoding(#[from] quick_xml::encoding::EncodingError),
    #[error("missing workbook part {0}")]
    MissingPart(String),
    #[error("unknown XML entity &{0};")]
    Entity(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumberFormat {
    General,
    Date,
    Fixed {
        decimals: usize,
        grouping: bool,
        percent: bool,
    },
}

impl NumberFormat {
    fn builtin(id: u32) -> NumberFormat {
        let fixed = |decimals, grouping, percent| NumberFormat::Fixed {
            decimals,
            grouping,
            percent,
        };
        match id {
            1 => fixed(0, false, false),
            2 => fixed(2, false, false),
            3 | 37 | 38 => fixed(0, true, false),
            4 | 39 | 40 => fixed(2, true, false),
            9 => fixed(0, false, true),
            10 => fixed(2, false, true),
            14..=22 | 27..=36 | 45..=47 | 50..=58 => NumberFormat::Date,
            _ => NumberFormat::General,
        }
    }

    fn custom(code: &str) -> NumberFormat {
        if code.to_ascii_lowercase().contains("yy") {
            return NumberFormat::Date;
        }
        // first section, without quoted literals and [color]/[condition] blocks
        let mut plain = String::with_capacity(code.len());
        let (mut quoted, mut bracket, mut escaped) = (false, false, false);
        for c in code.chars() {
            match c {
                _ if escaped => escaped = false,
                '\\' | '_' if !quoted => escaped = true,
                '"' => quoted = !quoted,
                '[' if !quoted => bracket = true,
                ']' if bracket => bracket = false,
                ';' if !quoted && !bracket => break,
                _ if quoted || bracket => (),
                c => plain.push(c),
            }
        }
        if !plain.contains(['0', '#']) {
            return NumberFormat::General;
        }
        let (int_part, frac_part) = plain.split_once('.').unwrap_or((&plain, ""));
        NumberFormat::Fixed {
            decimals: frac_part.chars().filter(|c| matches!(c, '0' | '#')).count(),
            grouping: int_part.contains(','),
            percent: plain.contains('%'),
        }
    }

    fn display(&self, value: f64) -> Option<String> {
        let NumberFormat::Fixed {
            decimals,
            grouping,
            percent,
        } = *self
        else {
            return None;
        };
        let scaled = if percent { value * 100.0 } else { value };
        let mut text = format!("{scaled:.decimals$}");
        if grouping {
            text = group_thousands(&text);
        }
        if percent {
            text.push('%');
        }
        Some(text)
    }
}

fn group_thousands(text: &str) -> String {
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text),
    };
    let (int_part, frac) = match digits.find('.') {
        Some(i) => digits.split_at(i),
        None => (digits, ""),
    };
    let mut out = String::with_capacity(text.len() + int_part.len() / 3);
    out.push_str(sign);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out.push_str(frac);
    out
}

/// Shortest text that parses back to the same number.
pub(crate) fn normalize_number(raw: &str) -> String {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => value.to_string(),
        _ => raw.to_owned(),
    }
}

/// Keeps the formatted form unless it cannot be read back as the stored number.
fn display_or_raw(raw: &str, format: NumberFormat) -> String {
    let Ok(value) = raw.trim().parse::<f64>() else {
        return raw.to_owned();
    };
    match format.display(value) {
        Some(shown) if !shown.contains(',') && shown.parse::<f64>() == Ok(value) => shown,
        _ => normalize_number(raw),
    }
}

/// Converts a spreadsheet date serial to `YYYY-MM-DD` or `YYYY-MM-DD hh:mm:ss`.
pub(crate) fn serial_to_string(serial: f64, date1904: bool) -> Option<String> {
    let epoch = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    }
    .and_hms_opt(0, 0, 0)?;
    let seconds = (serial * 86_400.0).round();
    if !seconds.is_finite() {
        return None;
    }
    let when = epoch.checked_add_signed(TimeDelta::try_seconds(seconds as i64)?)?;
    Some(if when.time().num_seconds_from_midnight() == 0 {
        when.format("%Y-%m-%d").to_string()
    } else {
        when.format("%Y-%m-%d %H:%M:%S").to_string()
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CellKind {
    Number,
    Shared,
    Inline,
    Bool,
    Error,
    Iso,
}

/// Zero-based (column, row) of an `A1` style reference.
fn parse_reference(reference: &str) -> Option<(usize, usize)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = c.to_ascii_uppercase() as usize - 'A' as usize + 1;
        col = col.checked_mul(26)?.checked_add(digit)?;
    }
    let row: usize = digits.parse().ok()?;
    Some((col - 1, row.checked_sub(1)?))
}

fn new_reader<R: BufRead>(r: R) -> Reader<R> {
    let mut reader = Reader::from_reader(r);
    let config = reader.config_mut();
    config.check_comments = false;
    config.check_end_names = false;
    config.expand_empty_elements = true;
    config.trim_text(false);
    reader
}

fn attribute<'a>(event: &'a BytesStart<'a>, name: &str) -> Result<Option<Cow<'a, str>>, XlsxError> {
    match event.try_get_attribute(name)? {
        Some(attribute) => Ok(Some(attribute.unescape_value()?)),
        None => Ok(None),
    }
}

fn push_reference(text: &mut String, event: &BytesRef) -> Result<(), XlsxError> {
    let raw = event.xml_content()?;
    if let Some(number) = raw.strip_prefix('#') {
        let code = match number.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => number.parse(),
        }
        .map_err(|_| XlsxError::Entity(raw.to_string()))?;
        if let Some(c) = char::from_u32(code) {
            text.push(c);
        }
    } else if let Some(entity) = resolve_xml_entity(&raw) {
        text.push_str(entity);
    } else {
        return Err(XlsxError::Entity(raw.to_string()));
    }
    Ok(())
}

// Text of a string item up to `end`, without phonetic runs.
fn read_text<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
    end: QName,
    in_text: bool,
) -> Result<String, XlsxError> {
    let mut text = String::new();
    let (mut phonetic, mut is_text) = (false, in_text);
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Eof => break,
            Event::End(e) if e.name() == end => break,
            Event::Start(e) if e.name() == TAG_PHONETIC_TEXT => phonetic = true,
            Event::End(e) if e.name() == TAG_PHONETIC_TEXT => phonetic = false,
            Event::Start(e) if !phonetic && e.name() == TAG_TEXT => is_text = true,
            Event::End(e) if e.name() == TAG_TEXT => is_text = in_text,
            Event::Text(e) if is_text => text.push_str(&e.xml_content()?),
            Event::CData(e) if is_text => text.push_str(&e.xml_content()?),
            Event::GeneralRef(e) if is_text => push_reference(&mut text, &e)?,
            _ => (),
        }
    }
    Ok(text)
}

fn zip_path(target: &str) -> String {
    if let Some(rest) = target.strip_prefix('/') {
        rest.to_owned()
    } else if target.starts_with("xl/") {
        target.to_owned()
    } else {
        format!("xl/{target}")
    }
}

#[derive(Debug, Default)]
struct Cells {
    formats: Vec<NumberFormat>,
    shared: Vec<String>,
    date1904: bool,
}

pub struct XlsxBook<R: Read + Seek> {
    zip: ZipArchive<R>,
    sheets: Vec<(String, String)>,
    cells: Cells,
}

impl XlsxBook<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, XlsxError> {
        XlsxBook::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> XlsxBook<R> {
    pub fn new(r: R) -> Result<Self, XlsxError> {
        let mut book = XlsxBook {
            zip: ZipArchive::new(r)?,
            sheets: Vec::new(),
            cells: Cells::default(),
        };
        book.load_workbook()?;
        book.load_styles()?;
        book.load_shared_strings()?;
        Ok(book)
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    // case-insensitive, the way Office itself resolves part names
    fn part(&mut self, name: &str) -> Result<Option<Vec<u8>>, XlsxError> {
        let Some(found) = self
            .zip
            .file_names()
            .find(|candidate| candidate.eq_ignore_ascii_case(name))
            .map(str::to_owned)
        else {
            return Ok(None);
        };
        let mut data = Vec::new();
        self.zip.by_name(&found)?.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn load_workbook(&mut self) -> Result<(), XlsxError> {
        let rels = self
            .part("xl/_rels/workbook.xml.rels")?
            .ok_or_else(|| XlsxError::MissingPart("xl/_rels/workbook.xml.rels".into()))?;
        let mut targets = HashMap::new();
        let mut reader = new_reader(&rels[..]);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)? {
                Event::Eof => break,
                Event::Start(e) if e.local_name().as_ref() == b"Relationship" => {
                    let id = attribute(&e, "Id")?;
                    let target = attribute(&e, "Target")?;
                    if let (Some(id), Some(target)) = (id, target) {
                        targets.insert(id.into_owned(), zip_path(&target));
                    }
                }
                _ => (),
            }
        }

        let workbook = self
            .part("xl/workbook.xml")?
            .ok_or_else(|| XlsxError::MissingPart("xl/workbook.xml".into()))?;
        let mut reader = new_reader(&workbook[..]);
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)? {
                Event::Eof => break,
                Event::Start(e) if e.name() == TAG_SHEET => {
                    let mut name = None;
                    let mut id = None;
                    for attr in e.attributes() {
                        let attr = attr?;
                        match attr.key.local_name().as_ref() {
                            b"name" => name = Some(attr.unescape_value()?.into_owned()),
                            b"id" => id = Some(attr.unescape_value()?.into_owned()),
                            _ => (),
                        }
                    }
                    if let (Some(name), Some(path)) = (name, id.and_then(|id| targets.get(&id))) {
                        self.sheets.push((name, path.clone()));
                    }
                }
                Event::Start(e) if e.name() == TAG_WORKBOOK_PROPERTIES => {
                    self.cells.date1904 = attribute(&e, "date1904")?
                        .map(|v| v == "1" || v == "true")
                        .unwrap_or(false);
                }
                _ => (),
            }
        }
        Ok(())
    }

    fn load_styles(&mut self) -> Result<(), XlsxError> {
        let Some(styles) = self.part("xl/styles.xml")? else {
            return Ok(());
        };
        let mut custom = HashMap::new();
        let (mut in_custom, mut in_xfs) = (false, false);
        let mut reader = new_reader(&styles[..]);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)? {
                Event::Eof => break,
                Event::Start(e) if e.name() == TAG_CUSTOM_FORMATS => in_custom = true,
                Event::End(e) if e.name() == TAG_CUSTOM_FORMATS => in_custom = false,
                Event::Start(e) if in_custom && e.name() == TAG_CUSTOM_FORMAT => {
                    let id = attribute(&e, "numFmtId")?.and_then(|id| id.parse::<u32>().ok());
                    let code = attribute(&e, "formatCode")?;
                    if let (Some(id), Some(code)) = (id, code) {
                        custom.insert(id, NumberFormat::custom(&code));
                    }
                }
                Event::Start(e) if e.name() == TAG_FORMAT_INDEXES => in_xfs = true,
                Event::End(e) if e.name() == TAG_FORMAT_INDEXES => in_xfs = false,
                Event::Start(e) if in_xfs && e.name() == TAG_FORMAT_INDEX => {
                    let id = attribute(&e, "numFmtId")?
                        .and_then(|id| id.parse::<u32>().ok())
                        .unwrap_or(0);
                    let format = custom
                        .get(&id)
                        .copied()
                        .unwrap_or_else(|| NumberFormat::builtin(id));
                    self.cells.formats.push(format);
                }
                _ => (),
            }
        }
        Ok(())
    }

    fn load_shared_strings(&mut self) -> Result<(), XlsxError> {
        let Some(strings) = self.part("xl/sharedStrings.xml")? else {
            return Ok(());
        };
        let mut reader = new_reader(&strings[..]);
        let mut buf = Vec::new();
        let mut text_buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)? {
                Event::Eof => break,
                Event::Start(e) if e.name() == TAG_SHARED_STRING_ITEM => {
                    let text = read_text(&mut reader, &mut text_buf, TAG_SHARED_STRING_ITEM, false)?;
                    self.cells.shared.push(text);
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Streams the rows of sheet `index` as `(row index, values)`; rows without
    /// any cell are not reported and trailing empty cells are trimmed.
    /// The callback returns `false` to stop early.
    pub fn read_rows<E, F>(&mut self, index: usize, mut on_row: F) -> Result<Result<(), E>, XlsxError>
    where
        F: FnMut(usize, Vec<String>) -> Result<bool, E>,
    {
        let Some((_, path)) = self.sheets.get(index).cloned() else {
            return Err(XlsxError::MissingPart(format!("sheet #{index}")));
        };
        let Some(found) = self
            .zip
            .file_names()
            .find(|candidate| candidate.eq_ignore_ascii_case(&path))
            .map(str::to_owned)
        else {
            return Err(XlsxError::MissingPart(path));
        };
        read_sheet_xml(&mut self.zip, &found, &self.cells, &mut on_row)
    }
}

impl Cells {
    fn cell_text(&self, kind: CellKind, style: usize, value: &str) -> String {
        match kind {
            CellKind::Shared => value
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| self.shared.get(i))
                .cloned()
                .unwrap_or_default(),
            CellKind::Inline | CellKind::Error | CellKind::Iso => value.to_owned(),
            CellKind::Bool => if value == "1" { "TRUE" } else { "FALSE" }.to_owned(),
            CellKind::Number => match self.formats.get(style).copied() {
                Some(NumberFormat::Date) => value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|serial| serial_to_string(serial, self.date1904))
                    .unwrap_or_else(|| value.to_owned()),
                Some(format @ NumberFormat::Fixed { .. }) => display_or_raw(value, format),
                _ => normalize_number(value),
            },
        }
    }
}

fn read_sheet_xml<R, E, F>(
    zip: &mut ZipArchive<R>,
    path: &str,
    converter: &Cells,
    on_row: &mut F,
) -> Result<Result<(), E>, XlsxError>
where
    R: Read + Seek,
    F: FnMut(usize, Vec<String>) -> Result<bool, E>,
{
    let file = zip.by_name(path)?;
    let mut reader = new_reader(BufReader::new(file));
    let mut buf = Vec::new();
    let mut text_buf = Vec::new();

    let mut row_index = 0usize;
    let mut next_row = 0usize;
    let mut next_col = 0usize;
    let mut cells: Vec<String> = Vec::new();
    let mut col = 0usize;
    let mut kind = CellKind::Number;
    let mut style = 0usize;
    let mut value = String::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) if e.name() == TAG_ROW => {
                row_index = attribute(&e, "r")?
                    .and_then(|r| r.trim().parse::<usize>().ok())
                    .and_then(|r| r.checked_sub(1))
                    .unwrap_or(next_row);
                next_row = row_index + 1;
                next_col = 0;
                cells.clear();
            }
            Event::End(e) if e.name() == TAG_ROW => {
                while cells.last().is_some_and(|c| c.is_empty()) {
                    cells.pop();
                }
                if !cells.is_empty() {
                    match on_row(row_index, std::mem::take(&mut cells)) {
                        Ok(true) => (),
                        Ok(false) => return Ok(Ok(())),
                        Err(err) => return Ok(Err(err)),
                    }
                }
            }
            Event::Start(e) if e.name() == TAG_CELL => {
                col = attribute(&e, "r")?
                    .and_then(|r| parse_reference(&r))
                    .map(|(col, _)| col)
                    .unwrap_or(next_col);
                next_col = col + 1;
                kind = match attribute(&e, "t")?.as_deref() {
                    Some("s") => CellKind::Shared,
                    Some("inlineStr") | Some("str") => CellKind::Inline,
                    Some("b") => CellKind::Bool,
                    Some("e") => CellKind::Error,
                    Some("d") => CellKind::Iso,
                    _ => CellKind::Number,
                };
                style = attribute(&e, "s")?
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                value.clear();
            }
            Event::Start(e) if e.name() == TAG_VALUE => {
                value = read_text(&mut reader, &mut text_buf, TAG_VALUE, true)?;
            }
            Event::Start(e) if e.name() == TAG_INLINE_STRING => {
                value = read_text(&mut reader, &mut text_buf, TAG_INLINE_STRING, false)?;
            }
            Event::End(e) if e.name() == TAG_CELL => {
                if !value.is_empty() {
                    if cells.len() <= col {
                        cells.resize(col + 1, String::new());
                    }
                    cells[col] = converter.cell_text(kind, style, &value);
                }
                value.clear();
            }
            _ => (),
        }
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::{Format, Workbook};
    use std::io::Cursor;

    #[test]
    fn references() {
        assert_eq!(parse_reference("A1"), Some((0, 0)));
        assert_eq!(parse_reference("AB12"), Some((27, 11)));
        assert_eq!(parse_reference("12"), None);
        assert_eq!(parse_reference("A0"), None);
        assert_eq!(parse_reference(&format!("{}1", "Z".repeat(20))), None);
    }

    #[test]
    fn format_codes() {
        assert_eq!(NumberFormat::custom("yyyy\\-mm\\-dd"), NumberFormat::Date);
        assert_eq!(NumberFormat::custom("[$-409]d-mmm-YY;@"), NumberFormat::Date);
        assert_eq!(
            NumberFormat::custom("#,##0.000;[Red]-#,##0.000"),
            NumberFormat::Fixed {
                decimals: 3,
                grouping: true,
                percent: false
            }
        );
        assert_eq!(NumberFormat::custom("\"yes\";\"yes\";\"no\""), NumberFormat::General);
        assert_eq!(NumberFormat::custom("@"), NumberFormat::General);
        assert_eq!(NumberFormat::builtin(14), NumberFormat::Date);
        assert_eq!(NumberFormat::builtin(0), NumberFormat::General);
    }

    #[test]
    fn display_keeps_lossless_forms_only() {
        let two = NumberFormat::builtin(2);
        assert_eq!(display_or_raw("3", two), "3.00");
        assert_eq!(display_or_raw("3.14159", two), "3.14159");
        assert_eq!(display_or_raw("1234567", NumberFormat::builtin(3)), "1234567");
        assert_eq!(display_or_raw("0.25", NumberFormat::builtin(9)), "0.25");
        assert_eq!(group_thousands("-1234567.50"), "-1,234,567.50");
        assert_eq!(normalize_number("1.1000000000000001"), "1.1");
    }

    #[test]
    fn serials() {
        assert_eq!(serial_to_string(45000.0, false).as_deref(), Some("2023-03-15"));
        assert_eq!(
            serial_to_string(45000.5, false).as_deref(),
            Some("2023-03-15 12:00:00")
        );
        assert_eq!(serial_to_string(0.0, true).as_deref(), Some("1904-01-01"));
    }

    #[test]
    fn reads_generated_workbook() {
        let mut workbook = Workbook::new();
        let date = Format::new().set_num_format("yyyy-mm-dd");
        let fixed = Format::new().set_num_format("0.00");
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name("Első").unwrap();
            sheet.write_string(0, 0, "id").unwrap();
            sheet.write_string(0, 1, "nap").unwrap();
            sheet.write_string(0, 2, "ár").unwrap();
            sheet.write_number(1, 0, 1).unwrap();
            sheet.write_number_with_format(1, 1, 45000, &date).unwrap();
            sheet.write_number_with_format(1, 2, 3, &fixed).unwrap();
            sheet.write_number(3, 0, 2).unwrap();
            sheet.write_string(3, 3, "x & y").unwrap();
        }
        workbook.add_worksheet().set_name("Second").unwrap();
        let data = workbook.save_to_buffer().unwrap();

        let mut book = XlsxBook::new(Cursor::new(data)).unwrap();
        assert_eq!(book.sheet_names(), vec!["Első", "Second"]);

        let mut rows = Vec::new();
        book.read_rows::<(), _>(0, |line, values| {
            rows.push((line, values));
            Ok(true)
        })
        .unwrap()
        .unwrap();
        assert_eq!(
            rows,
            vec![
                (0, vec!["id".to_owned(), "nap".into(), "ár".into()]),
                (1, vec!["1".to_owned(), "2023-03-15".into(), "3.00".into()]),
                (3, vec!["2".to_owned(), "".into(), "".into(), "x & y".into()]),
            ]
        );
    }
}
