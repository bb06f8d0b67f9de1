//! GitHub flavored markdown tables from any readable file.

use crate::context::Context;
use crate::source::{self, Config, Row};
use snafu::prelude::*;
use std::io::{self, Write};

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Read { source: source::Error },

    #[snafu(display("write markdown: {}", source))]
    Write { source: io::Error },
}

fn escape(value: &str) -> String {
    value.replace('|', "&#124;").replace('\n', "<br/>")
}

/// Renders rows as markdown tables, one `# sheet` section per sheet.
pub struct MarkdownWriter<W: Write> {
    out: W,
    // all-empty rows waiting for a non-empty successor
    pending: Vec<String>,
}

impl<W: Write> MarkdownWriter<W> {
    pub fn new(out: W) -> Self {
        MarkdownWriter {
            out,
            pending: Vec::new(),
        }
    }

    pub fn row(&mut self, sheet: &str, row: &Row) -> io::Result<()> {
        if row.line == 0 {
            writeln!(self.out, "# {sheet}")?;
        }
        let cells: Vec<String> = row.values.iter().map(|v| escape(v)).collect();
        let mut line = String::new();
        for cell in &cells {
            if line.is_empty() {
                line.push('|');
            }
            line.push(' ');
            line.push_str(cell);
            line.push_str(" |");
        }
        line.push('\n');

        if cells.iter().all(|c| c.chars().all(|r| r == ' ' || r == '-')) {
            self.pending.push(line);
            return Ok(());
        }
        for empty in self.pending.drain(..) {
            self.out.write_all(empty.as_bytes())?;
        }
        self.out.write_all(line.as_bytes())?;
        if row.line == 0 {
            let mut separator = String::from("|");
            for cell in &cells {
                separator.push(' ');
                separator.extend(std::iter::repeat('-').take(cell.len()));
                separator.push_str(" |");
            }
            writeln!(self.out, "{separator}")?;
        }
        Ok(())
    }

    /// Flushes and returns the writer; trailing empty rows are dropped.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Writes every sheet of `path` to `out`.
pub fn write_file<W: Write>(ctx: &Context, path: &str, out: W) -> Result<W, Error> {
    let mut config = Config::default();
    let mut md = MarkdownWriter::new(out);
    config
        .read_file(ctx, path, |sheet, row| {
            md.row(sheet, &row)
                .map_err(|err| source::Error::Callback { source: Box::new(err) })
        })
        .context(ReadSnafu)?;
    md.finish().context(WriteSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;
    use std::sync::Arc;

    fn row(line: usize, values: &[&str]) -> Row {
        Row {
            line,
            columns: Arc::from(vec!["a".to_owned()]),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn tables() {
        let mut md = MarkdownWriter::new(Vec::new());
        md.row("first", &row(0, &["name", "a|b"])).unwrap();
        md.row("first", &row(1, &["", ""])).unwrap();
        md.row("first", &row(2, &["x\ny", "1"])).unwrap();
        md.row("first", &row(3, &["", "--"])).unwrap();
        md.row("second", &row(0, &["id"])).unwrap();
        md.row("second", &row(1, &["7"])).unwrap();
        let out = String::from_utf8(md.finish().unwrap()).unwrap();
        assert_snapshot!(out, @r###"
        # first
        | name | a&#124;b |
        | ---- | -------- |
        |  |  |
        | x<br/>y | 1 |
        # second
        | id |
        | -- |
        | 7 |
        "###);
    }

    #[test]
    fn csv_file() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(b"a;b\n1;2\n").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let out = write_file(&Context::background(), &path, Vec::new()).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out, format!("# {path}\n| a | b |\n| - | - |\n| 1 | 2 |\n"));
    }
}
