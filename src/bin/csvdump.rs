use clap::{ArgAction, Parser};
use dbcsv::context::Context;
use dbcsv::db::Value;
use dbcsv::dump::{self, begin_read, build_query, parse_sheet, Compression, CsvOptions, Output};
use dbcsv::{charset, connector, env_dsn, init_logging, parse_duration};
use snafu::{OptionExt, ResultExt, Whatever};
use std::io::{self, Read};
use std::time::Duration;

/// Dumps a table or query result as CSV, or several queries as the sheets
/// of an XLSX/ODS workbook.
#[derive(Parser, Debug)]
#[command(name = "csvdump", version)]
struct Args {
    /// Database connection string
    #[arg(long, env = "DB_ID")]
    connect: Option<String>,

    /// Date layout (strftime)
    #[arg(long, default_value = dump::DEFAULT_DATE_LAYOUT)]
    date: String,

    #[arg(long, default_value = ",")]
    sep: String,

    /// Print the header row
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    header: bool,

    /// Output character set
    #[arg(long, default_value_t = charset::default_label())]
    encoding: String,

    /// Output file, standard output when -
    #[arg(short, default_value = "-")]
    output: String,

    /// Values concatenated without separators or quoting
    #[arg(long)]
    raw: bool,

    /// Order SELECT * queries by every non-LOB column
    #[arg(long)]
    sort: bool,

    /// name:SELECT…, each becomes a sheet of the output workbook
    #[arg(long = "sheet")]
    sheets: Vec<String>,

    /// Positional bind parameters (:1, :2, …)
    #[arg(long = "param")]
    params: Vec<String>,

    /// gz/gzip or zst/zstd/zstandard
    #[arg(long, default_value = "")]
    compress: String,

    #[arg(long, default_value = "15m", value_parser = parse_duration)]
    timeout: Duration,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Table or SELECT statement, then an optional WHERE clause and columns;
    /// the query is read from standard input when missing
    args: Vec<String>,
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    init_logging(args.verbose > 0);
    let ctx = Context::background().with_timeout(args.timeout);

    let dsn = args
        .connect
        .clone()
        .or_else(|| env_dsn(&["BRUNO_ID"]))
        .whatever_context("no database given (--connect, DB_ID or BRUNO_ID)")?;
    let db = connector(&dsn).whatever_context("connect")?;
    let mut conn = db.connect().whatever_context("connect")?;
    begin_read(conn.as_mut()).whatever_context("begin")?;

    if !args.sheets.is_empty() {
        let sheets: Vec<(String, String)> = args
            .sheets
            .iter()
            .enumerate()
            .map(|(i, arg)| parse_sheet(i, arg))
            .collect();
        dump::dump_sheets(&ctx, conn.as_mut(), &sheets, args.header, &args.date, &args.output)
            .whatever_context("dump sheets")?;
        let _ = conn.rollback();
        return Ok(());
    }

    let table = args.args.first().map(String::as_str).unwrap_or_default();
    let where_ = args.args.get(1).map(String::as_str).unwrap_or_default();
    let columns = args.args.get(2..).unwrap_or_default();
    let mut sql = match build_query(table, where_, columns) {
        Some(sql) => sql,
        None => {
            let mut sql = String::new();
            io::stdin().read_to_string(&mut sql).whatever_context("read query")?;
            sql
        }
    };
    if args.sort {
        sql = dump::sorted_query(conn.as_mut(), &sql).whatever_context("sort")?;
    }
    let params: Vec<Value> = args.params.iter().map(|p| Value::Text(p.clone())).collect();

    let compression = Compression::parse(&args.compress).whatever_context("compression")?;
    let mut out = Output::create(&args.output, compression, &args.encoding).whatever_context("create output")?;
    let opts = CsvOptions::builder()
        .header(args.header)
        .sep(args.sep.as_str())
        .raw(args.raw)
        .date_layout(args.date.as_str())
        .build();
    dump::dump_csv(&ctx, conn.as_mut(), &sql, &params, &opts, &mut out).whatever_context("dump")?;
    out.finish().whatever_context("finish output")?;
    let _ = conn.rollback();
    Ok(())
}
