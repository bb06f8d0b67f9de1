use clap::{ArgAction, Parser, Subcommand};
use dbcsv::context::Context;
use dbcsv::load::{self, split_fields, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY, DEFAULT_TABLESPACE};
use dbcsv::{charset, connector, env_dsn, init_logging, source};
use snafu::{OptionExt, ResultExt, Whatever};
use std::io::{self, BufWriter, Write};

/// Loads a CSV, XLS, XLSX or ODS file into a database table, creating the
/// table when it does not exist.
#[derive(Parser, Debug)]
#[command(name = "csvload", version, args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Database connection string
    #[arg(long, env = "DB_ID")]
    connect: Option<String>,

    /// Truncate the table before loading
    #[arg(long)]
    truncate: bool,

    /// Tablespace to create the table in
    #[arg(long, default_value = DEFAULT_TABLESPACE)]
    tablespace: String,

    /// Target fields, separated by comma, semicolon or space
    #[arg(long, default_value = "")]
    fields: String,

    /// Create every new column as a string
    #[arg(long)]
    force_string: bool,

    /// Print an INSERT ALL script instead of loading
    #[arg(long)]
    just_print: bool,

    /// Copy this table's structure
    #[arg(long, default_value = "")]
    copy: String,

    /// Rows inserted at once
    #[arg(long, alias = "chunk-size", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Input character set
    #[arg(long, default_value_t = charset::default_label())]
    charset: String,

    /// CSV separator, detected when empty
    #[arg(long, default_value = "")]
    delim: String,

    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Date layout of string dates (strftime)
    #[arg(long, default_value = dbcsv::convert::DEFAULT_DATE_LAYOUT)]
    date: String,

    /// Records to skip before the header
    #[arg(long, default_value_t = 0)]
    skip: usize,

    /// Zero-based sheet index
    #[arg(long, default_value_t = 0)]
    sheet: usize,

    /// 1-based source columns to use, like 3,1,2
    #[arg(long, default_value = "")]
    columns: String,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Destination table, or a full INSERT /*+ APPEND */ INTO statement
    table: Option<String>,

    /// Input file, standard input when missing or -
    file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the sheets of a file
    Sheets { file: String },
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    init_logging(args.verbose > 0);
    let ctx = Context::background();

    let mut src = source::Config::builder()
        .sheet(args.sheet)
        .skip(args.skip)
        .delim(args.delim.as_str())
        .charset(args.charset.as_str())
        .columns(args.columns.as_str())
        .build();

    if let Some(Command::Sheets { file }) = &args.command {
        src.open(file).whatever_context("open")?;
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for (index, name) in src.read_sheets().whatever_context("read sheets")? {
            writeln!(out, "{index}\t{name}").whatever_context("write")?;
        }
        return Ok(());
    }

    let table = args.table.as_deref().whatever_context("the destination table is required")?;
    src.open(args.file.as_deref().unwrap_or("-"))
        .whatever_context("open input")?;
    let dsn = args
        .connect
        .clone()
        .or_else(|| env_dsn(&["BRUNO_ID", "BRUNO_OWNER_ID"]))
        .whatever_context("no database given (--connect, DB_ID or BRUNO_ID)")?;
    let db = connector(&dsn).whatever_context("connect")?;

    let opts = load::Options::builder()
        .table(table)
        .fields(split_fields(&args.fields))
        .tablespace(args.tablespace.as_str())
        .copy(args.copy.as_str())
        .truncate(args.truncate)
        .force_string(args.force_string)
        .batch_size(args.batch_size)
        .concurrency(args.concurrency)
        .date_layout(args.date.as_str())
        .build();

    if args.just_print {
        let mut conn = db.connect().whatever_context("connect")?;
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        load::print_inserts(&ctx, conn.as_mut(), &opts, &src, &mut out).whatever_context("print inserts")?;
        out.flush().whatever_context("write")?;
        return Ok(());
    }

    let summary = load::load(&ctx, db.as_ref(), &opts, &src).whatever_context("load")?;
    log::info!("read={} inserted={}", summary.read, summary.inserted);
    Ok(())
}
