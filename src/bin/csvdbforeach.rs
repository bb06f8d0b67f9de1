use clap::{ArgAction, Parser};
use dbcsv::context::Context;
use dbcsv::foreach::{self, fixed_params, RunOptions, Statement, DEFAULT_CALL, DEFAULT_FIXED};
use dbcsv::{connector, env_dsn, init_logging, source};
use snafu::{OptionExt, ResultExt, Whatever};
use std::io::{self, BufWriter};

/// Calls a database function or block once for every row of a file.
#[derive(Parser, Debug)]
#[command(name = "csvdbforeach", version)]
struct Args {
    /// Database connection string
    #[arg(long, env = "DB_ID")]
    connect: Option<String>,

    /// Zero-based sheet index
    #[arg(long, default_value_t = 0)]
    sheet: usize,

    /// Function called with each row, or a literal BEGIN … END; block
    #[arg(long, default_value = DEFAULT_CALL)]
    call: String,

    /// Fixed parameters appended to each call, name=>template
    #[arg(long, default_value = DEFAULT_FIXED)]
    fix: String,

    /// Return value meaning success
    #[arg(long, default_value_t = 0)]
    call_ret_ok: i64,

    /// One transaction for the whole file, or commit after each row
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    one_tx: bool,

    /// Delimiter between fields, detected when empty
    #[arg(short = 'd', default_value = "")]
    delim: String,

    #[arg(long, default_value = "utf-8")]
    charset: String,

    /// Records to skip
    #[arg(long, default_value_t = 1)]
    skip: usize,

    /// 1-based column numbers in parameter order, like 3,1,2
    #[arg(long, default_value = "")]
    columns: String,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Input file, standard input when missing or -
    file: Option<String>,
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    init_logging(args.verbose > 0);
    let ctx = Context::background();
    let file = args.file.as_deref().unwrap_or("-");

    let mut src = source::Config::builder()
        .sheet(args.sheet)
        .skip(args.skip)
        .delim(args.delim.as_str())
        .charset(args.charset.as_str())
        .columns(args.columns.as_str())
        .build();
    src.open(file).whatever_context("open input")?;

    let dsn = args
        .connect
        .clone()
        .or_else(|| env_dsn(&["BRUNO_ID"]))
        .whatever_context("no database given (--connect, DB_ID or BRUNO_ID)")?;
    let db = connector(&dsn).whatever_context("connect")?;
    let mut conn = db.connect().whatever_context("connect")?;

    let fixed = fixed_params(&args.fix, file).whatever_context("fixed parameters")?;
    let st = Statement::prepare(conn.as_mut(), &args.call, &fixed).whatever_context("prepare call")?;
    log::info!("qry={}", st.sql);

    let opts = RunOptions::builder()
        .call_ret_ok(args.call_ret_ok)
        .one_tx(args.one_tx)
        .build();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut err_out = io::stderr();
    let n = foreach::run(&ctx, conn.as_mut(), &st, &opts, &src, &mut out, &mut err_out).whatever_context("run")?;
    log::info!("calls={n}");
    Ok(())
}
