use clap::{ArgAction, Parser};
use dbcsv::context::Context;
use dbcsv::paraexp::{export, parse_value, Query};
use dbcsv::{connector, env_dsn, init_logging};
use snafu::{OptionExt, ResultExt, Whatever};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Runs `name:SELECT …` queries in parallel and writes every result into one
/// JSON array.
///
/// `paraexp --value v_id=1 'a:SELECT * FROM t WHERE id = :v_id' 'b:SELECT …'`
#[derive(Parser, Debug)]
#[command(name = "paraexp", version)]
struct Args {
    /// Database connection string
    #[arg(long, env = "DB_ID")]
    connect: Option<String>,

    /// Queries run at once, the number of CPUs when missing
    #[arg(long)]
    concurrency: Option<usize>,

    /// Output file, standard output when -
    #[arg(short, default_value = "-")]
    output: String,

    /// name=value, bound to :name on every query
    #[arg(long = "value")]
    values: Vec<String>,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    queries: Vec<String>,
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    init_logging(args.verbose > 0);
    let ctx = Context::background();

    let queries = args
        .queries
        .iter()
        .map(|q| Query::parse(q))
        .collect::<Result<Vec<_>, _>>()
        .whatever_context("bad query")?;
    let values = args
        .values
        .iter()
        .map(|v| parse_value(v))
        .collect::<Result<BTreeMap<_, _>, _>>()
        .whatever_context("bad value")?;
    let concurrency = args
        .concurrency
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1);

    let dsn = args
        .connect
        .clone()
        .or_else(|| env_dsn(&["BRUNO_ID"]))
        .whatever_context("no database given (--connect, DB_ID or BRUNO_ID)")?;
    let db = connector(&dsn).whatever_context("connect")?;

    let out: Box<dyn Write + Send> = if args.output.is_empty() || args.output == "-" {
        Box::new(io::stdout())
    } else {
        if let Some(dir) = Path::new(&args.output).parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).whatever_context("create output directory")?;
        }
        Box::new(File::create(&args.output).whatever_context("create output")?)
    };
    log::debug!("writing file={}", args.output);
    export(&ctx, db.as_ref(), &queries, &values, concurrency, BufWriter::new(out)).whatever_context("export")?;
    Ok(())
}
