use clap::{ArgAction, Parser};
use dbcsv::context::Context;
use dbcsv::copy::{self, parse_replace, CopyTask, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY};
use dbcsv::{connector, env_dsn, init_logging, parse_duration};
use snafu::{OptionExt, ResultExt, Whatever};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

/// Copies tables between two databases. Tasks are `src [where [dst]]` on the
/// command line, or `src[=dst] [where]` lines on standard input.
#[derive(Parser, Debug)]
#[command(name = "tablecopy", version)]
struct Args {
    /// Connection string to read from
    #[arg(long, env = "DB_ID")]
    src: Option<String>,

    /// Statements run on the source connection, separated by ;\n
    #[arg(long, default_value = "")]
    src_prep: String,

    /// Connection string to write to
    #[arg(long, env = "DB_ID")]
    dst: Option<String>,

    #[arg(long, default_value = "")]
    dst_prep: String,

    /// FIELD_NAME=WITH_VALUE,OTHER=NEXT
    #[arg(long, default_value = "")]
    replace: String,

    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    timeout: Duration,

    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    table_timeout: Duration,

    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Truncate destination tables (must differ from the source)
    #[arg(long)]
    truncate: bool,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    tasks: Vec<String>,
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    init_logging(args.verbose > 0);
    let ctx = Context::background().with_timeout(args.timeout);

    let fallback = || env_dsn(&["BRUNO_ID"]);
    let src_dsn = args.src.clone().or_else(fallback).whatever_context("no source database")?;
    let dst_dsn = args.dst.clone().or_else(fallback).whatever_context("no destination database")?;

    let replace = parse_replace(&args.replace);
    let tasks: Vec<CopyTask> = if args.tasks.is_empty() {
        let mut tasks = Vec::new();
        for line in io::stdin().lock().lines() {
            let line = line.whatever_context("read tasks")?;
            tasks.extend(CopyTask::from_line(line.trim(), &replace, args.truncate));
        }
        tasks
    } else {
        CopyTask::from_args(&args.tasks, &replace, args.truncate).into_iter().collect()
    };

    let opts = copy::Options::builder()
        .batch_size(args.batch_size)
        .concurrency(args.concurrency)
        .table_timeout(args.table_timeout)
        .src_prep(args.src_prep.as_str())
        .dst_prep(args.dst_prep.as_str())
        .same_db(src_dsn == dst_dsn)
        .build();
    let src = connector(&src_dsn).whatever_context("connect source")?;
    let dst = if src_dsn == dst_dsn {
        Arc::clone(&src)
    } else {
        connector(&dst_dsn).whatever_context("connect destination")?
    };
    for (table, rows) in copy::copy_tables(&ctx, src, dst, tasks, &opts).whatever_context("copy")? {
        log::info!("copied table={table} rows={rows}");
    }
    Ok(())
}
