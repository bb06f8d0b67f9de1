use clap::{ArgAction, Parser};
use dbcsv::context::Context;
use dbcsv::init_logging;
use dbcsv::markdown::write_file;
use snafu::{ResultExt, Whatever};
use std::io::{self, BufWriter};

/// Prints every sheet of a CSV, XLS, XLSX or ODS file as markdown tables.
#[derive(Parser, Debug)]
#[command(name = "csv2md", version)]
struct Args {
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Input file, standard input when missing or -
    file: Option<String>,
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    init_logging(args.verbose > 0);
    let stdout = io::stdout();
    write_file(
        &Context::background(),
        args.file.as_deref().unwrap_or("-"),
        BufWriter::new(stdout.lock()),
    )
    .whatever_context("csv2md")?;
    Ok(())
}
