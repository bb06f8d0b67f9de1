//! Moves tabular data between relational databases and CSV, XLS, XLSX and ODS
//! files: bulk loading, dumping, table copy, per-row procedure calls, parallel
//! JSON export and markdown rendering.

pub mod charset;
pub mod context;
pub mod convert;
pub mod copy;
pub mod db;
pub mod detect;
pub mod dump;
pub mod foreach;
pub mod infer;
pub mod load;
pub mod markdown;
pub mod paraexp;
pub mod provision;
pub mod source;
pub mod xlsx;

pub use context::{Canceled, Cancellation, Context};
pub use db::{connector, Connection, Connector, Dialect, Value};
pub use source::{Config, Row};

use std::time::Duration;

/// First non-empty of the given environment variables.
pub fn env_dsn(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("bad duration {0:?}, expected a number with an ms, s, m or h suffix")]
pub struct BadDuration(pub String);

/// `500ms`, `10s`, `15m`, `1h`; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, BadDuration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (n, unit) = s.split_at(split);
    let n: u64 = n.parse().map_err(|_| BadDuration(s.to_owned()))?;
    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "" | "s" => Some(n),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        _ => None,
    };
    secs.map(Duration::from_secs).ok_or_else(|| BadDuration(s.to_owned()))
}

/// Log level filter for the binaries: `debug` when verbose, else `warn`.
/// `RUST_LOG` wins when set.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_from_env() {
        std::env::set_var("DBCSV_TEST_EMPTY", " ");
        std::env::set_var("DBCSV_TEST_SET", "sqlite::memory:");
        assert_eq!(
            env_dsn(&["DBCSV_TEST_MISSING", "DBCSV_TEST_EMPTY", "DBCSV_TEST_SET"]).as_deref(),
            Some("sqlite::memory:")
        );
        assert_eq!(env_dsn(&["DBCSV_TEST_MISSING"]), None);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("15m"), Ok(Duration::from_secs(900)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("3d").is_err());
        assert_eq!(
            parse_duration(&format!("{}h", u64::MAX / 1000)),
            Err(BadDuration(format!("{}h", u64::MAX / 1000)))
        );
    }
}
