use dbcsv::context::{Cancellation, Context};
use dbcsv::convert::ValueKind;
use dbcsv::db::{Connector, SqliteConnector, Value};
use dbcsv::load::{self, Options};
use dbcsv::provision::table_columns;
use dbcsv::source::Config;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

fn write_csv(dir: &Path, rows: usize) -> String {
    let mut data = String::from("id;str\n");
    for i in 0..rows {
        writeln!(data, "{i};s{i}").unwrap();
    }
    let path = dir.join("data.csv");
    std::fs::write(&path, data).unwrap();
    path.to_str().unwrap().to_owned()
}

fn open(path: &str) -> Config {
    let mut src = Config::builder().build();
    src.open(path).unwrap();
    src
}

fn count(connector: &dyn Connector, table: &str) -> Value {
    let mut conn = connector.connect().unwrap();
    let rows = conn.query_rows(&format!("SELECT COUNT(*) FROM {table}"), &[]).unwrap();
    rows.rows[0][0].clone()
}

#[test]
fn loads_new_table_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let src = open(&write_csv(dir.path(), 1000));
    let connector = SqliteConnector::open(dir.path().join("load.db").to_str().unwrap()).unwrap();

    let opts = Options::builder().table("t").batch_size(100).concurrency(4).build();
    let summary = load::load(&Context::background(), &connector, &opts, &src).unwrap();
    assert_eq!(summary.read, 1000);
    assert_eq!(summary.inserted, 1000);
    assert_eq!(count(&connector, "t"), Value::Int(1000));

    let mut conn = connector.connect().unwrap();
    let kinds: Vec<(String, ValueKind)> = table_columns(conn.as_mut(), "T")
        .unwrap()
        .into_iter()
        .map(|c| (c.name, c.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![("ID".to_owned(), ValueKind::Integer), ("STR".to_owned(), ValueKind::String)]
    );
    let rows = conn.query_rows("SELECT MAX(ID), MIN(STR) FROM T", &[]).unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Int(999), Value::Text("s0".into())]]);
}

#[test]
fn failing_row_is_found_by_replay() {
    let dir = tempfile::tempdir().unwrap();
    let src = open(&write_csv(dir.path(), 30));
    let connector = SqliteConnector::open(dir.path().join("load.db").to_str().unwrap()).unwrap();
    let mut conn = connector.connect().unwrap();
    conn.execute("CREATE TABLE T (ID INTEGER CHECK (ID <> 7), STR TEXT)", &[])
        .unwrap();

    let opts = Options::builder().table("t").batch_size(10).concurrency(1).build();
    let err = load::load(&Context::background(), &connector, &opts, &src).unwrap_err();
    assert!(!err.is_cancellation());
    match err {
        load::Error::Exec { row, values, .. } => {
            assert_eq!(row, 7);
            assert_eq!(values, "7, s7");
        }
        other => panic!("unexpected {other}"),
    }
    // batches commit on their own, so the rows before the bad one stay
    assert_eq!(count(&connector, "T"), Value::Int(7));
}

#[test]
fn lob_tables_load_row_by_row() {
    let dir = tempfile::tempdir().unwrap();
    let src = open(&write_csv(dir.path(), 25));
    let connector = SqliteConnector::open(":memory:").unwrap();
    let mut conn = connector.connect().unwrap();
    conn.execute("CREATE TABLE DOCS (ID INTEGER, STR CLOB)", &[]).unwrap();

    let opts = Options::builder().table("docs").batch_size(10).concurrency(2).build();
    let summary = load::load(&Context::background(), &connector, &opts, &src).unwrap();
    assert_eq!(summary.inserted, 25);
    let rows = conn.query_rows("SELECT STR FROM DOCS WHERE ID = 24", &[]).unwrap();
    assert_eq!(rows.rows, vec![vec![Value::Text("s24".into())]]);
}

#[test]
fn canceled_load_is_a_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let src = open(&write_csv(dir.path(), 10));
    let connector = SqliteConnector::open(":memory:").unwrap();
    let ctx = Context::background();
    ctx.cancel();
    let opts = Options::builder().table("t").build();
    let err = load::load(&ctx, &connector, &opts, &src).unwrap_err();
    assert!(err.is_cancellation(), "{err}");
}

#[test]
fn deadline_during_load_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let src = open(&write_csv(dir.path(), 200_000));
    let connector = SqliteConnector::open(dir.path().join("load.db").to_str().unwrap()).unwrap();
    let mut conn = connector.connect().unwrap();
    conn.execute("CREATE TABLE T (ID INTEGER, STR TEXT)", &[]).unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let opts = Options::builder().table("t").batch_size(100).concurrency(2).build();
    let err = load::load(&ctx, &connector, &opts, &src).unwrap_err();
    assert!(err.is_cancellation(), "{err}");
    assert_eq!(err.to_string(), "context deadline exceeded");
    match count(&connector, "T") {
        Value::Int(n) => assert!(n < 200_000, "{n}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn non_empty_extra_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("extra.csv");
    std::fs::write(&path, "id;str\n1;a;;\n2;b;LOST;\n").unwrap();
    let src = open(path.to_str().unwrap());
    let connector = SqliteConnector::open(":memory:").unwrap();
    let mut conn = connector.connect().unwrap();
    conn.execute("CREATE TABLE T (ID INTEGER, STR TEXT)", &[]).unwrap();

    let opts = Options::builder().table("t").concurrency(1).build();
    let err = load::load(&Context::background(), &connector, &opts, &src).unwrap_err();
    match err {
        load::Error::TooManyFields { row, len, columns } => {
            assert_eq!((row, len, columns), (1, 4, 2));
        }
        other => panic!("unexpected {other}"),
    }
}
