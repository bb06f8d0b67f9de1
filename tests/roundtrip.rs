use dbcsv::context::Context;
use dbcsv::db::{Connector, SqliteConnector};
use dbcsv::dump::{self, dump_csv, parse_sheet, sorted_query, CsvOptions};
use dbcsv::load::{self, Options};
use dbcsv::markdown;
use dbcsv::source::Config;
use insta::assert_snapshot;

fn loaded(dir: &std::path::Path) -> SqliteConnector {
    let csv = dir.join("people.csv");
    std::fs::write(&csv, "id;str;born\n2;s2;1990-05-06 00:00:00\n0;s0;\n1;\"a|b\";2001-01-02 03:04:05\n").unwrap();
    let mut src = Config::builder().build();
    src.open(csv.to_str().unwrap()).unwrap();
    let connector = SqliteConnector::open(dir.join("rt.db").to_str().unwrap()).unwrap();
    let opts = Options::builder().table("people").concurrency(1).build();
    let summary = load::load(&Context::background(), &connector, &opts, &src).unwrap();
    assert_eq!(summary.inserted, 3);
    connector
}

#[test]
fn load_then_dump_csv() {
    let dir = tempfile::tempdir().unwrap();
    let connector = loaded(dir.path());
    let mut conn = connector.connect().unwrap();
    let sql = sorted_query(conn.as_mut(), "SELECT * FROM PEOPLE").unwrap();
    assert_eq!(sql, "SELECT * FROM PEOPLE ORDER BY 1,2,3");

    let mut out = Vec::new();
    let n = dump_csv(&Context::background(), conn.as_mut(), &sql, &[], &CsvOptions::builder().build(), &mut out).unwrap();
    assert_eq!(n, 3);
    assert_snapshot!(String::from_utf8(out).unwrap(), @r###"
    ID,STR,BORN
    0,s0,
    1,a|b,2001-01-02T03:04:05
    2,s2,1990-05-06T00:00:00
    "###);
}

#[test]
fn load_then_workbook_then_markdown() {
    let dir = tempfile::tempdir().unwrap();
    let connector = loaded(dir.path());
    let mut conn = connector.connect().unwrap();
    let path = dir.path().join("out").join("people.xlsx");
    let path = path.to_str().unwrap();
    let sheets = vec![parse_sheet(0, "people:SELECT ID, STR FROM PEOPLE ORDER BY ID")];
    dump::dump_sheets(&Context::background(), conn.as_mut(), &sheets, true, dump::DEFAULT_DATE_LAYOUT, path).unwrap();

    let out = markdown::write_file(&Context::background(), path, Vec::new()).unwrap();
    assert_snapshot!(String::from_utf8(out).unwrap(), @r###"
    # people
    | ID | STR |
    | -- | --- |
    | 0 | s0 |
    | 1 | a&#124;b |
    | 2 | s2 |
    "###);
}
