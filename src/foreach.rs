//! Calls a statement or stored procedure once for every row of a file.

use crate::context::{Canceled, Cancellation, Context};
use crate::db::{self, rewrite_placeholders, Connection, Dialect, Value};
use crate::source;
use chrono::{NaiveDate, NaiveDateTime};
use minijinja::Environment;
use serde_json::json;
use snafu::prelude::*;
use std::io::{self, Write};
use std::time::Instant;
use thiserror::Error;
use typed_builder::TypedBuilder;

pub const DEFAULT_CALL: &str = "DBMS_OUTPUT.PUT_LINE";
pub const DEFAULT_FIXED: &str = "p_file_name=>{{ file_name }}";

#[non_exhaustive]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Db { source: db::Error },

    #[snafu(display("Error reading source: {}", source))]
    Read { source: source::Error },

    #[snafu(display("Bad fixed parameter {:?}, expected name=>template", item))]
    FixedParam { item: String },

    #[snafu(display("Error rendering fixed parameter {}: {}", name, source))]
    Template { name: String, source: minijinja::Error },

    #[snafu(display("Bad function name: {}", name))]
    BadName { name: String },

    #[snafu(display("{} has no arguments", name))]
    NoArguments { name: String },

    #[snafu(display("convert {:?} (row {}, col {}): {}", value, line, column, source))]
    Convert {
        line: usize,
        column: usize,
        value: String,
        source: DateError,
    },

    #[snafu(display("returned {} ({}) for line {} ({:?})", ret, fixed, line, values))]
    ReturnCode {
        ret: i64,
        fixed: String,
        line: usize,
        values: Vec<String>,
    },

    #[snafu(display("Error writing output: {}", source))]
    Write { source: io::Error },
}

impl Cancellation for Error {
    fn is_cancellation(&self) -> bool {
        match self {
            Error::Db { source } => source.is_cancellation(),
            Error::Read { source } => source.is_cancellation(),
            _ => false,
        }
    }
}

impl From<db::Error> for Error {
    fn from(source: db::Error) -> Self {
        Error::Db { source }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateError {
    #[error("date {0:?} too short")]
    TooShort(String),
    #[error("date {0:?} is not valid")]
    Invalid(String),
}

/// Reads a date out of the digit groups of `s`. `mm/dd/yyyy` is reordered,
/// groups are zero padded into `YYYYMMDDhhmmss`. No digits at all is NULL.
pub fn str_to_date(s: &str) -> Result<Option<NaiveDateTime>, DateError> {
    let mut fields: Vec<&str> = s
        .split(|c: char| !c.is_ascii_digit())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        return Ok(None);
    }
    if fields.len() >= 3 && fields[0].len() < 4 && fields[2].len() == 4 {
        fields[..3].rotate_right(1);
    }
    let mut digits = String::with_capacity(14);
    for (i, field) in fields.iter().enumerate() {
        let width = if i == 0 { 4 } else { 2 };
        for _ in field.len()..width {
            digits.push('0');
        }
        digits.push_str(field);
    }
    digits.truncate(14);
    if digits.len() < 8 {
        return Err(DateError::TooShort(digits));
    }
    if digits.len() == 14 {
        return NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S")
            .map(Some)
            .map_err(|_| DateError::Invalid(digits));
    }
    NaiveDate::parse_from_str(&digits[..8], "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(Some)
        .ok_or(DateError::Invalid(digits))
}

/// `name=>template,…`, each template rendered with `file_name` in scope.
pub fn fixed_params(spec: &str, file_name: &str) -> Result<Vec<(String, String)>, Error> {
    if spec.trim().is_empty() {
        return Ok(Vec::new());
    }
    let env = Environment::new();
    let ctx = json!({ "file_name": file_name });
    spec.split(',')
        .map(|item| {
            let (name, template) = item.split_once("=>").context(FixedParamSnafu { item })?;
            let name = name.trim();
            let value = env
                .render_str(template, &ctx)
                .context(TemplateSnafu { name })?;
            Ok((name.to_owned(), value))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conv {
    Text,
    Date,
}

/// What feeds one bind position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// The next value of the row.
    Input(Conv),
    /// An output argument; bound as NULL and not read back.
    Output,
    Fixed(String),
}

/// A procedure argument as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    /// Empty for the return value of a function.
    pub name: String,
    pub typ: String,
    pub in_out: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub slots: Vec<Slot>,
    /// The call yields an integer status.
    pub returns: bool,
}

fn bind_names(sql: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != ':' {
            continue;
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || (c == '_' && !name.is_empty()) {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if !name.is_empty() {
            names.push(name);
        }
    }
    names
}

impl Statement {
    /// A statement written out in full. It returns a status when `:=` precedes
    /// the first `(`, or when it is a `SELECT`.
    pub fn literal(sql: &str, dialect: Dialect) -> Statement {
        let sql = sql.trim();
        let head = &sql[..sql.find('(').unwrap_or(sql.len())];
        let assigns = head.contains(":=");
        let selects = sql.get(..7).is_some_and(|h| h.eq_ignore_ascii_case("SELECT "));
        let (rewritten, names) = rewrite_placeholders(sql, dialect);
        // Oracle binds every occurrence
        let count = if dialect == Dialect::Oracle {
            bind_names(sql).len()
        } else {
            names.len()
        };
        Statement {
            sql: rewritten,
            slots: vec![Slot::Input(Conv::Text); count.saturating_sub(usize::from(assigns))],
            returns: assigns || selects,
        }
    }

    /// `BEGIN [:x1 := ]name(arg=>:xN, …); END;` over the catalog arguments,
    /// with the fixed parameters last.
    pub fn for_call(name: &str, args: &[Arg], fixed: &[(String, String)]) -> Statement {
        let mut sql = String::from("BEGIN ");
        let mut args = args;
        let mut i = 1;
        let returns = args.first().is_some_and(|a| a.name.is_empty());
        if returns {
            sql.push_str(":x1 := ");
            args = &args[1..];
            i += 1;
        }
        let fixed_names: Vec<String> = fixed.iter().map(|(n, _)| n.to_uppercase()).collect();
        let mut slots = Vec::with_capacity(args.len() + fixed.len());
        let mut binds = Vec::with_capacity(args.len() + fixed.len());
        for arg in args.iter().filter(|a| !fixed_names.contains(&a.name.to_uppercase())) {
            binds.push(format!("{}=>:x{i}", arg.name.to_lowercase()));
            slots.push(if arg.in_out == "OUT" {
                Slot::Output
            } else if arg.typ == "DATE" {
                Slot::Input(Conv::Date)
            } else {
                Slot::Input(Conv::Text)
            });
            i += 1;
        }
        for (name, value) in fixed {
            binds.push(format!("{name}=>:x{i}"));
            slots.push(Slot::Fixed(value.clone()));
            i += 1;
        }
        sql.push_str(&format!("{name}({}); END;", binds.join(", ")));
        Statement { sql, slots, returns }
    }

    /// Literal statements are used as they are; a bare name is looked up in
    /// the catalog (Oracle only).
    pub fn prepare(conn: &mut dyn Connection, call: &str, fixed: &[(String, String)]) -> Result<Statement, Error> {
        let call = call.trim();
        if call.contains(char::is_whitespace) {
            return Ok(Statement::literal(call, conn.dialect()));
        }
        if conn.dialect() != Dialect::Oracle {
            return Err(db::Error::Unsupported {
                what: "procedure argument lookup".to_owned(),
                dialect: conn.dialect(),
            }
            .into());
        }
        let parts: Vec<&str> = call.split('.').collect();
        let base = "SELECT argument_name, data_type, in_out FROM all_arguments WHERE ";
        let filter = match parts.len() {
            1 => "owner = SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA') AND package_name IS NULL AND object_name = UPPER(:1)",
            2 => "owner = SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA') AND package_name = UPPER(:1) AND object_name = UPPER(:2)",
            3 => "owner = UPPER(:1) AND package_name = UPPER(:2) AND object_name = UPPER(:3)",
            _ => return BadNameSnafu { name: call }.fail(),
        };
        let sql = format!("{base}{filter} ORDER BY sequence");
        let params: Vec<Value> = parts.iter().map(|p| Value::Text((*p).to_owned())).collect();
        let rows = conn.query_rows(&sql, &params)?;
        let text = |v: Option<&Value>| v.and_then(Value::as_text).map(|t| t.into_owned()).unwrap_or_default();
        let args: Vec<Arg> = rows
            .rows
            .iter()
            .map(|row| Arg {
                name: text(row.first()),
                typ: text(row.get(1)),
                in_out: text(row.get(2)),
            })
            .collect();
        ensure!(!args.is_empty(), NoArgumentsSnafu { name: call });
        let st = Statement::for_call(call, &args, fixed);
        log::debug!("qry={} slots={:?}", st.sql, st.slots);
        Ok(st)
    }

    /// Bind values for one row; missing trailing inputs are empty strings.
    pub fn bind(&self, line: usize, values: &[String]) -> Result<Vec<Value>, Error> {
        let inputs = self.slots.iter().filter(|s| matches!(s, Slot::Input(_))).count();
        if values.len() > inputs {
            log::warn!("converter number mismatch values={} params={inputs}", values.len());
        }
        let mut next = values.iter().enumerate();
        let mut binds = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let value = match slot {
                Slot::Output => Value::Null,
                Slot::Fixed(value) => Value::Text(value.clone()),
                Slot::Input(conv) => match (next.next(), conv) {
                    (None, _) => Value::Text(String::new()),
                    (Some((_, s)), Conv::Text) => Value::Text(s.clone()),
                    (Some((j, s)), Conv::Date) => match str_to_date(s) {
                        Ok(Some(dt)) => Value::Date(dt),
                        Ok(None) => Value::Null,
                        Err(source) => {
                            return Err(Error::Convert {
                                line,
                                column: j + 1,
                                value: s.clone(),
                                source,
                            })
                        }
                    },
                },
            };
            binds.push(value);
        }
        Ok(binds)
    }

    fn fixed(&self) -> String {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Fixed(v) => Some(v.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RunOptions {
    /// Status meaning success.
    #[builder(default)]
    pub call_ret_ok: i64,
    /// One transaction for the whole file instead of a commit per row.
    #[builder(default = true)]
    pub one_tx: bool,
}

struct Runner<'a> {
    conn: &'a mut dyn Connection,
    st: &'a Statement,
    opts: &'a RunOptions,
    out: &'a mut dyn Write,
    err_out: &'a mut dyn Write,
    in_tx: bool,
    done: u64,
}

impl Runner<'_> {
    fn row(&mut self, row: source::Row) -> Result<(), Error> {
        log::debug!("row line={} values={:?}", row.line, row.values);
        if !self.in_tx {
            self.conn.begin()?;
            self.in_tx = true;
        }
        let binds = self.st.bind(row.line, &row.values)?;
        log::info!("exec values={binds:?}");
        let ret = match self.conn.call(&self.st.sql, &binds, self.st.returns) {
            Ok(ret) => ret,
            Err(err) => {
                log::error!("execute qry={} line={} values={binds:?} error={err}", self.st.sql, row.line);
                return Err(err.into());
            }
        };
        self.done += 1;
        if let Some(ret) = ret {
            let fixed = self.st.fixed();
            let values = format!("[{}]", row.values.join(" "));
            if ret == self.opts.call_ret_ok {
                writeln!(self.out, "{ret}: OK [{fixed}]\t{values}").context(WriteSnafu)?;
                return self.commit_row();
            }
            writeln!(self.err_out, "{ret}: {fixed}\t{values}").context(WriteSnafu)?;
            log::warn!("ROLLBACK ret={ret}");
            self.conn.rollback()?;
            self.in_tx = false;
            let mut line = csv::Writer::from_writer(Vec::new());
            let mut record = vec![ret.to_string(), fixed.clone()];
            record.extend(row.values.iter().cloned());
            line.write_record(&record).map_err(io::Error::from).context(WriteSnafu)?;
            let bytes = line.into_inner().map_err(|err| err.into_error()).context(WriteSnafu)?;
            self.out.write_all(&bytes).context(WriteSnafu)?;
            if self.opts.one_tx {
                return ReturnCodeSnafu {
                    ret,
                    fixed,
                    line: row.line,
                    values: row.values,
                }
                .fail();
            }
        }
        self.commit_row()
    }

    fn commit_row(&mut self) -> Result<(), Error> {
        if self.in_tx && !self.opts.one_tx {
            log::info!("COMMIT");
            self.conn.commit()?;
            self.in_tx = false;
        }
        Ok(())
    }
}

/// Executes `st` for every non-empty row of `src`, returning the number of calls.
pub fn run(
    ctx: &Context,
    conn: &mut dyn Connection,
    st: &Statement,
    opts: &RunOptions,
    src: &source::Config,
    out: &mut dyn Write,
    err_out: &mut dyn Write,
) -> Result<u64, Error> {
    let start = Instant::now();
    let mut runner = Runner {
        conn,
        st,
        opts,
        out,
        err_out,
        in_tx: false,
        done: 0,
    };
    let mut failure = None;
    let res = src.read_rows(ctx, |_, row| {
        if row.is_empty() {
            return Ok(());
        }
        runner.row(row).map_err(|err| {
            failure = Some(err);
            source::Error::from(Canceled::Canceled)
        })
    });
    let result = match (failure, res) {
        (Some(err), _) => Err(err),
        (None, Err(source)) => Err(Error::Read { source }),
        (None, Ok(())) if runner.in_tx => {
            log::info!("COMMIT");
            runner.in_tx = false;
            runner.conn.commit().map_err(Error::from)
        }
        (None, Ok(())) => Ok(()),
    };
    if runner.in_tx {
        if let Err(err) = runner.conn.rollback() {
            log::warn!("ROLLBACK: {err}");
        }
    }
    runner.out.flush().context(WriteSnafu)?;
    log::info!("processed rows={} dur={:?}", runner.done, start.elapsed());
    result.map(|()| runner.done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Connector, SqliteConnector};

    fn date(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).and_then(|d| d.and_hms_opt(hh, mm, ss))
    }

    #[test]
    fn dates() {
        assert_eq!(str_to_date("2024-03-15").unwrap(), date(2024, 3, 15, 0, 0, 0));
        assert_eq!(str_to_date("03/15/2024").unwrap(), date(2024, 3, 15, 0, 0, 0));
        assert_eq!(str_to_date("2024.3.5 7:08:09").unwrap(), date(2024, 3, 5, 7, 8, 9));
        assert_eq!(str_to_date("2024-03-15 10").unwrap(), date(2024, 3, 15, 0, 0, 0));
        assert_eq!(str_to_date("").unwrap(), None);
        assert_eq!(str_to_date("n/a").unwrap(), None);
        assert_eq!(str_to_date("12"), Err(DateError::TooShort("0012".into())));
        assert!(matches!(str_to_date("2024-13-40"), Err(DateError::Invalid(_))));
    }

    #[test]
    fn fixed() {
        let got = fixed_params("p_file_name=>{{ file_name }}, p_x=>a", "/tmp/in.csv").unwrap();
        assert_eq!(
            got,
            vec![
                ("p_file_name".to_owned(), "/tmp/in.csv".to_owned()),
                ("p_x".to_owned(), "a".to_owned())
            ]
        );
        assert!(fixed_params("", "x").unwrap().is_empty());
        assert!(matches!(fixed_params("nope", "x"), Err(Error::FixedParam { .. })));
    }

    #[test]
    fn literal_statements() {
        let st = Statement::literal("BEGIN :ret := pkg.fn(:a, :b_1); END;", Dialect::Oracle);
        assert!(st.returns);
        assert_eq!(st.slots.len(), 2);
        assert_eq!(st.sql, "BEGIN :ret := pkg.fn(:a, :b_1); END;");

        let st = Statement::literal("BEGIN pkg.proc(p_a => :a); END;", Dialect::Oracle);
        assert!(!st.returns);
        assert_eq!(st.slots, vec![Slot::Input(Conv::Text)]);

        let st = Statement::literal("SELECT f(:a, :b)", Dialect::Sqlite);
        assert!(st.returns);
        assert_eq!(st.sql, "SELECT f(?1, ?2)");
        assert_eq!(bind_names(":a, :_b, :c_d"), vec!["a", "c_d"]);
    }

    #[test]
    fn literal_with_multibyte_head() {
        let st = Statement::literal("SELECTÉ", Dialect::Sqlite);
        assert!(!st.returns);
        let st = Statement::literal("select 1", Dialect::Sqlite);
        assert!(st.returns);
    }

    #[test]
    fn catalog_calls() {
        let arg = |name: &str, typ: &str, in_out: &str| Arg {
            name: name.into(),
            typ: typ.into(),
            in_out: in_out.into(),
        };
        let args = vec![
            arg("", "NUMBER", "OUT"),
            arg("P_DAY", "DATE", "IN"),
            arg("P_NAME", "VARCHAR2", "IN"),
            arg("P_MSG", "VARCHAR2", "OUT"),
            arg("P_FILE_NAME", "VARCHAR2", "IN"),
        ];
        let fixed = vec![("p_file_name".to_owned(), "in.csv".to_owned())];
        let st = Statement::for_call("pkg.load", &args, &fixed);
        assert!(st.returns);
        assert_eq!(
            st.sql,
            "BEGIN :x1 := pkg.load(p_day=>:x2, p_name=>:x3, p_msg=>:x4, p_file_name=>:x5); END;"
        );
        let binds = st.bind(3, &["2024-01-02".into()]).unwrap();
        assert_eq!(
            binds,
            vec![
                Value::Date(date(2024, 1, 2, 0, 0, 0).unwrap()),
                Value::Text(String::new()),
                Value::Null,
                Value::Text("in.csv".into()),
            ]
        );
        assert_eq!(st.bind(3, &["n/a".into()]).unwrap()[0], Value::Null);
        match st.bind(3, &["12".into()]) {
            Err(Error::Convert { line: 3, column: 1, .. }) => (),
            other => panic!("{other:?}"),
        }
    }

    fn fixture(data: &str) -> (tempfile::TempDir, source::Config) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, data).unwrap();
        let mut src = source::Config::builder().skip(1).build();
        src.open(path.to_str().unwrap()).unwrap();
        (dir, src)
    }

    #[test]
    fn runs_statements() {
        let (_dir, src) = fixture("a;b\n1;x\n;\n2;y\n3\n");
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        conn.execute("CREATE TABLE t (a INTEGER, b TEXT)", &[]).unwrap();

        let st = Statement::prepare(conn.as_mut(), "INSERT INTO t (a, b) VALUES (:a, :b)", &[]).unwrap();
        let (mut out, mut err_out) = (Vec::new(), Vec::new());
        let opts = RunOptions::builder().build();
        let n = run(&Context::background(), conn.as_mut(), &st, &opts, &src, &mut out, &mut err_out).unwrap();
        assert_eq!(n, 3);
        let rows = conn.query_rows("SELECT a, b FROM t ORDER BY a", &[]).unwrap();
        assert_eq!(
            rows.rows,
            vec![
                vec![Value::Int(1), Value::Text("x".into())],
                vec![Value::Int(2), Value::Text("y".into())],
                vec![Value::Int(3), Value::Text(String::new())],
            ]
        );
    }

    #[test]
    fn status_codes() {
        let (_dir, src) = fixture("v\nok\nbad\nok2\n");
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        let st = Statement::prepare(
            conn.as_mut(),
            "SELECT CASE WHEN :v = 'bad' THEN 7 ELSE 0 END",
            &[],
        )
        .unwrap();

        let (mut out, mut err_out) = (Vec::new(), Vec::new());
        let opts = RunOptions::builder().build();
        let err = run(&Context::background(), conn.as_mut(), &st, &opts, &src, &mut out, &mut err_out).unwrap_err();
        assert!(matches!(err, Error::ReturnCode { ret: 7, line: 2, .. }), "{err:?}");
        assert_eq!(String::from_utf8(out).unwrap(), "0: OK []\t[ok]\n7,,bad\n");
        assert_eq!(String::from_utf8(err_out).unwrap(), "7: \t[bad]\n");

        let (mut out, mut err_out) = (Vec::new(), Vec::new());
        let opts = RunOptions::builder().one_tx(false).build();
        let n = run(&Context::background(), conn.as_mut(), &st, &opts, &src, &mut out, &mut err_out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "0: OK []\t[ok]\n7,,bad\n0: OK []\t[ok2]\n");
    }

    struct Full;

    impl Write for Full {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rejected_line_write_failure_is_returned() {
        let (_dir, src) = fixture("v\nbad\n");
        let connector = SqliteConnector::open(":memory:").unwrap();
        let mut conn = connector.connect().unwrap();
        let st = Statement::prepare(conn.as_mut(), "SELECT CASE WHEN :v = 'bad' THEN 7 ELSE 0 END", &[]).unwrap();

        let mut err_out = Vec::new();
        let opts = RunOptions::builder().one_tx(false).build();
        let err = run(&Context::background(), conn.as_mut(), &st, &opts, &src, &mut Full, &mut err_out).unwrap_err();
        assert!(matches!(err, Error::Write { .. }), "{err:?}");
        assert_eq!(String::from_utf8(err_out).unwrap(), "7: \t[bad]\n");
    }
}
