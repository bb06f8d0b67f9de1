use crate::convert::{parse_date, reference_width};

/// Column classification from sample values. `Unknown` means only empty values were seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Kind {
    #[default]
    Unknown,
    String,
    Integer,
    Float,
    Date,
}

/// Classifies one sample value.
pub fn type_of(s: &str, force_string: bool, date_layout: &str) -> Kind {
    if force_string {
        return Kind::String;
    }
    if s.is_empty() {
        return Kind::Unknown;
    }
    let mut non_digit = false;
    let mut dots = 0;
    for c in s.chars() {
        if c == '.' {
            dots += 1;
        } else if !c.is_ascii_digit() {
            non_digit = true;
        }
    }
    if !non_digit && !s.starts_with('0') {
        match dots {
            0 => return Kind::Integer,
            1 => return Kind::Float,
            _ => (),
        }
    }
    let max = reference_width(date_layout).unwrap_or(0);
    if 10 <= s.len() && s.len() <= max && parse_date(s, date_layout).is_some() {
        return Kind::Date;
    }
    Kind::String
}

/// Running classification and width of one column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inferred {
    pub kind: Kind,
    /// Longest value seen, in bytes.
    pub width: usize,
}

impl Inferred {
    pub fn observe(&mut self, value: &str, force_string: bool, date_layout: &str) {
        self.width = self.width.max(value.len());
        if self.kind == Kind::String {
            return;
        }
        let kind = type_of(value, force_string, date_layout);
        if kind == Kind::Unknown {
            return;
        }
        if self.kind == Kind::Unknown {
            self.kind = kind;
        } else if kind != self.kind {
            self.kind = Kind::String;
        }
    }
}

/// Folds sample rows into per-column [`Inferred`] values.
#[derive(Debug, Clone)]
pub struct Inferencer {
    columns: Vec<Inferred>,
    force_string: bool,
    date_layout: String,
}

impl Inferencer {
    pub fn new(width: usize, force_string: bool, date_layout: &str) -> Self {
        let kind = if force_string { Kind::String } else { Kind::Unknown };
        Inferencer {
            columns: vec![Inferred { kind, width: 0 }; width],
            force_string,
            date_layout: date_layout.to_owned(),
        }
    }

    /// Values beyond the header width are ignored.
    pub fn observe(&mut self, values: &[String]) {
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.observe(value, self.force_string, &self.date_layout);
        }
    }

    pub fn finish(self) -> Vec<Inferred> {
        self.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

    #[test]
    fn single_values() {
        let cases = [
            ("", Kind::Unknown),
            ("123", Kind::Integer),
            ("12.5", Kind::Float),
            ("0123", Kind::String),
            ("1.2.3", Kind::String),
            ("-1", Kind::String),
            ("2024-02-29", Kind::Date),
            ("2024-02-29 13:45", Kind::Date),
            ("2024-02-30", Kind::String),
            ("2024-02-29 13:45:00 extra", Kind::String),
            ("alma", Kind::String),
        ];
        for (value, want) in cases {
            assert_eq!(type_of(value, false, LAYOUT), want, "{value:?}");
        }
        assert_eq!(type_of("123", true, LAYOUT), Kind::String);
    }

    #[test]
    fn conflicts_widen_to_string() {
        let mut col = Inferred::default();
        for v in ["", "1", "22", ""] {
            col.observe(v, false, LAYOUT);
        }
        assert_eq!(col, Inferred { kind: Kind::Integer, width: 2 });
        col.observe("3.5", false, LAYOUT);
        assert_eq!(col.kind, Kind::String);
        col.observe("4", false, LAYOUT);
        assert_eq!(col.kind, Kind::String);
    }

    #[test]
    fn order_does_not_matter() {
        let samples = ["1", "", "2024-01-01", "7", "x"];
        let mut kinds = Vec::new();
        for rotation in 0..samples.len() {
            let mut col = Inferred::default();
            for i in 0..samples.len() {
                col.observe(samples[(i + rotation) % samples.len()], false, LAYOUT);
            }
            kinds.push(col);
        }
        assert!(kinds.iter().all(|k| *k == Inferred { kind: Kind::String, width: 10 }));
    }

    #[test]
    fn rows_fold_per_column() {
        let mut inf = Inferencer::new(2, false, LAYOUT);
        inf.observe(&["1".into(), "alma".into(), "ignored".into()]);
        inf.observe(&["20".into()]);
        let got = inf.finish();
        assert_eq!(got[0], Inferred { kind: Kind::Integer, width: 2 });
        assert_eq!(got[1], Inferred { kind: Kind::String, width: 4 });
    }
}
