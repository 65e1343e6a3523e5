//! The dynamically typed value carried by data messages and stores.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

/// An `f64` with the IEEE 754 total order, so [`Data`] can be a map key.
#[derive(Clone, Copy, Debug, Default)]
pub struct Real(pub f64);

impl PartialEq for Real {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for Real {}

impl PartialOrd for Real {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Real {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Real {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A dynamically typed value. The sum type is closed; every variant has a
/// stable wire representation (see `wire`).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Data {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Real(Real),
    Str(String),
    Bytes(Bytes),
    List(Vec<Data>),
    Table(BTreeMap<Data, Data>),
    Set(BTreeSet<Data>),
    Record(Vec<Data>),
}

impl Data {
    pub fn is_nil(&self) -> bool {
        matches!(self, Data::Nil)
    }

    /// Short variant name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Data::Nil => "nil",
            Data::Bool(_) => "bool",
            Data::Integer(_) => "integer",
            Data::Real(_) => "real",
            Data::Str(_) => "string",
            Data::Bytes(_) => "bytes",
            Data::List(_) => "list",
            Data::Table(_) => "table",
            Data::Set(_) => "set",
            Data::Record(_) => "record",
        }
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Integer(value)
    }
}

impl From<i32> for Data {
    fn from(value: i32) -> Self {
        Data::Integer(value.into())
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Real(Real(value))
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Str(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Str(value)
    }
}

impl From<Bytes> for Data {
    fn from(value: Bytes) -> Self {
        Data::Bytes(value)
    }
}

impl From<Vec<Data>> for Data {
    fn from(value: Vec<Data>) -> Self {
        Data::List(value)
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Nil => write!(f, "nil"),
            Data::Bool(x) => write!(f, "{x}"),
            Data::Integer(x) => write!(f, "{x}"),
            Data::Real(x) => write!(f, "{}", x.0),
            Data::Str(x) => f.write_str(x),
            Data::Bytes(x) => {
                for byte in x.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Data::List(xs) => write_seq(f, "[", "]", xs.iter()),
            Data::Table(xs) => {
                f.write_str("{")?;
                for (i, (k, v)) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                f.write_str("}")
            }
            Data::Set(xs) => write_seq(f, "{", "}", xs.iter()),
            Data::Record(xs) => write_seq(f, "(", ")", xs.iter()),
        }
    }
}

fn write_seq<'a>(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    close: &str,
    items: impl Iterator<Item = &'a Data>,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(close)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_is_totally_ordered_across_variants() {
        let mut table = BTreeMap::new();
        table.insert(Data::from("k"), Data::from(1));
        let values = [
            Data::Nil,
            Data::from(true),
            Data::from(-3),
            Data::from(1.5),
            Data::from("x"),
            Data::Table(table),
        ];
        // Data must be usable as a BTreeMap key, NaN included.
        let mut keys = BTreeSet::new();
        for v in values {
            keys.insert(v);
        }
        keys.insert(Data::from(f64::NAN));
        keys.insert(Data::from(f64::NAN));
        assert_eq!(keys.len(), 7);
    }

    #[test]
    fn display_matches_event_log_expectations() {
        assert_eq!(Data::from("world").to_string(), "world");
        assert_eq!(Data::from(123).to_string(), "123");
        assert_eq!(Data::Nil.to_string(), "nil");
        let list = Data::List(vec![Data::from("a"), Data::from(1)]);
        assert_eq!(list.to_string(), "[a, 1]");
    }
}
