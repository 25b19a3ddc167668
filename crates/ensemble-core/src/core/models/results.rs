use serde::{Deserialize, Serialize};
use std::fmt;

/// A single field of a result tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Integer(v) => write!(f, "{}", v),
            ResultValue::Real(v) => write!(f, "{}", v),
            ResultValue::Text(v) => f.write_str(v),
            ResultValue::Null => Ok(()),
        }
    }
}

impl From<i64> for ResultValue {
    fn from(value: i64) -> Self {
        ResultValue::Integer(value)
    }
}

impl From<f64> for ResultValue {
    fn from(value: f64) -> Self {
        ResultValue::Real(value)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        ResultValue::Text(value.to_string())
    }
}

impl From<String> for ResultValue {
    fn from(value: String) -> Self {
        ResultValue::Text(value)
    }
}

impl<T: Into<ResultValue>> From<Option<T>> for ResultValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ResultValue::Null)
    }
}

/// The ordered, fixed-arity record describing one completed unit. The coordinator passes it
/// to the result sink unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultTuple(Vec<ResultValue>);

impl ResultTuple {
    pub fn new(values: Vec<ResultValue>) -> Self {
        Self(values)
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[ResultValue] {
        &self.0
    }

    pub fn push(&mut self, value: impl Into<ResultValue>) {
        self.0.push(value.into());
    }
}

impl From<Vec<ResultValue>> for ResultTuple {
    fn from(values: Vec<ResultValue>) -> Self {
        Self(values)
    }
}

impl FromIterator<ResultValue> for ResultTuple {
    fn from_iter<I: IntoIterator<Item = ResultValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_preserves_order_and_types_through_json() {
        let mut row = ResultTuple::default();
        row.push(1_700_000_000_000_i64);
        row.push("A123G");
        row.push(12.5_f64);
        row.push(None::<f64>);

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[1700000000000,"A123G",12.5,null]"#);

        let back: ResultTuple = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
        assert_eq!(back.arity(), 4);
    }
}
