use serde::{Deserialize, Serialize};

/// JSON-friendly representation of a normalized cell value.
///
/// The payload shape is directed by the owning [`crate::Field`]'s type, so
/// the enum is untagged: a single-select and a date both persist as a JSON
/// string, a multi-select as a string array, an attachment as whatever
/// structured blob the attachment collaborator stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Number(f64),
    Text(String),
    TextList(Vec<String>),
    Json(serde_json::Value),
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Null
    }
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<Option<f64>> for CellValue {
    fn from(value: Option<f64>) -> Self {
        value.map(CellValue::Number).unwrap_or(CellValue::Null)
    }
}

/// Output of the per-field validator: the normalized value plus the formula
/// bookkeeping the cell store persists alongside it.
///
/// Invariants: a non-formula cell never carries `formula_expr`; a formula
/// cell's value is forced to [`CellValue::Null`] here and only ever set by
/// the recomputation pass (`is_dirty` marks the gap in between).
#[derive(Clone, Debug, PartialEq)]
pub struct CoercedCell {
    pub value: CellValue,
    pub formula_expr: Option<String>,
    pub is_dirty: bool,
}

impl CoercedCell {
    pub fn plain(value: CellValue) -> Self {
        Self {
            value,
            formula_expr: None,
            is_dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn untagged_serde_round_trip() {
        let cases = [
            (CellValue::Null, "null"),
            (CellValue::Boolean(true), "true"),
            (CellValue::Number(1.5), "1.5"),
            (CellValue::Text("hi".into()), "\"hi\""),
            (
                CellValue::TextList(vec!["a".into(), "b".into()]),
                "[\"a\",\"b\"]",
            ),
        ];
        for (value, json) in cases {
            assert_eq!(serde_json::to_string(&value).expect("serialize"), json);
            assert_eq!(
                serde_json::from_str::<CellValue>(json).expect("deserialize"),
                value
            );
        }
    }
}
