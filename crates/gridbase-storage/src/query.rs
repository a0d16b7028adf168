use gridbase_model::CellValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::cmp::Ordering;

use crate::types::RecordData;

/// Listing/filtering/sorting parameters for [`crate::Storage::list_records`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListQuery {
    pub page: usize,
    pub size: usize,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Option<Sort>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            size: 20,
            filters: Vec::new(),
            sort: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Filter {
    pub field_id: i64,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Option<Json>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    In,
    Between,
    IsNull,
    IsNotNull,
}

/// Single-field sort. Records with no value for the field sort before
/// valued ones ascending (after them descending); ties fall back to record
/// id so the order is stable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Sort {
    pub field_id: i64,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordPage {
    pub data: Vec<RecordData>,
    pub page: usize,
    pub size: usize,
    pub total: usize,
}

pub(crate) fn filter_matches(value: Option<&CellValue>, filter: &Filter) -> bool {
    let present = value.filter(|v| !v.is_null());

    match filter.op {
        FilterOp::IsNull => return present.is_none(),
        FilterOp::IsNotNull => return present.is_some(),
        _ => {}
    }

    let Some(value) = present else {
        return false;
    };
    let expected = filter.value.as_ref().unwrap_or(&Json::Null);

    match filter.op {
        FilterOp::Eq => as_json(value) == *expected,
        FilterOp::Ne => as_json(value) != *expected,
        FilterOp::Lt => cmp_json(value, expected) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
            cmp_json(value, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => cmp_json(value, expected) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            cmp_json(value, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Contains => match (value, expected) {
            (CellValue::Text(s), Json::String(needle)) => s.contains(needle),
            _ => false,
        },
        FilterOp::In => match expected {
            Json::Array(items) => items.iter().any(|item| as_json(value) == *item),
            _ => false,
        },
        FilterOp::Between => match expected {
            Json::Array(bounds) if bounds.len() == 2 => {
                matches!(
                    cmp_json(value, &bounds[0]),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    cmp_json(value, &bounds[1]),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            _ => false,
        },
        FilterOp::IsNull | FilterOp::IsNotNull => unreachable!("handled above"),
    }
}

pub(crate) fn cmp_cells(a: Option<&CellValue>, b: Option<&CellValue>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => cmp_values(a, b).unwrap_or(Ordering::Equal),
    }
}

fn cmp_values(a: &CellValue, b: &CellValue) -> Option<Ordering> {
    match (a, b) {
        (CellValue::Number(x), CellValue::Number(y)) => x.partial_cmp(y),
        (CellValue::Text(x), CellValue::Text(y)) => Some(x.cmp(y)),
        (CellValue::Boolean(x), CellValue::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn cmp_json(value: &CellValue, expected: &Json) -> Option<Ordering> {
    match (value, expected) {
        (CellValue::Number(x), Json::Number(y)) => x.partial_cmp(&y.as_f64()?),
        (CellValue::Text(x), Json::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

fn as_json(value: &CellValue) -> Json {
    serde_json::to_value(value).unwrap_or(Json::Null)
}
