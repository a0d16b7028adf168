use serde_json::Value as Json;
use thiserror::Error;

use crate::{CellValue, CoercedCell, Field, FieldType};

/// Field-attributed validation failures.
///
/// Every message carries the field name so aggregated reporting (batch
/// errors, per-row CSV issues) can attribute a failure to its column.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ValueError {
    #[error("{field} expects string")]
    ExpectedText { field: String },
    #[error("{field} exceeds max_length {max}")]
    TextTooLong { field: String, max: usize },
    #[error("{field} expects number")]
    ExpectedNumber { field: String },
    #[error("{field} below min {min}")]
    BelowMin { field: String, min: f64 },
    #[error("{field} above max {max}")]
    AboveMax { field: String, max: f64 },
    #[error("{field} expects boolean")]
    ExpectedBoolean { field: String },
    #[error("{field} option not allowed: {choice}")]
    ChoiceNotAllowed { field: String, choice: String },
    #[error("{field} expects string[]")]
    ExpectedChoiceList { field: String },
    #[error("{field} expects date string")]
    ExpectedDate { field: String },
    #[error("{field} expects attachment array or object")]
    ExpectedAttachment { field: String },
    #[error("{field} requires formula expression")]
    MissingFormula { field: String },
    #[error("{field} does not accept attachments from CSV")]
    CsvAttachment { field: String },
    #[error("{field} is computed and cannot be imported from CSV")]
    CsvFormula { field: String },
}

/// Round to `precision` decimal places.
///
/// Policy (pinned, shared by every write path): scale by `10^precision`,
/// round half away from zero on the scaled binary value, scale back. Note
/// this operates on the f64 representation, so e.g. `1.005` at precision 2
/// yields `1.0` because `1.005 * 100` is `100.4999…` in binary.
pub fn round_to_precision(value: f64, precision: u8) -> f64 {
    let factor = 10f64.powi(i32::from(precision));
    (value * factor).round() / factor
}

/// Validate and normalize a raw JSON cell value against a field definition.
///
/// Absent input and JSON `null` are both treated as "no value". For formula
/// fields the incoming value is ignored: the stored value is always the
/// output of the recomputation pass, never a direct write.
pub fn validate_cell(
    field: &Field,
    raw: Option<&Json>,
    formula_expr: Option<&str>,
) -> Result<CoercedCell, ValueError> {
    let raw = match raw {
        Some(Json::Null) | None => None,
        Some(v) => Some(v),
    };

    let value = match field.field_type {
        FieldType::Text => match raw {
            None => CellValue::Null,
            Some(Json::String(s)) => {
                check_text_length(field, s)?;
                CellValue::Text(s.clone())
            }
            Some(_) => {
                return Err(ValueError::ExpectedText {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::Number => match raw {
            None => CellValue::Null,
            Some(Json::Number(n)) => {
                let n = n.as_f64().ok_or_else(|| ValueError::ExpectedNumber {
                    field: field.name.clone(),
                })?;
                CellValue::Number(check_number_bounds(field, n)?)
            }
            Some(_) => {
                return Err(ValueError::ExpectedNumber {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::Boolean => match raw {
            None => CellValue::Null,
            Some(Json::Bool(b)) => CellValue::Boolean(*b),
            Some(_) => {
                return Err(ValueError::ExpectedBoolean {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::SingleSelect => match raw {
            None => CellValue::Null,
            Some(Json::String(s)) => {
                check_choice(field, s)?;
                CellValue::Text(s.clone())
            }
            Some(_) => {
                return Err(ValueError::ExpectedText {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::MultiSelect => match raw {
            None => CellValue::Null,
            Some(Json::Array(items)) => {
                let mut choices = Vec::with_capacity(items.len());
                for item in items {
                    let s = item.as_str().ok_or_else(|| ValueError::ExpectedChoiceList {
                        field: field.name.clone(),
                    })?;
                    check_choice(field, s)?;
                    choices.push(s.to_string());
                }
                CellValue::TextList(choices)
            }
            Some(_) => {
                return Err(ValueError::ExpectedChoiceList {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::Date => match raw {
            None => CellValue::Null,
            // Stored as an opaque string; format validation is the caller's
            // concern.
            Some(Json::String(s)) => CellValue::Text(s.clone()),
            Some(_) => {
                return Err(ValueError::ExpectedDate {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::Attachment => match raw {
            None => CellValue::Null,
            // Structural acceptance only; deep validation belongs to the
            // attachment collaborator.
            Some(v @ (Json::Array(_) | Json::Object(_))) => CellValue::Json(v.clone()),
            Some(_) => {
                return Err(ValueError::ExpectedAttachment {
                    field: field.name.clone(),
                })
            }
        },
        FieldType::Formula => {
            let expr = formula_expr
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| ValueError::MissingFormula {
                    field: field.name.clone(),
                })?;
            return Ok(CoercedCell {
                value: CellValue::Null,
                formula_expr: Some(expr.to_string()),
                is_dirty: true,
            });
        }
    };

    Ok(CoercedCell::plain(value))
}

/// Boolean token sets recognized by the CSV coercer, compared
/// case-insensitively after trimming.
#[derive(Clone, Debug)]
pub struct BoolTokens {
    pub truthy: Vec<String>,
    pub falsy: Vec<String>,
}

impl Default for BoolTokens {
    fn default() -> Self {
        Self {
            truthy: ["true", "1", "yes", "y", "是"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            falsy: ["false", "0", "no", "n", "否"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl BoolTokens {
    fn classify(&self, s: &str) -> Option<bool> {
        let lowered = s.to_lowercase();
        if self.truthy.iter().any(|t| *t == lowered) {
            return Some(true);
        }
        if self.falsy.iter().any(|t| *t == lowered) {
            return Some(false);
        }
        None
    }
}

/// Validate and coerce one raw CSV cell.
///
/// Whitespace is trimmed first; an empty cell means "no value" and returns
/// `Ok(None)` rather than an error. Attachment and formula columns cannot be
/// populated from CSV.
pub fn coerce_csv_cell(
    field: &Field,
    raw: &str,
    tokens: &BoolTokens,
) -> Result<Option<CellValue>, ValueError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }

    let value = match field.field_type {
        FieldType::Text => {
            check_text_length(field, s)?;
            CellValue::Text(s.to_string())
        }
        FieldType::Number => {
            let n = parse_csv_number(s).ok_or_else(|| ValueError::ExpectedNumber {
                field: field.name.clone(),
            })?;
            CellValue::Number(check_number_bounds(field, n)?)
        }
        FieldType::Boolean => {
            let b = tokens.classify(s).ok_or_else(|| ValueError::ExpectedBoolean {
                field: field.name.clone(),
            })?;
            CellValue::Boolean(b)
        }
        FieldType::SingleSelect => {
            check_choice(field, s)?;
            CellValue::Text(s.to_string())
        }
        FieldType::MultiSelect => {
            let parts: Vec<String> = s
                .split([',', ';'])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            for part in &parts {
                check_choice(field, part)?;
            }
            CellValue::TextList(parts)
        }
        FieldType::Date => CellValue::Text(s.to_string()),
        FieldType::Attachment => {
            return Err(ValueError::CsvAttachment {
                field: field.name.clone(),
            })
        }
        FieldType::Formula => {
            return Err(ValueError::CsvFormula {
                field: field.name.clone(),
            })
        }
    };

    Ok(Some(value))
}

/// Parse a CSV number, tolerating `,` thousands separators (`1,234.5`).
fn parse_csv_number(s: &str) -> Option<f64> {
    let cleaned: String = s.chars().filter(|c| *c != ',').collect();
    let n: f64 = cleaned.parse().ok()?;
    n.is_finite().then_some(n)
}

fn check_text_length(field: &Field, s: &str) -> Result<(), ValueError> {
    if let Some(max) = field.options.max_length {
        if s.chars().count() > max {
            return Err(ValueError::TextTooLong {
                field: field.name.clone(),
                max,
            });
        }
    }
    Ok(())
}

fn check_number_bounds(field: &Field, n: f64) -> Result<f64, ValueError> {
    if let Some(min) = field.options.min {
        if n < min {
            return Err(ValueError::BelowMin {
                field: field.name.clone(),
                min,
            });
        }
    }
    if let Some(max) = field.options.max {
        if n > max {
            return Err(ValueError::AboveMax {
                field: field.name.clone(),
                max,
            });
        }
    }
    Ok(match field.options.precision {
        Some(p) => round_to_precision(n, p),
        None => n,
    })
}

fn check_choice(field: &Field, choice: &str) -> Result<(), ValueError> {
    if !field.options.allows_choice(choice) {
        return Err(ValueError::ChoiceNotAllowed {
            field: field.name.clone(),
            choice: choice.to_string(),
        });
    }
    Ok(())
}
