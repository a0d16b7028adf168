use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of a column definition within a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    SingleSelect,
    MultiSelect,
    Date,
    Attachment,
    Formula,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::SingleSelect => "single_select",
            FieldType::MultiSelect => "multi_select",
            FieldType::Date => "date",
            FieldType::Attachment => "attachment",
            FieldType::Formula => "formula",
        }
    }

    /// Parse the persisted type tag. Unknown tags are rejected rather than
    /// defaulted so a schema written by a newer version fails loudly.
    pub fn parse(s: &str) -> Option<FieldType> {
        match s {
            "text" => Some(FieldType::Text),
            "number" => Some(FieldType::Number),
            "boolean" => Some(FieldType::Boolean),
            "single_select" => Some(FieldType::SingleSelect),
            "multi_select" => Some(FieldType::MultiSelect),
            "date" => Some(FieldType::Date),
            "attachment" => Some(FieldType::Attachment),
            "formula" => Some(FieldType::Formula),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-dependent field options, deserialized from the field's JSON
/// options blob. Unknown keys are ignored; absent keys mean "no limit".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldOptions {
    /// Maximum character count for text fields.
    pub max_length: Option<usize>,
    /// Inclusive lower bound for number fields.
    pub min: Option<f64>,
    /// Inclusive upper bound for number fields.
    pub max: Option<f64>,
    /// Decimal places to round number (and numeric formula) values to.
    pub precision: Option<u8>,
    /// Allowed choices for single/multi select fields.
    pub options: Vec<String>,
}

impl FieldOptions {
    pub fn from_json(value: Option<&serde_json::Value>) -> FieldOptions {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn allows_choice(&self, choice: &str) -> bool {
        self.options.iter().any(|o| o == choice)
    }
}

/// A typed column definition within a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: i64,
    pub table_id: i64,
    /// Unique within the owning table.
    pub name: String,
    pub field_type: FieldType,
    pub options: FieldOptions,
    pub readonly: bool,
}
