//! Upstream records.
//!
//! Providers yield either dynamic key/value records or structured values exposing a
//! field accessor. The row mapper only ever asks a record for one named field.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use reportforge_core::{ExportError, ExportResult};

/// Named field lookup on a structured record.
pub trait FieldAccess: Send {
    /// Value of `field`, or `None` when the record has no such field.
    fn get(&self, field: &str) -> Option<JsonValue>;
}

/// One upstream record.
pub enum Record {
    /// Dynamic key/value record.
    Map(Map<String, JsonValue>),
    /// Structured record with its own field accessor.
    Structured(Box<dyn FieldAccess>),
}

impl Record {
    /// Build a record from any serializable struct or map.
    ///
    /// Non-object values (numbers, arrays, ...) have no named fields and are rejected.
    pub fn from_serialize<T: Serialize>(value: &T) -> ExportResult<Self> {
        match serde_json::to_value(value)? {
            JsonValue::Object(map) => Ok(Record::Map(map)),
            other => Err(ExportError::Serialization(format!(
                "record must serialize to an object, got {}",
                kind_of(&other)
            ))),
        }
    }

    pub fn structured(access: impl FieldAccess + 'static) -> Self {
        Record::Structured(Box::new(access))
    }

    /// Field value; missing fields read as `null`.
    pub fn get(&self, field: &str) -> JsonValue {
        let value = match self {
            Record::Map(map) => map.get(field).cloned(),
            Record::Structured(access) => access.get(field),
        };
        value.unwrap_or(JsonValue::Null)
    }

    /// Project this record onto an ordered list of fields.
    pub fn project(&self, fields: &[String]) -> Vec<JsonValue> {
        fields.iter().map(|f| self.get(f)).collect()
    }
}

impl From<Map<String, JsonValue>> for Record {
    fn from(value: Map<String, JsonValue>) -> Self {
        Record::Map(value)
    }
}

impl core::fmt::Debug for Record {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Record::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Record::Structured(_) => f.write_str("Structured(..)"),
        }
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Invoice {
        number: String,
        amount: i64,
    }

    struct Point {
        x: i64,
        y: i64,
    }

    impl FieldAccess for Point {
        fn get(&self, field: &str) -> Option<JsonValue> {
            match field {
                "x" => Some(json!(self.x)),
                "y" => Some(json!(self.y)),
                _ => None,
            }
        }
    }

    #[test]
    fn map_and_structured_records_project_the_same_way() {
        let fields = vec!["x".to_string(), "y".to_string(), "z".to_string()];

        let map = Record::from(json!({"x": 1, "y": 2}).as_object().unwrap().clone());
        let structured = Record::structured(Point { x: 1, y: 2 });

        assert_eq!(map.project(&fields), vec![json!(1), json!(2), JsonValue::Null]);
        assert_eq!(structured.project(&fields), map.project(&fields));
    }

    #[test]
    fn serializable_structs_become_records() {
        let record = Record::from_serialize(&Invoice {
            number: "INV-1".into(),
            amount: 42,
        })
        .unwrap();

        assert_eq!(record.get("number"), json!("INV-1"));
        assert_eq!(record.get("amount"), json!(42));
        assert_eq!(record.get("missing"), JsonValue::Null);
    }

    #[test]
    fn scalars_are_not_records() {
        assert!(Record::from_serialize(&5).is_err());
    }
}
