//! Conversion between model values and their wire form.

use exograph_model::{Value, ValueType};
use exograph_protocol::date::{format_date, parse_date};
use exograph_protocol::{EntityRef, WireItem};
use serde_json::Value as Json;

/// Converts a model value to JSON. Entities become `{type, id}` references
/// and dates become wire date strings.
pub fn to_wire(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Date(d) => Json::String(format_date(d)),
        Value::Entity(e) => serde_json::to_value(e.to_ref()).unwrap_or(Json::Null),
    }
}

/// Converts a list item to its wire form.
pub fn to_wire_item(value: &Value) -> WireItem {
    match value {
        Value::Entity(e) => WireItem::Entity(e.to_ref()),
        other => WireItem::Value(to_wire(other)),
    }
}

/// Returns the wire reference of an entity value, `None` for anything else.
pub fn to_wire_ref(value: &Value) -> Option<EntityRef> {
    value.as_entity().map(|e| e.to_ref())
}

/// Converts a primitive JSON value to a model value.
///
/// Strings shaped like wire dates become dates unless the target type is
/// `String`. Integers stay integers unless the target type is `Number`.
/// Composite JSON is kept as its serialized text.
pub fn value_from_wire(json: &Json, value_type: Option<ValueType>) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match (n.as_i64(), value_type) {
            (Some(i), Some(ValueType::Number)) => Value::Float(i as f64),
            (Some(i), _) => Value::Int(i),
            (None, _) => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        Json::String(s) if value_type != Some(ValueType::String) => parse_date(s)
            .map(Value::Date)
            .unwrap_or_else(|| Value::Text(s.clone())),
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn primitives_round_trip() {
        assert_eq!(to_wire(&Value::Int(4)), json!(4));
        assert_eq!(to_wire(&Value::Text("a".into())), json!("a"));
        assert_eq!(value_from_wire(&json!(4), Some(ValueType::Integer)), Value::Int(4));
        assert_eq!(value_from_wire(&json!(4), Some(ValueType::Number)), Value::Float(4.0));
        assert_eq!(value_from_wire(&json!(1.5), None), Value::Float(1.5));
        assert_eq!(value_from_wire(&json!(null), None), Value::Null);
    }

    #[test]
    fn dates_are_restored() {
        let date = Utc.with_ymd_and_hms(2023, 11, 2, 8, 30, 0).unwrap();
        let wire = to_wire(&Value::Date(date));
        assert_eq!(wire, json!("2023-11-02T08:30:00.000Z"));
        assert_eq!(value_from_wire(&wire, Some(ValueType::Date)), Value::Date(date));
        assert_eq!(value_from_wire(&wire, None), Value::Date(date));
        assert_eq!(
            value_from_wire(&wire, Some(ValueType::String)),
            Value::Text("2023-11-02T08:30:00.000Z".into())
        );
    }

    #[test]
    fn composites_become_text() {
        assert_eq!(
            value_from_wire(&json!({"a": 1}), Some(ValueType::Object)),
            Value::Text("{\"a\":1}".into())
        );
    }
}
