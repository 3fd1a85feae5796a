//! Conversion between JSON documents and DynamoDB attribute values.
//!
//! Documents map onto `S`, `N`, `BOOL`, `NULL`, `M` and `L`. Numbers travel
//! as strings, so integers survive unchanged.

use serde_json::{Map, Number, Value, json};

use super::error::DynamoError;

/// Convert a JSON value into an attribute value.
pub fn to_attribute(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "NULL": true }),
        Value::Bool(b) => json!({ "BOOL": b }),
        Value::Number(n) => json!({ "N": n.to_string() }),
        Value::String(s) => json!({ "S": s }),
        Value::Array(items) => json!({ "L": items.iter().map(to_attribute).collect::<Vec<_>>() }),
        Value::Object(map) => json!({ "M": to_item(map) }),
    }
}

/// Convert a JSON object into an item (attribute name to attribute value).
pub fn to_item(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter().map(|(name, value)| (name.clone(), to_attribute(value))).collect()
}

/// Convert an attribute value back into plain JSON.
pub fn from_attribute(attribute: &Value) -> Result<Value, DynamoError> {
    let Some((tag, inner)) = attribute.as_object().and_then(|m| m.iter().next()) else {
        return Err(DynamoError::Parse(format!("malformed attribute value: {attribute}")));
    };

    match (tag.as_str(), inner) {
        ("NULL", _) => Ok(Value::Null),
        ("BOOL", Value::Bool(b)) => Ok(Value::Bool(*b)),
        ("S", Value::String(s)) => Ok(Value::String(s.clone())),
        ("N", Value::String(n)) => parse_number(n),
        ("L", Value::Array(items)) => items.iter().map(from_attribute).collect::<Result<Vec<_>, _>>().map(Value::Array),
        ("M", Value::Object(map)) => from_item(map).map(Value::Object),
        ("SS", Value::Array(items)) => Ok(Value::Array(items.clone())),
        ("NS", Value::Array(items)) => items
            .iter()
            .map(|n| n.as_str().map(parse_number).unwrap_or_else(|| Err(DynamoError::Parse("NS member".into()))))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (tag, _) => Err(DynamoError::Parse(format!("unsupported attribute type {tag}"))),
    }
}

/// Convert an item back into a JSON object.
pub fn from_item(item: &Map<String, Value>) -> Result<Map<String, Value>, DynamoError> {
    item.iter()
        .map(|(name, attribute)| Ok((name.clone(), from_attribute(attribute)?)))
        .collect()
}

fn parse_number(raw: &str) -> Result<Value, DynamoError> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(u) = raw.parse::<u64>() {
        return Ok(Value::from(u));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| DynamoError::Parse(format!("invalid number {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_document() {
        let doc = json!({
            "url": "https://a.com/",
            "success": true,
            "status_code": 200,
            "media": {"images": [{"src": "a.png", "score": 1.5}]},
            "screenshot": null
        });
        let item = to_item(doc.as_object().unwrap());

        assert_eq!(item["url"], json!({"S": "https://a.com/"}));
        assert_eq!(item["status_code"], json!({"N": "200"}));
        assert_eq!(item["screenshot"], json!({"NULL": true}));
        assert_eq!(item["media"]["M"]["images"]["L"][0]["M"]["score"], json!({"N": "1.5"}));

        let back = from_item(&item).unwrap();
        assert_eq!(Value::Object(back), doc);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(from_attribute(&json!({"N": "abc"})).is_err());
        assert!(from_attribute(&json!({"B": "AAEC"})).is_err());
        assert!(from_attribute(&json!("bare")).is_err());
    }

    #[test]
    fn test_large_epoch_numbers() {
        assert_eq!(from_attribute(&json!({"N": "1735689600"})).unwrap(), json!(1_735_689_600));
    }
}
