use serde_json::Value;

/// One decoded row: destination column name to coerced value, in column order.
///
/// Rows stay dynamic through decode and insert; typed records exist only at
/// module boundaries (company state, sessions, audit events).
pub type Row = serde_json::Map<String, Value>;

/// Returns the string value of `key`, or `""` for absent/null/non-string.
pub fn row_text<'a>(row: &'a Row, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Returns `key` as an integer, accepting numeric strings the way the
/// gateway renders alter-ids in text fields.
pub fn row_i64(row: &Row, key: &str) -> i64 {
    match row.get(key) {
        Some(Value::Number(number)) => number.as_i64().unwrap_or_else(|| {
            number
                .as_f64()
                .map(|float| float as i64)
                .unwrap_or_default()
        }),
        Some(Value::String(text)) => text.trim().parse::<i64>().unwrap_or_else(|_| {
            text.trim()
                .parse::<f64>()
                .map(|float| float as i64)
                .unwrap_or_default()
        }),
        _ => 0,
    }
}
