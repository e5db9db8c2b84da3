//! JSON feed connector.
//!
//! Accepts three top-level shapes commonly seen in product feeds: a
//! bare array of rows, an object wrapping the rows under a well-known
//! key (`items`, `products`, `data`, `records`), or newline-delimited
//! JSON objects.

use serde_json::Value;
use tracing::debug;

use crate::fields::map_row;
use crate::row::ParseOutput;
use crate::sniff::FeedFormat;
use crate::{ConnectorError, FormatConnector};

const WRAPPER_KEYS: &[&str] = &["items", "products", "data", "records"];

pub struct JsonConnector;

impl FormatConnector for JsonConnector {
    fn format(&self) -> FeedFormat {
        FeedFormat::Json
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParseOutput, ConnectorError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConnectorError::Payload(format!("invalid utf-8: {e}")))?;

        let rows = extract_rows(text)?;
        debug!(rows = rows.len(), "json payload decoded");

        let mut output = ParseOutput::default();
        for row in &rows {
            output.push(map_row(row));
        }
        Ok(output)
    }
}

fn extract_rows(text: &str) -> Result<Vec<Value>, ConnectorError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(rows)) => Ok(rows),
        Ok(Value::Object(obj)) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(rows)) = obj.get(*key) {
                    return Ok(rows.clone());
                }
            }
            // A single bare object is treated as a one-row feed.
            Ok(vec![Value::Object(obj)])
        }
        Ok(other) => Err(ConnectorError::Payload(format!(
            "expected array or object at top level, got {other}"
        ))),
        // Whole-document parse failed; try newline-delimited objects.
        Err(_) => parse_ndjson(text),
    }
}

fn parse_ndjson(text: &str) -> Result<Vec<Value>, ConnectorError> {
    let mut rows = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|e| {
            ConnectorError::Payload(format!("invalid json on line {}: {e}", line_no + 1))
        })?;
        rows.push(value);
    }
    if rows.is_empty() {
        return Err(ConnectorError::Payload("no json rows found".to_string()));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowOutcome;

    #[test]
    fn parses_bare_array() {
        let out = JsonConnector
            .parse(br#"[{"title": "A", "price": 1}, {"title": "B", "price": 2}]"#)
            .unwrap();
        assert_eq!(out.total_rows, 2);
        assert_eq!(out.rejected_count(), 0);
    }

    #[test]
    fn parses_items_wrapper() {
        let out = JsonConnector
            .parse(br#"{"items": [{"title": "A", "price": 1}]}"#)
            .unwrap();
        assert_eq!(out.total_rows, 1);
    }

    #[test]
    fn parses_ndjson() {
        let out = JsonConnector
            .parse(b"{\"title\": \"A\", \"price\": 1}\n\n{\"title\": \"B\", \"price\": 2}\n")
            .unwrap();
        assert_eq!(out.total_rows, 2);
    }

    #[test]
    fn row_failure_does_not_fail_payload() {
        let out = JsonConnector
            .parse(br#"[{"title": "A", "price": 1}, {"price": "broken"}]"#)
            .unwrap();
        assert_eq!(out.total_rows, 2);
        assert_eq!(out.rejected_count(), 1);
        assert!(matches!(out.rows[0].outcome, RowOutcome::Parsed { .. }));
        assert!(matches!(out.rows[1].outcome, RowOutcome::Rejected { .. }));
    }

    #[test]
    fn undecodable_payload_is_an_error() {
        assert!(JsonConnector.parse(b"{not json").is_err());
        assert!(JsonConnector.parse(b"42").is_err());
        assert!(JsonConnector.parse(&[0xff, 0xfe]).is_err());
    }
}
