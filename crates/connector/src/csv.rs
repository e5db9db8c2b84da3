//! CSV feed connector.
//!
//! Hand-rolled RFC-4180-ish reader: quoted fields with doubled-quote
//! escapes, configurable delimiter, header row required. Each data row
//! becomes a JSON object keyed by the header names and goes through the
//! same field mapping as JSON rows.

use serde_json::{Map, Value};
use tracing::debug;

use crate::fields::map_row;
use crate::row::{ParseOutput, RowError, RowOutcome};
use crate::sniff::FeedFormat;
use crate::{ConnectorError, FormatConnector};

pub struct CsvConnector {
    delimiter: char,
}

impl Default for CsvConnector {
    fn default() -> Self {
        Self { delimiter: ',' }
    }
}

impl CsvConnector {
    pub fn with_delimiter(delimiter: char) -> Self {
        Self { delimiter }
    }
}

impl FormatConnector for CsvConnector {
    fn format(&self) -> FeedFormat {
        FeedFormat::Csv
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParseOutput, ConnectorError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConnectorError::Payload(format!("invalid utf-8: {e}")))?;
        let text = text.trim_start_matches('\u{feff}');

        // Tab-heavy first line with no delimiter hits means a TSV feed
        // declared as CSV.
        let delimiter = detect_delimiter(text, self.delimiter);

        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header_line = lines
            .next()
            .ok_or_else(|| ConnectorError::Payload("empty csv payload".to_string()))?;
        let headers = split_line(header_line, delimiter);
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(ConnectorError::Payload("missing csv header row".to_string()));
        }
        let headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        debug!(columns = headers.len(), ?delimiter, "csv header decoded");

        let mut output = ParseOutput::default();
        for line in lines {
            let fields = split_line(line, delimiter);
            if fields.len() != headers.len() {
                output.push(RowOutcome::Rejected {
                    errors: vec![RowError {
                        field: None,
                        code: "PARSE_ERROR".to_string(),
                        message: format!(
                            "expected {} fields, found {}",
                            headers.len(),
                            fields.len()
                        ),
                    }],
                });
                continue;
            }
            let mut obj = Map::new();
            for (header, field) in headers.iter().zip(fields) {
                obj.insert(header.clone(), Value::String(field));
            }
            output.push(map_row(&Value::Object(obj)));
        }
        Ok(output)
    }
}

fn detect_delimiter(text: &str, configured: char) -> char {
    let first_line = text.lines().next().unwrap_or("");
    if !first_line.contains(configured) && first_line.contains('\t') {
        '\t'
    } else {
        configured
    }
}

/// Split one line into fields, honoring quotes and doubled-quote
/// escapes.
fn split_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}
