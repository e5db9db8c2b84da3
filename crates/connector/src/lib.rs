//! Format connectors: raw feed bytes → structured parse results.
//!
//! Rejection is an expected, high-frequency outcome of real-world feed
//! data, so per-row results are a tagged variant ([`RowOutcome`]), not
//! an error path. A connector only fails as a whole when the payload
//! cannot be decoded at all.

pub mod csv;
pub mod fields;
pub mod json;
pub mod row;
pub mod sniff;

use thiserror::Error;

pub use csv::CsvConnector;
pub use fields::map_row;
pub use json::JsonConnector;
pub use row::{CoercionNote, ParseOutput, ParsedRow, RowError, RowOutcome, RowResult};
pub use sniff::{sniff_format, FeedFormat};

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The payload as a whole could not be decoded (bad encoding,
    /// invalid top-level structure). Row-level problems never surface
    /// here.
    #[error("undecodable payload: {0}")]
    Payload(String),
}

/// Trait for format-specific parsers.
pub trait FormatConnector: Send + Sync {
    fn format(&self) -> FeedFormat;

    /// Parse a payload into per-row outcomes. Individual row failures
    /// are recorded in the output, never returned as `Err`.
    fn parse(&self, bytes: &[u8]) -> Result<ParseOutput, ConnectorError>;
}

/// Connector for a known format kind.
pub fn connector_for(format: FeedFormat) -> Box<dyn FormatConnector> {
    match format {
        FeedFormat::Json => Box::new(JsonConnector),
        FeedFormat::Csv => Box::new(CsvConnector::default()),
    }
}

/// Select a connector by the feed's declared format, sniffing the
/// payload when the declaration is absent or unknown.
pub fn select_connector(declared: &str, bytes: &[u8]) -> Box<dyn FormatConnector> {
    let format = match declared.parse::<FeedFormat>() {
        Ok(f) => f,
        Err(_) => sniff_format(bytes),
    };
    connector_for(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_format_wins_over_content() {
        let connector = select_connector("csv", b"[{\"title\": \"x\"}]");
        assert_eq!(connector.format(), FeedFormat::Csv);
    }

    #[test]
    fn unknown_declaration_falls_back_to_sniffing() {
        let connector = select_connector("", b"  [{\"title\": \"x\"}]");
        assert_eq!(connector.format(), FeedFormat::Json);
    }
}
