//! Payload format detection.

use std::fmt;
use std::str::FromStr;

/// Supported feed payload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Json,
    Csv,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Json => "json",
            FeedFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "ndjson" => Ok(FeedFormat::Json),
            "csv" | "tsv" => Ok(FeedFormat::Csv),
            other => Err(format!("unknown feed format: {other}")),
        }
    }
}

/// Guess the payload format from its leading bytes.
///
/// A payload whose first non-whitespace byte opens a JSON value is
/// treated as JSON; everything else falls back to CSV, which is the
/// more forgiving parser of the two.
pub fn sniff_format(bytes: &[u8]) -> FeedFormat {
    let first = bytes.iter().copied().find(|b| !b.is_ascii_whitespace());
    match first {
        Some(b'[') | Some(b'{') => FeedFormat::Json,
        _ => FeedFormat::Csv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_json_array_and_object() {
        assert_eq!(sniff_format(b"[{\"a\":1}]"), FeedFormat::Json);
        assert_eq!(sniff_format(b"  \n\t{\"a\":1}"), FeedFormat::Json);
    }

    #[test]
    fn defaults_to_csv() {
        assert_eq!(sniff_format(b"title,price\nWidget,9.99"), FeedFormat::Csv);
        assert_eq!(sniff_format(b""), FeedFormat::Csv);
    }

    #[test]
    fn parses_format_aliases() {
        assert_eq!("JSON".parse::<FeedFormat>().unwrap(), FeedFormat::Json);
        assert_eq!("ndjson".parse::<FeedFormat>().unwrap(), FeedFormat::Json);
        assert_eq!("tsv".parse::<FeedFormat>().unwrap(), FeedFormat::Csv);
        assert!("xml".parse::<FeedFormat>().is_err());
    }
}
