//! Per-row parse results and classification helpers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A normalized product row produced by the field mapping step.
///
/// All fields except `raw` are best-effort extractions; classification
/// (indexable vs. quarantine vs. reject) happens downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRow {
    pub title: String,
    /// Strong product identifier (GTIN/EAN/UPC/MPN-style).
    pub identifier: Option<String>,
    pub sku: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub in_stock: Option<bool>,
    pub url: Option<String>,
    /// Original row payload as received.
    pub raw: serde_json::Value,
}

impl ParsedRow {
    /// Strong identity: an identifier or sku is present. Eligible for
    /// the indexable lane.
    pub fn has_strong_identity(&self) -> bool {
        self.identifier.as_deref().is_some_and(|s| !s.is_empty())
            || self.sku.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Minimum viability for quarantine: a non-empty title and a
    /// positive price.
    pub fn has_minimum_viability(&self) -> bool {
        !self.title.trim().is_empty() && self.price_cents.is_some_and(|p| p > 0)
    }
}

/// A lossy-but-accepted conversion applied during field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoercionNote {
    pub field: String,
    pub note: String,
}

/// A row-level blocking error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub field: Option<String>,
    pub code: String,
    pub message: String,
}

/// Outcome of parsing one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    Parsed {
        record: ParsedRow,
        coercions: Vec<CoercionNote>,
    },
    Rejected {
        errors: Vec<RowError>,
    },
}

/// One row's outcome paired with its index in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    pub index: u32,
    pub outcome: RowOutcome,
}

/// Aggregate output of one connector parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseOutput {
    pub total_rows: u32,
    pub rows: Vec<RowResult>,
    /// Error code → occurrence count across all rejected rows.
    pub error_code_counts: HashMap<String, u32>,
}

impl ParseOutput {
    pub fn push(&mut self, outcome: RowOutcome) {
        if let RowOutcome::Rejected { errors } = &outcome {
            for err in errors {
                *self.error_code_counts.entry(err.code.clone()).or_default() += 1;
            }
        }
        self.rows.push(RowResult {
            index: self.total_rows,
            outcome,
        });
        self.total_rows += 1;
    }

    pub fn rejected_count(&self) -> u32 {
        self.rows
            .iter()
            .filter(|r| matches!(r.outcome, RowOutcome::Rejected { .. }))
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(title: &str, identifier: Option<&str>, price: Option<i64>) -> ParsedRow {
        ParsedRow {
            title: title.into(),
            identifier: identifier.map(String::from),
            sku: None,
            price_cents: price,
            currency: None,
            in_stock: None,
            url: None,
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn identifier_gives_strong_identity() {
        assert!(row("Widget", Some("W-1"), Some(100)).has_strong_identity());
        assert!(!row("Widget", None, Some(100)).has_strong_identity());
        assert!(!row("Widget", Some(""), Some(100)).has_strong_identity());
    }

    #[test]
    fn viability_needs_title_and_positive_price() {
        assert!(row("Widget", None, Some(1)).has_minimum_viability());
        assert!(!row("", None, Some(1)).has_minimum_viability());
        assert!(!row("   ", None, Some(1)).has_minimum_viability());
        assert!(!row("Widget", None, Some(0)).has_minimum_viability());
        assert!(!row("Widget", None, None).has_minimum_viability());
    }

    #[test]
    fn error_code_counts_accumulate() {
        let mut out = ParseOutput::default();
        out.push(RowOutcome::Rejected {
            errors: vec![RowError {
                field: None,
                code: "PARSE_ERROR".into(),
                message: "bad".into(),
            }],
        });
        out.push(RowOutcome::Rejected {
            errors: vec![RowError {
                field: Some("price".into()),
                code: "PARSE_ERROR".into(),
                message: "bad price".into(),
            }],
        });
        assert_eq!(out.total_rows, 2);
        assert_eq!(out.rejected_count(), 2);
        assert_eq!(out.error_code_counts["PARSE_ERROR"], 2);
    }
}
