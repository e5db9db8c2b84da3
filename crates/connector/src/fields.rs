//! Field mapping: probe well-known key aliases in a raw row object and
//! coerce values into a [`ParsedRow`].
//!
//! Real-world feeds disagree on naming, so each logical field is probed
//! against an alias list in priority order. Lossy conversions (float
//! prices, stringly booleans) are accepted and recorded as
//! [`CoercionNote`]s rather than rejected.

use serde_json::Value;

use crate::row::{CoercionNote, ParsedRow, RowError, RowOutcome};

const TITLE_KEYS: &[&str] = &["title", "name", "product_name", "productname", "label"];
const IDENTIFIER_KEYS: &[&str] = &["gtin", "ean", "upc", "isbn", "mpn", "identifier", "product_id", "id"];
const SKU_KEYS: &[&str] = &["sku", "article_number", "articlenumber", "item_number", "offer_id"];
const PRICE_KEYS: &[&str] = &["price", "price_amount", "current_price", "sale_price", "amount"];
const CURRENCY_KEYS: &[&str] = &["currency", "currency_code", "price_currency"];
const STOCK_KEYS: &[&str] = &["in_stock", "instock", "availability", "available", "stock_status"];
const URL_KEYS: &[&str] = &["url", "link", "product_url", "deeplink"];

/// Map one raw row object into a parsed row or a rejection.
pub fn map_row(raw: &Value) -> RowOutcome {
    let Some(obj) = raw.as_object() else {
        return RowOutcome::Rejected {
            errors: vec![RowError {
                field: None,
                code: "PARSE_ERROR".to_string(),
                message: format!("row is not an object: {}", value_kind(raw)),
            }],
        };
    };

    let mut errors = Vec::new();
    let mut coercions = Vec::new();

    let title = probe_string(obj, TITLE_KEYS)
        .map(|(_, s)| s)
        .unwrap_or_default();
    if title.trim().is_empty() {
        errors.push(RowError {
            field: Some("title".to_string()),
            code: "VALIDATION_ERROR".to_string(),
            message: "missing or empty title".to_string(),
        });
    }

    let identifier = probe_string(obj, IDENTIFIER_KEYS).map(|(_, s)| s);
    let sku = probe_string(obj, SKU_KEYS).map(|(_, s)| s);

    let mut price_cents = None;
    if let Some((key, value)) = probe(obj, PRICE_KEYS) {
        match coerce_price_cents(value) {
            Ok((cents, note)) => {
                if cents < 0 {
                    errors.push(RowError {
                        field: Some(key.to_string()),
                        code: "VALIDATION_ERROR".to_string(),
                        message: format!("negative price: {value}"),
                    });
                } else {
                    if let Some(note) = note {
                        coercions.push(CoercionNote {
                            field: key.to_string(),
                            note,
                        });
                    }
                    price_cents = Some(cents);
                }
            }
            Err(message) => errors.push(RowError {
                field: Some(key.to_string()),
                code: "PARSE_ERROR".to_string(),
                message,
            }),
        }
    }

    let currency = probe_string(obj, CURRENCY_KEYS).map(|(_, s)| s.to_ascii_uppercase());

    let in_stock = probe(obj, STOCK_KEYS).and_then(|(key, value)| {
        let (parsed, note) = coerce_bool(value)?;
        if let Some(note) = note {
            coercions.push(CoercionNote {
                field: key.to_string(),
                note,
            });
        }
        Some(parsed)
    });

    let url = probe_string(obj, URL_KEYS).map(|(_, s)| s);

    if !errors.is_empty() {
        return RowOutcome::Rejected { errors };
    }

    RowOutcome::Parsed {
        record: ParsedRow {
            title,
            identifier,
            sku,
            price_cents,
            currency,
            in_stock,
            url,
            raw: raw.clone(),
        },
        coercions,
    }
}

/// First alias present in the object, in list order.
fn probe<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()).map(|v| (*key, v)))
}

fn probe_string(obj: &serde_json::Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, String)> {
    let (key, value) = probe(obj, keys)?;
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some((key, s))
    }
}

/// Coerce a price value into integer cents, with an optional note when
/// the conversion was lossy or implicit.
fn coerce_price_cents(value: &Value) -> Result<(i64, Option<String>), String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                // Whole numbers are treated as major units.
                Ok((i * 100, None))
            } else if let Some(f) = n.as_f64() {
                let cents = (f * 100.0).round() as i64;
                Ok((cents, Some(format!("decimal price {f} rounded to {cents} cents"))))
            } else {
                Err(format!("price out of range: {n}"))
            }
        }
        Value::String(s) => {
            let cleaned = s.trim().replace(',', ".");
            let cleaned = cleaned
                .trim_start_matches(|c: char| !c.is_ascii_digit() && c != '-' && c != '.')
                .trim_end_matches(|c: char| !c.is_ascii_digit());
            let f: f64 = cleaned
                .parse()
                .map_err(|_| format!("unparseable price: {s:?}"))?;
            let cents = (f * 100.0).round() as i64;
            Ok((cents, Some(format!("string price {s:?} parsed as {cents} cents"))))
        }
        other => Err(format!("unsupported price type: {}", value_kind(other))),
    }
}

fn coerce_bool(value: &Value) -> Option<(bool, Option<String>)> {
    match value {
        Value::Bool(b) => Some((*b, None)),
        Value::Number(n) => {
            let b = n.as_i64().is_some_and(|i| i != 0);
            Some((b, Some(format!("numeric availability {n} read as {b}"))))
        }
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            let b = match lowered.as_str() {
                "true" | "yes" | "1" | "in_stock" | "instock" | "available" | "in stock" => true,
                "false" | "no" | "0" | "out_of_stock" | "outofstock" | "unavailable"
                | "out of stock" => false,
                _ => return None,
            };
            Some((b, Some(format!("availability {s:?} read as {b}"))))
        }
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed(raw: Value) -> (ParsedRow, Vec<CoercionNote>) {
        match map_row(&raw) {
            RowOutcome::Parsed { record, coercions } => (record, coercions),
            RowOutcome::Rejected { errors } => panic!("unexpected rejection: {errors:?}"),
        }
    }

    fn rejected(raw: Value) -> Vec<RowError> {
        match map_row(&raw) {
            RowOutcome::Rejected { errors } => errors,
            RowOutcome::Parsed { record, .. } => panic!("unexpected parse: {record:?}"),
        }
    }

    #[test]
    fn maps_aliased_fields() {
        let (record, _) = parsed(json!({
            "product_name": "Widget",
            "ean": "4006381333931",
            "article_number": "W-1",
            "price": 19,
            "currency_code": "eur",
            "availability": "in_stock",
            "link": "https://example.com/w1"
        }));
        assert_eq!(record.title, "Widget");
        assert_eq!(record.identifier.as_deref(), Some("4006381333931"));
        assert_eq!(record.sku.as_deref(), Some("W-1"));
        assert_eq!(record.price_cents, Some(1900));
        assert_eq!(record.currency.as_deref(), Some("EUR"));
        assert_eq!(record.in_stock, Some(true));
        assert_eq!(record.url.as_deref(), Some("https://example.com/w1"));
    }

    #[test]
    fn decimal_price_coerces_with_note() {
        let (record, coercions) = parsed(json!({"title": "Widget", "price": 9.99}));
        assert_eq!(record.price_cents, Some(999));
        assert_eq!(coercions.len(), 1);
        assert_eq!(coercions[0].field, "price");
    }

    #[test]
    fn string_price_with_currency_symbol_coerces() {
        let (record, coercions) = parsed(json!({"title": "Widget", "price": "€ 12,50"}));
        assert_eq!(record.price_cents, Some(1250));
        assert!(!coercions.is_empty());
    }

    #[test]
    fn missing_title_rejects() {
        let errors = rejected(json!({"price": 10}));
        assert_eq!(errors[0].code, "VALIDATION_ERROR");
        assert_eq!(errors[0].field.as_deref(), Some("title"));
    }

    #[test]
    fn unparseable_price_rejects() {
        let errors = rejected(json!({"title": "Widget", "price": "call us"}));
        assert_eq!(errors[0].code, "PARSE_ERROR");
        assert_eq!(errors[0].field.as_deref(), Some("price"));
    }

    #[test]
    fn negative_price_rejects() {
        let errors = rejected(json!({"title": "Widget", "price": -5}));
        assert_eq!(errors[0].code, "VALIDATION_ERROR");
    }

    #[test]
    fn missing_price_parses_without_price() {
        let (record, _) = parsed(json!({"title": "Widget"}));
        assert_eq!(record.price_cents, None);
        assert!(!record.has_minimum_viability());
    }

    #[test]
    fn non_object_row_rejects_with_parse_error() {
        let errors = rejected(json!("just a string"));
        assert_eq!(errors[0].code, "PARSE_ERROR");
    }
}
