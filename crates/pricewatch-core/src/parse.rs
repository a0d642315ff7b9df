//! Normalization of script results into product fields.
//!
//! In-page scripts already strip currency symbols, separators and plus signs;
//! what reaches these parsers is plain numeric text.

use pricewatch_models::{Comments, Extracted, Price, Product};
use serde_json::Value;
use tracing::debug;

const TEN_THOUSAND: char = '万';

/// `"199.00"` is a single price, `"99-129"` or `"99~129"` a range.
pub fn parse_price(text: &str) -> Price {
    let text = text.trim();
    if !text.contains(['-', '~']) {
        return match parse_decimal(text) {
            Some(value) => Price::Single(value),
            None => Price::Failed,
        };
    }

    let bounds = split_pair(text, '-').or_else(|| split_pair(text, '~'));
    match bounds.map(|(low, high)| (parse_decimal(low), parse_decimal(high))) {
        Some((Some(low), Some(high))) => Price::Range { low, high },
        _ => Price::Failed,
    }
}

fn split_pair(text: &str, separator: char) -> Option<(&str, &str)> {
    let mut parts = text.split(separator);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(low), Some(high), None) => Some((low, high)),
        _ => None,
    }
}

fn parse_decimal(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Stock and sales counts; `"1.4万"` reads as 14000.
///
/// Counts are never negative, so a leading minus is a failed read.
pub fn parse_quantity(text: &str) -> Extracted<i64> {
    let text = text.trim();
    let (number, scaled) = match text.strip_suffix(TEN_THOUSAND) {
        Some(number) => (number.trim_end_matches(TEN_THOUSAND), true),
        None => (text, false),
    };
    match parse_decimal(number).filter(|value| *value >= 0.0) {
        Some(value) if scaled => Extracted::Value((value * 10_000.0).round() as i64),
        Some(value) => Extracted::Value(value.trunc() as i64),
        None => Extracted::Failed,
    }
}

/// Review counters from a JSON object such as
/// `{"total": "1.2万", "star5": 10000, "image": "35"}`.
///
/// Without a usable `total` the whole record counts as failed.
pub fn parse_comments(text: &str) -> Comments {
    let failed = Comments {
        total: Extracted::Failed,
        ..Comments::default()
    };
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(text) else {
        return failed;
    };

    let count = |key: &str| -> Option<Extracted<i64>> {
        let raw = match fields.get(key)? {
            Value::String(text) if !text.trim().is_empty() => text.clone(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        Some(parse_quantity(&raw))
    };
    let bucket = |key: &str| count(key).and_then(|value| value.value().copied()).unwrap_or(0);

    let total = match count("total") {
        Some(total @ Extracted::Value(_)) => total,
        _ => return failed,
    };
    Comments {
        total,
        star5: bucket("star5"),
        star4: bucket("star4"),
        star3: bucket("star3"),
        star2: bucket("star2"),
        star1: bucket("star1"),
        image: bucket("image"),
        append: bucket("append"),
    }
}

/// Store a script result into the field named `name`.
///
/// Returns `false` for field names the crawler does not know.
pub fn apply_field(product: &mut Product, name: &str, text: &str) -> bool {
    match name {
        "title" => product.title = text.to_string(),
        "price" => product.price = parse_price(text),
        "stock" => product.stock = parse_quantity(text),
        "sales" => product.sales = parse_quantity(text),
        "category" => product.category = text.to_string(),
        "comments" => product.comments = parse_comments(text),
        _ => {
            debug!(field = name, "ignoring result for unknown field");
            return false;
        }
    }
    true
}

/// Mark the field named `name` as scripted but unreadable.
pub fn apply_failure(product: &mut Product, name: &str) {
    match name {
        "price" => product.price = Price::Failed,
        "stock" => product.stock = Extracted::Failed,
        "sales" => product.sales = Extracted::Failed,
        "comments" => product.comments.total = Extracted::Failed,
        _ => {}
    }
}
