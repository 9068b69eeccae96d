//! The product record and the text-parsing helpers shared by every source.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One catalog product, assembled from any mix of DOM extraction, captured
/// JSON payloads, and detail-page enrichment.
///
/// Field-level contract: a non-null/non-zero value is never replaced with
/// null/zero by a later merge; see [`crate::reconcile::UpsertIndex`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// Site-assigned product id; absent for some sources.
    pub product_id: Option<String>,
    /// Display title. Required: a candidate without one is dropped.
    pub title: String,
    /// Absolute detail-page URL.
    pub url: Option<String>,
    /// Price shown on the listing card.
    pub list_price: Option<f64>,
    /// Lowest offer price.
    pub price_min: Option<f64>,
    /// Default/first offer price.
    pub price_default: Option<f64>,
    /// Aggregate rating on the site's native scale.
    pub rating: Option<f64>,
    /// Review count.
    pub reviews: Option<u32>,
    /// Number of merchants offering the product.
    pub offers_count: Option<u32>,
    /// Best-ranked merchant name.
    pub best_merchant: Option<String>,
    /// Append-only `"; "`-joined error annotations.
    pub errors: Option<String>,
}

impl ProductRecord {
    /// Identity key: product id when present, else `title|list_price`.
    pub fn identity(&self) -> String {
        match &self.product_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => composite_key(&self.title, self.list_price),
        }
    }

    /// The composite fallback key, also used by the rating cache.
    pub fn fallback_key(&self) -> String {
        composite_key(&self.title, self.list_price)
    }

    /// Append an error annotation without clobbering earlier ones.
    pub fn annotate_error(&mut self, note: &str) {
        match &mut self.errors {
            Some(e) => {
                e.push_str("; ");
                e.push_str(note);
            }
            None => self.errors = Some(note.to_string()),
        }
    }

    /// Whether the detail enricher still has work to do on this record.
    pub fn missing_detail(&self) -> bool {
        self.price_min.is_none()
            || self.rating.is_none()
            || self.reviews.is_none()
            || self.list_price.is_none()
    }
}

fn composite_key(title: &str, list_price: Option<f64>) -> String {
    match list_price {
        Some(p) => format!("{title}|{p}"),
        None => format!("{title}|"),
    }
}

fn price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Grouped thousands with space/nbsp separators, or a plain integer,
        // with an optional decimal tail.
        Regex::new(r"(?:(?:\d{1,3}(?:[ \u{00A0}]\d{3})+)|\d+)(?:[.,]\d+)?")
            .expect("price regex is valid")
    })
}

/// Pull the first price-looking number out of free text.
///
/// Handles grouped thousands (`1 234 567`, nbsp separators), comma decimals,
/// and currency noise around the number. Returns `None` when nothing in the
/// text parses.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let m = price_regex().find(text)?;
    let cleaned: String = m
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{00A0}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse::<f64>().ok()
}

/// Parse an integer out of text, ignoring every non-digit character.
pub fn parse_int_text(text: &str) -> Option<u32> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_product_id() {
        let rec = ProductRecord {
            product_id: Some("42".into()),
            title: "Phone".into(),
            list_price: Some(100.0),
            ..Default::default()
        };
        assert_eq!(rec.identity(), "42");
    }

    #[test]
    fn identity_falls_back_to_title_and_price() {
        let rec = ProductRecord {
            title: "Phone".into(),
            list_price: Some(100.0),
            ..Default::default()
        };
        assert_eq!(rec.identity(), "Phone|100");
        let bare = ProductRecord {
            title: "Phone".into(),
            ..Default::default()
        };
        assert_eq!(bare.identity(), "Phone|");
    }

    #[test]
    fn annotate_error_appends() {
        let mut rec = ProductRecord::default();
        rec.annotate_error("a");
        rec.annotate_error("b");
        assert_eq!(rec.errors.as_deref(), Some("a; b"));
    }

    #[test]
    fn parse_price_grouped_thousands() {
        assert_eq!(parse_price_text("449 990 ₸"), Some(449_990.0));
        assert_eq!(parse_price_text("1\u{00A0}234\u{00A0}567 ₸"), Some(1_234_567.0));
    }

    #[test]
    fn parse_price_comma_decimal() {
        assert_eq!(parse_price_text("от 12,5"), Some(12.5));
        assert_eq!(parse_price_text("12.5"), Some(12.5));
    }

    #[test]
    fn parse_price_rejects_empty() {
        assert_eq!(parse_price_text("нет в продаже"), None);
        assert_eq!(parse_price_text(""), None);
    }

    #[test]
    fn parse_int_ignores_noise() {
        assert_eq!(parse_int_text("1 024 отзыва"), Some(1024));
        assert_eq!(parse_int_text("(37)"), Some(37));
        assert_eq!(parse_int_text("нет"), None);
    }
}
