//! DOM-side card extraction.
//!
//! Fallback path for when no usable JSON endpoint was captured: read the
//! rendered listing cards directly. DOM-extracted records are sparser than
//! their JSON counterparts, which is why the reconciler merges rather than
//! replaces.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::SiteProfile;
use crate::record::{parse_int_text, parse_price_text, ProductRecord};
use crate::session::{js_string_array, Session};

/// Raw card fields as read out of the DOM by [`card_script`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCard {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub reviews: Option<String>,
}

/// Build the extraction script for the site's card-selector ladder. One
/// object per card, text fields left raw for Rust-side parsing.
pub fn card_script(site: &SiteProfile) -> String {
    format!(
        r#"(() => {{
  const out = [];
  let cards = [];
  for (const sel of {sels}) {{
    cards = Array.from(document.querySelectorAll(sel));
    if (cards.length > 0) break;
  }}
  for (const card of cards) {{
    const a = card.matches('a[href]') ? card : card.querySelector('a[href*="/shop/p/"], a[href]');
    const titleEl = card.querySelector('[class*="name"], [itemprop="name"]');
    const priceEl = card.querySelector('[class*="price"], [itemprop="price"]');
    const ratingEl = card.querySelector('[class*="rating"]');
    const reviewsEl = card.querySelector('[class*="review"]');
    out.push({{
      id: card.getAttribute('data-product-id'),
      title: ((titleEl ? titleEl.textContent : (a ? a.textContent : '')) || '').trim(),
      href: a ? a.getAttribute('href') : null,
      price: priceEl ? priceEl.textContent : null,
      rating: ratingEl ? (ratingEl.getAttribute('data-rating') || ratingEl.textContent) : null,
      reviews: reviewsEl ? reviewsEl.textContent : null,
    }});
  }}
  return out;
}})()"#,
        sels = js_string_array(&site.card_selectors)
    )
}

fn href_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/shop/p/[^/?#]*-(\d+)/?").expect("static pattern"))
}

/// Pull a product id out of a `/shop/p/<slug>-<id>/` href.
pub fn id_from_href(href: &str) -> Option<String> {
    href_id_regex()
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Turn raw cards into partial records. Cards without a title are dropped.
pub fn parse_cards(raw: Vec<RawCard>, site: &SiteProfile) -> Vec<ProductRecord> {
    raw.into_iter()
        .filter_map(|card| {
            let title = card.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
            let url = card.href.as_deref().map(|h| site.absolutize(h));
            let product_id = card
                .id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .or_else(|| card.href.as_deref().and_then(id_from_href));
            let price = card.price.as_deref().and_then(parse_price_text);
            let rating = card
                .rating
                .as_deref()
                .and_then(parse_price_text)
                .filter(|r| *r > 0.0 && *r <= 5.0);
            let reviews = card.reviews.as_deref().and_then(parse_int_text);
            Some(ProductRecord {
                product_id,
                title: title.to_string(),
                url,
                list_price: price,
                price_min: None,
                price_default: price,
                rating,
                reviews,
                offers_count: None,
                best_merchant: None,
                errors: None,
            })
        })
        .collect()
}

/// Extract all currently rendered cards from the live page.
pub async fn extract_cards(session: &Session, site: &SiteProfile) -> Result<Vec<ProductRecord>> {
    let raw: Vec<RawCard> = session.execute_js(&card_script(site)).await?;
    let records = parse_cards(raw, site);
    debug!(count = records.len(), "extracted rendered cards");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(title: &str) -> RawCard {
        RawCard {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn id_falls_back_to_href() {
        let site = SiteProfile::default();
        let raw = RawCard {
            href: Some("/shop/p/samsung-galaxy-s24-118363700/".into()),
            ..card("Samsung Galaxy S24")
        };
        let recs = parse_cards(vec![raw], &site);
        assert_eq!(recs[0].product_id.as_deref(), Some("118363700"));
        assert_eq!(
            recs[0].url.as_deref(),
            Some("https://kaspi.kz/shop/p/samsung-galaxy-s24-118363700/")
        );
    }

    #[test]
    fn attribute_id_wins_over_href() {
        let site = SiteProfile::default();
        let raw = RawCard {
            id: Some("555".into()),
            href: Some("/shop/p/x-111/".into()),
            ..card("X")
        };
        let recs = parse_cards(vec![raw], &site);
        assert_eq!(recs[0].product_id.as_deref(), Some("555"));
    }

    #[test]
    fn titleless_cards_are_dropped() {
        let site = SiteProfile::default();
        let recs = parse_cards(vec![RawCard::default(), card("  "), card("Keep")], &site);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].title, "Keep");
    }

    #[test]
    fn text_fields_are_parsed() {
        let site = SiteProfile::default();
        let raw = RawCard {
            price: Some("449 990 ₸".into()),
            rating: Some("4.8".into()),
            reviews: Some("(1 245 отзывов)".into()),
            ..card("TV")
        };
        let recs = parse_cards(vec![raw], &site);
        assert_eq!(recs[0].list_price, Some(449_990.0));
        assert_eq!(recs[0].price_default, Some(449_990.0));
        assert_eq!(recs[0].rating, Some(4.8));
        assert_eq!(recs[0].reviews, Some(1245));
    }

    #[test]
    fn out_of_range_rating_rejected() {
        let site = SiteProfile::default();
        let raw = RawCard {
            rating: Some("87%".into()),
            ..card("TV")
        };
        let recs = parse_cards(vec![raw], &site);
        assert_eq!(recs[0].rating, None);
    }

    #[test]
    fn script_embeds_selector_ladder() {
        let site = SiteProfile::default();
        let script = card_script(&site);
        assert!(script.contains("data-product-id"));
        assert!(script.contains(&site.card_selectors[0]));
    }
}
