//! Detail-page enrichment.
//!
//! Listing payloads leave gaps (no rating on DOM cards, no merchant on some
//! endpoints). For a bounded number of gap-bearing records, the detail page
//! is fetched over plain HTTP and mined through an ordered extraction chain:
//! JSON-LD product data first, microdata attributes second, raw-HTML regex
//! last. Later sources only fill fields the earlier ones left empty.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CollectConfig;
use crate::record::{parse_int_text, parse_price_text, ProductRecord};

/// Fields a detail page can contribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub price: Option<f64>,
    pub rating: Option<f64>,
    pub reviews: Option<u32>,
    pub offers_count: Option<u32>,
    pub merchant: Option<String>,
}

impl DetailFields {
    fn fill_from(&mut self, other: DetailFields) {
        if self.price.is_none() {
            self.price = other.price;
        }
        if self.rating.is_none() {
            self.rating = other.rating;
        }
        if self.reviews.is_none() {
            self.reviews = other.reviews;
        }
        if self.offers_count.is_none() {
            self.offers_count = other.offers_count;
        }
        if self.merchant.is_none() {
            self.merchant = other.merchant;
        }
    }

    fn is_empty(&self) -> bool {
        *self == DetailFields::default()
    }

    /// Copy into a record, filling only what the record is missing.
    pub fn apply(&self, record: &mut ProductRecord) {
        if record.price_default.is_none() {
            record.price_default = self.price;
        }
        if record.price_min.is_none() {
            record.price_min = self.price;
        }
        if record.rating.is_none() {
            record.rating = self.rating;
        }
        if record.reviews.is_none() || record.reviews == Some(0) {
            record.reviews = self.reviews.or(record.reviews);
        }
        if record.offers_count.is_none() || record.offers_count == Some(0) {
            record.offers_count = self.offers_count.or(record.offers_count);
        }
        if record.best_merchant.is_none() {
            record.best_merchant = self.merchant.clone();
        }
    }
}

/// Post-chain price fallback: a known list price stands in for whatever the
/// other sources left empty.
pub fn backfill_prices(records: &mut [ProductRecord]) {
    for record in records {
        if record.price_default.is_none() {
            record.price_default = record.list_price;
        }
        if record.price_min.is_none() {
            record.price_min = record.price_default;
        }
    }
}

fn sel(s: &str) -> Selector {
    Selector::parse(s).expect("static selector")
}

/// Run the full extraction chain over detail-page HTML.
pub fn extract_detail(html: &str) -> DetailFields {
    let doc = Html::parse_document(html);
    let mut fields = from_json_ld(&doc);
    fields.fill_from(from_microdata(&doc));
    fields.fill_from(from_regex(html));
    fields
}

/// JSON-LD `Product` blocks, the richest and most stable source.
fn from_json_ld(doc: &Html) -> DetailFields {
    let mut fields = DetailFields::default();
    let script_sel = sel(r#"script[type="application/ld+json"]"#);
    for script in doc.select(&script_sel) {
        let text: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let nodes: Vec<&Value> = match &data {
            Value::Array(arr) => arr.iter().collect(),
            other => vec![other],
        };
        for node in nodes {
            if node.get("@type").and_then(Value::as_str) != Some("Product") {
                continue;
            }
            if let Some(offers) = node.get("offers") {
                fields.price = fields.price.or_else(|| {
                    ["lowPrice", "price"]
                        .iter()
                        .find_map(|k| offers.get(*k))
                        .and_then(json_number)
                });
                fields.offers_count = fields.offers_count.or_else(|| {
                    offers
                        .get("offerCount")
                        .and_then(json_number)
                        .map(|n| n as u32)
                });
                fields.merchant = fields.merchant.or_else(|| {
                    offers
                        .get("seller")
                        .and_then(|s| s.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            }
            if let Some(agg) = node.get("aggregateRating") {
                fields.rating = fields
                    .rating
                    .or_else(|| agg.get("ratingValue").and_then(json_number));
                fields.reviews = fields.reviews.or_else(|| {
                    ["reviewCount", "ratingCount"]
                        .iter()
                        .find_map(|k| agg.get(*k))
                        .and_then(json_number)
                        .map(|n| n as u32)
                });
            }
        }
    }
    fields
}

fn json_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price_text(s),
        _ => None,
    }
}

/// `itemprop` microdata attributes.
fn from_microdata(doc: &Html) -> DetailFields {
    let prop = |name: &str| -> Option<String> {
        let selector = sel(&format!(r#"[itemprop="{name}"]"#));
        doc.select(&selector).next().map(|el| {
            el.value()
                .attr("content")
                .map(str::to_string)
                .unwrap_or_else(|| el.text().collect::<String>())
        })
    };
    DetailFields {
        price: prop("price").as_deref().and_then(parse_price_text),
        rating: prop("ratingValue").as_deref().and_then(parse_price_text),
        reviews: prop("reviewCount").as_deref().and_then(parse_int_text),
        offers_count: prop("offerCount").as_deref().and_then(parse_int_text),
        merchant: None,
    }
}

struct DetailPatterns {
    state_rating: Regex,
    state_reviews: Regex,
    state_offers: Regex,
    text_rating: Regex,
    text_reviews: Regex,
    text_min_price: Regex,
}

fn patterns() -> &'static DetailPatterns {
    static P: OnceLock<DetailPatterns> = OnceLock::new();
    P.get_or_init(|| DetailPatterns {
        state_rating: Regex::new(r#""rating(?:Value)?"\s*:\s*"?([\d.]+)"#).expect("static pattern"),
        state_reviews: Regex::new(r#""review(?:s(?:Quantity|Count)|Count)"\s*:\s*"?(\d+)"#)
            .expect("static pattern"),
        state_offers: Regex::new(r#""(?:merchantCount|offersCount|offerCount)"\s*:\s*"?(\d+)"#)
            .expect("static pattern"),
        text_rating: Regex::new(r"(\d(?:[.,]\d)?)\s*из\s*5").expect("static pattern"),
        text_reviews: Regex::new(r"\(?\s*(\d[\d\s\u{00A0}]*)\s*\)?\s*отзыв").expect("static pattern"),
        text_min_price: Regex::new(r"от\s+((?:\d[\d\s\u{00A0}]*)\d|\d)").expect("static pattern"),
    })
}

/// Last resort: patterns over embedded state blobs, then over localized
/// visible text.
fn from_regex(html: &str) -> DetailFields {
    let p = patterns();
    let first = |re: &Regex| -> Option<String> {
        re.captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    DetailFields {
        price: first(&p.text_min_price).as_deref().and_then(parse_price_text),
        rating: first(&p.state_rating)
            .or_else(|| first(&p.text_rating))
            .as_deref()
            .and_then(parse_price_text)
            .filter(|r| *r > 0.0 && *r <= 5.0),
        reviews: first(&p.state_reviews)
            .or_else(|| first(&p.text_reviews))
            .as_deref()
            .and_then(parse_int_text),
        offers_count: first(&p.state_offers).as_deref().and_then(parse_int_text),
        merchant: None,
    }
}

/// HTTP enricher over the gap-bearing tail of a collected set.
pub struct Enricher {
    http: reqwest::Client,
    delay: Duration,
}

impl Enricher {
    pub fn new(config: &CollectConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.site.user_agent.clone())
            .timeout(Duration::from_secs(30));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy")?);
        }
        Ok(Self {
            http: builder.build().context("building enrich client")?,
            delay: config.delay(),
        })
    }

    /// Enrich records that are missing detail fields and have a URL to
    /// fetch, visiting at most `limit` pages. Failed visits annotate the
    /// record and still spend the budget. Returns how many records gained
    /// fields.
    pub async fn enrich(&self, records: &mut [ProductRecord], limit: usize) -> usize {
        let mut enriched = 0;
        let mut visited = 0;
        for record in records.iter_mut() {
            if visited >= limit {
                break;
            }
            if !record.missing_detail() {
                continue;
            }
            let Some(url) = record.url.clone() else { continue };
            visited += 1;
            match self.fetch_detail(&url).await {
                Ok(fields) if !fields.is_empty() => {
                    fields.apply(record);
                    enriched += 1;
                    debug!(url, "record enriched");
                }
                Ok(_) => {
                    record.annotate_error("detail page had no extractable fields");
                }
                Err(e) => {
                    warn!(url, error = %e, "detail fetch failed");
                    record.annotate_error(&format!("detail fetch failed: {e}"));
                }
            }
            tokio::time::sleep(self.delay).await;
        }
        enriched
    }

    async fn fetch_detail(&self, url: &str) -> Result<DetailFields> {
        let resp = self.http.get(url).send().await.context("request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("status {status}");
        }
        let html = resp.text().await.context("reading body")?;
        Ok(extract_detail(&html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_LD_PAGE: &str = r#"<html><head>
      <script type="application/ld+json">
      {"@type":"Product","name":"TV",
       "offers":{"price":"449990","offerCount":12,"seller":{"name":"BestShop"}},
       "aggregateRating":{"ratingValue":"4.7","reviewCount":320}}
      </script></head><body></body></html>"#;

    #[test]
    fn json_ld_is_preferred() {
        let fields = extract_detail(JSON_LD_PAGE);
        assert_eq!(fields.price, Some(449_990.0));
        assert_eq!(fields.rating, Some(4.7));
        assert_eq!(fields.reviews, Some(320));
        assert_eq!(fields.offers_count, Some(12));
        assert_eq!(fields.merchant.as_deref(), Some("BestShop"));
    }

    #[test]
    fn microdata_fills_when_json_ld_absent() {
        let html = r#"<html><body>
          <span itemprop="price" content="123456"></span>
          <meta itemprop="ratingValue" content="4.2">
          <span itemprop="reviewCount">87</span>
        </body></html>"#;
        let fields = extract_detail(html);
        assert_eq!(fields.price, Some(123_456.0));
        assert_eq!(fields.rating, Some(4.2));
        assert_eq!(fields.reviews, Some(87));
    }

    #[test]
    fn regex_is_the_last_resort() {
        let html = r#"<html><body><script>
          window.__STATE__ = {"product":{"rating":4.9,"reviewsQuantity":15,"merchantCount":3}};
        </script></body></html>"#;
        let fields = extract_detail(html);
        assert_eq!(fields.rating, Some(4.9));
        assert_eq!(fields.reviews, Some(15));
        assert_eq!(fields.offers_count, Some(3));
    }

    #[test]
    fn earlier_sources_win() {
        let html = format!(
            r#"{JSON_LD_PAGE}<script>var s = {{"rating":1.0,"reviewsCount":1}};</script>"#
        );
        let fields = extract_detail(&html);
        assert_eq!(fields.rating, Some(4.7));
        assert_eq!(fields.reviews, Some(320));
    }

    #[test]
    fn apply_fills_only_gaps() {
        let fields = DetailFields {
            price: Some(100.0),
            rating: Some(4.0),
            reviews: Some(10),
            offers_count: Some(2),
            merchant: Some("Shop".into()),
        };
        let mut record = ProductRecord {
            title: "X".into(),
            price_default: Some(200.0),
            rating: None,
            reviews: Some(0),
            ..Default::default()
        };
        fields.apply(&mut record);
        assert_eq!(record.price_default, Some(200.0));
        assert_eq!(record.rating, Some(4.0));
        assert_eq!(record.reviews, Some(10));
        assert_eq!(record.offers_count, Some(2));
        assert_eq!(record.best_merchant.as_deref(), Some("Shop"));
    }

    #[test]
    fn localized_text_is_the_final_fallback() {
        let html = "<html><body><span>4,6 из 5</span> <span>(38 отзывов)</span> \
                    <div>от 12 990 ₸</div></body></html>";
        let fields = extract_detail(html);
        assert_eq!(fields.rating, Some(4.6));
        assert_eq!(fields.reviews, Some(38));
        assert_eq!(fields.price, Some(12_990.0));
    }

    #[test]
    fn price_backfill_prefers_list_price() {
        let mut records = vec![ProductRecord {
            title: "X".into(),
            list_price: Some(500.0),
            ..Default::default()
        }];
        backfill_prices(&mut records);
        assert_eq!(records[0].price_default, Some(500.0));
        assert_eq!(records[0].price_min, Some(500.0));
    }

    #[test]
    fn empty_page_yields_nothing() {
        assert!(extract_detail("<html><body><p>404</p></body></html>").is_empty());
    }

    #[tokio::test]
    async fn budget_counts_visits_not_successes() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut records: Vec<ProductRecord> = (0..5)
            .map(|i| ProductRecord {
                title: format!("P{i}"),
                url: Some(format!("{}/shop/p/p-{i}", server.uri())),
                ..Default::default()
            })
            .collect();

        let config = CollectConfig {
            delay_ms: 0,
            ..CollectConfig::default()
        };
        let enricher = Enricher::new(&config).expect("client");
        let enriched = enricher.enrich(&mut records, 2).await;

        assert_eq!(enriched, 0);
        let visited = records.iter().filter(|r| r.errors.is_some()).count();
        assert_eq!(visited, 2);
    }
}
