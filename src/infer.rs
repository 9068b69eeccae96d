//! Pagination-shape inference over unknown JSON.
//!
//! The collector makes no assumption about the private endpoint's schema
//! beyond "some array of item-like objects reachable by structural scan".
//! This module owns the scan, the pagination hints it yields, and the
//! URL/body mutations that derive a follow-up request from a captured one.
//! Everything here is pure and synchronous.

use serde_json::{json, Value};
use url::Url;

use crate::config::SiteProfile;
use crate::record::{parse_price_text, ProductRecord};

/// The conventional container keys an item array hides under. This key set
/// is the only schema knowledge the interceptor hard-codes.
const CONTAINER_KEYS: &[&str] = &["cards", "items", "products", "results", "list", "edges", "nodes"];

/// Sibling keys that carry a continuation cursor.
const CURSOR_KEYS: &[&str] = &["next", "nextPage", "next_page", "nextToken", "next_token", "cursor", "after"];

/// Sibling objects that carry numeric paging metadata.
const META_KEYS: &[&str] = &["pageInfo", "pagination", "meta", "paging"];

/// Query keys treated as 1-based page numbers when bumping a GET URL.
const PAGE_QUERY_KEYS: &[&str] = &["page", "p", "pageNumber", "page_num"];

/// Query keys treated as item offsets when bumping a GET URL.
const OFFSET_QUERY_KEYS: &[&str] = &["offset", "start", "from"];

/// Pagination hints inferred from one payload. Every field is individually
/// optional; an all-`None` value still counts as "items found, no hints".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaginationHints {
    /// Continuation cursor/after token.
    pub cursor: Option<String>,
    /// `hasNextPage`-style flag. Parsed but never used as a stop signal:
    /// unrelated filter blocks carry spurious `false` values, so the end of
    /// the catalog is decided by limit/total arithmetic and duplicate
    /// counting instead.
    pub has_next: Option<bool>,
    /// Current page number.
    pub page: Option<i64>,
    /// Current item offset.
    pub offset: Option<i64>,
    /// Page size.
    pub limit: Option<i64>,
    /// Total item count.
    pub total: Option<i64>,
}

impl PaginationHints {
    /// Merge `other` into `self`, keeping existing values.
    pub fn absorb(&mut self, other: &PaginationHints) {
        if self.cursor.is_none() {
            self.cursor = other.cursor.clone();
        }
        if self.has_next.is_none() {
            self.has_next = other.has_next;
        }
        if self.page.is_none() {
            self.page = other.page;
        }
        if self.offset.is_none() {
            self.offset = other.offset;
        }
        if self.limit.is_none() {
            self.limit = other.limit;
        }
        if self.total.is_none() {
            self.total = other.total;
        }
    }
}

/// Recursively scan a payload for the first non-empty item array, returning
/// it together with pagination hints read from its sibling keys.
pub fn find_items(data: &Value) -> Option<(Vec<Value>, PaginationHints)> {
    match data {
        Value::Array(arr) => arr.iter().find_map(find_items),
        Value::Object(obj) => {
            for key in CONTAINER_KEYS {
                if let Some(Value::Array(arr)) = obj.get(*key) {
                    if !arr.is_empty() {
                        return Some((arr.clone(), sibling_hints(obj)));
                    }
                }
            }
            obj.values().find_map(find_items)
        }
        _ => None,
    }
}

/// Read cursor/flag/numeric hints from the object that holds the item array.
fn sibling_hints(obj: &serde_json::Map<String, Value>) -> PaginationHints {
    let mut hints = PaginationHints::default();
    for key in CURSOR_KEYS {
        if let Some(v) = obj.get(*key) {
            if let Some(s) = scalar_string(v) {
                hints.cursor = Some(s);
                break;
            }
        }
    }
    for meta_key in META_KEYS {
        let Some(Value::Object(meta)) = obj.get(*meta_key) else {
            continue;
        };
        if hints.cursor.is_none() {
            for key in ["next", "cursor", "endCursor", "after"] {
                if let Some(s) = meta.get(key).and_then(scalar_string) {
                    hints.cursor = Some(s);
                    break;
                }
            }
        }
        if hints.has_next.is_none() {
            for key in ["hasNextPage", "has_next", "hasNext"] {
                if let Some(b) = meta.get(key).and_then(Value::as_bool) {
                    hints.has_next = Some(b);
                    break;
                }
            }
        }
        for (keys, slot) in [
            (&["page", "pageNumber", "p"][..], &mut hints.page),
            (&["offset", "start", "from"][..], &mut hints.offset),
            (&["limit", "size", "rows", "perPage"][..], &mut hints.limit),
            (&["total", "totalCount", "totalResults"][..], &mut hints.total),
        ] {
            if slot.is_none() {
                for key in keys {
                    if let Some(n) = meta.get(*key).and_then(Value::as_i64) {
                        *slot = Some(n);
                        break;
                    }
                }
            }
        }
    }
    hints
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Derive a follow-up GET URL by incrementing known pagination parameters:
/// page-like keys by 1, offset-like keys by `step` (the observed page size).
/// `None` means inference failure; the caller falls through to the next
/// strategy.
pub fn bump_get_url(url: &str, step: i64) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let mut bumped = false;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let key = k.into_owned();
            let val = v.into_owned();
            if PAGE_QUERY_KEYS.contains(&key.as_str()) {
                if let Ok(n) = val.parse::<i64>() {
                    bumped = true;
                    return (key, (n + 1).to_string());
                }
            }
            if OFFSET_QUERY_KEYS.contains(&key.as_str()) {
                if let Ok(n) = val.parse::<i64>() {
                    bumped = true;
                    return (key, (n + step).to_string());
                }
            }
            (key, val)
        })
        .collect();
    if !bumped {
        return None;
    }
    let mut out = parsed;
    {
        let mut qp = out.query_pairs_mut();
        qp.clear();
        for (k, v) in &pairs {
            qp.append_pair(k, v);
        }
    }
    Some(out.to_string())
}

/// Apply the equivalent page/offset mutation inside a structured POST body's
/// `variables` sub-object (GraphQL style), or substitute the cursor when one
/// is available. `None` means nothing in the body mutated cleanly.
pub fn bump_post_body(body: &str, hints: &PaginationHints, step: i64) -> Option<String> {
    let mut parsed: Value = serde_json::from_str(body).ok()?;
    let mut changed = false;
    match &mut parsed {
        Value::Array(ops) => {
            for op in ops.iter_mut() {
                changed |= mutate_variables(op, hints, step);
            }
        }
        Value::Object(_) => {
            changed = mutate_variables(&mut parsed, hints, step);
            if !changed {
                if let (Some(cursor), Some(vars)) = (
                    hints.cursor.as_ref(),
                    parsed.get_mut("variables").and_then(Value::as_object_mut),
                ) {
                    vars.insert("after".into(), json!(cursor));
                    changed = true;
                }
            }
        }
        _ => return None,
    }
    if changed {
        serde_json::to_string(&parsed).ok()
    } else {
        None
    }
}

fn mutate_variables(op: &mut Value, hints: &PaginationHints, step: i64) -> bool {
    let Some(vars) = op.get_mut("variables").and_then(Value::as_object_mut) else {
        return false;
    };
    let mut changed = false;
    for key in ["page", "pageNumber", "p"] {
        if let Some(n) = vars.get(key).and_then(Value::as_i64) {
            vars.insert(key.into(), json!(n + 1));
            changed = true;
        }
    }
    for key in ["offset", "start", "from"] {
        if let Some(n) = vars.get(key).and_then(Value::as_i64) {
            vars.insert(key.into(), json!(n + step));
            changed = true;
        }
    }
    if let Some(cursor) = &hints.cursor {
        for key in ["cursor", "after", "endCursor"] {
            if vars.contains_key(key) {
                vars.insert(key.into(), json!(cursor));
                changed = true;
            }
        }
    }
    changed
}

fn zone_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r":availableInZones:[A-Za-z0-9_\-]+").expect("static pattern")
    })
}

/// Remove the `:availableInZones:<zone>` clause from the `q` query parameter.
/// The zone clause silently truncates replayed pagination.
pub fn strip_zone(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let mut changed = false;
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            if k == "q" && v.contains(":availableInZones:") {
                changed = true;
                (k.into_owned(), zone_regex().replace_all(&v, "").into_owned())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    if !changed {
        return url.to_string();
    }
    let mut out = parsed;
    {
        let mut qp = out.query_pairs_mut();
        qp.clear();
        for (k, v) in &pairs {
            qp.append_pair(k, v);
        }
    }
    out.to_string()
}

/// Set/replace several query parameters at once.
pub fn set_query_params(url: &str, kv: &[(&str, &str)]) -> String {
    let mut out = url.to_string();
    for (k, v) in kv {
        out = crate::config::set_query_param(&out, k, v);
    }
    out
}

/// Drop the named query parameters from a URL.
pub fn strip_query_params(url: &str, keys: &[&str]) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !keys.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut qp = parsed.query_pairs_mut();
        qp.clear();
        for (k, v) in &kept {
            qp.append_pair(k, v);
        }
    }
    if parsed.query() == Some("") {
        parsed.set_query(None);
    }
    parsed.to_string()
}

/// The search request token buried in the filters payload
/// (`data.externalSearchQueryInfo.queryID`).
pub fn request_token(data: &Value) -> Option<String> {
    data.get("data")?
        .get("externalSearchQueryInfo")?
        .get("queryID")
        .and_then(scalar_string)
}

/// `limit` and `total` as reported in the payload's `data` envelope.
pub fn limit_total(data: &Value) -> (Option<i64>, Option<i64>) {
    let Some(meta) = data.get("data").and_then(Value::as_object) else {
        return (None, None);
    };
    (
        meta.get("limit").and_then(Value::as_i64),
        meta.get("total").and_then(Value::as_i64),
    )
}

/// Extract a product id from an item-like object.
pub fn id_from_json(obj: &Value) -> Option<String> {
    for key in ["productId", "id", "configSku", "product_id"] {
        if let Some(s) = obj.get(key).and_then(scalar_string) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn price_from_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price_text(s),
        _ => None,
    }
}

fn first_price(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(price_from_value))
}

/// Map an item-like JSON object onto a partial record. Objects without a
/// usable title are rejected.
pub fn record_from_json(obj: &Value, site: &SiteProfile) -> Option<ProductRecord> {
    if !obj.is_object() {
        return None;
    }
    let title = ["title", "name"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();

    let url = ["shopLink", "link", "url", "href"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(|href| site.absolutize(href));

    let list_price = first_price(obj, &["unitPrice", "price", "basePrice", "priceFormatted", "listPrice"]);
    let sale_price = first_price(obj, &["unitSalePrice", "salePrice", "minPrice", "priceMin"]);

    let rating = obj.get("rating").and_then(price_from_value).filter(|r| *r != 0.0);
    let reviews = ["reviewsQuantity", "reviewsCount"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_u64))
        .map(|v| v as u32);
    let offers_count = ["merchantCount", "offersCount"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_u64))
        .map(|v| v as u32);

    let best_merchant = obj
        .get("majorMerchants")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|first| match first {
            Value::Object(m) => ["title", "name", "merchantName"]
                .iter()
                .find_map(|k| m.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty());

    Some(ProductRecord {
        product_id: id_from_json(obj),
        title,
        url,
        list_price,
        price_min: sale_price,
        price_default: sale_price.or(list_price),
        rating,
        reviews,
        offers_count,
        best_merchant,
        errors: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_items_under_each_container_key() {
        for key in CONTAINER_KEYS {
            let data = json!({ "data": { *key: [{"id": 1}] } });
            let (items, _) = find_items(&data).expect("items found");
            assert_eq!(items.len(), 1, "key {key}");
        }
    }

    #[test]
    fn ignores_empty_containers() {
        let data = json!({ "items": [], "deeper": { "products": [{"id": 1}] } });
        let (items, _) = find_items(&data).expect("items found");
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn reports_failure_on_unrecognized_shapes() {
        assert!(find_items(&json!({"a": {"b": 3}})).is_none());
        assert!(find_items(&json!(42)).is_none());
        assert!(find_items(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn scans_graphql_edge_shapes() {
        let data = json!({
            "data": {
                "search": {
                    "edges": [{"node": {"id": "1"}}],
                    "pageInfo": { "endCursor": "abc", "hasNextPage": true }
                }
            }
        });
        let (items, hints) = find_items(&data).expect("items found");
        assert_eq!(items.len(), 1);
        assert_eq!(hints.cursor.as_deref(), Some("abc"));
        assert_eq!(hints.has_next, Some(true));
    }

    #[test]
    fn reads_numeric_paging_metadata() {
        let data = json!({
            "results": [{"id": 1}],
            "pagination": { "page": 2, "perPage": 24, "total": 480 }
        });
        let (_, hints) = find_items(&data).expect("items found");
        assert_eq!(hints.page, Some(2));
        assert_eq!(hints.limit, Some(24));
        assert_eq!(hints.total, Some(480));
    }

    #[test]
    fn sibling_cursor_beats_meta_cursor() {
        let data = json!({
            "items": [{"id": 1}],
            "next": "tok-sibling",
            "paging": { "cursor": "tok-meta" }
        });
        let (_, hints) = find_items(&data).expect("items found");
        assert_eq!(hints.cursor.as_deref(), Some("tok-sibling"));
    }

    #[test]
    fn bump_get_increments_page_by_one() {
        let out = bump_get_url("https://x.test/api?page=3&q=tv", 12).expect("bumped");
        assert!(out.contains("page=4"));
        assert!(out.contains("q=tv"));
    }

    #[test]
    fn bump_get_increments_offset_by_step() {
        let out = bump_get_url("https://x.test/api?offset=24", 12).expect("bumped");
        assert!(out.contains("offset=36"));
    }

    #[test]
    fn bump_get_fails_without_known_keys() {
        assert!(bump_get_url("https://x.test/api?q=tv", 12).is_none());
        assert!(bump_get_url("https://x.test/api?page=abc", 12).is_none());
    }

    #[test]
    fn bump_post_increments_variables() {
        let body = r#"{"query":"q","variables":{"page":1,"limit":24}}"#;
        let out = bump_post_body(body, &PaginationHints::default(), 12).expect("mutated");
        let v: Value = serde_json::from_str(&out).expect("valid json");
        assert_eq!(v["variables"]["page"], json!(2));
    }

    #[test]
    fn bump_post_substitutes_cursor() {
        let body = r#"{"variables":{"after":"old"}}"#;
        let hints = PaginationHints {
            cursor: Some("new".into()),
            ..Default::default()
        };
        let out = bump_post_body(body, &hints, 12).expect("mutated");
        assert!(out.contains("\"after\":\"new\""));
    }

    #[test]
    fn bump_post_inserts_after_as_last_resort() {
        let body = r#"{"variables":{"text":"tv"}}"#;
        let hints = PaginationHints {
            cursor: Some("tok".into()),
            ..Default::default()
        };
        let out = bump_post_body(body, &hints, 12).expect("mutated");
        assert!(out.contains("\"after\":\"tok\""));
    }

    #[test]
    fn bump_post_fails_cleanly() {
        assert!(bump_post_body("not json", &PaginationHints::default(), 12).is_none());
        assert!(bump_post_body(r#"{"variables":{"text":"tv"}}"#, &PaginationHints::default(), 12).is_none());
    }

    #[test]
    fn strip_zone_removes_clause() {
        let url = "https://x.test/api?q=%3Acategory%3ATVs%3AavailableInZones%3AMagnum_ZONE1&page=1";
        let out = strip_zone(url);
        assert!(!out.contains("availableInZones"));
        assert!(out.contains("page=1"));
    }

    #[test]
    fn strip_zone_leaves_clean_urls_alone() {
        let url = "https://x.test/api?q=tv";
        assert_eq!(strip_zone(url), url);
    }

    #[test]
    fn strip_query_params_drops_keys() {
        let out = strip_query_params("https://x.test/a?page=2&offset=12&q=tv", &["page", "offset"]);
        assert!(!out.contains("page="));
        assert!(!out.contains("offset="));
        assert!(out.contains("q=tv"));
    }

    #[test]
    fn request_token_path() {
        let data = json!({"data": {"externalSearchQueryInfo": {"queryID": "abc123"}}});
        assert_eq!(request_token(&data).as_deref(), Some("abc123"));
        assert!(request_token(&json!({"data": {}})).is_none());
    }

    #[test]
    fn record_from_json_maps_fields() {
        let site = SiteProfile::default();
        let obj = json!({
            "productId": "p-1",
            "title": "TV 55",
            "shopLink": "/shop/p/tv-55",
            "unitPrice": 300000,
            "unitSalePrice": 280000,
            "rating": 4.6,
            "reviewsQuantity": 133,
            "merchantCount": 9,
            "majorMerchants": [{"title": "BestShop"}]
        });
        let rec = record_from_json(&obj, &site).expect("mapped");
        assert_eq!(rec.product_id.as_deref(), Some("p-1"));
        assert_eq!(rec.url.as_deref(), Some("https://kaspi.kz/shop/p/tv-55"));
        assert_eq!(rec.list_price, Some(300000.0));
        assert_eq!(rec.price_min, Some(280000.0));
        assert_eq!(rec.price_default, Some(280000.0));
        assert_eq!(rec.rating, Some(4.6));
        assert_eq!(rec.reviews, Some(133));
        assert_eq!(rec.offers_count, Some(9));
        assert_eq!(rec.best_merchant.as_deref(), Some("BestShop"));
    }

    #[test]
    fn record_from_json_requires_title() {
        let site = SiteProfile::default();
        assert!(record_from_json(&json!({"id": "1"}), &site).is_none());
        assert!(record_from_json(&json!({"title": "  "}), &site).is_none());
    }

    #[test]
    fn record_from_json_parses_string_prices() {
        let site = SiteProfile::default();
        let obj = json!({"name": "TV", "priceFormatted": "449 990 ₸"});
        let rec = record_from_json(&obj, &site).expect("mapped");
        assert_eq!(rec.list_price, Some(449_990.0));
        assert_eq!(rec.price_default, Some(449_990.0));
    }
}
