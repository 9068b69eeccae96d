//! Browserless XHR replay strategy.
//!
//! Once the tap has established at least one item-bearing endpoint, the rest
//! of the catalog can be paged over plain HTTP, far faster than any in-page
//! strategy. Three phases, each independently bounded:
//!
//! 1. canonical results walk: when the endpoint is the site's own listing
//!    API, walk `page=1..` on it directly, with the search token probed from
//!    the sibling filters endpoint;
//! 2. offset bump: mutate offset/page/index parameters through a ladder of
//!    variants until one yields unseen identities, then ride it;
//! 3. page fallback: plain `page=N` walk for endpoints that ignored offsets.
//!
//! Termination never relies on a `hasNextPage` flag. Page budgets derive
//! from reported limit/total, and two consecutive rounds without a single
//! unseen identity end a phase.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{PaginationStrategy, Pass, StrategyOutcome};
use crate::config::{set_query_param, CollectConfig};
use crate::infer;
use crate::intercept::CapturedEndpoint;
use crate::reconcile::UpsertIndex;

/// Strategy wrapper over [`ReplayClient`].
pub struct XhrReplay;

#[async_trait]
impl PaginationStrategy for XhrReplay {
    fn name(&self) -> &'static str {
        "xhr-replay"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let endpoints = pass.tap.endpoints();
        if endpoints.is_empty() {
            return Ok(StrategyOutcome::Unavailable);
        }
        let client = ReplayClient::new(pass.config)?;
        let mut fresh_total = 0;
        for ep in &endpoints {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            match client
                .replay_endpoint(ep, pass.config, pass.index, pass.deadline)
                .await
            {
                Ok(fresh) => fresh_total += fresh,
                // Replay failures are isolated per endpoint; whatever the
                // browser already collected stands.
                Err(e) => warn!(url = ep.url, error = %e, "endpoint replay failed"),
            }
        }
        Ok(if pass.target_met() {
            StrategyOutcome::Done
        } else if fresh_total > 0 {
            StrategyOutcome::Stalled
        } else {
            StrategyOutcome::Unavailable
        })
    }
}

/// Index-parameter handling in the offset-bump ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexMode {
    MinusOne,
    Raw,
    Omit,
}

#[derive(Debug, Clone, Copy)]
struct OffsetVariant {
    with_page: bool,
    index_mode: IndexMode,
}

const OFFSET_LADDER: &[OffsetVariant] = &[
    OffsetVariant { with_page: true, index_mode: IndexMode::MinusOne },
    OffsetVariant { with_page: true, index_mode: IndexMode::Raw },
    OffsetVariant { with_page: true, index_mode: IndexMode::Omit },
    OffsetVariant { with_page: false, index_mode: IndexMode::MinusOne },
    OffsetVariant { with_page: false, index_mode: IndexMode::Raw },
    OffsetVariant { with_page: false, index_mode: IndexMode::Omit },
];

/// Maximum requests a page walk may issue: `ceil(total/limit) + 2` once both
/// are known, the configured page count until then.
fn page_budget(limit: Option<i64>, total: Option<i64>, fallback: u32) -> u32 {
    match (limit, total) {
        (Some(limit), Some(total)) if limit > 0 && total >= 0 => {
            ((total + limit - 1) / limit) as u32 + 2
        }
        _ => fallback,
    }
}

/// Plain-HTTP replayer for captured endpoints.
pub struct ReplayClient {
    http: reqwest::Client,
    inter_request_delay: Duration,
    city_header: String,
}

impl ReplayClient {
    pub fn new(config: &CollectConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.site.user_agent.clone())
            .timeout(Duration::from_secs(30));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy")?);
        }
        Ok(Self {
            http: builder.build().context("building replay client")?,
            inter_request_delay: Duration::from_millis(config.delay_ms / 3),
            city_header: config.site.city_header.clone(),
        })
    }

    /// Run every applicable phase against one endpoint, bounded by the
    /// run's wall-clock deadline. Returns the number of new identities.
    pub async fn replay_endpoint(
        &self,
        ep: &CapturedEndpoint,
        config: &CollectConfig,
        index: &mut UpsertIndex,
        deadline: Instant,
    ) -> Result<usize> {
        let mut fresh = 0;
        if ep.method == "GET" && ep.url.contains(&config.site.results_suffix) {
            fresh += self.phase_results(ep, config, index, deadline).await?;
        }
        if index.len() < config.max_items {
            fresh += match ep.post_data {
                Some(_) => self.phase_body_bump(ep, config, index, deadline).await?,
                None => self.phase_offset_bump(ep, config, index, deadline).await?,
            };
        }
        if index.len() < config.max_items {
            fresh += self.phase_page_walk(ep, config, index, deadline).await?;
        }
        info!(url = ep.url, fresh, total = index.len(), "endpoint replayed");
        Ok(fresh)
    }

    /// Phase 1: canonical listing-API walk.
    async fn phase_results(
        &self,
        ep: &CapturedEndpoint,
        config: &CollectConfig,
        index: &mut UpsertIndex,
        deadline: Instant,
    ) -> Result<usize> {
        if Instant::now() >= deadline {
            return Ok(0);
        }
        let mut canonical = ep.url.clone();
        if config.strip_zone {
            canonical = infer::strip_zone(&canonical);
        }
        let filters_url =
            canonical.replace(&config.site.results_suffix, &config.site.filters_suffix);
        if filters_url != canonical {
            match self.fetch_json(ep, &filters_url, None).await {
                Ok(data) => {
                    if let Some(token) = infer::request_token(&data) {
                        debug!(token, "search token probed");
                        canonical = set_query_param(&canonical, "requestId", &token);
                    }
                }
                Err(e) => trace!(error = %e, "filters probe failed"),
            }
        }

        let mut fresh_total = 0;
        let mut dup_rounds = 0u32;
        let mut budget = config.pages.max(1);
        let mut page = 1u32;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let url = set_query_param(&canonical, "page", &page.to_string());
            let data = match self.fetch_json(ep, &url, None).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(page, error = %e, "results page failed");
                    break;
                }
            };
            let (limit, total) = infer::limit_total(&data);
            budget = page_budget(limit, total, budget);
            let (fresh, items) = upsert_payload(&data, config, index);
            debug!(page, items, fresh, "results page");
            if fresh == 0 {
                dup_rounds += 1;
                if dup_rounds >= 2 {
                    break;
                }
            } else {
                dup_rounds = 0;
                fresh_total += fresh;
            }
            if index.len() >= config.max_items {
                break;
            }
            if let Some(total) = total {
                if total >= 0 && index.len() >= total as usize {
                    break;
                }
            }
            page += 1;
            if page > budget {
                break;
            }
            tokio::time::sleep(self.inter_request_delay).await;
        }
        Ok(fresh_total)
    }

    /// Phase 2, GET form: mutate offset-style query parameters through the
    /// variant ladder, under `all=true` first and `all=false` on retry.
    async fn phase_offset_bump(
        &self,
        ep: &CapturedEndpoint,
        config: &CollectConfig,
        index: &mut UpsertIndex,
        deadline: Instant,
    ) -> Result<usize> {
        let step = page_step(ep);
        let raw_index = raw_index_param(&ep.url);
        let mut base = ep.url.clone();
        if config.strip_zone {
            base = infer::strip_zone(&base);
        }

        let mut fresh_total = 0;
        'ladder: for variant in OFFSET_LADDER {
            if variant.index_mode == IndexMode::Raw && raw_index.is_none() {
                continue;
            }
            let mut all_flag = true;
            // Everything below the current count was already seen, so the
            // walk starts where the collection stands.
            let mut offset = (index.len() as i64).max(step);
            let mut committed = false;
            let mut dup_rounds = 0u32;
            let mut retried_at: Option<i64> = None;
            let mut total: Option<i64> = ep.hints.total;
            let mut budget = page_budget(ep.hints.limit.or(Some(step)), total, config.pages.max(1));
            let mut rounds = 0u32;

            loop {
                if Instant::now() >= deadline {
                    return Ok(fresh_total);
                }
                let url = offset_url(&base, offset, step, *variant, raw_index.as_deref(), all_flag);
                let data = match self.fetch_json(ep, &url, None).await {
                    Ok(d) => d,
                    Err(e) => {
                        trace!(error = %e, ?variant, "offset probe failed");
                        continue 'ladder;
                    }
                };
                let (limit, t) = infer::limit_total(&data);
                if t.is_some() {
                    total = t;
                }
                budget = page_budget(limit.or(Some(step)), total, budget);
                let (fresh, items) = upsert_payload(&data, config, index);
                debug!(offset, items, fresh, ?variant, all_flag, "offset round");

                if fresh > 0 {
                    committed = true;
                    dup_rounds = 0;
                    fresh_total += fresh;
                } else if !committed {
                    // The variant never worked. One all-flag toggle, then
                    // the next rung.
                    if all_flag {
                        all_flag = false;
                        continue;
                    }
                    continue 'ladder;
                } else if retried_at != Some(offset) {
                    // Same offset once more under the other flag before it
                    // counts as exhausted.
                    retried_at = Some(offset);
                    all_flag = !all_flag;
                    tokio::time::sleep(self.inter_request_delay).await;
                    continue;
                } else {
                    // The retry changed nothing; restore the committed flag
                    // and let the round count.
                    all_flag = !all_flag;
                    dup_rounds += 1;
                    if dup_rounds >= 2 {
                        return Ok(fresh_total);
                    }
                }

                if index.len() >= config.max_items {
                    return Ok(fresh_total);
                }
                offset += step;
                if let Some(total) = total {
                    if total >= 0 && offset >= total {
                        return Ok(fresh_total);
                    }
                }
                rounds += 1;
                if rounds >= budget {
                    return Ok(fresh_total);
                }
                tokio::time::sleep(self.inter_request_delay).await;
            }
        }
        Ok(fresh_total)
    }

    /// Phase 2, POST form: bump page/offset/cursor inside the body.
    async fn phase_body_bump(
        &self,
        ep: &CapturedEndpoint,
        config: &CollectConfig,
        index: &mut UpsertIndex,
        deadline: Instant,
    ) -> Result<usize> {
        let step = page_step(ep);
        let Some(seed) = ep.post_data.as_deref() else {
            return Ok(0);
        };
        let mut hints = ep.hints.clone();
        let mut body = match infer::bump_post_body(seed, &hints, step) {
            Some(b) => b,
            None => return Ok(0),
        };

        let mut fresh_total = 0;
        let mut dup_rounds = 0u32;
        let budget = page_budget(hints.limit.or(Some(step)), hints.total, config.pages.max(1));
        for _ in 0..budget {
            if Instant::now() >= deadline {
                break;
            }
            let data = match self.fetch_json(ep, &ep.url, Some(&body)).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "body bump failed");
                    break;
                }
            };
            let next_hints = infer::find_items(&data).map(|(_, h)| h);
            let (fresh, items) = upsert_payload(&data, config, index);
            debug!(items, fresh, "body round");
            if fresh == 0 {
                dup_rounds += 1;
                if dup_rounds >= 2 {
                    break;
                }
            } else {
                dup_rounds = 0;
                fresh_total += fresh;
            }
            if index.len() >= config.max_items {
                break;
            }
            if let Some(next) = next_hints {
                hints.cursor = next.cursor.or(hints.cursor);
            }
            body = match infer::bump_post_body(&body, &hints, step) {
                Some(b) => b,
                None => break,
            };
            tokio::time::sleep(self.inter_request_delay).await;
        }
        Ok(fresh_total)
    }

    /// Phase 3: plain `page=N` walk with its own budget, for endpoints that
    /// ignored offset mutation.
    async fn phase_page_walk(
        &self,
        ep: &CapturedEndpoint,
        config: &CollectConfig,
        index: &mut UpsertIndex,
        deadline: Instant,
    ) -> Result<usize> {
        if ep.method != "GET" {
            return Ok(0);
        }
        let mut base = infer::strip_query_params(&ep.url, &["offset", "start", "from"]);
        if config.strip_zone {
            base = infer::strip_zone(&base);
        }

        let mut fresh_total = 0;
        let mut barren = 0u32;
        let mut budget = page_budget(ep.hints.limit, ep.hints.total, config.pages.max(1));
        for page in 2..=budget.max(2) {
            if Instant::now() >= deadline {
                break;
            }
            let url = set_query_param(&base, "page", &page.to_string());
            let data = match self.fetch_json(ep, &url, None).await {
                Ok(d) => d,
                Err(e) => {
                    trace!(page, error = %e, "page walk failed");
                    break;
                }
            };
            let (limit, total) = infer::limit_total(&data);
            budget = page_budget(limit, total, budget);
            let (fresh, items) = upsert_payload(&data, config, index);
            debug!(page, items, fresh, "fallback page");
            if items == 0 || fresh == 0 {
                barren += 1;
                if barren >= 2 {
                    break;
                }
            } else {
                barren = 0;
                fresh_total += fresh;
            }
            if index.len() >= config.max_items {
                break;
            }
            tokio::time::sleep(self.inter_request_delay).await;
        }
        Ok(fresh_total)
    }

    async fn fetch_json(
        &self,
        ep: &CapturedEndpoint,
        url: &str,
        body: Option<&str>,
    ) -> Result<Value> {
        let mut headers = replay_headers(&ep.headers);
        // The site keys availability on the city header; when the browser
        // never sent it, derive it from the `c` query parameter.
        if !headers.contains_key(self.city_header.as_str()) {
            if let (Ok(name), Some(city)) = (
                HeaderName::from_bytes(self.city_header.as_bytes()),
                city_param(url),
            ) {
                if let Ok(value) = HeaderValue::from_str(&city) {
                    headers.insert(name, value);
                }
            }
        }
        let req = match body {
            Some(body) => self
                .http
                .post(url)
                .headers(headers)
                .header("content-type", "application/json")
                .body(body.to_string()),
            None => self.http.get(url).headers(headers),
        };
        let resp = req.send().await.context("request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("status {status} from {url}");
        }
        resp.json::<Value>().await.context("non-JSON response")
    }
}

/// Page size guess for an endpoint: reported limit, else the item count of
/// the establishing capture.
fn page_step(ep: &CapturedEndpoint) -> i64 {
    ep.hints
        .limit
        .filter(|l| *l > 0)
        .unwrap_or_else(|| ep.item_count.max(1) as i64)
}

/// The numeric city code from the `c` query parameter, if any.
fn city_param(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, v)| k == "c" && !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
        .map(|(_, v)| v.into_owned())
}

/// The raw value of the `i` index parameter on the captured URL, if any.
fn raw_index_param(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "i")
        .map(|(_, v)| v.into_owned())
}

fn offset_url(
    base: &str,
    offset: i64,
    step: i64,
    variant: OffsetVariant,
    raw_index: Option<&str>,
    all_flag: bool,
) -> String {
    let mut url = set_query_param(base, "offset", &offset.to_string());
    if variant.with_page {
        let page = offset / step.max(1) + 1;
        url = set_query_param(&url, "page", &page.to_string());
    } else {
        url = infer::strip_query_params(&url, &["page"]);
    }
    match variant.index_mode {
        IndexMode::MinusOne => url = set_query_param(&url, "i", "-1"),
        IndexMode::Raw => {
            if let Some(raw) = raw_index {
                url = set_query_param(&url, "i", raw);
            }
        }
        IndexMode::Omit => url = infer::strip_query_params(&url, &["i"]),
    }
    set_query_param(&url, "all", if all_flag { "true" } else { "false" })
}

/// Scan a payload and upsert everything it yields. Returns (fresh, items).
fn upsert_payload(data: &Value, config: &CollectConfig, index: &mut UpsertIndex) -> (usize, usize) {
    let Some((items, _)) = infer::find_items(data) else {
        return (0, 0);
    };
    let count = items.len();
    let mut fresh = 0;
    for item in &items {
        if let Some(rec) = infer::record_from_json(item, &config.site) {
            if rec.rating.is_some() || rec.reviews.is_some() {
                index.observe_rating(&rec);
            }
            if index.upsert(rec) {
                fresh += 1;
            }
        }
    }
    (fresh, count)
}

/// Captured request headers, minus the ones reqwest must own.
fn replay_headers(headers: &Value) -> HeaderMap {
    let mut map = HeaderMap::new();
    let Some(obj) = headers.as_object() else {
        return map;
    };
    for (name, value) in obj {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with(':') || lower == "host" || lower == "content-length" {
            continue;
        }
        let Some(value) = value.as_str() else { continue };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn budget_is_ceil_plus_two() {
        assert_eq!(page_budget(Some(12), Some(60), 5), 7);
        assert_eq!(page_budget(Some(12), Some(61), 5), 8);
        assert_eq!(page_budget(Some(12), Some(1), 5), 3);
        assert_eq!(page_budget(None, Some(60), 5), 5);
        assert_eq!(page_budget(Some(0), Some(60), 5), 5);
    }

    #[test]
    fn offset_url_variants() {
        let base = "https://x.test/api?q=tv&i=7";
        let v = OffsetVariant { with_page: true, index_mode: IndexMode::MinusOne };
        let url = offset_url(base, 24, 12, v, Some("7"), true);
        assert!(url.contains("offset=24"));
        assert!(url.contains("page=3"));
        assert!(url.contains("i=-1"));
        assert!(url.contains("all=true"));

        let v = OffsetVariant { with_page: false, index_mode: IndexMode::Omit };
        let url = offset_url(base, 24, 12, v, Some("7"), false);
        assert!(!url.contains("page="));
        assert!(!url.contains("i="));
        assert!(url.contains("all=false"));
    }

    #[test]
    fn raw_index_is_read_from_url() {
        assert_eq!(raw_index_param("https://x.test/a?i=42").as_deref(), Some("42"));
        assert_eq!(raw_index_param("https://x.test/a?q=tv"), None);
    }

    #[test]
    fn city_param_wants_a_digit_code() {
        assert_eq!(
            city_param("https://x.test/a?q=tv&c=750000000").as_deref(),
            Some("750000000")
        );
        assert_eq!(city_param("https://x.test/a?c=almaty"), None);
        assert_eq!(city_param("https://x.test/a?q=tv"), None);
    }

    #[test]
    fn replay_headers_skip_forbidden() {
        let headers = json!({
            "Accept": "application/json",
            "Host": "x.test",
            "Content-Length": "10",
            ":authority": "x.test",
            "x-ks-city": "750000000"
        });
        let map = replay_headers(&headers);
        assert_eq!(map.get("accept").and_then(|v| v.to_str().ok()), Some("application/json"));
        assert_eq!(map.get("x-ks-city").and_then(|v| v.to_str().ok()), Some("750000000"));
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
    }
}
