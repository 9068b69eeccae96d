//! Run configuration and the site profile.
//!
//! `CollectConfig` is everything one collection pass needs; `SiteProfile`
//! isolates the site-shaped constants (URL templates, selector ladders,
//! localized control keywords) so the engine itself stays schema-agnostic.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

/// Which entry listing(s) to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Open the category listing only.
    Category,
    /// Open the text-search listing only.
    Search,
    /// Try category first, fall back to search.
    Both,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Category => "category",
            Mode::Search => "search",
            Mode::Both => "both",
        };
        f.write_str(name)
    }
}

/// Site-shaped constants: URL templates, selectors, localized keywords.
///
/// Defaults target the marketplace the collector was built against; every
/// field can be overridden to point the engine at a lookalike site.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    /// Scheme + host, no trailing slash.
    pub base_url: String,
    /// Category listing path; `{category}` is substituted.
    pub category_path: String,
    /// Text-search path; the query is appended as the `q` parameter.
    pub search_path: String,
    /// Path suffix of the canonical listing-results endpoint.
    pub results_suffix: String,
    /// Path suffix of the filters endpoint that carries the search token.
    pub filters_suffix: String,
    /// Header the site expects the city-zone parameter in.
    pub city_header: String,
    /// Browser user agent for the session and for network replay.
    pub user_agent: String,
    /// Accept-Language sent by the session and replay requests.
    pub accept_language: String,
    /// Timezone override for the browser session.
    pub timezone: String,
    /// Card selector ladder, most specific first.
    pub card_selectors: Vec<String>,
    /// CSS selectors for the load-more affordance.
    pub load_more_selectors: Vec<String>,
    /// Visible-text keywords identifying the load-more affordance.
    pub load_more_keywords: Vec<String>,
    /// CSS selectors for consent/region overlays worth dismissing.
    pub dismiss_selectors: Vec<String>,
    /// Visible-text keywords for overlay confirm buttons.
    pub dismiss_keywords: Vec<String>,
    /// Visible-text keywords for the next-page control.
    pub next_keywords: Vec<String>,
    /// CSS selectors for the next-page control.
    pub next_selectors: Vec<String>,
    /// CSS selectors enumerating numbered page links.
    pub page_number_selectors: Vec<String>,
    /// CSS selectors for the active-page indicator.
    pub active_page_selectors: Vec<String>,
}

impl Default for SiteProfile {
    fn default() -> Self {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect();
        Self {
            base_url: "https://kaspi.kz".into(),
            category_path: "/shop/c/{category}/".into(),
            search_path: "/shop/search/".into(),
            results_suffix: "/pl/results".into(),
            filters_suffix: "/pl/filters".into(),
            city_header: "x-ks-city".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36 Edg/140.0.0.0"
                .into(),
            accept_language: "ru-RU,ru;q=0.9,en-US;q=0.8".into(),
            timezone: "Asia/Almaty".into(),
            card_selectors: s(&[
                "article[data-product-id]",
                "[data-product-id]",
                ".item-card",
                "div[itemtype*=\"Product\"]",
                "a[href*=\"/shop/p/\"]",
            ]),
            load_more_selectors: s(&[
                "[data-test=\"load-more\"]",
                "button[data-test=\"load-more\"]",
                "div[data-test=\"load-more\"] button",
            ]),
            load_more_keywords: s(&["показать ещё", "показать еще"]),
            dismiss_selectors: s(&[
                "[class*=\"cookie\"] button",
                "[id*=\"cookie\"] button",
                "[aria-label=\"Закрыть\"]",
                "[data-test=\"region-confirm\"]",
                "[data-testid=\"region-confirm\"]",
            ]),
            dismiss_keywords: s(&[
                "понятно",
                "согласен",
                "согласиться",
                "accept",
                "алматы",
                "да",
                "ок",
            ]),
            next_keywords: s(&["следующая", "дальше"]),
            next_selectors: s(&[
                "a[rel=\"next\"]",
                "[data-test=\"pagination-next\"]",
                "button[aria-label*=\"Следующая\"]",
            ]),
            page_number_selectors: s(&[".pagination__el", "nav a", "nav[aria-label=\"Pagination\"] a"]),
            active_page_selectors: s(&[
                ".pagination__el._active",
                "nav a[aria-current=\"page\"]",
                "nav li._active",
                "[data-page].is-active",
            ]),
        }
    }
}

impl SiteProfile {
    /// Absolute category listing URL. Sort order is a separate query
    /// parameter the callers layer on with [`set_query_param`].
    pub fn category_url(&self, category: &str) -> String {
        let path = self.category_path.replace("{category}", category);
        format!("{}{}", self.base_url, path)
    }

    /// Absolute text-search URL.
    pub fn search_url(&self, query: &str) -> String {
        let url = format!("{}{}", self.base_url, self.search_path);
        set_query_param(&url, "q", query)
    }

    /// Resolve a possibly site-relative href against the base URL.
    pub fn absolutize(&self, href: &str) -> String {
        if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            href.to_string()
        }
    }
}

/// Set (or replace) one query parameter on a URL, leaving the rest intact.
pub fn set_query_param(url: &str, key: &str, value: &str) -> String {
    match Url::parse(url) {
        Ok(mut u) => {
            let kept: Vec<(String, String)> = u
                .query_pairs()
                .filter(|(k, _)| k != key)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut qp = u.query_pairs_mut();
                qp.clear();
                for (k, v) in &kept {
                    qp.append_pair(k, v);
                }
                qp.append_pair(key, value);
            }
            if u.query() == Some("") {
                u.set_query(None);
            }
            u.to_string()
        }
        Err(_) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}{key}={value}")
        }
    }
}

/// Default facet values for fan-out (manufacturer names).
pub const DEFAULT_FACETS: &[&str] = &[
    "apple", "samsung", "xiaomi", "realme", "huawei", "oppo", "vivo", "tecno", "infinix",
];

/// Full configuration of one collection run.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// Search query text.
    pub query: String,
    /// Target category slug.
    pub category: String,
    /// Entry mode: category listing, text search, or both.
    pub mode: Mode,
    /// Pagination depth target (pages/rounds per strategy).
    pub pages: u32,
    /// Hard cap on collected records.
    pub max_items: usize,
    /// Base inter-action delay.
    pub delay_ms: u64,
    /// How many records the detail enricher may visit.
    pub detail_limit: usize,
    /// Run one full pass per facet and merge.
    pub split_by_facet: bool,
    /// Facet values for fan-out; empty means [`DEFAULT_FACETS`].
    pub facets: Vec<String>,
    /// Listing sort order, if any.
    pub sort: Option<String>,
    /// Paced/human-style navigation instead of network replay.
    pub paced: bool,
    /// Single facet filter applied in paced mode.
    pub paced_facet: Option<String>,
    /// Proxy server for the browser session (`http://host:port`).
    pub proxy: Option<String>,
    /// Run with a visible browser window.
    pub headful: bool,
    /// Remove the availability-zone clause from replayed queries.
    pub strip_zone: bool,
    /// Wall-clock deadline for one pass.
    pub deadline_ms: u64,
    /// When set, captured exchanges are dumped here as JSON files.
    pub dump_dir: Option<PathBuf>,
    /// Site-shaped constants.
    pub site: SiteProfile,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            query: "смартфон".into(),
            category: "smartphones".into(),
            mode: Mode::Both,
            pages: 5,
            max_items: 200,
            delay_ms: 900,
            detail_limit: 24,
            split_by_facet: false,
            facets: Vec::new(),
            sort: None,
            paced: false,
            paced_facet: None,
            proxy: None,
            headful: false,
            strip_zone: true,
            deadline_ms: 600_000,
            dump_dir: None,
            site: SiteProfile::default(),
        }
    }
}

impl CollectConfig {
    /// Base inter-action delay as a `Duration`.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// The facet list to fan out over.
    pub fn facet_list(&self) -> Vec<String> {
        if self.facets.is_empty() {
            DEFAULT_FACETS.iter().map(|s| s.to_string()).collect()
        } else {
            self.facets.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_url_substitutes() {
        let site = SiteProfile::default();
        assert_eq!(
            site.category_url("smartphones"),
            "https://kaspi.kz/shop/c/smartphones/"
        );
    }

    #[test]
    fn search_url_encodes_query() {
        let site = SiteProfile::default();
        let url = site.search_url("iphone 15");
        assert!(url.starts_with("https://kaspi.kz/shop/search/?"));
        assert!(url.contains("q=iphone+15") || url.contains("q=iphone%2015"));
    }

    #[test]
    fn set_query_param_replaces_existing() {
        let url = set_query_param("https://x.test/a?page=2&c=750", "page", "3");
        assert!(url.contains("page=3"));
        assert!(url.contains("c=750"));
        assert!(!url.contains("page=2"));
    }

    #[test]
    fn absolutize_only_touches_relative() {
        let site = SiteProfile::default();
        assert_eq!(site.absolutize("/shop/p/x-1"), "https://kaspi.kz/shop/p/x-1");
        assert_eq!(site.absolutize("https://other/p"), "https://other/p");
    }

    #[test]
    fn facet_list_falls_back_to_defaults() {
        let cfg = CollectConfig::default();
        assert_eq!(cfg.facet_list().len(), DEFAULT_FACETS.len());
        let cfg = CollectConfig {
            facets: vec!["apple".into()],
            ..CollectConfig::default()
        };
        assert_eq!(cfg.facet_list(), vec!["apple".to_string()]);
    }
}
