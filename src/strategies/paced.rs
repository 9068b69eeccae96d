//! Low-and-slow collection mode.
//!
//! Everything the fast chain does in minutes, this does in a human-looking
//! trickle: gentle scrolls, long jittered dwells, one page at a time, DOM
//! and passive capture only. Replay is deliberately off the table here; a
//! burst of API requests would defeat the point of pacing. Pages advance
//! the way a person advances them, by clicking the next page number and
//! watching the active indicator flip; direct URL navigation is the
//! fallback for listings without a pager.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use super::numbered::{active_page_script, click_next_number_script};
use super::{PaginationStrategy, Pass, StrategyOutcome};
use crate::config::{set_query_param, SiteProfile};
use crate::session::Session;

pub struct Paced;

async fn dwell(base_ms: u64) {
    let jittered = (base_ms.max(500) as f64) * rand::thread_rng().gen_range(0.8..1.8);
    tokio::time::sleep(Duration::from_millis(jittered as u64)).await;
}

/// Poll the active-page indicator until it shows `want`.
async fn wait_active_page(
    session: &Session,
    site: &SiteProfile,
    want: u32,
    timeout_ms: u64,
) -> bool {
    let script = active_page_script(&site.active_page_selectors);
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        let active: Option<u32> = session.execute_js(&script).await.unwrap_or(None);
        if active == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    false
}

#[async_trait]
impl PaginationStrategy for Paced {
    fn name(&self) -> &'static str {
        "paced"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let site = pass.config.site.clone();
        let mut entry = pass.entry_url.clone();
        if let Some(facet) = &pass.config.paced_facet {
            entry = site.search_url(&format!("{} {}", pass.config.query, facet));
            if let Some(sort) = &pass.config.sort {
                entry = set_query_param(&entry, "sort", sort);
            }
            info!(facet, "paced run narrowed to one facet");
            pass.session.navigate(&entry, 45_000).await?;
            pass.session.dismiss_overlays(&site).await;
        }

        let click_script =
            click_next_number_script(&site.page_number_selectors, &site.active_page_selectors);
        let long_pause = pass.config.delay_ms.saturating_mul(3);
        let max_attempts = pass.config.pages.saturating_mul(2).max(2);
        let mut barren_rounds = 0u32;
        let mut page = 1u32;

        for _ in 0..max_attempts {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            if pass.session.wait_any_cards(&site, 15_000).await.is_err() {
                barren_rounds += 1;
                if barren_rounds >= 2 {
                    break;
                }
                continue;
            }

            // Scroll in small steps with reading-length dwells between.
            let steps = rand::thread_rng().gen_range(3..6);
            for _ in 0..steps {
                pass.session
                    .execute_js::<serde_json::Value>(
                        "(() => { window.scrollBy(0, window.innerHeight * 0.7); return null; })()",
                    )
                    .await?;
                dwell(pass.config.delay_ms).await;
            }
            pass.session.scroll_to_bottom().await?;
            dwell(pass.config.delay_ms).await;

            let fresh = pass.absorb_all().await;
            debug!(page, fresh, total = pass.index.len(), "paced page done");
            if fresh == 0 {
                barren_rounds += 1;
                if barren_rounds >= 2 {
                    break;
                }
            } else {
                barren_rounds = 0;
            }
            if page >= pass.config.pages {
                break;
            }

            let clicked: Option<u32> = pass.session.execute_js(&click_script).await.unwrap_or(None);
            match clicked {
                Some(next) => {
                    if wait_active_page(pass.session, &site, next, 10_000).await {
                        page = next;
                    } else {
                        debug!(next, "pager click never confirmed");
                        barren_rounds += 1;
                    }
                }
                // No pager rendered; fall back to navigating the URL.
                None => {
                    page += 1;
                    let url = set_query_param(&entry, "page", &page.to_string());
                    pass.session.navigate(&url, 45_000).await?;
                    pass.session.dismiss_overlays(&site).await;
                }
            }
            dwell(long_pause).await;
        }

        Ok(if pass.target_met() {
            StrategyOutcome::Done
        } else {
            StrategyOutcome::Stalled
        })
    }
}
