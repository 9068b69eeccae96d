//! URL page-parameter strategy.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{pause, PaginationStrategy, Pass, StrategyOutcome};
use crate::config::set_query_param;

/// Walk `?page=2..N` on the entry URL directly. Works on listings that
/// render server-side pages and on SPAs that honor the parameter.
pub struct PageParam;

#[async_trait]
impl PaginationStrategy for PageParam {
    fn name(&self) -> &'static str {
        "page-param"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let site = pass.config.site.clone();
        let entry = pass.entry_url.clone();
        let mut barren_pages = 0u32;
        let mut gained_any = false;

        for page in 2..=pass.config.pages {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            let url = set_query_param(&entry, "page", &page.to_string());
            pass.session.navigate(&url, 30_000).await?;
            pass.session.dismiss_overlays(&site).await;

            let rendered = pass.session.wait_any_cards(&site, 10_000).await.is_ok();
            let fresh = if rendered { pass.absorb_all().await } else { 0 };
            debug!(page, fresh, rendered, "page-param round");

            if fresh == 0 {
                barren_pages += 1;
                if barren_pages >= 2 {
                    break;
                }
            } else {
                gained_any = true;
                barren_pages = 0;
            }
            pause(pass.config).await;
        }

        Ok(if gained_any {
            StrategyOutcome::Stalled
        } else {
            StrategyOutcome::Unavailable
        })
    }
}
