//! Next-link navigation strategy.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{pause, PaginationStrategy, Pass, StrategyOutcome};

/// Follow the listing's "next page" control, by selector first, by link
/// text second.
pub struct NextNav;

#[async_trait]
impl PaginationStrategy for NextNav {
    fn name(&self) -> &'static str {
        "next-nav"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let site = pass.config.site.clone();
        let mut advanced = false;
        let mut barren_pages = 0u32;
        // One hop per requested page, the control itself decides the end.
        for _ in 1..pass.config.pages.max(2) {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            let url_before = pass.session.current_url().await.unwrap_or_default();
            let before = pass.session.visible_identities(&site).await.unwrap_or_default();

            let mut clicked = false;
            for selector in &site.next_selectors {
                if pass.session.click_selector(selector).await.unwrap_or(false) {
                    clicked = true;
                    break;
                }
            }
            if !clicked {
                clicked = pass
                    .session
                    .click_by_text(&site.next_keywords)
                    .await
                    .unwrap_or(false);
            }
            if !clicked {
                return Ok(if advanced {
                    StrategyOutcome::Stalled
                } else {
                    StrategyOutcome::Unavailable
                });
            }

            let changed = pass
                .session
                .wait_identities_changed(&site, &before, 8_000)
                .await;
            let url_after = pass.session.current_url().await.unwrap_or_default();
            let fresh = pass.absorb_all().await;
            debug!(fresh, %url_after, "next-nav hop");

            // A click that changed neither URL nor identities twice in a row
            // is a dead control (disabled arrow on the last page).
            if fresh == 0 && url_after == url_before && changed.is_none() {
                barren_pages += 1;
                if barren_pages >= 2 {
                    return Ok(StrategyOutcome::Stalled);
                }
            } else {
                advanced = true;
                barren_pages = 0;
            }
            pause(pass.config).await;
        }
        Ok(if advanced {
            StrategyOutcome::Stalled
        } else {
            StrategyOutcome::Unavailable
        })
    }
}
