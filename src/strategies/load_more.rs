//! "Load more" button strategy.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{pause, PaginationStrategy, Pass, StrategyOutcome};

/// Repeatedly click the listing's load-more control until it disappears or
/// stops growing the card set.
pub struct LoadMore;

#[async_trait]
impl PaginationStrategy for LoadMore {
    fn name(&self) -> &'static str {
        "load-more"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let site = &pass.config.site;
        let mut clicked_once = false;
        let mut stale_rounds = 0u32;

        loop {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            let before = pass.session.visible_identities(site).await.unwrap_or_default();

            let mut clicked = false;
            for selector in &site.load_more_selectors {
                if pass.session.click_selector(selector).await.unwrap_or(false) {
                    clicked = true;
                    break;
                }
            }
            if !clicked {
                clicked = pass
                    .session
                    .click_by_text(&site.load_more_keywords)
                    .await
                    .unwrap_or(false);
            }
            if !clicked {
                return Ok(if clicked_once {
                    StrategyOutcome::Stalled
                } else {
                    StrategyOutcome::Unavailable
                });
            }
            clicked_once = true;

            let changed = pass
                .session
                .wait_identities_changed(site, &before, 8_000)
                .await;
            pass.absorb_all().await;
            debug!(changed = changed.is_some(), "load-more round");

            if changed.is_none() {
                stale_rounds += 1;
                if stale_rounds >= 2 {
                    return Ok(StrategyOutcome::Stalled);
                }
            } else {
                stale_rounds = 0;
            }
            pause(pass.config).await;
        }
    }
}
