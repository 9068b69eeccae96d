//! Infinite-scroll strategy.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{pause, PaginationStrategy, Pass, StrategyOutcome};

/// Scroll to the document bottom until the card count stops growing.
pub struct InfiniteScroll;

#[async_trait]
impl PaginationStrategy for InfiniteScroll {
    fn name(&self) -> &'static str {
        "infinite-scroll"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let site = &pass.config.site;
        let max_rounds = (pass.config.pages.max(2) as usize) * 3;
        let mut grew = false;
        let mut stale_rounds = 0u32;

        for _ in 0..max_rounds {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            let before = pass.session.visible_identities(site).await.unwrap_or_default();
            pass.session.scroll_to_bottom().await?;
            let changed = pass
                .session
                .wait_identities_changed(site, &before, 6_000)
                .await;
            pass.absorb_all().await;
            debug!(changed = changed.is_some(), "scroll round");

            if changed.is_none() {
                stale_rounds += 1;
                if stale_rounds >= 2 {
                    break;
                }
            } else {
                grew = true;
                stale_rounds = 0;
            }
            pause(pass.config).await;
        }

        Ok(if grew {
            StrategyOutcome::Stalled
        } else {
            StrategyOutcome::Unavailable
        })
    }
}
