//! Pagination strategies and the fallback chain that runs them.
//!
//! The listing surface decides nothing; each strategy tries to advance
//! pagination its own way, absorbing items from the network tap and the DOM
//! as it goes, and reports how far it got. The chain walks the strategies in
//! a fixed order, from least to most invasive, and stops as soon as the item
//! target is met or the deadline passes.

pub mod facet;
pub mod load_more;
pub mod next_nav;
pub mod numbered;
pub mod page_param;
pub mod paced;
pub mod replay;
pub mod scroll;

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::CollectConfig;
use crate::extract;
use crate::infer;
use crate::intercept::TapHandle;
use crate::reconcile::UpsertIndex;
use crate::session::Session;

/// How a strategy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// Item target met or catalog exhausted. The chain stops.
    Done,
    /// Progress was made but the strategy ran out of road. The chain moves
    /// on to the next strategy.
    Stalled,
    /// The strategy could not operate at all on this page.
    Unavailable,
}

/// Everything one strategy pass needs: the live page, the network tap, the
/// accumulating index, and the run bounds.
pub struct Pass<'a> {
    pub session: &'a Session,
    pub tap: &'a TapHandle,
    pub config: &'a CollectConfig,
    /// Listing URL the chain entered on; URL-deriving strategies start here.
    pub entry_url: String,
    pub deadline: Instant,
    pub index: &'a mut UpsertIndex,
}

impl Pass<'_> {
    pub fn target_met(&self) -> bool {
        self.index.len() >= self.config.max_items
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn should_stop(&self) -> bool {
        self.target_met() || self.deadline_passed()
    }

    /// Drain the tap and upsert every captured item. Returns the number of
    /// new identities.
    pub fn absorb_batches(&mut self) -> usize {
        let mut fresh = 0;
        for batch in self.tap.drain_batches() {
            for item in &batch.items {
                if let Some(rec) = infer::record_from_json(item, &self.config.site) {
                    // Payload ratings go to the cache first; the row they
                    // belong to may already exist under a different key.
                    if rec.rating.is_some() || rec.reviews.is_some() {
                        self.index.observe_rating(&rec);
                    }
                    if self.index.upsert(rec) {
                        fresh += 1;
                    }
                }
            }
        }
        fresh
    }

    /// Extract the rendered cards and upsert them. Returns the number of
    /// new identities.
    pub async fn absorb_dom(&mut self) -> Result<usize> {
        let records = extract::extract_cards(self.session, &self.config.site).await?;
        let mut fresh = 0;
        for rec in records {
            if self.index.upsert(rec) {
                fresh += 1;
            }
        }
        Ok(fresh)
    }

    /// Both absorption paths in one call, tap first.
    pub async fn absorb_all(&mut self) -> usize {
        let mut fresh = self.absorb_batches();
        fresh += self.absorb_dom().await.unwrap_or(0);
        fresh
    }
}

/// One way of advancing pagination.
#[async_trait]
pub trait PaginationStrategy {
    fn name(&self) -> &'static str;
    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome>;
}

/// Sleep the configured inter-action delay with +-40% jitter.
pub async fn pause(config: &CollectConfig) {
    let base = config.delay_ms.max(1) as f64;
    let jittered = base * rand::thread_rng().gen_range(0.6..1.4);
    tokio::time::sleep(Duration::from_millis(jittered as u64)).await;
}

/// Run the in-page strategies (load-more, scroll, page-param, next-nav,
/// numbered links) in order. Used both by the full chain and by the facet
/// fan-out on each facet's page.
pub async fn run_ui_chain(pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
    let strategies: Vec<Box<dyn PaginationStrategy + Send + Sync>> = vec![
        Box::new(load_more::LoadMore),
        Box::new(scroll::InfiniteScroll),
        Box::new(page_param::PageParam),
        Box::new(next_nav::NextNav),
        Box::new(numbered::NumberedLinks),
    ];
    run_list(pass, &strategies).await
}

/// Run the full fallback chain. Paced mode replaces the whole chain with the
/// single low-and-slow strategy; otherwise the UI strategies run first, then
/// facet fan-out, then browserless replay.
pub async fn run_chain(pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
    if pass.config.paced {
        let strategies: Vec<Box<dyn PaginationStrategy + Send + Sync>> =
            vec![Box::new(paced::Paced)];
        return run_list(pass, &strategies).await;
    }
    let outcome = run_ui_chain(pass).await?;
    if outcome == StrategyOutcome::Done {
        return Ok(outcome);
    }
    let tail: Vec<Box<dyn PaginationStrategy + Send + Sync>> = vec![
        Box::new(facet::FacetFanOut),
        Box::new(replay::XhrReplay),
    ];
    run_list(pass, &tail).await
}

async fn run_list(
    pass: &mut Pass<'_>,
    strategies: &[Box<dyn PaginationStrategy + Send + Sync>],
) -> Result<StrategyOutcome> {
    let mut best = StrategyOutcome::Unavailable;
    for strategy in strategies {
        if pass.should_stop() {
            return Ok(StrategyOutcome::Done);
        }
        let before = pass.index.len();
        let result = strategy.run(pass).await;
        pass.absorb_all().await;
        let gained = pass.index.len() - before;
        // A strategy error (lost selector, navigation timeout, replay
        // failure) ends that strategy, not the chain.
        let outcome = result.unwrap_or_else(|e| {
            warn!(strategy = strategy.name(), error = %e, "strategy aborted");
            outcome_after_error(gained)
        });
        info!(
            strategy = strategy.name(),
            ?outcome,
            gained,
            total = pass.index.len(),
            "strategy finished"
        );
        match outcome {
            StrategyOutcome::Done => return Ok(StrategyOutcome::Done),
            StrategyOutcome::Stalled => best = StrategyOutcome::Stalled,
            StrategyOutcome::Unavailable => {
                debug!(strategy = strategy.name(), "not applicable here");
            }
        }
        if pass.should_stop() {
            return Ok(StrategyOutcome::Done);
        }
    }
    Ok(best)
}

/// Chain-level reading of a failed strategy: progress before the failure
/// still counts, a fruitless failure does not.
fn outcome_after_error(gained: usize) -> StrategyOutcome {
    if gained > 0 {
        StrategyOutcome::Stalled
    } else {
        StrategyOutcome::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_strategies_demote_instead_of_aborting() {
        assert_eq!(outcome_after_error(3), StrategyOutcome::Stalled);
        assert_eq!(outcome_after_error(0), StrategyOutcome::Unavailable);
    }
}
