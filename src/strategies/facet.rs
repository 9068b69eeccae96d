//! Facet fan-out strategy.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{pause, run_ui_chain, PaginationStrategy, Pass, StrategyOutcome};
use crate::config::set_query_param;

/// Re-run the search narrowed by each configured facet term and paginate
/// each narrowed listing with the in-page strategies. Overlap between facets
/// is expected; the reconciler collapses it.
pub struct FacetFanOut;

#[async_trait]
impl PaginationStrategy for FacetFanOut {
    fn name(&self) -> &'static str {
        "facet-fan-out"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        if !pass.config.split_by_facet {
            return Ok(StrategyOutcome::Unavailable);
        }
        let facets = pass.config.facet_list();
        if facets.is_empty() {
            return Ok(StrategyOutcome::Unavailable);
        }

        let site = pass.config.site.clone();
        let outer_entry = pass.entry_url.clone();
        let mut gained_any = false;

        for facet in &facets {
            if pass.should_stop() {
                break;
            }
            let query = format!("{} {}", pass.config.query, facet);
            let mut url = site.search_url(&query);
            if let Some(sort) = &pass.config.sort {
                url = set_query_param(&url, "sort", sort);
            }
            info!(facet, "fanning out");
            if let Err(e) = pass.session.navigate(&url, 30_000).await {
                warn!(facet, error = %e, "facet navigation failed");
                continue;
            }
            pass.session.dismiss_overlays(&site).await;
            if pass.session.wait_any_cards(&site, 10_000).await.is_err() {
                warn!(facet, "facet listing never rendered");
                continue;
            }

            let before = pass.index.len();
            pass.absorb_all().await;
            pass.entry_url = url;
            let _ = run_ui_chain(pass).await?;
            if pass.index.len() > before {
                gained_any = true;
            }
            pause(pass.config).await;
        }
        pass.entry_url = outer_entry;

        Ok(if pass.target_met() {
            StrategyOutcome::Done
        } else if gained_any {
            StrategyOutcome::Stalled
        } else {
            StrategyOutcome::Unavailable
        })
    }
}
