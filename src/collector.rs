//! End-to-end collection runs.
//!
//! A run launches one browser session, walks each entry listing through the
//! strategy chain, then closes the browser and enriches the gap-bearing
//! tail over plain HTTP. A listing that never renders is logged and skipped;
//! whatever the other entries produced is still returned.

use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tracing::{info, warn};

use crate::config::{set_query_param, CollectConfig, Mode};
use crate::enrich::{self, Enricher};
use crate::intercept::TapHandle;
use crate::reconcile::UpsertIndex;
use crate::record::ProductRecord;
use crate::session::Session;
use crate::strategies::{run_chain, Pass};

pub struct Collector {
    config: CollectConfig,
}

impl Collector {
    pub fn new(config: CollectConfig) -> Self {
        Self { config }
    }

    /// Entry listings for the configured mode, sort applied when set.
    fn entry_urls(&self) -> Vec<String> {
        let site = &self.config.site;
        let mut urls = Vec::new();
        match self.config.mode {
            Mode::Category => urls.push(site.category_url(&self.config.category)),
            Mode::Search => urls.push(site.search_url(&self.config.query)),
            Mode::Both => {
                urls.push(site.category_url(&self.config.category));
                urls.push(site.search_url(&self.config.query));
            }
        }
        if let Some(sort) = &self.config.sort {
            urls = urls
                .iter()
                .map(|u| set_query_param(u, "sort", sort))
                .collect();
        }
        urls
    }

    /// Run the full collection. Rating gaps are bridged from the cache one
    /// last time before enrichment so the HTTP budget goes to records that
    /// actually still need it.
    pub async fn collect(&self) -> Result<Vec<ProductRecord>> {
        let session = Session::launch(&self.config).await?;
        let tap = TapHandle::attach(session.page(), self.config.dump_dir.clone()).await?;
        let deadline = Instant::now() + Duration::from_millis(self.config.deadline_ms);
        let mut index = UpsertIndex::new();

        for entry in self.entry_urls() {
            if Instant::now() >= deadline || index.len() >= self.config.max_items {
                break;
            }
            if let Err(e) = self
                .run_entry(&session, &tap, &mut index, &entry, deadline)
                .await
            {
                warn!(entry, error = %e, "entry listing abandoned");
            }
        }

        if let Err(e) = session.close().await {
            warn!(error = %e, "browser close failed");
        }
        drop(tap);

        let bridged = index.apply_rating_cache();
        if bridged > 0 {
            info!(bridged, "rating gaps bridged from cache");
        }

        let mut records = index.into_records();
        if self.config.detail_limit > 0 {
            let enricher = Enricher::new(&self.config)?;
            let enriched = enricher
                .enrich(&mut records, self.config.detail_limit)
                .await;
            info!(enriched, "detail enrichment done");
        }
        enrich::backfill_prices(&mut records);
        info!(count = records.len(), "collection finished");
        Ok(records)
    }

    /// Run one full pass per facet-qualified query, merging everything into
    /// a single reconciled set. Iterations are sequential with a jittered
    /// pause between them.
    pub async fn collect_split(&self, facets: &[String]) -> Result<Vec<ProductRecord>> {
        let mut merged = UpsertIndex::new();
        for (i, facet) in facets.iter().enumerate() {
            let sub = Collector::new(CollectConfig {
                query: format!("{} {}", self.config.query, facet),
                // Inner fan-out would square the facet work.
                split_by_facet: false,
                facets: Vec::new(),
                ..self.config.clone()
            });
            info!(facet, pass = i + 1, total = facets.len(), "split pass");
            match sub.collect().await {
                Ok(records) => {
                    for rec in records {
                        merged.upsert(rec);
                    }
                }
                Err(e) => warn!(facet, error = %e, "split pass failed"),
            }
            if i + 1 < facets.len() {
                let jitter = rand::thread_rng().gen_range(0.8..1.6);
                let pause = (self.config.delay_ms as f64 * 4.0 * jitter) as u64;
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }
        let mut records = merged.into_records();
        enrich::backfill_prices(&mut records);
        Ok(records)
    }

    async fn run_entry(
        &self,
        session: &Session,
        tap: &TapHandle,
        index: &mut UpsertIndex,
        entry: &str,
        deadline: Instant,
    ) -> Result<()> {
        info!(entry, "collecting listing");
        session.navigate(entry, 45_000).await?;
        session.dismiss_overlays(&self.config.site).await;
        let cards = session.wait_any_cards(&self.config.site, 20_000).await?;
        info!(cards, "listing rendered");

        // The site may have redirected (zone parameters, canonical slugs);
        // URL-deriving strategies should start from where we actually are.
        let resolved = session.current_url().await.ok().filter(|u| !u.is_empty());

        let mut pass = Pass {
            session,
            tap,
            config: &self.config,
            entry_url: resolved.unwrap_or_else(|| entry.to_string()),
            deadline,
            index,
        };
        pass.absorb_all().await;
        let outcome = run_chain(&mut pass).await?;
        // Late responses can land between the last absorb and here.
        pass.absorb_batches();
        info!(?outcome, total = index.len(), "chain finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_urls_follow_mode_and_carry_sort() {
        let collector = Collector::new(CollectConfig {
            mode: Mode::Both,
            sort: Some("price_asc".into()),
            ..CollectConfig::default()
        });
        let urls = collector.entry_urls();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].contains("/shop/c/smartphones/"));
        assert!(urls[1].contains("/shop/search/"));
        assert!(urls.iter().all(|u| u.contains("sort=price_asc")));

        let collector = Collector::new(CollectConfig {
            mode: Mode::Search,
            ..CollectConfig::default()
        });
        let urls = collector.entry_urls();
        assert_eq!(urls.len(), 1);
        assert!(!urls[0].contains("sort="));
    }
}
