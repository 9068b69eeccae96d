//! Keyed upsert reconciliation.
//!
//! Every pagination strategy and the network interceptor feed candidate
//! records into one [`UpsertIndex`], so duplicates across strategies
//! self-suppress. Merging is monotonic: a field that already holds a
//! non-null/non-zero value is never reset by a later candidate.
//!
//! Rating and review data frequently arrive through a background JSON call
//! before (or after) the DOM row they belong to. The side [`RatingCache`]
//! tracks the best pair seen per identity and is re-applied after every
//! write, so convergence does not depend on arrival order.

use std::collections::HashMap;

use crate::record::ProductRecord;

/// Best rating/review pair seen per identity, keyed both by product id and
/// by the title/price fallback key.
#[derive(Debug, Default)]
pub struct RatingCache {
    map: HashMap<String, (Option<f64>, Option<u32>)>,
}

impl RatingCache {
    fn keys_for(rec: &ProductRecord) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(id) = &rec.product_id {
            if !id.is_empty() {
                keys.push(id.clone());
            }
        }
        let fallback = rec.fallback_key();
        if !keys.contains(&fallback) {
            keys.push(fallback);
        }
        keys
    }

    /// Record the rating/review pair of `rec`, keeping earlier non-zero
    /// values when the new record carries none.
    pub fn observe(&mut self, rec: &ProductRecord) {
        let rating = rec.rating.filter(|r| *r != 0.0);
        let reviews = rec.reviews.filter(|r| *r != 0);
        for key in Self::keys_for(rec) {
            let entry = self.map.entry(key).or_insert((None, None));
            if rating.is_some() {
                entry.0 = rating;
            }
            if reviews.is_some() {
                entry.1 = reviews;
            }
        }
    }

    /// Fill missing rating/reviews on `rec` from the cache. Returns whether
    /// anything was applied.
    pub fn apply(&self, rec: &mut ProductRecord) -> bool {
        let mut applied = false;
        for key in Self::keys_for(rec) {
            let Some((rating, reviews)) = self.map.get(&key) else {
                continue;
            };
            if let Some(r) = rating {
                if rec.rating.is_none() || rec.rating == Some(0.0) {
                    rec.rating = Some(*r);
                    applied = true;
                }
            }
            if let Some(v) = reviews {
                if rec.reviews.is_none() || rec.reviews == Some(0) {
                    rec.reviews = Some(*v);
                    applied = true;
                }
            }
            if applied {
                break;
            }
        }
        applied
    }
}

/// Insertion-ordered `identity -> record` upsert index.
#[derive(Debug, Default)]
pub struct UpsertIndex {
    records: Vec<ProductRecord>,
    by_key: HashMap<String, usize>,
    ratings: RatingCache,
}

impl UpsertIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProductRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [ProductRecord] {
        &mut self.records
    }

    /// Consume the index, yielding records in insertion order.
    pub fn into_records(self) -> Vec<ProductRecord> {
        self.records
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.by_key.contains_key(identity)
    }

    /// Insert-or-merge. Returns `true` when the identity was unseen.
    ///
    /// Candidates without a title carry no usable identity and are dropped.
    pub fn upsert(&mut self, candidate: ProductRecord) -> bool {
        if candidate.title.is_empty() {
            return false;
        }
        let key = candidate.identity();
        match self.by_key.get(&key) {
            Some(&i) => {
                merge_into(&mut self.records[i], &candidate);
                self.ratings.apply(&mut self.records[i]);
                false
            }
            None => {
                let mut rec = candidate;
                self.ratings.apply(&mut rec);
                self.by_key.insert(key, self.records.len());
                self.records.push(rec);
                true
            }
        }
    }

    /// Feed the rating cache from any source record (the record itself need
    /// not be upserted), then re-apply the cache to every stored record.
    pub fn observe_rating(&mut self, rec: &ProductRecord) {
        self.ratings.observe(rec);
        self.apply_rating_cache();
    }

    /// Re-apply the rating cache to all records. Returns how many changed.
    pub fn apply_rating_cache(&mut self) -> usize {
        let mut updated = 0;
        for rec in &mut self.records {
            if self.ratings.apply(rec) {
                updated += 1;
            }
        }
        updated
    }
}

/// Copy into `dst` only the fields it is still missing; concatenate errors.
fn merge_into(dst: &mut ProductRecord, src: &ProductRecord) {
    if dst.url.is_none() && src.url.is_some() {
        dst.url = src.url.clone();
    }
    if dst.list_price.is_none() && src.list_price.is_some() {
        dst.list_price = src.list_price;
    }
    if dst.price_min.is_none() && src.price_min.is_some() {
        dst.price_min = src.price_min;
    }
    if dst.price_default.is_none() && src.price_default.is_some() {
        dst.price_default = src.price_default;
    }
    let dst_rating_empty = dst.rating.is_none() || dst.rating == Some(0.0);
    if dst_rating_empty && matches!(src.rating, Some(r) if r != 0.0) {
        dst.rating = src.rating;
    }
    let dst_reviews_empty = dst.reviews.is_none() || dst.reviews == Some(0);
    if dst_reviews_empty && matches!(src.reviews, Some(v) if v != 0) {
        dst.reviews = src.reviews;
    }
    if dst.best_merchant.is_none() && src.best_merchant.is_some() {
        dst.best_merchant = src.best_merchant.clone();
    }
    let dst_offers_empty = dst.offers_count.is_none() || dst.offers_count == Some(0);
    if dst_offers_empty && matches!(src.offers_count, Some(v) if v != 0) {
        dst.offers_count = src.offers_count;
    }
    if let Some(e) = &src.errors {
        dst.annotate_error(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, title: &str) -> ProductRecord {
        ProductRecord {
            product_id: if id.is_empty() { None } else { Some(id.into()) },
            title: title.into(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut idx = UpsertIndex::new();
        let mut r = rec("5", "Phone");
        r.list_price = Some(100.0);
        r.rating = Some(4.5);
        assert!(idx.upsert(r.clone()));
        assert!(!idx.upsert(r));
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.records()[0].list_price, Some(100.0));
        assert_eq!(idx.records()[0].rating, Some(4.5));
    }

    #[test]
    fn merge_never_clears_fields() {
        let mut idx = UpsertIndex::new();
        let mut full = rec("5", "Phone");
        full.list_price = Some(100.0);
        full.rating = Some(4.5);
        full.reviews = Some(12);
        idx.upsert(full);

        let mut sparse = rec("5", "Phone");
        sparse.rating = Some(0.0);
        sparse.reviews = Some(0);
        assert!(!idx.upsert(sparse));

        let stored = &idx.records()[0];
        assert_eq!(stored.list_price, Some(100.0));
        assert_eq!(stored.rating, Some(4.5));
        assert_eq!(stored.reviews, Some(12));
    }

    #[test]
    fn partial_records_sharing_identity_merge() {
        let mut idx = UpsertIndex::new();
        let mut a = rec("7", "Phone");
        a.url = Some("https://x.test/p/7".into());
        let mut b = rec("7", "Phone");
        b.list_price = Some(99.0);
        b.best_merchant = Some("Shop".into());
        idx.upsert(a);
        idx.upsert(b);
        assert_eq!(idx.len(), 1);
        let stored = &idx.records()[0];
        assert_eq!(stored.url.as_deref(), Some("https://x.test/p/7"));
        assert_eq!(stored.list_price, Some(99.0));
        assert_eq!(stored.best_merchant.as_deref(), Some("Shop"));
    }

    #[test]
    fn rating_arrives_late() {
        // Scenario C: {id:5, rating:None} then {id:5, rating:4.5}.
        let mut idx = UpsertIndex::new();
        idx.upsert(rec("5", "Phone"));
        let mut rated = rec("5", "Phone");
        rated.rating = Some(4.5);
        idx.upsert(rated);
        assert_eq!(idx.records()[0].rating, Some(4.5));
    }

    #[test]
    fn rating_arrives_early() {
        // Scenario C reversed: the rated candidate comes first.
        let mut idx = UpsertIndex::new();
        let mut rated = rec("5", "Phone");
        rated.rating = Some(4.5);
        idx.upsert(rated);
        idx.upsert(rec("5", "Phone"));
        assert_eq!(idx.records()[0].rating, Some(4.5));
    }

    #[test]
    fn rating_cache_bridges_sources_before_insert() {
        // XHR payload observed before the DOM row exists.
        let mut idx = UpsertIndex::new();
        let mut xhr = rec("9", "Phone");
        xhr.rating = Some(4.2);
        xhr.reviews = Some(88);
        idx.observe_rating(&xhr);

        idx.upsert(rec("9", "Phone"));
        let stored = &idx.records()[0];
        assert_eq!(stored.rating, Some(4.2));
        assert_eq!(stored.reviews, Some(88));
    }

    #[test]
    fn rating_cache_bridges_sources_after_insert() {
        let mut idx = UpsertIndex::new();
        idx.upsert(rec("9", "Phone"));
        let mut xhr = rec("9", "Phone");
        xhr.rating = Some(4.2);
        idx.observe_rating(&xhr);
        assert_eq!(idx.records()[0].rating, Some(4.2));
    }

    #[test]
    fn rating_cache_matches_on_fallback_key() {
        // DOM row without a product id, payload with one but the same
        // title/price composite.
        let mut idx = UpsertIndex::new();
        let mut dom = rec("", "Phone");
        dom.list_price = Some(100.0);
        idx.upsert(dom);

        let mut xhr = rec("77", "Phone");
        xhr.list_price = Some(100.0);
        xhr.rating = Some(3.9);
        idx.observe_rating(&xhr);
        assert_eq!(idx.records()[0].rating, Some(3.9));
    }

    #[test]
    fn disjoint_pages_accumulate() {
        // Scenario A: 20 + 15 disjoint identities -> 35 records.
        let mut idx = UpsertIndex::new();
        for i in 0..20 {
            idx.upsert(rec(&format!("a{i}"), &format!("A {i}")));
        }
        for i in 0..15 {
            idx.upsert(rec(&format!("b{i}"), &format!("B {i}")));
        }
        assert_eq!(idx.len(), 35);
    }

    #[test]
    fn overlapping_facets_dedupe() {
        // Scenario D: two facets of 3 identities sharing one -> 5, not 6.
        let mut idx = UpsertIndex::new();
        for id in ["f1", "f2", "shared"] {
            idx.upsert(rec(id, id));
        }
        for id in ["g1", "g2", "shared"] {
            idx.upsert(rec(id, id));
        }
        assert_eq!(idx.len(), 5);
    }

    #[test]
    fn error_annotations_concatenate() {
        let mut idx = UpsertIndex::new();
        let mut a = rec("1", "P");
        a.errors = Some("first".into());
        let mut b = rec("1", "P");
        b.errors = Some("second".into());
        idx.upsert(a);
        idx.upsert(b);
        assert_eq!(idx.records()[0].errors.as_deref(), Some("first; second"));
    }

    #[test]
    fn titleless_candidates_are_dropped() {
        let mut idx = UpsertIndex::new();
        assert!(!idx.upsert(ProductRecord::default()));
        assert!(idx.is_empty());
    }
}
