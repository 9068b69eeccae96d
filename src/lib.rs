// Copyright 2026 Bazaar Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bazaar library: resilient listing collector for JS-rendered marketplaces.
//!
//! The collector drives one browser session per pass, intercepts the site's
//! private background JSON calls, infers pagination from their shape, and
//! walks a priority-ordered chain of pagination strategies that all feed one
//! keyed upsert reconciler. A budgeted detail-page enricher backfills missing
//! price/rating/review fields afterwards.

pub mod cli;
pub mod collector;
pub mod config;
pub mod enrich;
pub mod error;
pub mod export;
pub mod extract;
pub mod infer;
pub mod intercept;
pub mod reconcile;
pub mod record;
pub mod session;
pub mod strategies;
