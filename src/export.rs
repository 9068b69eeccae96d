//! CSV export.

use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;
use tracing::info;

use crate::record::ProductRecord;

/// Column order is part of the output contract; downstream sheets key on it.
const COLUMNS: &[&str] = &[
    "product_id",
    "title",
    "url",
    "list_price",
    "price_min",
    "price_default",
    "rating",
    "reviews",
    "offers_count",
    "best_merchant",
    "errors",
];

fn fmt_f64(v: Option<f64>) -> String {
    match v {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{v}"),
        None => String::new(),
    }
}

fn fmt_u32(v: Option<u32>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Write records to `path` in the fixed column order.
pub fn write_csv(path: &Path, records: &[ProductRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writer.write_record(COLUMNS).context("writing header")?;
    for rec in records {
        writer
            .write_record([
                rec.product_id.clone().unwrap_or_default(),
                rec.title.clone(),
                rec.url.clone().unwrap_or_default(),
                fmt_f64(rec.list_price),
                fmt_f64(rec.price_min),
                fmt_f64(rec.price_default),
                fmt_f64(rec.rating),
                fmt_u32(rec.reviews),
                fmt_u32(rec.offers_count),
                rec.best_merchant.clone().unwrap_or_default(),
                rec.errors.clone().unwrap_or_default(),
            ])
            .context("writing record")?;
    }
    writer.flush().context("flushing csv")?;
    info!(path = %path.display(), count = records.len(), "exported");
    Ok(())
}
