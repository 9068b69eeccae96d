//! The `collect` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use crate::collector::Collector;
use crate::config::{CollectConfig, Mode};
use crate::export;

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Search query
    #[arg(long, default_value = "смартфон")]
    pub query: String,

    /// Category slug for category-mode listings
    #[arg(long, default_value = "smartphones")]
    pub category: String,

    /// Which listing surfaces to collect
    #[arg(long, value_enum, default_value_t = Mode::Search)]
    pub mode: Mode,

    /// Page budget per listing
    #[arg(long, default_value = "5")]
    pub pages: u32,

    /// Stop once this many distinct items are collected
    #[arg(long, default_value = "200")]
    pub max_items: usize,

    /// Base delay between browser actions, in milliseconds
    #[arg(long, default_value = "900")]
    pub delay_ms: u64,

    /// How many gap-bearing records to enrich from detail pages (0 disables)
    #[arg(long, default_value = "24")]
    pub detail_limit: usize,

    /// Disable the facet fan-out strategy
    #[arg(long)]
    pub no_facets: bool,

    /// Run one full browser pass per facet instead of a single pass
    #[arg(long)]
    pub split_runs: bool,

    /// Facet terms for fan-out (comma-separated; defaults to common brands)
    #[arg(long, value_delimiter = ',')]
    pub facets: Vec<String>,

    /// Sort order passed to the listing (site-specific)
    #[arg(long)]
    pub sort: Option<String>,

    /// Low-and-slow mode: human-paced browsing, no HTTP replay
    #[arg(long)]
    pub paced: bool,

    /// Restrict a paced run to a single facet
    #[arg(long)]
    pub paced_facet: Option<String>,

    /// Proxy server, e.g. socks5://127.0.0.1:9050
    #[arg(long)]
    pub proxy: Option<String>,

    /// Run with a visible browser window
    #[arg(long)]
    pub headful: bool,

    /// Keep the availability-zone clause on replayed URLs
    #[arg(long)]
    pub keep_zone: bool,

    /// Wall-clock budget for the whole run, in milliseconds
    #[arg(long, default_value = "600000")]
    pub deadline_ms: u64,

    /// Dump every examined response body into this directory
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,

    /// Output CSV path (defaults to listings-<timestamp>.csv)
    #[arg(long, short)]
    pub out: Option<PathBuf>,
}

fn default_out() -> PathBuf {
    PathBuf::from(format!(
        "listings-{}.csv",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ))
}

impl CollectArgs {
    fn into_config(self) -> (CollectConfig, PathBuf, bool) {
        let defaults = CollectConfig::default();
        let split_runs = self.split_runs;
        let config = CollectConfig {
            query: self.query,
            category: self.category,
            mode: self.mode,
            pages: self.pages,
            max_items: self.max_items,
            delay_ms: self.delay_ms,
            detail_limit: self.detail_limit,
            split_by_facet: !self.no_facets,
            facets: self.facets,
            sort: self.sort,
            paced: self.paced,
            paced_facet: self.paced_facet,
            proxy: self.proxy,
            headful: self.headful,
            strip_zone: !self.keep_zone,
            deadline_ms: self.deadline_ms,
            dump_dir: self.dump_dir,
            site: defaults.site,
        };
        let out = self.out.unwrap_or_else(default_out);
        (config, out, split_runs)
    }
}

pub async fn run(args: CollectArgs) -> Result<()> {
    let (config, out, split_runs) = args.into_config();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    spinner.set_message(format!(
        "collecting \"{}\" ({} mode, {} pages)...",
        config.query, config.mode, config.pages
    ));

    let facets = config.facet_list();
    let collector = Collector::new(config);
    let records = if split_runs {
        collector.collect_split(&facets).await?
    } else {
        collector.collect().await?
    };
    spinner.finish_and_clear();

    export::write_csv(&out, &records)?;

    let with_errors = records.iter().filter(|r| r.errors.is_some()).count();
    let with_rating = records.iter().filter(|r| r.rating.is_some()).count();
    println!("Collected {} items -> {}", records.len(), out.display());
    println!("  with rating: {with_rating}");
    if with_errors > 0 {
        println!("  with errors: {with_errors}");
    }
    Ok(())
}
