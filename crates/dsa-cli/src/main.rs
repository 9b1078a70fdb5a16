//! dsa-cli - browse the district catalog and export DSA project records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dsa_adapters::ClassificationRules;
use dsa_core::{District, JobState, ProgressUpdate};
use dsa_sync::{
    write_views, DistrictCatalog, DistrictOutcome, JobConfig, JobProgress, JobResult, Pipeline,
    ProgressObserver, RunStats, ScrapeJob,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dsa-cli")]
#[command(about = "Export California DSA school construction projects by district")]
struct Cli {
    /// District catalog (YAML).
    #[arg(long, global = true, default_value = "districts.yaml")]
    catalog: PathBuf,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List counties in the catalog.
    Counties,
    /// List districts, optionally for one county.
    Districts {
        #[arg(long)]
        county: Option<String>,
    },
    /// Fetch, normalize and export projects for the selected districts.
    Scrape(ScrapeArgs),
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    /// District code; repeat for several districts.
    #[arg(long = "district", value_name = "CODE")]
    districts: Vec<String>,
    /// Restrict `--district` codes to this county.
    #[arg(long)]
    county: Option<String>,
    /// Select every district of `--county`.
    #[arg(long, requires = "county")]
    all_in_county: bool,
    /// Minimum seconds between requests.
    #[arg(long)]
    delay: Option<f64>,
    /// Forward proxy URL (http, https, socks5).
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    max_pages: Option<u32>,
    /// Districts fetched at once; requests stay paced job-wide.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Also fetch application summary and certification pages.
    #[arg(long)]
    details: bool,
    /// Keep raw fetched pages under this directory.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Classification rules (YAML). Built-in rules are used when absent.
    #[arg(long, default_value = "rules/classification.yaml")]
    rules: PathBuf,
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ScrapeSummary<'a> {
    job_id: Uuid,
    state: JobState,
    failure: Option<&'a str>,
    records: usize,
    diagnostics: usize,
    districts: &'a [DistrictOutcome],
    progress: &'a JobProgress,
    stats: &'a RunStats,
    files: Vec<String>,
}

struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_progress(&self, update: &ProgressUpdate) {
        if update.done {
            info!(
                district = %update.district_code,
                pages = update.fetched_pages,
                parsed = update.parsed_records,
                quarantined = update.quarantined_records,
                "district done"
            );
        } else {
            debug!(
                district = %update.district_code,
                pages = update.fetched_pages,
                parsed = update.parsed_records,
                quarantined = update.quarantined_records,
                "progress"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "dsa=debug,warn" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let catalog = DistrictCatalog::load(&cli.catalog)?;
    match cli.command {
        Commands::Counties => {
            for county in catalog.counties() {
                println!("{county}");
            }
        }
        Commands::Districts { county } => {
            let districts: Vec<&District> = match county.as_deref() {
                Some(county) => catalog
                    .districts_in(county)
                    .with_context(|| format!("unknown county {county}"))?
                    .iter()
                    .collect(),
                None => catalog.all().collect(),
            };
            for d in districts {
                println!("{}\t{}\t{}", d.code, d.name, d.county);
            }
        }
        Commands::Scrape(args) => scrape(&catalog, args).await?,
    }

    Ok(())
}

fn select_districts(catalog: &DistrictCatalog, args: &ScrapeArgs) -> Result<Vec<District>> {
    let mut selected = catalog.select(args.districts.as_slice())?;
    if let Some(county) = args.county.as_deref() {
        let in_county = catalog
            .districts_in(county)
            .ok_or_else(|| dsa_sync::ConfigError::UnknownCounty(county.to_string()))?;
        if let Some(stray) = selected.iter().find(|d| !in_county.contains(d)) {
            bail!("district {} is in {}, not {county}", stray.code, stray.county);
        }
        if args.all_in_county {
            for district in in_county {
                if !selected.contains(district) {
                    selected.push(district.clone());
                }
            }
        }
    }
    Ok(selected)
}

fn job_config(args: &ScrapeArgs) -> JobConfig {
    let mut config = JobConfig::from_env();
    if let Some(delay) = args.delay {
        config.delay_seconds = delay;
    }
    if let Some(proxy) = &args.proxy {
        config.proxy = Some(proxy.clone());
    }
    if let Some(max_pages) = args.max_pages {
        config.max_pages = max_pages;
    }
    if let Some(concurrency) = args.concurrency {
        config.district_concurrency = concurrency;
    }
    if args.details {
        config.fetch_details = true;
    }
    if let Some(archive) = &args.archive {
        config.archive_dir = Some(archive.clone());
    }
    config
}

fn load_rules(path: &Path) -> Result<ClassificationRules> {
    if path.exists() {
        ClassificationRules::load(path)
    } else {
        info!(path = %path.display(), "no rules file, using built-in classification");
        Ok(ClassificationRules::default())
    }
}

async fn scrape(catalog: &DistrictCatalog, args: ScrapeArgs) -> Result<()> {
    let districts = select_districts(catalog, &args)?;
    let job = ScrapeJob::new(districts, job_config(&args))?;
    let pipeline = Pipeline::new(load_rules(&args.rules)?).with_observer(Arc::new(LogProgress));

    let token = job.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight requests");
            token.cancel();
        }
    });

    let result = pipeline.run(&job).await?;
    let files = write_export(&args.out, &result).await?;
    report(&result, &files, args.json)?;

    if result.state == JobState::Failed {
        bail!(
            "job finished with failures: {}",
            result.failure.as_deref().unwrap_or("unknown cause")
        );
    }
    Ok(())
}

async fn write_export(out: &Path, result: &JobResult) -> Result<Vec<PathBuf>> {
    let export_name = result.export_file_name(chrono::Local::now().naive_local());
    write_views(out, &export_name, &result.views()).await
}

fn report(result: &JobResult, files: &[PathBuf], json: bool) -> Result<()> {
    let summary = ScrapeSummary {
        job_id: result.job_id,
        state: result.state,
        failure: result.failure.as_deref(),
        records: result.records.len(),
        diagnostics: result.diagnostics.len(),
        districts: &result.districts,
        progress: &result.progress,
        stats: &result.stats,
        files: files.iter().map(|p| p.display().to_string()).collect(),
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing run summary")?
        );
        return Ok(());
    }

    println!(
        "scrape {:?}: job_id={} records={} quarantined={} pages={} requests={} retries={} elapsed_ms={}",
        summary.state,
        summary.job_id,
        summary.records,
        result.progress.totals.quarantined_records,
        result.progress.totals.fetched_pages,
        result.stats.total_requests,
        result.stats.retries,
        result.stats.elapsed_ms,
    );
    for diagnostic in &result.diagnostics {
        println!(
            "  {:?} {} page={} row={} {}",
            diagnostic.kind,
            diagnostic.district_code,
            diagnostic.page.map(|p| p.to_string()).unwrap_or_default(),
            diagnostic.row.map(|r| r.to_string()).unwrap_or_default(),
            diagnostic.message
        );
    }
    for file in &summary.files {
        println!("wrote {file}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DistrictCatalog {
        DistrictCatalog::from_yaml_str(
            r#"
counties:
  - name: San Bernardino
    districts:
      - { name: Chaffey Joint Union High, code: "36-67" }
      - { name: Fontana Unified, code: "3672" }
  - name: Alameda
    districts:
      - { name: Alameda Unified, code: "360" }
"#,
        )
        .unwrap()
    }

    fn args(argv: &[&str]) -> ScrapeArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Scrape(args) => args,
            other => panic!("expected scrape, got {other:?}"),
        }
    }

    #[test]
    fn county_selection_appends_after_explicit_codes() {
        let args = args(&[
            "dsa-cli", "scrape", "--district", "3672", "--county", "San Bernardino", "--all-in-county",
        ]);
        let codes: Vec<String> = select_districts(&catalog(), &args)
            .unwrap()
            .into_iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(codes, vec!["3672", "36-67"]);
    }

    #[test]
    fn district_outside_county_is_rejected() {
        let args = args(&["dsa-cli", "scrape", "--district", "360", "--county", "San Bernardino"]);
        assert!(select_districts(&catalog(), &args).is_err());
    }

    #[test]
    fn flags_override_config() {
        let args = args(&[
            "dsa-cli", "scrape", "--district", "360", "--delay", "2.5", "--max-pages", "7", "--details",
        ]);
        let config = job_config(&args);
        assert_eq!(config.delay_seconds, 2.5);
        assert_eq!(config.max_pages, 7);
        assert!(config.fetch_details);
    }

    #[test]
    fn all_in_county_needs_a_county() {
        assert!(Cli::try_parse_from(["dsa-cli", "scrape", "--all-in-county"]).is_err());
    }
}
