//! Scrape job orchestration: district selection, paced pagination, normalization
//! into a result sink, and the export views built from it.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use dsa_adapters::{
    parse_application_summary, parse_base_url, parse_certification_page, AdapterError,
    ClassificationRules, NormalizedRow, Normalizer, MIN_ROW_CELLS,
};
use dsa_core::{District, InvalidTransition, JobState, ProjectRecord, QuarantineReason};
use dsa_storage::{ArtifactStore, FetchError, HttpFetcher, PageTransport};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod job;
pub mod pager;
pub mod sink;
pub mod views;

pub use catalog::DistrictCatalog;
pub use config::{ConfigError, JobConfig, MAX_DELAY_SECONDS, MAX_DISTRICT_CONCURRENCY};
pub use job::ScrapeJob;
pub use pager::{DistrictError, DistrictPager, FetchedPage, PageOutcome};
pub use sink::{
    Counters, Diagnostic, DiagnosticKind, JobProgress, ProgressObserver, ResultSink, SinkOutput,
};
pub use views::{
    compose_views, export_file_name, view_file_name, write_views, ProjectViews, ProjectionView,
};

pub const CRATE_NAME: &str = "dsa-sync";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DistrictStatus {
    Completed,
    Cancelled,
    Failed { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistrictOutcome {
    pub district: District,
    pub pages_fetched: usize,
    #[serde(flatten)]
    pub status: DistrictStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub retries: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub state: JobState,
    /// Human-readable cause when `state` is `Failed`.
    pub failure: Option<String>,
    pub districts: Vec<DistrictOutcome>,
    pub records: Vec<ProjectRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub progress: JobProgress,
    pub stats: RunStats,
}

impl JobResult {
    pub fn views(&self) -> ProjectViews {
        compose_views(&self.records)
    }

    pub fn district_codes(&self) -> Vec<String> {
        self.districts.iter().map(|o| o.district.code.clone()).collect()
    }

    pub fn export_file_name(&self, timestamp: NaiveDateTime) -> String {
        export_file_name(&self.district_codes(), timestamp)
    }
}

/// Runs [`ScrapeJob`]s. One pipeline can run many jobs; pacing state lives
/// with each run, so the minimum request gap is enforced per job.
pub struct Pipeline {
    rules: ClassificationRules,
    transport: Option<Arc<dyn PageTransport>>,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl Pipeline {
    pub fn new(rules: ClassificationRules) -> Self {
        Self {
            rules,
            transport: None,
            observers: Vec::new(),
        }
    }

    /// Replace the reqwest transport, e.g. with recorded pages.
    pub fn with_transport(mut self, transport: Arc<dyn PageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// A sink wired to this pipeline's observers. Subscribe to it before
    /// handing it to [`Pipeline::run_with_sink`] to follow progress live.
    pub fn sink_for(&self, job: &ScrapeJob) -> ResultSink {
        let mut sink = ResultSink::new(&job.district_codes());
        for observer in &self.observers {
            sink.add_observer(observer.clone());
        }
        sink
    }

    pub async fn run(&self, job: &ScrapeJob) -> Result<JobResult, JobError> {
        let sink = self.sink_for(job);
        self.run_with_sink(job, sink).await
    }

    pub async fn run_with_sink(&self, job: &ScrapeJob, sink: ResultSink) -> Result<JobResult, JobError> {
        let config = job.config();
        let prepared = parse_base_url(&config.base_url)
            .map_err(JobError::from)
            .and_then(|base_url| {
                let http = config.http_client_config();
                let fetcher = match &self.transport {
                    Some(transport) => HttpFetcher::with_transport(transport.clone(), &http),
                    None => HttpFetcher::new(http)?,
                };
                Ok((base_url, fetcher))
            });
        let (base_url, fetcher) = match prepared {
            Ok(parts) => parts,
            Err(err) => {
                job.transition(JobState::Failed)?;
                return Err(err);
            }
        };

        job.transition(JobState::Running)?;
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        info!(
            job_id = %job.id(),
            districts = job.districts().len(),
            delay_seconds = config.delay_seconds,
            concurrency = config.district_concurrency,
            "scrape job started"
        );

        let normalizer = Normalizer::new(base_url, self.rules.clone());
        let archive = config.archive_dir.clone().map(ArtifactStore::new);
        let ctx = RunContext {
            job,
            fetcher: &fetcher,
            normalizer: &normalizer,
            sink: &sink,
            archive: archive.as_ref(),
            started_at,
        };

        let mut outcomes: Vec<(usize, DistrictOutcome)> = stream::iter(job.districts().iter().enumerate())
            .map(|(position, district)| {
                let ctx = &ctx;
                async move { (position, ctx.run_district(district).await) }
            })
            .buffer_unordered(config.district_concurrency.clamp(1, MAX_DISTRICT_CONCURRENCY))
            .collect()
            .await;
        outcomes.sort_by_key(|(position, _)| *position);
        let districts: Vec<DistrictOutcome> = outcomes.into_iter().map(|(_, o)| o).collect();

        let failures: Vec<String> = districts
            .iter()
            .filter_map(|o| match &o.status {
                DistrictStatus::Failed { cause } => Some(format!("district {}: {cause}", o.district.code)),
                _ => None,
            })
            .collect();
        let state = if job.is_cancelled() {
            JobState::Cancelled
        } else if failures.is_empty() {
            JobState::Completed
        } else {
            JobState::Failed
        };
        let state = job.transition(state)?;

        let output = sink.finish();
        let fetch_stats = fetcher.stats();
        let stats = RunStats {
            total_requests: fetch_stats.total_requests,
            successful_requests: fetch_stats.successful_requests,
            failed_requests: fetch_stats.failed_requests,
            retries: fetch_stats.retries,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
        };
        info!(
            job_id = %job.id(),
            state = ?state,
            records = output.records.len(),
            quarantined = output.progress.totals.quarantined_records,
            requests = stats.total_requests,
            "scrape job finished"
        );

        Ok(JobResult {
            job_id: job.id(),
            state,
            failure: (!failures.is_empty()).then(|| failures.join("; ")),
            districts,
            records: output.records,
            diagnostics: output.diagnostics,
            progress: output.progress,
            stats,
        })
    }
}

struct RunContext<'a> {
    job: &'a ScrapeJob,
    fetcher: &'a HttpFetcher,
    normalizer: &'a Normalizer,
    sink: &'a ResultSink,
    archive: Option<&'a ArtifactStore>,
    started_at: DateTime<Utc>,
}

impl RunContext<'_> {
    async fn run_district(&self, district: &District) -> DistrictOutcome {
        let code = district.code.as_str();
        let span = info_span!("district", code);
        async {
            let mut pager = DistrictPager::new(
                self.fetcher,
                self.normalizer.base_url(),
                self.job.id(),
                code,
                self.job.config().max_pages,
                self.job.cancellation_token(),
            );
            let mut pages_fetched = 0usize;
            let status = loop {
                match pager.next_page().await {
                    Ok(Some(PageOutcome::Fetched(page))) => {
                        pages_fetched += 1;
                        self.process_page(code, page).await;
                    }
                    Ok(Some(PageOutcome::Failed {
                        page_index,
                        url,
                        error,
                    })) => {
                        warn!(page = page_index + 1, %url, error = %error, "page skipped");
                        self.sink.record_diagnostic(
                            Diagnostic::new(code, DiagnosticKind::PageFailed, error.to_string())
                                .at_page(page_index),
                        );
                    }
                    Ok(None) if self.job.is_cancelled() => break DistrictStatus::Cancelled,
                    Ok(None) => break DistrictStatus::Completed,
                    Err(err) => {
                        warn!(error = %err, "district failed");
                        self.sink.record_diagnostic(Diagnostic::new(
                            code,
                            DiagnosticKind::DistrictFailed,
                            err.to_string(),
                        ));
                        break DistrictStatus::Failed {
                            cause: err.to_string(),
                        };
                    }
                }
            };
            self.sink.mark_done(code);
            info!(pages = pages_fetched, status = ?status, "district finished");
            DistrictOutcome {
                district: district.clone(),
                pages_fetched,
                status,
            }
        }
        .instrument(span)
        .await
    }

    async fn archive(&self, code: &str, page_index: u32, body: &[u8]) {
        let Some(store) = self.archive else {
            return;
        };
        if let Err(err) = store.store_page(self.started_at, code, body).await {
            warn!(error = %format!("{err:#}"), "archiving page failed");
            self.sink.record_diagnostic(
                Diagnostic::new(code, DiagnosticKind::ArchiveFailed, format!("{err:#}"))
                    .at_page(page_index),
            );
        }
    }

    fn quarantine(&self, code: &str, page_index: u32, row_index: usize, reason: &QuarantineReason) {
        warn!(page = page_index + 1, row = row_index + 1, %reason, "row quarantined");
        self.sink.record_quarantine(
            Diagnostic::quarantined(code, reason)
                .at_page(page_index)
                .at_row(row_index),
        );
    }

    /// A page's records reach the sink together, after any enrichment.
    async fn process_page(&self, code: &str, page: FetchedPage) {
        self.archive(code, page.page_index, &page.body).await;

        for malformed in &page.extracted.malformed {
            let reason = QuarantineReason::MalformedRow {
                expected_min: MIN_ROW_CELLS,
                found: malformed.found_cells,
            };
            self.quarantine(code, page.page_index, malformed.row_index, &reason);
        }

        let mut records = Vec::with_capacity(page.extracted.rows.len());
        for row in &page.extracted.rows {
            match self.normalizer.normalize(code, row) {
                Ok(NormalizedRow { mut record, notes }) => {
                    for note in &notes {
                        warn!(page = page.page_index + 1, row = row.row_index + 1, %note, "field not parsed");
                        self.sink.record_diagnostic(
                            Diagnostic::field_note(code, note)
                                .at_page(page.page_index)
                                .at_row(row.row_index)
                                .for_record(&record.dsa_app_id),
                        );
                    }
                    if self.job.config().fetch_details {
                        self.enrich(code, page.page_index, &mut record).await;
                    }
                    records.push(record);
                }
                Err(reason) => self.quarantine(code, page.page_index, row.row_index, &reason),
            }
        }
        self.sink.record_page(code, records);
    }

    fn detail_failed(&self, code: &str, record: &ProjectRecord, message: String) {
        warn!(dsa_app_id = %record.dsa_app_id, %message, "detail enrichment failed");
        self.sink.record_diagnostic(
            Diagnostic::new(code, DiagnosticKind::DetailFailed, message).for_record(&record.dsa_app_id),
        );
    }

    fn field_notes(&self, code: &str, record: &ProjectRecord, notes: Vec<dsa_core::FieldNote>) {
        for note in notes {
            warn!(dsa_app_id = %record.dsa_app_id, %note, "detail field not parsed");
            self.sink.record_diagnostic(
                Diagnostic::field_note(code, &note).for_record(&record.dsa_app_id),
            );
        }
    }

    async fn fetch_body(&self, code: &str, page_index: u32, url: &str) -> Result<String, FetchError> {
        let response = self.fetcher.fetch_page(self.job.id(), code, url).await?;
        self.archive(code, page_index, &response.body).await;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    /// Application summary then certification page. Failures keep the
    /// list-level record and leave a diagnostic. Cancellation is checked
    /// before each request; a response already in flight is still applied.
    async fn enrich(&self, code: &str, page_index: u32, record: &mut ProjectRecord) {
        let Some(link) = record.link.clone() else {
            return;
        };
        if self.job.is_cancelled() {
            return;
        }
        match self.fetch_body(code, page_index, &link).await {
            Ok(body) => match parse_application_summary(&body) {
                Ok(detail) => {
                    let notes = self.normalizer.apply_detail(record, &detail);
                    self.field_notes(code, record, notes);
                }
                Err(err) => self.detail_failed(code, record, format!("application summary: {err}")),
            },
            Err(err) => self.detail_failed(code, record, format!("application summary: {err}")),
        }

        let cert_url = match self.normalizer.certification_url(record) {
            Ok(Some(url)) => url,
            Ok(None) => return,
            Err(err) => {
                self.detail_failed(code, record, format!("certification link: {err}"));
                return;
            }
        };
        if self.job.is_cancelled() {
            return;
        }
        match self.fetch_body(code, page_index, &cert_url).await {
            Ok(body) => match parse_certification_page(&body) {
                Ok(Some(letter)) => {
                    if let Some(note) = self.normalizer.apply_certification(record, &letter) {
                        self.field_notes(code, record, vec![note]);
                    }
                }
                Ok(None) => {}
                Err(err) => self.detail_failed(code, record, format!("certification page: {err}")),
            },
            Err(err) => self.detail_failed(code, record, format!("certification page: {err}")),
        }
    }
}
