use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use dsa_core::{FieldNote, ProgressUpdate, ProjectRecord, QuarantineReason};
use serde::Serialize;
use tokio::sync::watch;

/// Receives per-district progress as the pipeline runs. Called inline from
/// the pipeline, so implementations must return promptly.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Quarantined,
    FieldNote,
    PageFailed,
    DetailFailed,
    ArchiveFailed,
    DistrictFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub district_code: String,
    pub kind: DiagnosticKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsa_app_id: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(district_code: &str, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            district_code: district_code.to_string(),
            kind,
            page: None,
            row: None,
            dsa_app_id: None,
            message: message.into(),
        }
    }

    /// `page_index` is zero-based; diagnostics report one-based pages.
    pub fn at_page(mut self, page_index: u32) -> Self {
        self.page = Some(page_index + 1);
        self
    }

    /// `row_index` is the zero-based data row of the page; reported one-based
    /// like pages. Header and pager rows are not counted.
    pub fn at_row(mut self, row_index: usize) -> Self {
        self.row = Some(row_index + 1);
        self
    }

    pub fn for_record(mut self, dsa_app_id: &str) -> Self {
        self.dsa_app_id = Some(dsa_app_id.to_string());
        self
    }

    pub fn quarantined(district_code: &str, reason: &QuarantineReason) -> Self {
        Self::new(district_code, DiagnosticKind::Quarantined, reason.to_string())
    }

    pub fn field_note(district_code: &str, note: &FieldNote) -> Self {
        Self::new(district_code, DiagnosticKind::FieldNote, note.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub fetched_pages: usize,
    pub parsed_records: usize,
    pub quarantined_records: usize,
}

impl Counters {
    fn add(&mut self, other: &Counters) {
        self.fetched_pages += other.fetched_pages;
        self.parsed_records += other.parsed_records;
        self.quarantined_records += other.quarantined_records;
    }
}

/// Point-in-time progress of the whole job, districts in selection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub districts: Vec<ProgressUpdate>,
    pub totals: Counters,
}

#[derive(Debug, Default)]
struct DistrictBuffer {
    counters: Counters,
    records: Vec<ProjectRecord>,
    done: bool,
}

impl DistrictBuffer {
    fn update(&self, district_code: &str) -> ProgressUpdate {
        ProgressUpdate {
            district_code: district_code.to_string(),
            fetched_pages: self.counters.fetched_pages,
            parsed_records: self.counters.parsed_records,
            quarantined_records: self.counters.quarantined_records,
            done: self.done,
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    districts: BTreeMap<String, DistrictBuffer>,
    diagnostics: Vec<Diagnostic>,
}

/// Everything the sink accumulated, fixed once the job is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutput {
    /// Unique by `dsa_app_id`; a later occurrence replaces an earlier one in place.
    pub records: Vec<ProjectRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub progress: JobProgress,
}

/// Per-job accumulator for records, counters and diagnostics.
pub struct ResultSink {
    order: Vec<String>,
    state: Mutex<SinkState>,
    progress_tx: watch::Sender<JobProgress>,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("order", &self.order)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl ResultSink {
    pub fn new(district_codes: &[String]) -> Self {
        let mut state = SinkState::default();
        for code in district_codes {
            state.districts.entry(code.clone()).or_default();
        }
        let initial = progress_of(district_codes, &state);
        let (progress_tx, _) = watch::channel(initial);
        Self {
            order: district_codes.to_vec(),
            state: Mutex::new(state),
            progress_tx,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// Live progress. Reading it never blocks the pipeline.
    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress_tx.subscribe()
    }

    pub fn snapshot(&self) -> JobProgress {
        self.progress_tx.borrow().clone()
    }

    /// Add the records of one fully processed page.
    pub fn record_page(&self, district_code: &str, records: Vec<ProjectRecord>) {
        self.mutate(district_code, |buffer, _| {
            buffer.counters.fetched_pages += 1;
            buffer.counters.parsed_records += records.len();
            buffer.records.extend(records);
        });
    }

    pub fn record_quarantine(&self, diagnostic: Diagnostic) {
        let district_code = diagnostic.district_code.clone();
        self.mutate(&district_code, |buffer, diagnostics| {
            buffer.counters.quarantined_records += 1;
            diagnostics.push(diagnostic);
        });
    }

    /// Diagnostics that do not change any counter.
    pub fn record_diagnostic(&self, diagnostic: Diagnostic) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.diagnostics.push(diagnostic);
    }

    pub fn mark_done(&self, district_code: &str) {
        self.mutate(district_code, |buffer, _| buffer.done = true);
    }

    fn mutate<F>(&self, district_code: &str, apply: F)
    where
        F: FnOnce(&mut DistrictBuffer, &mut Vec<Diagnostic>),
    {
        let (update, progress) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let SinkState {
                districts,
                diagnostics,
            } = &mut *state;
            let buffer = districts.entry(district_code.to_string()).or_default();
            apply(buffer, diagnostics);
            let update = buffer.update(district_code);
            (update, progress_of(&self.order, &state))
        };
        self.progress_tx.send_replace(progress);
        for observer in &self.observers {
            observer.on_progress(&update);
        }
    }

    /// Merge district buffers in selection order. Records sharing a
    /// `dsa_app_id` collapse to the last one seen.
    pub fn finish(self) -> SinkOutput {
        let progress = self.snapshot();
        let state = self.state.into_inner().unwrap_or_else(|e| e.into_inner());
        let SinkState {
            mut districts,
            diagnostics,
        } = state;

        let mut records: Vec<ProjectRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for code in &self.order {
            let Some(buffer) = districts.remove(code) else {
                continue;
            };
            for record in buffer.records {
                match index.get(&record.dsa_app_id) {
                    Some(&slot) => records[slot] = record,
                    None => {
                        index.insert(record.dsa_app_id.clone(), records.len());
                        records.push(record);
                    }
                }
            }
        }

        SinkOutput {
            records,
            diagnostics,
            progress,
        }
    }
}

fn progress_of(order: &[String], state: &SinkState) -> JobProgress {
    let mut totals = Counters::default();
    let districts = order
        .iter()
        .map(|code| {
            let buffer = state.districts.get(code);
            if let Some(buffer) = buffer {
                totals.add(&buffer.counters);
            }
            buffer
                .map(|b| b.update(code))
                .unwrap_or_else(|| DistrictBuffer::default().update(code))
        })
        .collect();
    JobProgress { districts, totals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsa_core::CertType;

    fn record(id: &str, name: &str, district: &str) -> ProjectRecord {
        ProjectRecord {
            district_code: district.into(),
            link: None,
            dsa_app_id: id.into(),
            ptn: None,
            name: name.into(),
            scope: String::new(),
            cert_type: CertType::Unknown,
            project_type: String::new(),
            final_cost: None,
            approval_date: None,
            address: String::new(),
            city: String::new(),
            compliance: Default::default(),
            special: Default::default(),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressUpdate>>);

    impl ProgressObserver for Recorder {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    fn codes(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn last_write_wins_in_selection_order() {
        let sink = ResultSink::new(&codes(&["360", "3672"]));
        sink.record_page("3672", vec![record("04 2", "late", "3672")]);
        sink.record_page("360", vec![record("04 1", "a", "360"), record("04 2", "early", "360")]);
        sink.record_page("360", vec![record("04 1", "a2", "360")]);

        let out = sink.finish();
        let names: Vec<(&str, &str)> = out
            .records
            .iter()
            .map(|r| (r.dsa_app_id.as_str(), r.name.as_str()))
            .collect();
        assert_eq!(names, vec![("04 1", "a2"), ("04 2", "late")]);
        assert_eq!(out.progress.totals.parsed_records, 4);
        assert_eq!(out.progress.totals.fetched_pages, 3);
    }

    #[test]
    fn observers_and_subscribers_see_counts() {
        let recorder = Arc::new(Recorder::default());
        let mut sink = ResultSink::new(&codes(&["360"]));
        sink.add_observer(recorder.clone());
        let rx = sink.subscribe();

        sink.record_page("360", vec![record("1", "x", "360")]);
        sink.record_quarantine(
            Diagnostic::quarantined("360", &QuarantineReason::MissingAppId)
                .at_page(0)
                .at_row(0),
        );
        sink.record_diagnostic(Diagnostic::new("360", DiagnosticKind::PageFailed, "timeout"));
        sink.mark_done("360");

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        let last = seen.last().unwrap();
        assert_eq!(
            (last.fetched_pages, last.parsed_records, last.quarantined_records, last.done),
            (1, 1, 1, true)
        );
        assert_eq!(rx.borrow().totals.quarantined_records, 1);

        let out = sink.finish();
        assert_eq!(out.diagnostics.len(), 2);
        assert_eq!(out.diagnostics[0].page, Some(1));
        assert_eq!(out.diagnostics[0].row, Some(1));
    }
}
