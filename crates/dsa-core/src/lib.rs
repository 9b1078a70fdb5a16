//! Core domain model for DSA project exports.

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dsa-core";

/// A school district as listed in the district catalog. The code is the
/// identifier the registry expects in list requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct District {
    pub county: String,
    pub name: String,
    pub code: String,
}

/// Certification classification of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CertType {
    /// Plan-check stage, not yet certified.
    Pc,
    /// Certified and closed by DSA.
    Dsa,
    /// A recognized letter type that is neither of the above (voids, exceptions).
    Other,
    #[default]
    Unknown,
}

impl CertType {
    pub fn as_str(self) -> &'static str {
        match self {
            CertType::Pc => "PC",
            CertType::Dsa => "DSA",
            CertType::Other => "OTHER",
            CertType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compliance and life-safety indicators from the application summary page.
/// `None` means the page was not fetched or did not list the indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceFlags {
    pub auto_fire_detection: Option<bool>,
    pub sprinkler_system: Option<bool>,
    pub access_compliance: Option<bool>,
    pub fire_life_safety: Option<bool>,
    pub structural_safety: Option<bool>,
}

impl ComplianceFlags {
    pub const LABELS: [&'static str; 5] = [
        "Auto Fire Detection",
        "Sprinkler System",
        "Access Compliance",
        "Fire & Life Safety",
        "Structural Safety",
    ];

    pub fn slot_mut(&mut self, label: &str) -> Option<&mut Option<bool>> {
        match label {
            "Auto Fire Detection" => Some(&mut self.auto_fire_detection),
            "Sprinkler System" => Some(&mut self.sprinkler_system),
            "Access Compliance" => Some(&mut self.access_compliance),
            "Fire & Life Safety" => Some(&mut self.fire_life_safety),
            "Structural Safety" => Some(&mut self.structural_safety),
            _ => None,
        }
    }

    /// Labels of the indicators that are checked, in display order.
    pub fn set_labels(&self) -> Vec<&'static str> {
        let values = [
            self.auto_fire_detection,
            self.sprinkler_system,
            self.access_compliance,
            self.fire_life_safety,
            self.structural_safety,
        ];
        Self::LABELS
            .iter()
            .zip(values)
            .filter(|(_, v)| *v == Some(true))
            .map(|(label, _)| *label)
            .collect()
    }
}

/// Special program indicators plus the free-text class/type fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialAttributes {
    pub sb_575: Option<bool>,
    pub new_campus: Option<bool>,
    pub modernization: Option<bool>,
    pub field_review: Option<bool>,
    pub cgs_review: Option<bool>,
    pub hps: Option<bool>,
    pub project_class: Option<String>,
    pub special_type: Option<String>,
}

impl SpecialAttributes {
    pub const LABELS: [&'static str; 6] = [
        "SB 575",
        "New Campus",
        "Modernization",
        "Field Review",
        "CGS Review",
        "HPS",
    ];

    pub fn slot_mut(&mut self, label: &str) -> Option<&mut Option<bool>> {
        match label {
            "SB 575" => Some(&mut self.sb_575),
            "New Campus" => Some(&mut self.new_campus),
            "Modernization" => Some(&mut self.modernization),
            "Field Review" => Some(&mut self.field_review),
            "CGS Review" => Some(&mut self.cgs_review),
            "HPS" => Some(&mut self.hps),
            _ => None,
        }
    }

    pub fn set_labels(&self) -> Vec<String> {
        let values = [
            self.sb_575,
            self.new_campus,
            self.modernization,
            self.field_review,
            self.cgs_review,
            self.hps,
        ];
        let mut out: Vec<String> = Self::LABELS
            .iter()
            .zip(values)
            .filter(|(_, v)| *v == Some(true))
            .map(|(label, _)| (*label).to_string())
            .collect();
        if let Some(class) = &self.project_class {
            out.push(format!("Project Class: {class}"));
        }
        if let Some(special) = &self.special_type {
            out.push(format!("Special Type: {special}"));
        }
        out
    }
}

/// Canonical normalized project. Identity is `dsa_app_id`; a later record with
/// the same id replaces an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub district_code: String,
    pub link: Option<String>,
    pub dsa_app_id: String,
    pub ptn: Option<String>,
    pub name: String,
    pub scope: String,
    pub cert_type: CertType,
    pub project_type: String,
    pub final_cost: Option<Decimal>,
    pub approval_date: Option<NaiveDate>,
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub compliance: ComplianceFlags,
    #[serde(default)]
    pub special: SpecialAttributes,
}

/// One table row as extracted, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub page_index: u32,
    pub row_index: usize,
    pub cells: Vec<String>,
    /// `href` of the first anchor in the row, unresolved.
    pub link_href: Option<String>,
}

impl RawRow {
    /// Cell text by position; absent trailing cells read as empty.
    pub fn cell(&self, index: usize) -> &str {
        self.cells.get(index).map(String::as_str).unwrap_or("")
    }
}

/// Why a whole row was withheld from the record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuarantineReason {
    MalformedRow { expected_min: usize, found: usize },
    MissingAppId,
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::MalformedRow {
                expected_min,
                found,
            } => write!(f, "row has {found} cells, expected at least {expected_min}"),
            QuarantineReason::MissingAppId => f.write_str("row has no DSA application id"),
        }
    }
}

/// A field that was kept on the record but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNote {
    pub field: String,
    pub raw: String,
    pub reason: String,
}

impl FieldNote {
    pub fn new(field: &str, raw: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.field, self.raw, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job cannot move from {:?} to {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Pending -> Running -> {Completed, Failed, Cancelled}. A pending job may
    /// also be cancelled or failed before it starts.
    pub fn advance(self, to: JobState) -> Result<JobState, InvalidTransition> {
        let allowed = match (self, to) {
            (JobState::Pending, JobState::Running) => true,
            (JobState::Pending, JobState::Cancelled | JobState::Failed) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

/// Pagination position for one district. Page indexes are zero-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub district_code: String,
    pub page_index: u32,
    pub has_more: bool,
}

impl PageCursor {
    pub fn new(district_code: impl Into<String>) -> Self {
        Self {
            district_code: district_code.into(),
            page_index: 0,
            has_more: true,
        }
    }

    pub fn advance(&mut self, has_more: bool) {
        self.page_index += 1;
        self.has_more = self.has_more && has_more;
    }

    pub fn exhaust(&mut self) {
        self.has_more = false;
    }
}

/// Counter snapshot pushed to progress observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub district_code: String,
    pub fetched_pages: usize,
    pub parsed_records: usize,
    pub quarantined_records: usize,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Overview,
    Financial,
    Technical,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Overview, ViewKind::Financial, ViewKind::Technical];

    pub fn slug(self) -> &'static str {
        match self {
            ViewKind::Overview => "overview",
            ViewKind::Financial => "financial",
            ViewKind::Technical => "technical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_only_moves_forward() {
        assert_eq!(JobState::Pending.advance(JobState::Running), Ok(JobState::Running));
        assert_eq!(JobState::Running.advance(JobState::Completed), Ok(JobState::Completed));
        assert!(JobState::Completed.advance(JobState::Running).is_err());
        assert!(JobState::Running.advance(JobState::Pending).is_err());
        assert!(JobState::Cancelled.advance(JobState::Completed).is_err());
        assert!(JobState::Pending.advance(JobState::Completed).is_err());
    }

    #[test]
    fn cursor_stays_exhausted() {
        let mut cursor = PageCursor::new("36-67");
        cursor.advance(true);
        assert_eq!(cursor.page_index, 1);
        assert!(cursor.has_more);
        cursor.exhaust();
        cursor.advance(true);
        assert!(!cursor.has_more);
    }

    #[test]
    fn flag_labels_follow_display_order() {
        let compliance = ComplianceFlags {
            structural_safety: Some(true),
            auto_fire_detection: Some(true),
            sprinkler_system: Some(false),
            ..Default::default()
        };
        assert_eq!(
            compliance.set_labels(),
            vec!["Auto Fire Detection", "Structural Safety"]
        );

        let special = SpecialAttributes {
            modernization: Some(true),
            project_class: Some("1".into()),
            ..Default::default()
        };
        assert_eq!(
            special.set_labels(),
            vec!["Modernization".to_string(), "Project Class: 1".to_string()]
        );
    }

    #[test]
    fn cert_type_serializes_as_code() {
        let json = serde_json::to_string(&CertType::Pc).unwrap();
        assert_eq!(json, "\"PC\"");
        assert_eq!(CertType::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn raw_row_missing_cells_read_empty() {
        let row = RawRow {
            page_index: 0,
            row_index: 3,
            cells: vec!["04 1".into()],
            link_href: None,
        };
        assert_eq!(row.cell(0), "04 1");
        assert_eq!(row.cell(7), "");
    }
}
