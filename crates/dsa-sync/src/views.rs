use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use dsa_core::{ProjectRecord, ViewKind};
use serde::Serialize;
use tokio::fs;

pub const OVERVIEW_COLUMNS: [&str; 6] = [
    "Link",
    "DSA AppId",
    "PTN",
    "Project Name",
    "Project Scope",
    "Project Cert Type",
];

pub const FINANCIAL_COLUMNS: [&str; 6] = [
    "DSA AppId",
    "Final Project Cost",
    "Approval Date",
    "Project Type",
    "City",
    "Address",
];

pub const TECHNICAL_COLUMNS: [&str; 4] = [
    "DSA AppId",
    "Cert Type",
    "Compliance/Safety attributes",
    "Special project attributes",
];

const EXPORT_PREFIX: &str = "dsa_projects";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A fixed-column projection over a record set, already rendered to text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionView {
    pub kind: ViewKind,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<String>>,
}

impl ProjectionView {
    pub fn columns_for(kind: ViewKind) -> &'static [&'static str] {
        match kind {
            ViewKind::Overview => &OVERVIEW_COLUMNS,
            ViewKind::Financial => &FINANCIAL_COLUMNS,
            ViewKind::Technical => &TECHNICAL_COLUMNS,
        }
    }

    pub fn project(kind: ViewKind, records: &[ProjectRecord]) -> Self {
        Self {
            kind,
            columns: Self::columns_for(kind).to_vec(),
            rows: records.iter().map(|r| render_row(kind, r)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// CRLF-terminated CSV with a header row. Fields holding a comma, quote or
    /// line break are quoted.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, self.columns.iter().copied());
        for row in &self.rows {
            push_line(&mut out, row.iter().map(String::as_str));
        }
        out
    }
}

fn push_line<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    let line = fields.map(escape_csv).collect::<Vec<_>>().join(",");
    out.push_str(&line);
    out.push_str("\r\n");
}

fn escape_csv(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn render_row(kind: ViewKind, r: &ProjectRecord) -> Vec<String> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    match kind {
        ViewKind::Overview => vec![
            opt(&r.link),
            r.dsa_app_id.clone(),
            opt(&r.ptn),
            r.name.clone(),
            r.scope.clone(),
            r.cert_type.to_string(),
        ],
        ViewKind::Financial => vec![
            r.dsa_app_id.clone(),
            r.final_cost.map(|c| format!("{c:.2}")).unwrap_or_default(),
            r.approval_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            r.project_type.clone(),
            r.city.clone(),
            r.address.clone(),
        ],
        ViewKind::Technical => vec![
            r.dsa_app_id.clone(),
            r.cert_type.to_string(),
            r.compliance.set_labels().join("; "),
            r.special.set_labels().join("; "),
        ],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectViews {
    pub overview: ProjectionView,
    pub financial: ProjectionView,
    pub technical: ProjectionView,
}

impl ProjectViews {
    pub fn get(&self, kind: ViewKind) -> &ProjectionView {
        match kind {
            ViewKind::Overview => &self.overview,
            ViewKind::Financial => &self.financial,
            ViewKind::Technical => &self.technical,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectionView> {
        ViewKind::ALL.into_iter().map(|kind| self.get(kind))
    }
}

/// Every record appears in every view; only the columns differ.
pub fn compose_views(records: &[ProjectRecord]) -> ProjectViews {
    ProjectViews {
        overview: ProjectionView::project(ViewKind::Overview, records),
        financial: ProjectionView::project(ViewKind::Financial, records),
        technical: ProjectionView::project(ViewKind::Technical, records),
    }
}

/// `dsa_projects_<codes>_<YYYYMMDD_HHMMSS>.csv`, codes in selection order with
/// dashes removed.
pub fn export_file_name<S: AsRef<str>>(district_codes: &[S], timestamp: NaiveDateTime) -> String {
    let codes = district_codes
        .iter()
        .map(|c| c.as_ref().replace('-', ""))
        .collect::<Vec<_>>()
        .join("_");
    format!(
        "{EXPORT_PREFIX}_{codes}_{}.csv",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

/// The overview is the bulk file itself; other views get a suffix.
pub fn view_file_name(export_name: &str, kind: ViewKind) -> String {
    match kind {
        ViewKind::Overview => export_name.to_string(),
        other => {
            let stem = export_name.strip_suffix(".csv").unwrap_or(export_name);
            format!("{stem}_{}.csv", other.slug())
        }
    }
}

pub async fn write_views(dir: &Path, export_name: &str, views: &ProjectViews) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let mut written = Vec::with_capacity(ViewKind::ALL.len());
    for view in views.iter() {
        let path = dir.join(view_file_name(export_name, view.kind));
        fs::write(&path, view.to_csv())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
