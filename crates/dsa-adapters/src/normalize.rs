use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use dsa_core::{CertType, FieldNote, ProjectRecord, QuarantineReason, RawRow};
use rust_decimal::Decimal;
use url::Url;

use crate::rules::{ClassificationRules, UNKNOWN_PROJECT_TYPE};
use crate::{
    app_id_parts, certification_page_url, clean_text, columns, list_page_url, AdapterError,
    ProjectDetail, MIN_ROW_CELLS,
};

const DATETIME_FORMATS: [&str; 5] = [
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

const DATE_FORMATS: [&str; 6] = [
    "%m/%d/%Y",
    "%Y-%m-%d",
    "%m-%d-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d-%b-%Y",
];

const STREET_TYPES: [(&str, &str); 14] = [
    ("ave", "avenue"),
    ("blvd", "boulevard"),
    ("cir", "circle"),
    ("ct", "court"),
    ("dr", "drive"),
    ("expy", "expressway"),
    ("hwy", "highway"),
    ("ln", "lane"),
    ("pkwy", "parkway"),
    ("pl", "place"),
    ("rd", "road"),
    ("sq", "square"),
    ("st", "street"),
    ("trl", "trail"),
];

const DIRECTIONS: [(&str, &str); 8] = [
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
    ("ne", "northeast"),
    ("nw", "northwest"),
    ("se", "southeast"),
    ("sw", "southwest"),
];

const MINOR_WORDS: [&str; 6] = ["and", "of", "the", "in", "on", "at"];

fn is_two_digit_year(raw: &str) -> bool {
    let parts: Vec<&str> = raw.split('/').collect();
    parts.len() == 3
        && parts[2].len() == 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Parse one of the date shapes the tracker is known to emit. Timestamps are
/// truncated to their date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = clean_text(raw);
    if raw.is_empty() {
        return None;
    }
    if is_two_digit_year(&raw) {
        return NaiveDate::parse_from_str(&raw, "%m/%d/%y").ok();
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&raw, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(&raw, fmt).ok())
        })
}

/// Parse a currency amount such as `$1,234.50` or `(500.00)`.
pub fn parse_cost(raw: &str) -> Option<Decimal> {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if stripped.is_empty() {
        return None;
    }
    let (negative, digits) = match stripped
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
    {
        Some(inner) => (true, inner),
        None => (false, stripped.as_str()),
    };
    let value = Decimal::from_str(digits).ok()?;
    Some(if negative { -value } else { value })
}

fn expand(word: &str) -> &str {
    STREET_TYPES
        .iter()
        .chain(DIRECTIONS.iter())
        .find(|(abbr, _)| *abbr == word)
        .map(|(_, full)| *full)
        .unwrap_or(word)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Expand street and direction abbreviations and title-case the result.
pub fn normalize_address(raw: &str) -> String {
    let lower = clean_text(raw).to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for word in lower.split(' ').filter(|w| !w.is_empty()) {
        let word = expand(word.trim_end_matches('.'));
        if word.is_empty() {
            continue;
        }
        if !out.is_empty() && MINOR_WORDS.contains(&word) {
            out.push(word.to_string());
        } else {
            out.push(capitalize(word));
        }
    }
    out.join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    pub record: ProjectRecord,
    /// Fields kept on the record whose source text could not be parsed.
    pub notes: Vec<FieldNote>,
}

/// Turns extracted rows and detail pages into [`ProjectRecord`]s.
#[derive(Debug, Clone)]
pub struct Normalizer {
    base_url: Url,
    rules: ClassificationRules,
}

fn non_empty(value: &str) -> Option<String> {
    let value = clean_text(value);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Normalizer {
    pub fn new(base_url: Url, rules: ClassificationRules) -> Self {
        Self { base_url, rules }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn rules(&self) -> &ClassificationRules {
        &self.rules
    }

    pub fn list_page_url(&self, district_code: &str, page_index: u32) -> Result<String, AdapterError> {
        list_page_url(&self.base_url, district_code, page_index)
    }

    pub fn certification_url(&self, record: &ProjectRecord) -> Result<Option<String>, AdapterError> {
        match &record.link {
            Some(link) => certification_page_url(&self.base_url, link),
            None => Ok(None),
        }
    }

    fn cert_type(&self, raw: &str, notes: &mut Vec<FieldNote>) -> CertType {
        if raw.trim().is_empty() {
            return CertType::Unknown;
        }
        match self.rules.classify_cert(raw) {
            Some(cert) => cert,
            None => {
                notes.push(FieldNote::new("cert_type", raw, "unrecognized certification code"));
                CertType::Unknown
            }
        }
    }

    fn project_type(&self, raw: &str, notes: &mut Vec<FieldNote>) -> String {
        if raw.trim().is_empty() {
            return String::new();
        }
        match self.rules.classify_project_type(raw) {
            Some(category) => category.to_string(),
            None => {
                notes.push(FieldNote::new("project_type", raw, "unrecognized project type"));
                UNKNOWN_PROJECT_TYPE.to_string()
            }
        }
    }

    fn cost(raw: &str, notes: &mut Vec<FieldNote>) -> Option<Decimal> {
        if raw.trim().is_empty() {
            return None;
        }
        let parsed = parse_cost(raw);
        if parsed.is_none() {
            notes.push(FieldNote::new("final_cost", raw, "not a currency amount"));
        }
        parsed
    }

    fn date(raw: &str, notes: &mut Vec<FieldNote>) -> Option<NaiveDate> {
        if raw.trim().is_empty() {
            return None;
        }
        let parsed = parse_date(raw);
        if parsed.is_none() {
            notes.push(FieldNote::new("approval_date", raw, "unrecognized date format"));
        }
        parsed
    }

    /// Map one list row to a record. Rows without an application id, or with
    /// too few cells, are quarantined whole.
    pub fn normalize(&self, district_code: &str, row: &RawRow) -> Result<NormalizedRow, QuarantineReason> {
        if row.cells.len() < MIN_ROW_CELLS {
            return Err(QuarantineReason::MalformedRow {
                expected_min: MIN_ROW_CELLS,
                found: row.cells.len(),
            });
        }

        let mut notes = Vec::new();
        let link = match row.link_href.as_deref().filter(|h| !h.is_empty()) {
            Some(href) => match self.base_url.join(href) {
                Ok(url) => Some(url),
                Err(err) => {
                    notes.push(FieldNote::new("link", href, err.to_string()));
                    None
                }
            },
            None => None,
        };

        let dsa_app_id = link
            .as_ref()
            .and_then(app_id_parts)
            .map(|(origin, app)| format!("{origin} {app}"))
            .or_else(|| non_empty(row.cell(columns::APP_ID)))
            .ok_or(QuarantineReason::MissingAppId)?;

        let record = ProjectRecord {
            district_code: district_code.to_string(),
            link: link.map(String::from),
            dsa_app_id,
            ptn: non_empty(row.cell(columns::PTN)),
            name: clean_text(row.cell(columns::NAME)),
            scope: clean_text(row.cell(columns::SCOPE)),
            cert_type: self.cert_type(row.cell(columns::CERT_TYPE), &mut notes),
            project_type: self.project_type(row.cell(columns::PROJECT_TYPE), &mut notes),
            final_cost: Self::cost(row.cell(columns::FINAL_COST), &mut notes),
            approval_date: Self::date(row.cell(columns::APPROVED_DATE), &mut notes),
            address: normalize_address(row.cell(columns::ADDRESS)),
            city: clean_text(row.cell(columns::CITY)),
            compliance: Default::default(),
            special: Default::default(),
        };
        Ok(NormalizedRow { record, notes })
    }

    /// Fill fields the list row left empty and take the indicator flags from
    /// the application summary.
    pub fn apply_detail(&self, record: &mut ProjectRecord, detail: &ProjectDetail) -> Vec<FieldNote> {
        let mut notes = Vec::new();
        if record.ptn.is_none() {
            record.ptn = detail.get("PTN #:").and_then(non_empty);
        }
        if record.name.is_empty() {
            record.name = detail.get("Project Name:").map(clean_text).unwrap_or_default();
        }
        if record.scope.is_empty() {
            record.scope = detail.get("Project Scope:").map(clean_text).unwrap_or_default();
        }
        if record.project_type.is_empty() || record.project_type == UNKNOWN_PROJECT_TYPE {
            if let Some(raw) = detail.get("Project Type:") {
                record.project_type = self.project_type(raw, &mut notes);
            }
        }
        if record.address.is_empty() {
            record.address = detail.get("Address:").map(normalize_address).unwrap_or_default();
        }
        if record.city.is_empty() {
            record.city = detail.get("City:").map(clean_text).unwrap_or_default();
        }
        if record.final_cost.is_none() {
            if let Some(raw) = detail.get("Final Project Cost:") {
                record.final_cost = Self::cost(raw, &mut notes);
            }
        }
        if record.approval_date.is_none() {
            if let Some(raw) = detail.get("Approved Date:") {
                record.approval_date = Self::date(raw, &mut notes);
            }
        }
        record.compliance = detail.compliance.clone();
        record.special = detail.special.clone();
        notes
    }

    /// Classify the last certification letter. An unrecognized letter leaves
    /// the list-level cert type in place.
    pub fn apply_certification(&self, record: &mut ProjectRecord, letter: &str) -> Option<FieldNote> {
        match self.rules.classify_cert(letter) {
            Some(cert) => {
                record.cert_type = cert;
                None
            }
            None if letter.trim().is_empty() => None,
            None => Some(FieldNote::new(
                "cert_type",
                letter,
                "unrecognized certification letter",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_base_url, DEFAULT_BASE_URL};

    fn normalizer() -> Normalizer {
        Normalizer::new(
            parse_base_url(DEFAULT_BASE_URL).unwrap(),
            ClassificationRules::default(),
        )
    }

    fn row(cells: &[&str], href: Option<&str>) -> RawRow {
        RawRow {
            page_index: 0,
            row_index: 0,
            cells: cells.iter().map(|c| (*c).to_string()).collect(),
            link_href: href.map(ToString::to_string),
        }
    }

    #[test]
    fn dates_in_known_shapes() {
        let d = NaiveDate::from_ymd_opt(2021, 3, 15);
        assert_eq!(parse_date("3/15/2021"), d);
        assert_eq!(parse_date("03/15/2021 12:00:00 AM"), d);
        assert_eq!(parse_date("2021-03-15"), d);
        assert_eq!(parse_date("Mar 15, 2021"), d);
        assert_eq!(parse_date("15-Mar-2021"), d);
        assert_eq!(parse_date("3/15/21"), d);
        assert_eq!(parse_date("pending"), None);
        assert_eq!(parse_date("13/45/2021"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn costs_strip_formatting() {
        assert_eq!(parse_cost("$1,234,567.00"), Decimal::from_str("1234567.00").ok());
        assert_eq!(parse_cost(" $ 0 "), Some(Decimal::ZERO));
        assert_eq!(parse_cost("($2,500.50)"), Decimal::from_str("-2500.50").ok());
        assert_eq!(parse_cost("N/A"), None);
        assert_eq!(parse_cost(""), None);
    }

    #[test]
    fn addresses_expand_and_title_case() {
        assert_eq!(normalize_address("  123 n. main st."), "123 North Main Street");
        assert_eq!(normalize_address("45 AVE OF THE GIANTS"), "45 Avenue of the Giants");
        assert_eq!(normalize_address("the square sq"), "The Square Square");
        assert_eq!(normalize_address(""), "");
    }

    #[test]
    fn link_query_forms_the_app_id() {
        let out = normalizer()
            .normalize(
                "36-67",
                &row(
                    &["04-103556", "67330-12", "Central HS", "Gym", "DSA", "ALT", "$1,000.00", "3/15/2021", "12 oak ave", "Fontana"],
                    Some("ApplicationSummary.aspx?OriginId=04&AppId=103556"),
                ),
            )
            .unwrap();
        let record = out.record;
        assert_eq!(record.dsa_app_id, "04 103556");
        assert_eq!(
            record.link.as_deref(),
            Some("https://www.apps2.dgs.ca.gov/dsa/tracker/ApplicationSummary.aspx?OriginId=04&AppId=103556")
        );
        assert_eq!(record.cert_type, CertType::Dsa);
        assert_eq!(record.project_type, "Alteration");
        assert_eq!(record.address, "12 Oak Avenue");
        assert!(out.notes.is_empty());
    }

    #[test]
    fn unparsed_fields_are_nulled_with_notes() {
        let out = normalizer()
            .normalize(
                "360",
                &row(&["01-9", "", "Annex", "", "ZZ", "Hangar", "call office", "soon"], None),
            )
            .unwrap();
        let record = out.record;
        assert_eq!(record.dsa_app_id, "01-9");
        assert_eq!(record.ptn, None);
        assert_eq!(record.cert_type, CertType::Unknown);
        assert_eq!(record.project_type, UNKNOWN_PROJECT_TYPE);
        assert_eq!(record.final_cost, None);
        assert_eq!(record.approval_date, None);
        let fields: Vec<&str> = out.notes.iter().map(|n| n.field.as_str()).collect();
        assert_eq!(fields, vec!["cert_type", "project_type", "final_cost", "approval_date"]);
    }

    #[test]
    fn missing_key_and_short_rows_are_quarantined() {
        let n = normalizer();
        assert_eq!(
            n.normalize("360", &row(&["", "1", "Name"], None)),
            Err(QuarantineReason::MissingAppId)
        );
        assert_eq!(
            n.normalize("360", &row(&["04-1", "1"], None)),
            Err(QuarantineReason::MalformedRow { expected_min: 3, found: 2 })
        );
    }

    #[test]
    fn detail_fills_gaps_without_overwriting() {
        let n = normalizer();
        let mut record = n
            .normalize("360", &row(&["04-7", "", "Library", "", "", "", ""], Some("ApplicationSummary.aspx?OriginId=04&AppId=7")))
            .unwrap()
            .record;
        let mut detail = ProjectDetail::default();
        for (k, v) in [
            ("PTN #:", "111-22"),
            ("Project Name:", "Other Name"),
            ("Final Project Cost:", "$10.50"),
            ("Approved Date:", "1/2/2020"),
            ("City:", "Chino"),
        ] {
            detail.labels.insert(k.to_string(), v.to_string());
        }
        detail.compliance.sprinkler_system = Some(true);
        let notes = n.apply_detail(&mut record, &detail);
        assert!(notes.is_empty());
        assert_eq!(record.ptn.as_deref(), Some("111-22"));
        assert_eq!(record.name, "Library");
        assert_eq!(record.final_cost, Decimal::from_str("10.50").ok());
        assert_eq!(record.approval_date, NaiveDate::from_ymd_opt(2020, 1, 2));
        assert_eq!(record.city, "Chino");
        assert_eq!(record.compliance.sprinkler_system, Some(true));

        assert_eq!(n.apply_certification(&mut record, "1 YR VOID"), None);
        assert_eq!(record.cert_type, CertType::Other);
        assert!(n.apply_certification(&mut record, "Letter 99").is_some());
        assert_eq!(record.cert_type, CertType::Other);
        assert_eq!(
            n.certification_url(&record).unwrap().as_deref(),
            Some("https://www.apps2.dgs.ca.gov/dsa/tracker/ProjectCloseout.aspx?OriginId=04&AppId=7")
        );
    }
}
