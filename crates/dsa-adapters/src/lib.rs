//! Page extractors and record normalization for the DSA project tracker.
//!
//! Extraction never fails on odd markup: rows that do not fit are reported as
//! [`MalformedRow`]s and pages that are not recognizable come back with
//! [`PageLayout::Unrecognized`]. Errors are reserved for invalid selectors,
//! patterns and URLs.

use std::collections::BTreeMap;

use dsa_core::{ComplianceFlags, RawRow, SpecialAttributes};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

mod normalize;
mod rules;

pub use normalize::{normalize_address, parse_cost, parse_date, NormalizedRow, Normalizer};
pub use rules::{CertRule, ClassificationRules, ProjectTypeRule, UNKNOWN_PROJECT_TYPE};

pub const CRATE_NAME: &str = "dsa-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.apps2.dgs.ca.gov/dsa/tracker/";

/// Element id of the project results grid on the list page.
pub const PROJECT_GRID_ID: &str = "ctl00_MainContent_gdvsch";

/// AppId, PTN and project name are the least a row must carry.
pub const MIN_ROW_CELLS: usize = 3;

/// Column positions in the project list grid.
pub mod columns {
    pub const APP_ID: usize = 0;
    pub const PTN: usize = 1;
    pub const NAME: usize = 2;
    pub const SCOPE: usize = 3;
    pub const CERT_TYPE: usize = 4;
    pub const PROJECT_TYPE: usize = 5;
    pub const FINAL_COST: usize = 6;
    pub const APPROVED_DATE: usize = 7;
    pub const ADDRESS: usize = 8;
    pub const CITY: usize = 9;
}

/// Labels read from the application summary page.
pub const DETAIL_LABELS: [&str; 11] = [
    "PTN #:",
    "Project Name:",
    "Project Scope:",
    "Project Type:",
    "Project Class:",
    "Special Type:",
    "Address:",
    "City:",
    "Zip:",
    "Final Project Cost:",
    "Approved Date:",
];

const NO_RESULTS_MARKERS: [&str; 3] = ["no records", "no projects", "no data"];

const CERTIFICATION_LABEL: &str = "Last Certification Letter Type:";

const CERTIFICATION_PATTERNS: [&str; 4] = [
    r"#\d+-Certification & Close of File(?:\s+Per EDU Code \d+\(\w+\)\s+OR\s+\d+\(\w+\))?",
    r"DSA 301P Notification of Requirement for Certification",
    r"#\d+-Close of File w/o Certification - Exceptions",
    r"1 YR VOID",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageLayout {
    /// The results grid was present (possibly with zero data rows).
    Grid,
    /// No grid, but the page says there is nothing to list.
    NoResults,
    /// Neither a grid nor a no-results message. The markup has likely changed.
    Unrecognized,
}

/// A grid row with fewer cells than [`MIN_ROW_CELLS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRow {
    pub page_index: u32,
    pub row_index: usize,
    pub found_cells: usize,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub layout: PageLayout,
    pub rows: Vec<RawRow>,
    pub malformed: Vec<MalformedRow>,
    pub has_next_page: bool,
}

impl ExtractedPage {
    fn without_grid(layout: PageLayout) -> Self {
        Self {
            layout,
            rows: Vec::new(),
            malformed: Vec::new(),
            has_next_page: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.malformed.is_empty()
    }
}

/// Label/value pairs and indicator checkboxes from an application summary page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDetail {
    pub labels: BTreeMap<String, String>,
    pub compliance: ComplianceFlags,
    pub special: SpecialAttributes,
}

impl ProjectDetail {
    pub fn get(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn pattern(re: &str) -> Result<Regex, AdapterError> {
    Regex::new(re).map_err(|source| AdapterError::Pattern {
        pattern: re.to_string(),
        source,
    })
}

/// Collapse whitespace, turn non-breaking spaces into plain spaces and drop
/// the `Â` that a mis-decoded `&nbsp;` leaves behind.
pub fn clean_text(raw: &str) -> String {
    raw.replace("Â\u{a0}", " ")
        .replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

fn text_or_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children().filter_map(ElementRef::wrap)
}

/// Rows that belong to the grid itself, not to tables nested in its cells.
fn grid_rows(grid: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in child_elements(grid) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => {
                rows.extend(child_elements(child).filter(|e| e.value().name() == "tr"))
            }
            _ => {}
        }
    }
    rows
}

fn direct_cells<'a>(row: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    child_elements(row)
        .filter(|e| e.value().name() == "td")
        .collect()
}

fn is_page_anchor(a: ElementRef<'_>, page_param: &Regex) -> bool {
    let href_pages = a
        .value()
        .attr("href")
        .map(|href| page_param.is_match(href))
        .unwrap_or(false);
    let text = element_text(a);
    href_pages || (!text.is_empty() && text.chars().all(|c| c.is_ascii_digit()))
}

/// A pager row carries the `pager` class, or is a short row whose nested
/// table links to other pages. Any other row, nested tables included, is data.
fn is_pager_row(
    row: ElementRef<'_>,
    nested_table: &Selector,
    anchors: &Selector,
    page_param: &Regex,
) -> bool {
    let class_says_pager = row
        .value()
        .attr("class")
        .map(|c| c.to_ascii_lowercase().contains("pager"))
        .unwrap_or(false);
    if class_says_pager {
        return true;
    }
    if direct_cells(row).len() >= MIN_ROW_CELLS {
        return false;
    }
    row.select(nested_table)
        .any(|table| table.select(anchors).any(|a| is_page_anchor(a, page_param)))
}

fn pager_links_to(
    row: ElementRef<'_>,
    anchors: &Selector,
    page_param: &Regex,
    next_page_number: u32,
) -> bool {
    let next = next_page_number.to_string();
    row.select(anchors).any(|a| {
        let text = element_text(a);
        if text == next || matches!(text.to_ascii_lowercase().as_str(), "next" | ">" | ">>") {
            return true;
        }
        a.value()
            .attr("href")
            .and_then(|href| page_param.captures(href))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str() == next)
            .unwrap_or(false)
    })
}

fn mentions_no_results(document: &Html) -> bool {
    let text = document
        .root_element()
        .text()
        .collect::<String>()
        .to_ascii_lowercase();
    NO_RESULTS_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Split one project list page into data rows, malformed rows and a
/// next-page signal. `page_index` is zero-based.
pub fn extract_project_list(body: &str, page_index: u32) -> Result<ExtractedPage, AdapterError> {
    let document = Html::parse_document(body);
    let grid_sel = selector(&format!("table#{PROJECT_GRID_ID}"))?;
    let nested_table = selector("table")?;
    let header_sel = selector("th")?;
    let anchor_sel = selector("a[href]")?;
    let page_param = pattern(r"Page[=$](\d+)")?;

    let Some(grid) = document.select(&grid_sel).next() else {
        let layout = if mentions_no_results(&document) {
            PageLayout::NoResults
        } else {
            PageLayout::Unrecognized
        };
        return Ok(ExtractedPage::without_grid(layout));
    };

    let mut page = ExtractedPage {
        layout: PageLayout::Grid,
        rows: Vec::new(),
        malformed: Vec::new(),
        has_next_page: false,
    };

    let mut row_index = 0usize;
    for row in grid_rows(grid) {
        if is_pager_row(row, &nested_table, &anchor_sel, &page_param) {
            page.has_next_page |= pager_links_to(row, &anchor_sel, &page_param, page_index + 2);
            continue;
        }

        let cells = direct_cells(row);
        if cells.is_empty() && row.select(&header_sel).next().is_some() {
            continue;
        }

        let texts: Vec<String> = cells.iter().map(|c| element_text(*c)).collect();
        if texts.len() < MIN_ROW_CELLS {
            page.malformed.push(MalformedRow {
                page_index,
                row_index,
                found_cells: texts.len(),
                raw_text: element_text(row),
            });
        } else {
            let link_href = row
                .select(&anchor_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(|href| href.trim().to_string());
            page.rows.push(RawRow {
                page_index,
                row_index,
                cells: texts,
                link_href,
            });
        }
        row_index += 1;
    }

    Ok(page)
}

fn row_of(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "tr")
}

fn is_checked(input: ElementRef<'_>) -> bool {
    input.value().attr("checked").is_some()
}

/// Last checkbox inside `scope` that comes before `target` in document order.
fn checkbox_before<'a>(
    scope: ElementRef<'a>,
    target: ElementRef<'a>,
    checkbox: &Selector,
) -> Option<ElementRef<'a>> {
    let mut last = None;
    for node in scope.descendants() {
        if node == *target {
            return last;
        }
        if let Some(el) = ElementRef::wrap(node) {
            if checkbox.matches(&el) {
                last = Some(el);
            }
        }
    }
    None
}

fn checkbox_in_next_cell<'a>(cell: ElementRef<'a>, checkbox: &Selector) -> Option<ElementRef<'a>> {
    cell.next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "td")
        .and_then(|next| next.select(checkbox).next())
}

/// The checkbox for an indicator label: the `for` target, then one inside
/// the label, then the nearest one before it in its row, then one in the
/// following cell. Only when no match has a local checkbox is the nearest
/// one before a match anywhere on the page used.
fn indicator_value(
    document: &Html,
    label: &str,
    candidates: &Selector,
    checkbox: &Selector,
) -> Result<Option<bool>, AdapterError> {
    let matches: Vec<ElementRef<'_>> = document
        .select(candidates)
        .filter(|el| element_text(*el).eq_ignore_ascii_case(label))
        .collect();
    for el in &matches {
        if el.value().name() == "label" {
            if let Some(target) = el.value().attr("for") {
                let by_id = selector(&format!("input[id=\"{target}\"]"))?;
                if let Some(input) = document.select(&by_id).next() {
                    return Ok(Some(is_checked(input)));
                }
            }
        }
        let input = el
            .select(checkbox)
            .next()
            .or_else(|| row_of(*el).and_then(|tr| checkbox_before(tr, *el, checkbox)))
            .or_else(|| checkbox_in_next_cell(*el, checkbox));
        if let Some(input) = input {
            return Ok(Some(is_checked(input)));
        }
    }
    Ok(matches
        .iter()
        .find_map(|el| checkbox_before(document.root_element(), *el, checkbox))
        .map(is_checked))
}

/// Read the application summary page: every known `label:` cell paired with
/// the cell that follows it, plus indicator checkboxes.
pub fn parse_application_summary(body: &str) -> Result<ProjectDetail, AdapterError> {
    let document = Html::parse_document(body);
    let td_sel = selector("td")?;
    let candidates = selector("td, label")?;
    let checkbox = selector("input[type=checkbox]")?;

    let cells: Vec<String> = document.select(&td_sel).map(element_text).collect();
    let mut detail = ProjectDetail::default();
    for (i, text) in cells.iter().enumerate() {
        let Some(label) = DETAIL_LABELS.iter().find(|l| l.eq_ignore_ascii_case(text)) else {
            continue;
        };
        if detail.labels.contains_key(*label) {
            continue;
        }
        if let Some(value) = cells.get(i + 1).cloned().and_then(text_or_none) {
            detail.labels.insert((*label).to_string(), value);
        }
    }

    for label in ComplianceFlags::LABELS {
        let value = indicator_value(&document, label, &candidates, &checkbox)?;
        if let Some(slot) = detail.compliance.slot_mut(label) {
            *slot = value;
        }
    }
    for label in SpecialAttributes::LABELS {
        let value = indicator_value(&document, label, &candidates, &checkbox)?;
        if let Some(slot) = detail.special.slot_mut(label) {
            *slot = value;
        }
    }
    detail.special.project_class = detail.get("Project Class:").map(ToString::to_string);
    detail.special.special_type = detail.get("Special Type:").map(ToString::to_string);

    Ok(detail)
}

/// Last certification letter type from the project closeout page, falling
/// back to the first known letter wording anywhere on the page.
pub fn parse_certification_page(body: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(body);
    let td_sel = selector("td")?;

    let cells: Vec<String> = document.select(&td_sel).map(element_text).collect();
    if let Some(i) = cells
        .iter()
        .position(|t| t.eq_ignore_ascii_case(CERTIFICATION_LABEL))
    {
        if let Some(value) = cells.get(i + 1).cloned().and_then(text_or_none) {
            return Ok(Some(value));
        }
    }

    let page_text = element_text(document.root_element());
    for re in CERTIFICATION_PATTERNS {
        let re = pattern(&format!("(?i){re}"))?;
        if let Some(m) = re.find(&page_text) {
            return Ok(Some(m.as_str().trim().to_string()));
        }
    }
    Ok(None)
}

pub fn parse_base_url(base_url: &str) -> Result<Url, AdapterError> {
    let mut url = Url::parse(base_url).map_err(|source| AdapterError::Url {
        url: base_url.to_string(),
        source,
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join(base: &Url, relative: &str) -> Result<Url, AdapterError> {
    base.join(relative).map_err(|source| AdapterError::Url {
        url: relative.to_string(),
        source,
    })
}

/// `ProjectList.aspx?ClientId=<code>&Page=<n>` with a one-based page number.
pub fn list_page_url(base: &Url, district_code: &str, page_index: u32) -> Result<String, AdapterError> {
    let mut url = join(base, "ProjectList.aspx")?;
    url.query_pairs_mut()
        .append_pair("ClientId", district_code)
        .append_pair("Page", &(page_index + 1).to_string());
    Ok(url.to_string())
}

/// `(OriginId, AppId)` from an application summary or closeout link.
pub fn app_id_parts(link: &Url) -> Option<(String, String)> {
    let mut origin = None;
    let mut app = None;
    for (key, value) in link.query_pairs() {
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        if key.eq_ignore_ascii_case("OriginId") {
            origin = Some(value);
        } else if key.eq_ignore_ascii_case("AppId") {
            app = Some(value);
        }
    }
    Some((origin?, app?))
}

pub fn certification_page_url(base: &Url, link: &str) -> Result<Option<String>, AdapterError> {
    let link = join(base, link)?;
    let Some((origin, app)) = app_id_parts(&link) else {
        return Ok(None);
    };
    let mut url = join(base, "ProjectCloseout.aspx")?;
    url.query_pairs_mut()
        .append_pair("OriginId", &origin)
        .append_pair("AppId", &app);
    Ok(Some(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn fixture(name: &str) -> String {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/dsa-tracker/sample")
            .join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    #[test]
    fn list_page_separates_rows_malformed_and_pager() {
        let page = extract_project_list(&fixture("project_list_page1.html"), 0).unwrap();
        assert_eq!(page.layout, PageLayout::Grid);
        assert_eq!(page.rows.len(), 5);
        assert_eq!(page.malformed.len(), 1);
        assert_eq!(page.malformed[0].found_cells, 1);
        assert!(page.malformed[0].raw_text.contains("temporarily unavailable"));
        assert!(page.has_next_page);

        let first = &page.rows[0];
        assert_eq!(first.cell(columns::APP_ID), "04-103556");
        assert_eq!(first.cell(columns::SCOPE), "Modernization of classroom buildings B & C");
        assert_eq!(
            first.link_href.as_deref(),
            Some("ApplicationSummary.aspx?OriginId=04&AppId=103556")
        );
        let short = page.rows.last().unwrap();
        assert_eq!(short.cells.len(), 3);
        assert_eq!(short.cell(columns::CITY), "");
    }

    #[test]
    fn last_page_has_no_next_link() {
        let page = extract_project_list(&fixture("project_list_page2.html"), 1).unwrap();
        assert_eq!(page.layout, PageLayout::Grid);
        assert_eq!(page.rows.len(), 2);
        assert!(page.malformed.is_empty());
        assert!(!page.has_next_page);
    }

    #[test]
    fn no_results_and_unknown_markup_are_distinguished() {
        let none = extract_project_list(&fixture("no_results.html"), 0).unwrap();
        assert_eq!(none.layout, PageLayout::NoResults);
        assert!(none.is_empty());

        let odd = extract_project_list("<html><body><div>maintenance</div></body></html>", 0).unwrap();
        assert_eq!(odd.layout, PageLayout::Unrecognized);
        assert!(!odd.has_next_page);
    }

    #[test]
    fn empty_grid_is_a_final_page() {
        let html = format!(
            "<table id=\"{PROJECT_GRID_ID}\"><tr><th>DSA AppId</th><th>PTN</th><th>Project Name</th></tr></table>"
        );
        let page = extract_project_list(&html, 4).unwrap();
        assert_eq!(page.layout, PageLayout::Grid);
        assert!(page.is_empty());
        assert!(!page.has_next_page);
    }

    #[test]
    fn entities_and_nbsp_are_decoded() {
        let html = format!(
            "<table id=\"{PROJECT_GRID_ID}\"><tr><td>04-1</td><td>&nbsp;</td><td>Gym&nbsp;&amp;  Pool\n</td></tr></table>"
        );
        let page = extract_project_list(&html, 0).unwrap();
        assert_eq!(page.rows[0].cells, vec!["04-1", "", "Gym & Pool"]);
    }

    #[test]
    fn rows_with_nested_tables_are_counted() {
        let html = format!(
            "<table id=\"{PROJECT_GRID_ID}\">\
             <tr><th>DSA AppId</th><th>PTN</th><th>Project Name</th></tr>\
             <tr><td>04-1</td><td>P1</td><td>Library</td></tr>\
             <tr><td>04-2</td><td>P2</td><td><table><tr><td>Gym</td></tr></table></td></tr>\
             <tr><td><table><tr><td>layout only</td></tr></table></td></tr>\
             <tr><td colspan=\"3\"><table><tr><td><span>1</span></td>\
             <td><a href=\"javascript:__doPostBack('ctl00$MainContent$gdvsch','Page$2')\">2</a></td>\
             </tr></table></td></tr>\
             </table>"
        );
        let page = extract_project_list(&html, 0).unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[1].cells, vec!["04-2", "P2", "Gym"]);
        assert_eq!(page.malformed.len(), 1);
        assert_eq!(page.malformed[0].raw_text, "layout only");
        assert!(page.has_next_page);
    }

    #[test]
    fn each_indicator_reads_the_checkbox_before_it() {
        let html = "<table><tr>\
            <td><input type=\"checkbox\"/></td><td>SB 575</td>\
            <td><input type=\"checkbox\" checked/></td><td>New Campus</td>\
            </tr></table>";
        let detail = parse_application_summary(html).unwrap();
        assert_eq!(detail.special.sb_575, Some(false));
        assert_eq!(detail.special.new_campus, Some(true));
        assert_eq!(detail.special.hps, None);
    }

    #[test]
    fn application_summary_labels_and_indicators() {
        let detail = parse_application_summary(&fixture("application_summary.html")).unwrap();
        assert_eq!(detail.get("PTN #:"), Some("67330-12"));
        assert_eq!(detail.get("Final Project Cost:"), Some("$1,234,567.00"));
        assert_eq!(detail.get("Approved Date:"), Some("3/15/2021 12:00:00 AM"));
        assert_eq!(detail.get("Zip:"), Some("91911"));

        assert_eq!(detail.compliance.auto_fire_detection, Some(true));
        assert_eq!(detail.compliance.sprinkler_system, Some(false));
        assert_eq!(detail.compliance.fire_life_safety, Some(true));
        assert_eq!(detail.compliance.access_compliance, Some(false));
        assert_eq!(detail.compliance.structural_safety, Some(true));
        assert_eq!(detail.special.sb_575, Some(true));
        assert_eq!(detail.special.new_campus, Some(false));
        assert_eq!(detail.special.modernization, Some(true));
        assert_eq!(detail.special.hps, Some(false));
        assert_eq!(detail.special.project_class.as_deref(), Some("1"));
        assert_eq!(detail.special.special_type.as_deref(), Some("Modernization"));
    }

    #[test]
    fn certification_label_then_pattern_fallback() {
        let letter = parse_certification_page(&fixture("project_closeout.html")).unwrap();
        assert_eq!(letter.as_deref(), Some("#1-Certification & Close of File"));

        let fallback = parse_certification_page(
            "<html><body><p>Status: DSA 301P Notification of Requirement for Certification sent</p></body></html>",
        )
        .unwrap();
        assert_eq!(
            fallback.as_deref(),
            Some("DSA 301P Notification of Requirement for Certification")
        );

        assert_eq!(parse_certification_page("<p>nothing here</p>").unwrap(), None);
    }

    #[test]
    fn urls_follow_the_tracker_layout() {
        let base = parse_base_url("https://www.apps2.dgs.ca.gov/dsa/tracker").unwrap();
        assert_eq!(
            list_page_url(&base, "36-67", 0).unwrap(),
            "https://www.apps2.dgs.ca.gov/dsa/tracker/ProjectList.aspx?ClientId=36-67&Page=1"
        );
        assert_eq!(
            certification_page_url(&base, "ApplicationSummary.aspx?OriginId=04&AppId=103556")
                .unwrap()
                .as_deref(),
            Some("https://www.apps2.dgs.ca.gov/dsa/tracker/ProjectCloseout.aspx?OriginId=04&AppId=103556")
        );
        assert_eq!(certification_page_url(&base, "Other.aspx?x=1").unwrap(), None);
    }
}
