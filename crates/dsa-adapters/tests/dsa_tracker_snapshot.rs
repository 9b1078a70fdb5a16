use std::fs;
use std::path::{Path, PathBuf};

use dsa_adapters::{
    extract_project_list, parse_base_url, ClassificationRules, Normalizer, PageLayout,
    DEFAULT_BASE_URL,
};
use dsa_core::{ProjectRecord, QuarantineReason};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GoldenRecord {
    dsa_app_id: String,
    ptn: Option<String>,
    name: String,
    cert_type: String,
    project_type: String,
    final_cost: Option<String>,
    approval_date: Option<String>,
    address: String,
    city: String,
}

impl From<&ProjectRecord> for GoldenRecord {
    fn from(r: &ProjectRecord) -> Self {
        Self {
            dsa_app_id: r.dsa_app_id.clone(),
            ptn: r.ptn.clone(),
            name: r.name.clone(),
            cert_type: r.cert_type.to_string(),
            project_type: r.project_type.clone(),
            final_cost: r.final_cost.map(|c| c.to_string()),
            approval_date: r.approval_date.map(|d| d.to_string()),
            address: r.address.clone(),
            city: r.city.clone(),
        }
    }
}

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join("dsa-tracker")
        .join("sample")
}

fn read(name: &str) -> String {
    fs::read_to_string(sample_dir().join(name)).expect("read fixture")
}

#[test]
fn golden_json_snapshot_test_dsa_tracker() {
    let normalizer = Normalizer::new(
        parse_base_url(DEFAULT_BASE_URL).unwrap(),
        ClassificationRules::default(),
    );

    let mut records = Vec::new();
    let mut quarantined = Vec::new();
    let mut notes = Vec::new();
    for (page_index, name) in ["project_list_page1.html", "project_list_page2.html"]
        .into_iter()
        .enumerate()
    {
        let page = extract_project_list(&read(name), page_index as u32).unwrap();
        assert_eq!(page.layout, PageLayout::Grid);
        quarantined.extend(page.malformed.iter().map(|m| QuarantineReason::MalformedRow {
            expected_min: dsa_adapters::MIN_ROW_CELLS,
            found: m.found_cells,
        }));
        for row in &page.rows {
            match normalizer.normalize("36-67", row) {
                Ok(out) => {
                    notes.extend(out.notes);
                    records.push(out.record);
                }
                Err(reason) => quarantined.push(reason),
            }
        }
    }

    assert_eq!(
        quarantined,
        vec![
            QuarantineReason::MalformedRow { expected_min: 3, found: 1 },
            QuarantineReason::MissingAppId,
        ]
    );
    let noted: Vec<(&str, &str)> = notes
        .iter()
        .map(|n| (n.field.as_str(), n.raw.as_str()))
        .collect();
    assert_eq!(noted, vec![("cert_type", "X9"), ("final_cost", "TBD")]);
    assert!(records.iter().all(|r| r.district_code == "36-67" && r.link.is_some()));

    let actual: Vec<GoldenRecord> = records.iter().map(GoldenRecord::from).collect();
    let expected: Vec<GoldenRecord> =
        serde_json::from_str(&read("snapshot.json")).expect("parse snapshot");
    assert_eq!(actual, expected);
}
