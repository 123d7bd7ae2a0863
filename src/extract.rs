use crate::xml_tree::{as_list, lookup, scalar_text};
use serde_json::Value;

const ASSIGNMENT_PATH: [&str; 3] = ["us-patent-assignments", "patent-assignments", "patent-assignment"];

/// One recorded assignment transaction as read from the bulk XML.
///
/// The three party/property fields keep the raw sub-tree (absent, a single
/// object or a list); resolving their cardinality is the normalizer's job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentRecord {
    pub reel_no: Option<String>,
    pub frame_no: Option<String>,
    pub last_update_date: Option<String>,
    pub recorded_date: Option<String>,
    pub purge_indicator: Option<String>,
    pub patent_assignors: Option<Value>,
    pub patent_assignees: Option<Value>,
    pub patent_properties: Option<Value>,
}

fn record_field(node: &Value, path: &[&str]) -> Option<String> {
    let mut full = vec!["assignment-record"];
    full.extend_from_slice(path);
    scalar_text(lookup(node, &full))
}

fn raw_field(node: &Value, path: &[&str]) -> Option<Value> {
    lookup(node, path).cloned()
}

impl AssignmentRecord {
    fn from_node(node: &Value) -> Self {
        Self {
            reel_no: record_field(node, &["reel-no"]),
            frame_no: record_field(node, &["frame-no"]),
            last_update_date: record_field(node, &["last-update-date", "date"]),
            recorded_date: record_field(node, &["recorded-date", "date"]),
            purge_indicator: record_field(node, &["purge-indicator"]),
            patent_assignors: raw_field(node, &["patent-assignors", "patent-assignor"]),
            patent_assignees: raw_field(node, &["patent-assignees", "patent-assignee"]),
            patent_properties: raw_field(node, &["patent-properties", "patent-property"]),
        }
    }
}

/// Extracts every `patent-assignment` under the document root. Missing paths
/// turn into `None` fields; a document without assignments yields nothing.
pub fn extract_records(document: &Value) -> Vec<AssignmentRecord> {
    as_list(lookup(document, &ASSIGNMENT_PATH))
        .into_iter()
        .map(AssignmentRecord::from_node)
        .collect()
}
