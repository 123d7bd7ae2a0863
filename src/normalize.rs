use crate::csv_io::CsvRecord;
use crate::extract::AssignmentRecord;
use crate::xml_tree::{as_list, scalar_text};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
}

/// Design patents carry this kind code and are never part of the dataset.
pub const DESIGN_PATENT_KIND: &str = "X0";

/// A `document-id` found under `patent-properties`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentId {
    pub doc_number: Option<String>,
    pub kind: Option<String>,
}

/// One (assignment, document) pair before assignee explosion.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPatentRow {
    pub reel_no: Option<String>,
    pub frame_no: Option<String>,
    pub last_update_date: Option<String>,
    pub recorded_date: Option<String>,
    pub purge_indicator: Option<String>,
    pub patent_assignors: Option<Vec<String>>,
    pub patent_assignees: Option<Vec<String>>,
    pub patent_doc_num: Option<String>,
    pub patent_doc_kind: Option<String>,
}

/// A normalized row carrying a single assignee. This is the per-file CSV schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssigneeRow {
    pub reel_no: Option<String>,
    pub frame_no: Option<String>,
    pub last_update_date: Option<String>,
    pub recorded_date: Option<String>,
    pub purge_indicator: Option<String>,
    #[serde(with = "name_list")]
    pub patent_assignors: Option<Vec<String>>,
    pub patent_assignees: String,
    pub patent_doc_num: Option<String>,
    pub patent_doc_kind: Option<String>,
}

impl CsvRecord for AssigneeRow {
    const HEADERS: &'static [&'static str] = &[
        "reel_no",
        "frame_no",
        "last_update_date",
        "recorded_date",
        "purge_indicator",
        "patent_assignors",
        "patent_assignees",
        "patent_doc_num",
        "patent_doc_kind",
    ];
}

/// Name lists live in a single CSV cell as a JSON array; an empty cell is `None`.
pub(crate) mod name_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        names: &Option<Vec<String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match names {
            Some(names) => {
                let encoded = serde_json::to_string(names)
                    .map_err(<S::Error as serde::ser::Error>::custom)?;
                serializer.serialize_str(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<String>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => serde_json::from_str(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Lowercases a party name, strips backslashes and collapses whitespace runs.
pub fn clean_name(name: &str) -> String {
    let lowered = name.to_lowercase().replace('\\', "");
    WHITESPACE_RE.replace_all(&lowered, " ").into_owned()
}

/// Resolves a raw assignor/assignee sub-tree into a list of names.
///
/// A list must consist entirely of objects with a `name` key, otherwise the
/// whole value is unusable. A single object with a `name` becomes a
/// one-element list. Entries whose name is empty are skipped.
pub fn resolve_names(raw: Option<&Value>) -> Option<Vec<String>> {
    let names: Vec<Option<String>> = match raw? {
        Value::Array(parties) => parties
            .iter()
            .map(|party| {
                party
                    .as_object()
                    .filter(|fields| fields.contains_key("name"))
                    .map(|fields| scalar_text(fields.get("name")))
            })
            .collect::<Option<Vec<_>>>()?,
        Value::Object(party) if party.contains_key("name") => vec![scalar_text(party.get("name"))],
        _ => return None,
    };

    Some(names.into_iter().flatten().map(|name| clean_name(&name)).collect())
}

/// Flattens `patent-properties` into document descriptors. Non-object
/// properties and document ids are skipped.
pub fn document_ids(properties: Option<&Value>) -> Vec<DocumentId> {
    as_list(properties)
        .into_iter()
        .filter_map(Value::as_object)
        .flat_map(|property| as_list(property.get("document-id")))
        .filter_map(Value::as_object)
        .map(|doc| DocumentId {
            doc_number: scalar_text(doc.get("doc-number")),
            kind: scalar_text(doc.get("kind")),
        })
        .collect()
}

/// Expands each assignment into one row per document it covers. Assignments
/// without documents contribute nothing.
pub fn unnest_records(records: &[AssignmentRecord]) -> Vec<NormalizedPatentRow> {
    let mut rows = Vec::new();
    for record in records {
        let assignors = resolve_names(record.patent_assignors.as_ref());
        let assignees = resolve_names(record.patent_assignees.as_ref());

        for doc in document_ids(record.patent_properties.as_ref()) {
            rows.push(NormalizedPatentRow {
                reel_no: record.reel_no.clone(),
                frame_no: record.frame_no.clone(),
                last_update_date: record.last_update_date.clone(),
                recorded_date: record.recorded_date.clone(),
                purge_indicator: record.purge_indicator.clone(),
                patent_assignors: assignors.clone(),
                patent_assignees: assignees.clone(),
                patent_doc_num: doc.doc_number,
                patent_doc_kind: doc.kind,
            });
        }
    }
    rows
}

/// Drops design patents and rows without assignees, then emits one row per
/// assignee name. Assignor lists are carried through even when `None`.
pub fn explode_assignees(rows: Vec<NormalizedPatentRow>) -> Vec<AssigneeRow> {
    rows.into_iter()
        .filter(|row| row.patent_doc_kind.as_deref() != Some(DESIGN_PATENT_KIND))
        .filter_map(|row| {
            let assignees = row.patent_assignees.clone()?;
            Some(assignees.into_iter().map(move |assignee| AssigneeRow {
                reel_no: row.reel_no.clone(),
                frame_no: row.frame_no.clone(),
                last_update_date: row.last_update_date.clone(),
                recorded_date: row.recorded_date.clone(),
                purge_indicator: row.purge_indicator.clone(),
                patent_assignors: row.patent_assignors.clone(),
                patent_assignees: assignee,
                patent_doc_num: row.patent_doc_num.clone(),
                patent_doc_kind: row.patent_doc_kind.clone(),
            }))
        })
        .flatten()
        .collect()
}

/// Full per-file normalization: unnest, filter and explode.
pub fn normalize_records(records: &[AssignmentRecord]) -> Vec<AssigneeRow> {
    explode_assignees(unnest_records(records))
}
