use crate::normalize::{name_list, AssigneeRow};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::hash::Hash;
use std::io::Read;
use std::path::Path;

pub const PATENT_ID_COLUMN: &str = "patent_id";
pub const CPC_GROUP_COLUMN: &str = "cpc_group";
pub const USPC_SUBCLASS_COLUMN: &str = "uspc_subclass_id";

/// A `patent_id -> code` lookup read from a PatentsView TSV.
///
/// When a patent id appears more than once the last row in file order wins,
/// including rows whose code is empty.
#[derive(Debug, Default)]
pub struct ClassificationTable {
    value_column: String,
    by_patent: HashMap<String, Option<String>>,
}

impl ClassificationTable {
    pub fn from_reader<R: Read>(reader: R, value_column: &str) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(reader);

        let headers = rdr.headers().context("Failed to read header row")?.clone();
        let column_index = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| anyhow!("Missing required column '{}'", name))
        };
        let id_idx = column_index(PATENT_ID_COLUMN)?;
        let value_idx = column_index(value_column)?;

        let mut by_patent = HashMap::new();
        let mut rows_read = 0usize;
        for (i, result) in rdr.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read row {}", i + 1))?;
            rows_read += 1;

            let Some(patent_id) = record.get(id_idx).map(str::trim).filter(|id| !id.is_empty()) else {
                continue;
            };
            let value = record
                .get(value_idx)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            by_patent.insert(patent_id.to_string(), value);
        }

        debug!(
            "Read {} '{}' rows covering {} distinct patents",
            rows_read,
            value_column,
            by_patent.len()
        );

        Ok(Self {
            value_column: value_column.to_string(),
            by_patent,
        })
    }

    pub fn load(path: &Path, value_column: &str) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open classification table: {}", path.display()))?;
        let table = Self::from_reader(file, value_column)
            .with_context(|| format!("Failed to load classification table: {}", path.display()))?;
        if table.is_empty() {
            warn!("No '{}' rows in {}", table.value_column, path.display());
        } else {
            info!(
                "Loaded {} patents with '{}' from {}",
                table.len(),
                table.value_column,
                path.display()
            );
        }
        Ok(table)
    }

    pub fn get(&self, patent_id: &str) -> Option<&str> {
        self.by_patent.get(patent_id.trim())?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.by_patent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_patent.is_empty()
    }
}

/// The CPC and USPC tables joined independently against every row.
#[derive(Debug, Default)]
pub struct ClassificationTables {
    pub cpc: ClassificationTable,
    pub uspc: ClassificationTable,
}

impl ClassificationTables {
    pub fn load(cpc_path: &Path, uspc_path: &Path) -> Result<Self> {
        Ok(Self {
            cpc: ClassificationTable::load(cpc_path, CPC_GROUP_COLUMN)?,
            uspc: ClassificationTable::load(uspc_path, USPC_SUBCLASS_COLUMN)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassifiedRow {
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
    pub cpc_group: Option<String>,
    pub uspc_subclass_id: Option<String>,
}

impl ClassifiedRow {
    fn from_assignee_row(
        row: AssigneeRow,
        cpc_group: Option<String>,
        uspc_subclass_id: Option<String>,
    ) -> Self {
        Self {
            reel_no: row.reel_no,
            frame_no: row.frame_no,
            last_update_date: row.last_update_date,
            recorded_date: row.recorded_date,
            purge_indicator: row.purge_indicator,
            patent_assignors: row.patent_assignors,
            patent_assignees: row.patent_assignees,
            patent_doc_num: row.patent_doc_num,
            patent_doc_kind: row.patent_doc_kind,
            cpc_group,
            uspc_subclass_id,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.cpc_group.is_some() || self.uspc_subclass_id.is_some()
    }
}

/// Left-joins both classification tables on the document number and keeps
/// rows with at least one hit. Input order is preserved.
pub fn classify_rows(rows: Vec<AssigneeRow>, tables: &ClassificationTables) -> Vec<ClassifiedRow> {
    rows.into_par_iter()
        .filter_map(|row| {
            let doc_num = row.patent_doc_num.as_deref();
            let cpc_group = doc_num.and_then(|id| tables.cpc.get(id)).map(str::to_string);
            let uspc_subclass_id = doc_num.and_then(|id| tables.uspc.get(id)).map(str::to_string);
            let classified = ClassifiedRow::from_assignee_row(row, cpc_group, uspc_subclass_id);
            classified.is_classified().then_some(classified)
        })
        .collect()
}

/// Removes exact duplicates, keeping the first occurrence of each row.
/// Rows are hashed by reference and never cloned.
pub fn dedup_rows<T: Eq + Hash>(rows: Vec<T>) -> Vec<T> {
    let first_seen: Vec<bool> = {
        let mut seen = HashSet::with_capacity(rows.len());
        rows.iter().map(|row| seen.insert(row)).collect()
    };
    rows.into_iter()
        .zip(first_seen)
        .filter_map(|(row, first)| first.then_some(row))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPC_TSV: &str = "patent_id\tcpc_sequence\tcpc_group\n\
                           \"1234567\"\t0\tY02E10/00\n\
                           \"1234567\"\t1\tY02E10\n\
                           \"7654321\"\t0\tA01B\n\
                           \"5555555\"\t0\t\n";
    const USPC_TSV: &str = "patent_id\tuspc_subclass_id\n\
                            7654321\t111/1\n\
                            8888888\t222/2\n";

    fn tables() -> ClassificationTables {
        ClassificationTables {
            cpc: ClassificationTable::from_reader(CPC_TSV.as_bytes(), CPC_GROUP_COLUMN).unwrap(),
            uspc: ClassificationTable::from_reader(USPC_TSV.as_bytes(), USPC_SUBCLASS_COLUMN).unwrap(),
        }
    }

    fn row(doc_num: &str, assignee: &str) -> AssigneeRow {
        AssigneeRow {
            reel_no: Some("1".into()),
            frame_no: Some("2".into()),
            last_update_date: None,
            recorded_date: Some("20100105".into()),
            purge_indicator: Some("N".into()),
            patent_assignors: None,
            patent_assignees: assignee.to_string(),
            patent_doc_num: Some(doc_num.to_string()),
            patent_doc_kind: Some("B2".into()),
        }
    }

    #[test]
    fn last_duplicate_wins() {
        let t = tables();
        assert_eq!(t.cpc.get("1234567"), Some("Y02E10"));
        assert_eq!(t.cpc.len(), 3);
        assert_eq!(t.cpc.get("5555555"), None);
    }

    #[test]
    fn missing_column_is_an_error() {
        let err = ClassificationTable::from_reader("patent_id\tother\n1\tx\n".as_bytes(), CPC_GROUP_COLUMN);
        assert!(err.is_err());
    }

    #[test]
    fn header_only_table_is_empty() {
        let table = ClassificationTable::from_reader("patent_id\tcpc_group\n".as_bytes(), CPC_GROUP_COLUMN).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
        assert!(!tables().cpc.is_empty());
    }

    #[test]
    fn joins_keep_rows_with_any_classification() {
        let rows = vec![
            row("1234567", "acme"),
            row("7654321", "beta"),
            row("8888888", "gamma"),
            row("5555555", "delta"),
            row("0000000", "epsilon"),
        ];
        let classified = classify_rows(rows, &tables());
        let names: Vec<_> = classified.iter().map(|r| r.patent_assignees.as_str()).collect();
        assert_eq!(names, ["acme", "beta", "gamma"]);

        assert_eq!(classified[0].cpc_group.as_deref(), Some("Y02E10"));
        assert_eq!(classified[0].uspc_subclass_id, None);
        assert_eq!(classified[1].uspc_subclass_id.as_deref(), Some("111/1"));
        assert_eq!(classified[2].cpc_group, None);
        assert!(classified.iter().all(ClassifiedRow::is_classified));
    }

    #[test]
    fn rows_without_doc_number_never_match() {
        let mut orphan = row("1234567", "acme");
        orphan.patent_doc_num = None;
        assert!(classify_rows(vec![orphan], &tables()).is_empty());
    }

    #[test]
    fn dedup_keeps_first_and_is_idempotent() {
        let rows = vec![
            row("1234567", "acme"),
            row("7654321", "beta"),
            row("1234567", "acme"),
        ];
        let classified = classify_rows(rows, &tables());
        let once = dedup_rows(classified);
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].patent_assignees, "acme");

        let twice = dedup_rows(once.clone());
        assert_eq!(twice, once);
    }

    #[test]
    fn dedup_preserves_order_without_cloning() {
        #[derive(Debug, PartialEq, Eq, Hash)]
        struct Key(u32);

        let rows = vec![Key(3), Key(1), Key(3), Key(2), Key(1)];
        assert_eq!(dedup_rows(rows), vec![Key(3), Key(1), Key(2)]);
    }
}
