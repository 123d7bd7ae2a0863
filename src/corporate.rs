use crate::classify::{ClassifiedRow, CPC_GROUP_COLUMN};
use crate::csv_io::CsvRecord;
use crate::normalize::name_list;
use anyhow::{anyhow, bail, Context, Result};
use csv::ReaderBuilder;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::Date;

lazy_static! {
    static ref NON_WORD_RE: Regex = Regex::new(r"[^\w\s]+").unwrap();
}

/// Join key shared by crosswalk names and assignee names: lowercase, with each
/// run of punctuation replaced by a single space.
pub fn normalize_firm_name(name: &str) -> String {
    NON_WORD_RE.replace_all(&name.to_lowercase(), " ").into_owned()
}

const COMPACT_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year][month][day]");
const ISO_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parses the 8-digit `YYYYMMDD` dates used in the assignment XML.
pub fn parse_compact_date(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), COMPACT_DATE).ok()
}

/// Parses an ISO `YYYY-MM-DD` date, as accepted on the command line.
pub fn parse_iso_date(raw: &str) -> Result<Date> {
    Date::parse(raw.trim(), ISO_DATE)
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", raw))
}

pub fn format_date(date: Date) -> Result<String> {
    date.format(ISO_DATE)
        .with_context(|| format!("Failed to format date {}", date))
}

fn serialize_date<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
    let formatted = format_date(*date).map_err(<S::Error as serde::ser::Error>::custom)?;
    serializer.serialize_str(&formatted)
}

fn serialize_optional_date<S: Serializer>(
    date: &Option<Date>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match date {
        Some(date) => serialize_date(date, serializer),
        None => serializer.serialize_none(),
    }
}

/// Inclusive `[start, end]` range on the recorded date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: Date,
    pub end: Date,
}

impl DateWindow {
    pub fn new(start: Date, end: Date) -> Result<Self> {
        if start > end {
            bail!("Start date {} is after end date {}", start, end);
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Deserialize)]
struct CrosswalkRecord {
    assg_name: Option<String>,
    gvkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmMatch {
    pub assg_name: String,
    pub gvkey: Option<String>,
}

/// Firm-name → gvkey crosswalk keyed by normalized name.
///
/// Exact `(assg_name, gvkey)` duplicates are dropped before normalizing; a
/// name that still maps to several entries produces one joined row per entry.
#[derive(Debug, Default)]
pub struct Crosswalk {
    by_name: HashMap<String, Vec<FirmMatch>>,
    entries: usize,
}

impl Crosswalk {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        let mut seen = HashSet::new();
        let mut crosswalk = Self::default();
        for (name, gvkey) in pairs {
            if !seen.insert((name.clone(), gvkey.clone())) {
                continue;
            }
            let assg_name = normalize_firm_name(&name);
            crosswalk
                .by_name
                .entry(assg_name.clone())
                .or_default()
                .push(FirmMatch { assg_name, gvkey });
            crosswalk.entries += 1;
        }
        crosswalk
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let mut pairs = Vec::new();
        for (i, result) in rdr.deserialize::<CrosswalkRecord>().enumerate() {
            let record = result.with_context(|| format!("Failed to read crosswalk row {}", i + 1))?;
            if let Some(name) = record.assg_name {
                let gvkey = record
                    .gvkey
                    .map(|g| g.trim().to_string())
                    .filter(|g| !g.is_empty());
                pairs.push((name, gvkey));
            }
        }
        Ok(Self::from_pairs(pairs))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open crosswalk: {}", path.display()))?;
        let crosswalk = Self::from_reader(file)
            .with_context(|| format!("Failed to load crosswalk: {}", path.display()))?;
        info!(
            "Loaded {} crosswalk entries ({} distinct names) from {}",
            crosswalk.entries,
            crosswalk.by_name.len(),
            path.display()
        );
        Ok(crosswalk)
    }

    pub fn matches(&self, normalized_name: &str) -> &[FirmMatch] {
        self.by_name
            .get(normalized_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// The CPC groups counted as environmental technology.
#[derive(Debug, Default)]
pub struct GreenAllowlist {
    groups: HashSet<String>,
}

impl GreenAllowlist {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers().context("Failed to read header row")?.clone();
        let idx = headers
            .iter()
            .position(|h| h.trim() == CPC_GROUP_COLUMN)
            .ok_or_else(|| anyhow!("Missing required column '{}'", CPC_GROUP_COLUMN))?;

        let mut groups = Vec::new();
        for result in rdr.records() {
            let record = result.context("Failed to read allowlist row")?;
            if let Some(group) = record.get(idx).map(str::trim).filter(|g| !g.is_empty()) {
                groups.push(group.to_string());
            }
        }
        Ok(Self::new(groups))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open green allowlist: {}", path.display()))?;
        let allowlist = Self::from_reader(file)
            .with_context(|| format!("Failed to load green allowlist: {}", path.display()))?;
        if allowlist.is_empty() {
            warn!("Green allowlist {} has no CPC groups; nothing will be flagged", path.display());
        } else {
            info!("Loaded {} green CPC groups from {}", allowlist.len(), path.display());
        }
        Ok(allowlist)
    }

    pub fn is_green(&self, cpc_group: Option<&str>) -> bool {
        cpc_group.is_some_and(|group| self.groups.contains(group))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A classified row after the crosswalk join. `patent_assignees` holds the
/// normalized join key. Written out as `patent_assignment_with_class.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkedRow {
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
    pub assg_name: Option<String>,
    pub gvkey: Option<String>,
}

impl CsvRecord for CrosswalkedRow {
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
        "cpc_group",
        "uspc_subclass_id",
        "assg_name",
        "gvkey",
    ];
}

impl CrosswalkedRow {
    fn new(row: &ClassifiedRow, assignee: &str, firm: Option<&FirmMatch>) -> Self {
        Self {
            reel_no: row.reel_no.clone(),
            frame_no: row.frame_no.clone(),
            last_update_date: row.last_update_date.clone(),
            recorded_date: row.recorded_date.clone(),
            purge_indicator: row.purge_indicator.clone(),
            patent_assignors: row.patent_assignors.clone(),
            patent_assignees: assignee.to_string(),
            patent_doc_num: row.patent_doc_num.clone(),
            patent_doc_kind: row.patent_doc_kind.clone(),
            cpc_group: row.cpc_group.clone(),
            uspc_subclass_id: row.uspc_subclass_id.clone(),
            assg_name: firm.map(|f| f.assg_name.clone()),
            gvkey: firm.and_then(|f| f.gvkey.clone()),
        }
    }
}

/// Left join on the normalized assignee name.
pub fn join_crosswalk(rows: &[ClassifiedRow], crosswalk: &Crosswalk) -> Vec<CrosswalkedRow> {
    let mut joined = Vec::with_capacity(rows.len());
    for row in rows {
        let key = normalize_firm_name(&row.patent_assignees);
        let firms = crosswalk.matches(&key);
        if firms.is_empty() {
            joined.push(CrosswalkedRow::new(row, &key, None));
        } else {
            joined.extend(firms.iter().map(|firm| CrosswalkedRow::new(row, &key, Some(firm))));
        }
    }
    joined
}

/// Row-level output written to `patent_corporate.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorporateRow {
    pub patent_id: Option<String>,
    pub patent_kind: Option<String>,
    pub assignee_name: String,
    pub assignee_gvkey: String,
    #[serde(serialize_with = "serialize_date")]
    pub date_recorded: Date,
    #[serde(serialize_with = "serialize_optional_date")]
    pub date_last_update: Option<Date>,
    pub patent_cpc_group: Option<String>,
    pub patent_uspc_group: Option<String>,
    pub patent_is_green: u8,
    pub year_recorded: i32,
}

impl CsvRecord for CorporateRow {
    const HEADERS: &'static [&'static str] = &[
        "patent_id",
        "patent_kind",
        "assignee_name",
        "assignee_gvkey",
        "date_recorded",
        "date_last_update",
        "patent_cpc_group",
        "patent_uspc_group",
        "patent_is_green",
        "year_recorded",
    ];
}

/// Keeps firm-matched rows recorded inside `window` and flags green patents.
/// Rows whose recorded date does not parse cannot fall inside the window.
pub fn select_corporate_rows(
    rows: &[CrosswalkedRow],
    green: &GreenAllowlist,
    window: &DateWindow,
) -> Vec<CorporateRow> {
    rows.iter()
        .filter_map(|row| {
            let gvkey = row.gvkey.as_ref()?;
            let recorded = row.recorded_date.as_deref().and_then(parse_compact_date)?;
            if !window.contains(recorded) {
                return None;
            }
            Some(CorporateRow {
                patent_id: row.patent_doc_num.clone(),
                patent_kind: row.patent_doc_kind.clone(),
                assignee_name: row.patent_assignees.clone(),
                assignee_gvkey: gvkey.clone(),
                date_recorded: recorded,
                date_last_update: row.last_update_date.as_deref().and_then(parse_compact_date),
                patent_cpc_group: row.cpc_group.clone(),
                patent_uspc_group: row.uspc_subclass_id.clone(),
                patent_is_green: u8::from(green.is_green(row.cpc_group.as_deref())),
                year_recorded: recorded.year(),
            })
        })
        .collect()
}

/// Firm × year counts written to `patent_aggregate.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub assignee_gvkey: String,
    pub assignee_name: String,
    pub year: i32,
    pub patent_num: usize,
    pub patent_green_num: usize,
    pub patent_green_total: Option<f64>,
}

impl CsvRecord for AggregateRow {
    const HEADERS: &'static [&'static str] = &[
        "assignee_gvkey",
        "assignee_name",
        "year",
        "patent_num",
        "patent_green_num",
        "patent_green_total",
    ];
}

/// Share of green patents; `None` for an empty group instead of NaN.
pub fn green_ratio(green: usize, total: usize) -> Option<f64> {
    (total > 0).then(|| green as f64 / total as f64)
}

/// Groups by (gvkey, assignee name, year), sorted by that key.
pub fn aggregate(rows: &[CorporateRow]) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<(&str, &str, i32), (usize, usize)> = BTreeMap::new();
    for row in rows {
        let counts = groups
            .entry((row.assignee_gvkey.as_str(), row.assignee_name.as_str(), row.year_recorded))
            .or_default();
        counts.0 += 1;
        counts.1 += usize::from(row.patent_is_green);
    }

    groups
        .into_iter()
        .map(|((gvkey, name, year), (total, green))| AggregateRow {
            assignee_gvkey: gvkey.to_string(),
            assignee_name: name.to_string(),
            year,
            patent_num: total,
            patent_green_num: green,
            patent_green_total: green_ratio(green, total),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YearCounts {
    pub patents: usize,
    pub green_patents: usize,
}

/// Distinct patent ids per recorded year, overall and green only.
pub fn year_summary(rows: &[CorporateRow]) -> BTreeMap<i32, YearCounts> {
    let mut patents: BTreeMap<i32, (HashSet<&str>, HashSet<&str>)> = BTreeMap::new();
    for row in rows {
        let Some(id) = row.patent_id.as_deref() else {
            continue;
        };
        let (all, green) = patents.entry(row.year_recorded).or_default();
        all.insert(id);
        if row.patent_is_green == 1 {
            green.insert(id);
        }
    }

    patents
        .into_iter()
        .map(|(year, (all, green))| {
            (
                year,
                YearCounts {
                    patents: all.len(),
                    green_patents: green.len(),
                },
            )
        })
        .collect()
}
