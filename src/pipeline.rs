//! Stage orchestration. Each stage takes the previous stage's output as an
//! argument and returns its own, so any stage can be driven on its own.

use crate::classify::{classify_rows, dedup_rows, ClassificationTables, ClassifiedRow};
use crate::corporate::{
    aggregate, join_crosswalk, select_corporate_rows, year_summary, AggregateRow,
    CorporateRow, Crosswalk, CrosswalkedRow, DateWindow, GreenAllowlist,
};
use crate::csv_io::{read_rows, write_output, write_rows};
use crate::extract::extract_records;
use crate::normalize::{normalize_records, AssigneeRow};
use crate::xml_tree::read_document;
use anyhow::{bail, Context, Result};
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const CPC_TABLE_FILE: &str = "g_cpc_current.tsv";
pub const USPC_TABLE_FILE: &str = "g_uspc_at_issue.tsv";
pub const GREEN_ALLOWLIST_FILE: &str = "OECD_ENV_Tech_Patent_Group.csv";
pub const CROSSWALK_FILE: &str = "GCPD_granular_data.txt";
pub const WITH_CLASS_OUTPUT: &str = "patent_assignment_with_class.csv";
pub const CORPORATE_OUTPUT: &str = "patent_corporate.csv";
pub const AGGREGATE_OUTPUT: &str = "patent_aggregate.csv";

/// Where everything lives, relative to one base directory:
/// `uspatent/` holds the XML and reference tables (and receives the per-file
/// CSVs), `uva_darden/` the crosswalk, `results/` the final outputs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_path: PathBuf,
    pub window: DateWindow,
    pub crosswalk: Option<PathBuf>,
    pub skip_extract: bool,
}

impl PipelineConfig {
    pub fn new<P: AsRef<Path>>(base_path: P, window: DateWindow) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            window,
            crosswalk: None,
            skip_extract: false,
        }
    }

    pub fn uspatent_dir(&self) -> PathBuf {
        self.base_path.join("uspatent")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base_path.join("results")
    }

    pub fn crosswalk_path(&self) -> PathBuf {
        self.crosswalk
            .clone()
            .unwrap_or_else(|| self.base_path.join("uva_darden").join(CROSSWALK_FILE))
    }
}

/// One source file's normalized rows, in the order the files were listed.
#[derive(Debug)]
pub struct FileBatch {
    pub source: PathBuf,
    pub rows: Vec<AssigneeRow>,
}

struct ProcessedFileResult {
    batch: FileBatch,
    records: usize,
    error: Option<anyhow::Error>,
}

#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub batches: Vec<FileBatch>,
    pub files_found: usize,
    pub files_with_errors: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub files_found: usize,
    pub files_with_errors: Vec<PathBuf>,
    pub normalized_rows: usize,
    pub classified_rows: usize,
    pub crosswalked_rows: usize,
    pub total_records: usize,
    pub green_records: usize,
    pub aggregate: Vec<AggregateRow>,
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn stage_progress(len: usize, message: &str) -> Result<ProgressBar> {
    let progress_bar = ProgressBar::new(len as u64);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=> "),
    );
    progress_bar.set_message(message.to_string());
    Ok(progress_bar)
}

/// `ad20230101-01.xml` and `ad20230101-01.xml.gz` both become `ad20230101-01`.
pub fn source_basename(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    name.strip_suffix(".xml").unwrap_or(name).to_string()
}

/// Per-file output path, next to the source file.
pub fn per_file_csv_path(source: &Path) -> PathBuf {
    source.with_file_name(format!("{}.csv", source_basename(source)))
}

/// Lists `*.xml` and `*.xml.gz` directly inside `directory`, sorted by path.
/// Sources sharing a basename would write the same per-file CSV, so only the
/// first in path order (the plain `.xml`) is kept.
pub fn find_xml_files<P: AsRef<Path>>(directory: P) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for suffix in ["*.xml", "*.xml.gz"] {
        let pattern = directory.as_ref().join(suffix);
        let pattern_str = pattern.to_string_lossy();
        debug!("Searching for files matching pattern: {}", pattern_str);
        paths.extend(glob(&pattern_str)?.filter_map(Result::ok));
    }
    paths.sort();

    let mut outputs = HashSet::new();
    paths.retain(|path| {
        let keep = outputs.insert(per_file_csv_path(path));
        if !keep {
            warn!(
                "Skipping {}: another source already writes {}",
                path.display(),
                per_file_csv_path(path).display()
            );
        }
        keep
    });

    if paths.is_empty() {
        warn!("No XML files found in: {}", directory.as_ref().display());
    }
    Ok(paths)
}

fn process_file(filepath: &Path) -> ProcessedFileResult {
    let mut result = ProcessedFileResult {
        batch: FileBatch {
            source: filepath.to_path_buf(),
            rows: Vec::new(),
        },
        records: 0,
        error: None,
    };

    let document = match read_document(filepath) {
        Ok(doc) => doc,
        Err(e) => {
            result.error = Some(e);
            return result;
        }
    };

    let records = extract_records(&document);
    result.records = records.len();
    let rows = normalize_records(&records);

    let output_path = per_file_csv_path(filepath);
    if let Err(e) = write_rows(&output_path, &rows) {
        result.error = Some(e);
        return result;
    }

    debug!(
        "Finished processing {}: {} assignments, {} rows",
        filepath.display(),
        result.records,
        rows.len()
    );
    result.batch.rows = rows;
    result
}

pub struct PatentPipeline {
    config: PipelineConfig,
}

impl PatentPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Stage 1: parse, extract and normalize every XML file in parallel.
    /// A file that fails is reported and left out; the rest carry on.
    pub fn process_xml_files(&self) -> Result<ExtractionOutcome> {
        info!("Starting XML file processing...");
        let files = find_xml_files(self.config.uspatent_dir())?;
        info!("Found {} files to process.", files.len());

        let progress_bar = stage_progress(files.len(), "Processing XMLs")?;
        let results: Vec<ProcessedFileResult> = files
            .par_iter()
            .map(|filepath| {
                let started = Instant::now();
                let result = process_file(filepath);
                let file_name = filepath
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| filepath.display().to_string());

                progress_bar.inc(1);
                if result.error.is_some() {
                    progress_bar.set_message(format!("ERR: {} ({})", file_name, format_elapsed(started.elapsed())));
                } else {
                    progress_bar.set_message(format!(
                        "OK: {} ({} rows, {})",
                        file_name,
                        result.batch.rows.len(),
                        format_elapsed(started.elapsed())
                    ));
                }
                result
            })
            .collect();

        let mut outcome = ExtractionOutcome {
            files_found: files.len(),
            ..Default::default()
        };
        let mut total_records = 0;
        for result in results {
            match result.error {
                Some(e) => {
                    error!("Error processing file {}: {:#}", result.batch.source.display(), e);
                    outcome.files_with_errors.push(result.batch.source);
                }
                None => {
                    total_records += result.records;
                    outcome.batches.push(result.batch);
                }
            }
        }

        progress_bar.finish_with_message(format!(
            "XML processing finished. {} files OK, {} errors.",
            outcome.batches.len(),
            outcome.files_with_errors.len()
        ));
        info!(
            "Extracted {} assignments into {} normalized rows",
            total_records,
            outcome.batches.iter().map(|b| b.rows.len()).sum::<usize>()
        );
        Ok(outcome)
    }

    /// Re-reads the per-file CSVs left by an earlier run instead of parsing XML.
    pub fn load_normalized_files(&self) -> Result<ExtractionOutcome> {
        info!("Loading previously normalized per-file CSVs...");
        let files = find_xml_files(self.config.uspatent_dir())?;
        let mut outcome = ExtractionOutcome {
            files_found: files.len(),
            ..Default::default()
        };

        for source in files {
            let csv_path = per_file_csv_path(&source);
            if !csv_path.exists() {
                warn!("No normalized output for {}, skipping", source.display());
                outcome.files_with_errors.push(source);
                continue;
            }
            let rows = read_rows::<AssigneeRow>(&csv_path)?;
            debug!("Loaded {} rows from {}", rows.len(), csv_path.display());
            outcome.batches.push(FileBatch { source, rows });
        }
        Ok(outcome)
    }

    /// Stage 2: join the CPC and USPC tables and drop unclassified and
    /// duplicate rows across all files.
    pub fn merge_with_classification(&self, batches: Vec<FileBatch>) -> Result<Vec<ClassifiedRow>> {
        info!("Merging with patent classification data...");
        let dir = self.config.uspatent_dir();
        let tables = ClassificationTables::load(&dir.join(CPC_TABLE_FILE), &dir.join(USPC_TABLE_FILE))?;

        let progress_bar = stage_progress(batches.len(), "Merging classification")?;
        let mut combined = Vec::new();
        for batch in batches {
            let before = batch.rows.len();
            let classified = classify_rows(batch.rows, &tables);
            debug!(
                "{}: {} of {} rows classified",
                batch.source.display(),
                classified.len(),
                before
            );
            combined.extend(classified);
            progress_bar.inc(1);
        }
        progress_bar.finish_with_message("Classification merge finished.");

        let classified_count = combined.len();
        let combined = dedup_rows(combined);
        info!(
            "{} classified rows, {} after removing duplicates",
            classified_count,
            combined.len()
        );
        Ok(combined)
    }

    /// Stage 3: attach firm identifiers and write the full intermediate table.
    pub fn merge_with_corporate_data(&self, rows: &[ClassifiedRow]) -> Result<Vec<CrosswalkedRow>> {
        info!("Merging with corporate data...");
        let crosswalk = Crosswalk::load(&self.config.crosswalk_path())?;
        let joined = join_crosswalk(rows, &crosswalk);

        let matched = joined.iter().filter(|row| row.gvkey.is_some()).count();
        info!("{} of {} joined rows matched a firm", matched, joined.len());

        write_output(
            &self.config.output_dir().join(WITH_CLASS_OUTPUT),
            &joined,
            "Patent assignment data with classification",
        )?;
        Ok(joined)
    }

    /// Stage 4: restrict to firm-matched rows in the date window, flag green
    /// patents and aggregate by firm and year.
    pub fn finalize_and_aggregate(
        &self,
        rows: &[CrosswalkedRow],
    ) -> Result<(Vec<CorporateRow>, Vec<AggregateRow>)> {
        info!("Finalizing and aggregating...");
        let green = GreenAllowlist::load(&self.config.uspatent_dir().join(GREEN_ALLOWLIST_FILE))?;
        let window = &self.config.window;
        let corporate = select_corporate_rows(rows, &green, window);

        let green_count = corporate.iter().filter(|row| row.patent_is_green == 1).count();
        info!(
            "Total records between {} and {}: {}",
            window.start,
            window.end,
            corporate.len()
        );
        info!(
            "Total green records between {} and {}: {}",
            window.start, window.end, green_count
        );

        for (year, counts) in year_summary(&corporate) {
            debug!(
                "  {}: {} distinct patents, {} green",
                year, counts.patents, counts.green_patents
            );
        }

        let output_dir = self.config.output_dir();
        write_output(
            &output_dir.join(CORPORATE_OUTPUT),
            &corporate,
            "Corporate level patent data",
        )?;

        let aggregated = aggregate(&corporate);
        write_output(
            &output_dir.join(AGGREGATE_OUTPUT),
            &aggregated,
            "Aggregated patent data",
        )?;
        Ok((corporate, aggregated))
    }

    pub fn run(&self) -> Result<RunSummary> {
        let uspatent_dir = self.config.uspatent_dir();
        if !uspatent_dir.is_dir() {
            bail!("Input directory does not exist: {}", uspatent_dir.display());
        }
        let output_dir = self.config.output_dir();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

        let extraction = if self.config.skip_extract {
            self.load_normalized_files()?
        } else {
            self.process_xml_files()?
        };

        let mut summary = RunSummary {
            files_found: extraction.files_found,
            files_with_errors: extraction.files_with_errors,
            normalized_rows: extraction.batches.iter().map(|b| b.rows.len()).sum(),
            ..Default::default()
        };

        let classified = self.merge_with_classification(extraction.batches)?;
        summary.classified_rows = classified.len();

        let joined = self.merge_with_corporate_data(&classified)?;
        summary.crosswalked_rows = joined.len();

        let (corporate, aggregated) = self.finalize_and_aggregate(&joined)?;
        summary.total_records = corporate.len();
        summary.green_records = corporate.iter().filter(|row| row.patent_is_green == 1).count();
        summary.aggregate = aggregated;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_io::CsvRecord;
    use std::io::Write;
    use time::macros::date;

    const ASSIGNMENTS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<us-patent-assignments dtd-version="0.8">
  <action-key-code>DA</action-key-code>
  <patent-assignments>
    <patent-assignment>
      <assignment-record>
        <reel-no>024001</reel-no>
        <frame-no>0100</frame-no>
        <last-update-date><date>20100210</date></last-update-date>
        <purge-indicator>N</purge-indicator>
        <recorded-date><date>20100105</date></recorded-date>
      </assignment-record>
      <patent-assignors>
        <patent-assignor><name>DOE, JANE</name></patent-assignor>
      </patent-assignors>
      <patent-assignees>
        <patent-assignee><name>Acme Corp</name></patent-assignee>
      </patent-assignees>
      <patent-properties>
        <patent-property>
          <document-id><doc-number>1234567</doc-number><kind>B2</kind></document-id>
        </patent-property>
      </patent-properties>
    </patent-assignment>
  </patent-assignments>
</us-patent-assignments>
"#;

    fn write_file(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = fs::File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    fn fixture(base: &Path) -> PipelineConfig {
        let uspatent = base.join("uspatent");
        write_file(&uspatent.join("ad20100105.xml"), ASSIGNMENTS_XML.as_bytes());
        write_file(
            &uspatent.join(CPC_TABLE_FILE),
            b"patent_id\tcpc_section\tcpc_group\n\"1234567\"\tY\tY02E10\n",
        );
        write_file(
            &uspatent.join(USPC_TABLE_FILE),
            b"patent_id\tuspc_mainclass_id\tuspc_subclass_id\n9999999\t123\t123/45\n",
        );
        write_file(&uspatent.join(GREEN_ALLOWLIST_FILE), b"cpc_group\nY02E10\n");
        write_file(
            &base.join("uva_darden").join(CROSSWALK_FILE),
            b"assg_name,gvkey\nACME CORP,1001\nOther Co,2002\n",
        );

        let window = DateWindow::new(date!(2002 - 01 - 01), date!(2023 - 12 - 31)).unwrap();
        PipelineConfig::new(base, window)
    }

    #[test]
    fn basenames_strip_xml_and_gz() {
        assert_eq!(source_basename(Path::new("/d/ad2010.xml")), "ad2010");
        assert_eq!(source_basename(Path::new("/d/ad2010.xml.gz")), "ad2010");
        assert_eq!(per_file_csv_path(Path::new("/d/ad2010.xml.gz")), PathBuf::from("/d/ad2010.csv"));
    }

    #[test]
    fn end_to_end_single_green_patent() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let summary = PatentPipeline::new(config).run().unwrap();

        assert_eq!(summary.files_found, 1);
        assert!(summary.files_with_errors.is_empty());
        assert_eq!(summary.total_records, 1);
        assert_eq!(summary.green_records, 1);
        assert_eq!(
            summary.aggregate,
            vec![AggregateRow {
                assignee_gvkey: "1001".to_string(),
                assignee_name: "acme corp".to_string(),
                year: 2010,
                patent_num: 1,
                patent_green_num: 1,
                patent_green_total: Some(1.0),
            }]
        );

        let per_file: Vec<AssigneeRow> =
            read_rows(&dir.path().join("uspatent").join("ad20100105.csv")).unwrap();
        assert_eq!(per_file.len(), 1);
        assert_eq!(per_file[0].patent_assignees, "acme corp");

        let results = dir.path().join("results");
        let corporate = fs::read_to_string(results.join(CORPORATE_OUTPUT)).unwrap();
        assert!(corporate.starts_with(
            "patent_id,patent_kind,assignee_name,assignee_gvkey,date_recorded,date_last_update,\
             patent_cpc_group,patent_uspc_group,patent_is_green,year_recorded\n"
        ));
        assert!(corporate.contains("1234567,B2,acme corp,1001,2010-01-05,2010-02-10,Y02E10,,1,2010"));
        assert!(results.join(WITH_CLASS_OUTPUT).exists());
        assert!(results.join(AGGREGATE_OUTPUT).exists());
    }

    #[test]
    fn malformed_file_is_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        write_file(
            &dir.path().join("uspatent").join("ad20100106.xml"),
            b"<us-patent-assignments><patent-assignments></us-patent-assignments>",
        );

        let summary = PatentPipeline::new(config).run().unwrap();
        assert_eq!(summary.files_found, 2);
        assert_eq!(summary.files_with_errors.len(), 1);
        assert!(summary.files_with_errors[0].ends_with("ad20100106.xml"));
        assert_eq!(summary.total_records, 1);
    }

    #[test]
    fn gzipped_input_and_reuse_of_per_file_csvs() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        let uspatent = dir.path().join("uspatent");
        fs::remove_file(uspatent.join("ad20100105.xml")).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(ASSIGNMENTS_XML.as_bytes()).unwrap();
        write_file(&uspatent.join("ad20100105.xml.gz"), &encoder.finish().unwrap());

        let first = PatentPipeline::new(config.clone()).run().unwrap();
        assert_eq!(first.total_records, 1);

        config.skip_extract = true;
        let second = PatentPipeline::new(config).run().unwrap();
        assert_eq!(second.normalized_rows, first.normalized_rows);
        assert_eq!(second.aggregate, first.aggregate);
    }

    #[test]
    fn records_outside_the_window_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        config.window = DateWindow::new(date!(2011 - 01 - 01), date!(2023 - 12 - 31)).unwrap();

        let summary = PatentPipeline::new(config).run().unwrap();
        assert_eq!(summary.classified_rows, 1);
        assert_eq!(summary.total_records, 0);
        assert!(summary.aggregate.is_empty());

        let results = dir.path().join("results");
        assert_eq!(
            fs::read_to_string(results.join(CORPORATE_OUTPUT)).unwrap(),
            format!("{}\n", CorporateRow::HEADERS.join(","))
        );
        assert_eq!(
            fs::read_to_string(results.join(AGGREGATE_OUTPUT)).unwrap(),
            "assignee_gvkey,assignee_name,year,patent_num,patent_green_num,patent_green_total\n"
        );
    }

    #[test]
    fn file_without_assignments_still_gets_a_headed_csv() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let uspatent = dir.path().join("uspatent");
        write_file(
            &uspatent.join("ad20100107.xml"),
            b"<us-patent-assignments><patent-assignments/></us-patent-assignments>",
        );

        let summary = PatentPipeline::new(config).run().unwrap();
        assert!(summary.files_with_errors.is_empty());
        assert_eq!(
            fs::read_to_string(uspatent.join("ad20100107.csv")).unwrap(),
            format!("{}\n", AssigneeRow::HEADERS.join(","))
        );
    }

    #[test]
    fn sources_sharing_a_basename_are_processed_once() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        let uspatent = dir.path().join("uspatent");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(ASSIGNMENTS_XML.replace("Acme Corp", "Beta Inc").as_bytes())
            .unwrap();
        write_file(&uspatent.join("ad20100105.xml.gz"), &encoder.finish().unwrap());

        let files = find_xml_files(&uspatent).unwrap();
        assert_eq!(files, vec![uspatent.join("ad20100105.xml")]);

        let first = PatentPipeline::new(config.clone()).run().unwrap();
        assert_eq!(first.files_found, 1);
        assert_eq!(first.normalized_rows, 1);
        let per_file: Vec<AssigneeRow> = read_rows(&uspatent.join("ad20100105.csv")).unwrap();
        assert_eq!(per_file.len(), 1);
        assert_eq!(per_file[0].patent_assignees, "acme corp");

        config.skip_extract = true;
        let second = PatentPipeline::new(config).run().unwrap();
        assert_eq!(second.normalized_rows, 1);
        assert_eq!(second.aggregate, first.aggregate);
    }

    #[test]
    fn missing_reference_table_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        fs::remove_file(dir.path().join("uspatent").join(USPC_TABLE_FILE)).unwrap();
        assert!(PatentPipeline::new(config).run().is_err());
    }
}
