use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::path::Path;

/// A row type with a fixed column list. The names must follow the serde
/// field order so the header lines up with the serialized values.
pub trait CsvRecord: Serialize {
    const HEADERS: &'static [&'static str];
}

/// Writes `rows` to `path` under `T::HEADERS`. Parent directories are created
/// as needed. An empty slice still produces the header line.
pub fn write_rows<T: CsvRecord>(path: &Path, rows: &[T]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory structure for: {}", path.display()))?;
    }

    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

    writer
        .write_record(T::HEADERS)
        .with_context(|| format!("Failed to write header to: {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write row to: {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush output file: {}", path.display()))?;

    debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(rows.len())
}

/// Same as [`write_rows`] but announces the file at info level.
pub fn write_output<T: CsvRecord>(path: &Path, rows: &[T], what: &str) -> Result<usize> {
    let count = write_rows(path, rows)?;
    info!("{} ({} rows) saved to {}", what, count, path.display());
    Ok(count)
}

/// Reads a headed CSV written by [`write_rows`].
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let mut rdr = ReaderBuilder::new().from_reader(file);

    let rows = rdr
        .deserialize::<T>()
        .enumerate()
        .map(|(i, result)| {
            result.with_context(|| format!("Failed to read row {} of {}", i + 1, path.display()))
        })
        .collect::<Result<Vec<T>>>()?;
    Ok(rows)
}

/// Header line serde would derive for `row`, for checking `CsvRecord::HEADERS`.
#[cfg(test)]
pub fn derived_header<T: Serialize>(row: &T) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.serialize(row).unwrap();
    let bytes = writer.into_inner().unwrap();
    String::from_utf8(bytes).unwrap().lines().next().unwrap().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair {
        key: String,
        value: Option<String>,
    }

    impl CsvRecord for Pair {
        const HEADERS: &'static [&'static str] = &["key", "value"];
    }

    #[test]
    fn rows_survive_a_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pairs.csv");
        let rows = vec![
            Pair { key: "a".into(), value: Some("x, y".into()) },
            Pair { key: "b".into(), value: None },
        ];

        assert_eq!(write_rows(&path, &rows).unwrap(), 2);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "key,value\na,\"x, y\"\nb,\n");

        let back: Vec<Pair> = read_rows(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn empty_output_is_only_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        assert_eq!(write_rows::<Pair>(&path, &[]).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "key,value\n");

        let back: Vec<Pair> = read_rows(&path).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn declared_header_matches_serde_fields() {
        let row = Pair { key: "a".into(), value: None };
        assert_eq!(derived_header(&row), Pair::HEADERS.join(","));
    }
}
