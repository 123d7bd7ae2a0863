mod classify;
mod corporate;
mod csv_io;
mod extract;
mod normalize;
mod pipeline;
mod xml_tree;

use anyhow::Result;
use clap::Parser;
use corporate::{parse_iso_date, DateWindow};
use log::{error, info, warn, LevelFilter};
use pipeline::{format_elapsed, PatentPipeline, PipelineConfig, RunSummary};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::time::Instant;
use time::macros::format_description;
use time::Date;

#[derive(Parser)]
#[command(name = "Patent Assignment ETL")]
#[command(about = "Clean USPTO patent assignment XML, join CPC/USPC classes and firm identifiers, and aggregate green patents by firm and year")]
#[command(version = "0.1.0")]
struct Cli {
    #[arg(short, long, default_value = ".", help = "Base directory containing uspatent/, uva_darden/ and results/")]
    base_path: PathBuf,

    #[arg(short, long, default_value = "2002-01-01", value_parser = parse_date_arg, help = "First recorded date to keep (YYYY-MM-DD, inclusive)")]
    start_date: Date,

    #[arg(short, long, default_value = "2023-12-31", value_parser = parse_date_arg, help = "Last recorded date to keep (YYYY-MM-DD, inclusive)")]
    end_date: Date,

    #[arg(long, help = "Crosswalk file (defaults to <base>/uva_darden/GCPD_granular_data.txt)")]
    crosswalk: Option<PathBuf>,

    #[arg(long, help = "Reuse the per-file CSVs from a previous run instead of parsing XML")]
    skip_extract: bool,

    #[arg(short, long, default_value = "0", help = "Number of threads to use (0 for auto)")]
    threads: usize,

    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
}

fn parse_date_arg(raw: &str) -> Result<Date, String> {
    parse_iso_date(raw).map_err(|e| format!("{:#}", e))
}

fn setup_logging(log_level_str: &str) -> Result<()> {
    let log_level = match log_level_str.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        other => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", other);
            LevelFilter::Info
        }
    };

    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    Ok(())
}

fn setup_thread_pool(thread_count: usize) {
    let num_threads = if thread_count == 0 {
        let cores = num_cpus::get();
        info!("Auto-detected {} CPU cores. Using {} threads.", cores, cores);
        cores
    } else {
        info!("Using specified {} threads.", thread_count);
        thread_count
    };

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
    {
        error!("Failed to build global thread pool: {}. Proceeding with default.", e);
    }
}

fn print_final_summary(start_time: Instant, summary: &RunSummary, window: &DateWindow) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Input files found: {}", summary.files_found);

    let files_ok = summary.files_found - summary.files_with_errors.len();
    info!("Files processed successfully: {}", files_ok);
    if !summary.files_with_errors.is_empty() {
        warn!("Files with processing errors: {}", summary.files_with_errors.len());
        for err_file in summary.files_with_errors.iter().take(10) {
            warn!("  - {}", err_file.display());
        }
        if summary.files_with_errors.len() > 10 {
            warn!("  ... (and {} more)", summary.files_with_errors.len() - 10);
        }
    }

    info!("Normalized assignee rows: {}", summary.normalized_rows);
    info!("Rows with a CPC or USPC class: {}", summary.classified_rows);
    info!("Rows after crosswalk join: {}", summary.crosswalked_rows);

    let (start, end) = (window.start, window.end);
    info!("Total records between {} and {}: {}", start, end, summary.total_records);
    info!("Total green records between {} and {}: {}", start, end, summary.green_records);
    info!("Firm-year aggregate rows: {}", summary.aggregate.len());
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;
    info!("Starting patent assignment pipeline");

    setup_thread_pool(cli.threads);

    let window = DateWindow::new(cli.start_date, cli.end_date)?;
    let mut config = PipelineConfig::new(&cli.base_path, window);
    config.crosswalk = cli.crosswalk;
    config.skip_extract = cli.skip_extract;
    info!("Base directory: {}", config.base_path.display());
    info!("Date window: {} to {}", window.start, window.end);

    let summary = PatentPipeline::new(config).run()?;
    print_final_summary(start_time, &summary, &window);

    info!("Pipeline finished.");
    info!("-------------------------------------------------------");
    Ok(())
}
