//! verdure: command-line vegetation change analysis.
//!
//! Compares the vegetation index of an area of interest between two years
//! using a STAC item collection on disk and JSON raster assets, then
//! prints a summary report. Optionally writes the report, a per-class CSV
//! and a point-sample CSV, or emits everything as JSON.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin verdure -- \
//!     --catalog items.json --aoi field.geojson --start-year 2018 --end-year 2023
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::Level;
use verdure_export::{CsvMetadata, ReportMetadata, to_class_csv, to_samples_csv, to_text_report};
use verdure_io::{FileCatalog, JsonRasterDecoder, read_aoi, read_json};
use verdure_pipeline::diagnostics::{AnalysisDiagnostics, Clock, analyze_with_diagnostics};
use verdure_pipeline::sampling::{sample_change, sample_points};
use verdure_pipeline::{
    AnalysisConfig, AnalysisError, AnalysisRequest, AnalysisResult, ChangeStatistics, Crs,
    PointSample, TargetCrs, Thresholds,
};

/// Vegetation change between two years over an area of interest.
///
/// Selects the clearest scene of each year from a STAC item collection,
/// computes the normalized-difference vegetation index from the red and
/// near-infrared bands, and classifies the per-pixel change.
#[derive(Parser, Debug)]
#[command(name = "verdure", version)]
struct Cli {
    /// STAC item collection (GeoJSON FeatureCollection) to search.
    #[arg(long)]
    catalog: PathBuf,

    /// Directory that relative asset hrefs resolve against.
    ///
    /// Defaults to the directory containing the catalog.
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Area of interest: GeoJSON polygon, feature, feature collection, or
    /// a bare `[[lon, lat], ...]` ring.
    #[arg(long)]
    aoi: PathBuf,

    /// Year of the earlier acquisition.
    #[arg(long)]
    start_year: i32,

    /// Year of the later acquisition.
    #[arg(long)]
    end_year: i32,

    /// Catalog collection to search.
    #[arg(long, default_value_t = AnalysisConfig::DEFAULT_COLLECTION.to_string())]
    collection: String,

    /// Discard scenes cloudier than this fraction (0-1).
    #[arg(long)]
    max_cloud_cover: Option<f64>,

    /// Number of best scenes to merge per year (1 disables mosaicking).
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    mosaic_scenes: usize,

    /// Reproject rasters into this EPSG code instead of each scene's own.
    ///
    /// Use 6933 for equal-area statistics in square metres.
    #[arg(long)]
    target_epsg: Option<u32>,

    /// Change-class band edges, comma separated and increasing.
    ///
    /// Four edges give five classes, two edges give loss/stable/gain.
    /// Applies even when the configuration comes from JSON.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    thresholds: Option<Vec<f64>>,

    /// Acquire the two years and bands one after another.
    #[arg(long)]
    sequential: bool,

    /// Full analysis config as a JSON string.
    ///
    /// When provided, the collection, cloud, mosaic, CRS and sequential
    /// flags are ignored. Missing fields take their defaults.
    #[arg(long, conflicts_with = "config")]
    config_json: Option<String>,

    /// Read the full analysis config from a JSON file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print statistics, diagnostics and samples as JSON instead of the
    /// text report. Failures are printed as a JSON `error` object.
    #[arg(long)]
    json: bool,

    /// Append per-stage timings and counts to the text report.
    #[arg(long)]
    diagnostics: bool,

    /// Write the text report to this file.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write per-class statistics as CSV to this file.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Number of points to sample inside the area.
    #[arg(long, default_value_t = 0, requires = "samples_csv")]
    samples: usize,

    /// Write point samples as CSV to this file.
    #[arg(long)]
    samples_csv: Option<PathBuf>,

    /// Offset into the sampling sequence.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Name printed in report headings. Defaults to the area file's stem.
    #[arg(long)]
    area_name: Option<String>,

    /// Increase log verbosity (-v info, -vv debug). Logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Build an [`AnalysisConfig`] from CLI arguments.
///
/// `--config-json` or `--config` replaces the individual flags entirely.
fn config_from_cli(cli: &Cli) -> Result<AnalysisConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    if let Some(ref path) = cli.config {
        return read_json(path).map_err(|e| format!("Error reading --config: {e}"));
    }

    let mut config = AnalysisConfig {
        collection: cli.collection.clone(),
        parallel: !cli.sequential,
        ..AnalysisConfig::default()
    };
    config.selection.max_cloud_cover = cli.max_cloud_cover;
    config.selection.mosaic_scenes = cli.mosaic_scenes;
    if let Some(epsg) = cli.target_epsg {
        config.loader.target_crs = TargetCrs::Epsg(Crs::from_epsg(epsg));
    }
    Ok(config)
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// JSON document printed by `--json` on success.
#[derive(Serialize)]
struct JsonOutput<'a> {
    statistics: &'a ChangeStatistics,
    before_scenes: &'a [String],
    after_scenes: &'a [String],
    diagnostics: &'a AnalysisDiagnostics,
    samples: &'a [PointSample],
}

/// JSON document printed by `--json` on failure.
#[derive(Serialize)]
struct JsonFailure<'a> {
    error: &'a AnalysisError,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = config_from_cli(cli)?;
    let aoi = read_aoi(&cli.aoi).map_err(|e| format!("Error reading --aoi: {e}"))?;
    let catalog = FileCatalog::open(&cli.catalog, &config.collection)
        .map_err(|e| format!("Error reading --catalog: {e}"))?;
    let root = cli
        .assets
        .clone()
        .or_else(|| cli.catalog.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let decoder = JsonRasterDecoder::new(root);

    let mut request = AnalysisRequest::new(aoi.clone(), cli.start_year, cli.end_year);
    if let Some(ref edges) = cli.thresholds {
        let thresholds = Thresholds::try_new(edges.clone())
            .map_err(|e| format!("Error in --thresholds: {e}"))?;
        request = request.with_thresholds(thresholds);
    }

    tracing::info!(
        catalog = %cli.catalog.display(),
        scenes = catalog.len(),
        start_year = cli.start_year,
        end_year = cli.end_year,
        "starting analysis"
    );

    let (result, diagnostics) =
        match analyze_with_diagnostics(request, config, &catalog, &decoder, &StdClock) {
            Ok(outcome) => outcome,
            Err(e) => {
                if cli.json {
                    print_json(&JsonFailure { error: &e })?;
                }
                return Err(format!("Analysis failed: {e}"));
            }
        };

    let samples = if cli.samples > 0 {
        let points = sample_points(&aoi, cli.samples, cli.seed);
        sample_change(&result.change_map, &result.before, &result.after, &points)
            .map_err(|e| format!("Error sampling points: {e}"))?
    } else {
        Vec::new()
    };

    let area_name = cli
        .area_name
        .clone()
        .or_else(|| {
            cli.aoi
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        });
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let period = format!("{} -> {}", cli.start_year, cli.end_year);

    let report = to_text_report(
        &result,
        &ReportMetadata {
            area_name: area_name.as_deref(),
            timestamp: Some(&timestamp),
            samples: (cli.samples > 0).then_some(samples.as_slice()),
        },
    );

    if cli.json {
        print_json(&JsonOutput {
            statistics: &result.statistics,
            before_scenes: &result.change_map.before_scenes,
            after_scenes: &result.change_map.after_scenes,
            diagnostics: &diagnostics,
            samples: &samples,
        })?;
    } else {
        println!("{report}");
        if cli.diagnostics {
            println!();
            println!("{}", diagnostics.report());
        }
    }

    let csv_metadata = CsvMetadata {
        area_name: area_name.as_deref(),
        period: Some(&period),
        timestamp: Some(&timestamp),
    };
    if let Some(ref path) = cli.report {
        write_output(path, "report", &report)?;
    }
    if let Some(ref path) = cli.csv {
        write_output(path, "class CSV", &to_class_csv(&result.statistics, &csv_metadata))?;
    }
    if let Some(ref path) = cli.samples_csv {
        write_output(path, "sample CSV", &to_samples_csv(&samples, &csv_metadata))?;
    }

    log_summary(&result);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| format!("Error serializing JSON: {e}"))?;
    println!("{json}");
    Ok(())
}

fn write_output(path: &Path, what: &str, contents: &str) -> Result<(), String> {
    std::fs::write(path, contents)
        .map_err(|e| format!("Error writing {what} to {}: {e}", path.display()))?;
    eprintln!("{what} written to {} ({} bytes)", path.display(), contents.len());
    Ok(())
}

fn log_summary(result: &AnalysisResult) {
    let stats = &result.statistics;
    tracing::info!(
        valid = stats.total_valid,
        invalid = stats.total_invalid,
        mean_delta = stats.overall.mean,
        "analysis complete"
    );
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse(extra: &[&str]) -> Cli {
        let base = [
            "verdure",
            "--catalog",
            "items.json",
            "--aoi",
            "field.geojson",
            "--start-year",
            "2018",
            "--end-year",
            "2023",
        ];
        Cli::try_parse_from(base.iter().chain(extra)).unwrap()
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_build_config() {
        let cli = parse(&[
            "--collection",
            "landsat-c2-l2",
            "--max-cloud-cover",
            "0.3",
            "--mosaic-scenes",
            "2",
            "--target-epsg",
            "6933",
            "--sequential",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.collection, "landsat-c2-l2");
        assert_eq!(config.selection.max_cloud_cover, Some(0.3));
        assert_eq!(config.selection.mosaic_scenes, 2);
        assert_eq!(config.loader.target_crs, TargetCrs::Epsg(Crs::EqualArea));
        assert!(!config.parallel);
    }

    #[test]
    fn defaults_match_library_defaults() {
        let config = config_from_cli(&parse(&[])).unwrap();
        assert_eq!(config, AnalysisConfig::default());
    }

    #[test]
    fn config_json_replaces_flags() {
        let cli = parse(&[
            "--collection",
            "ignored",
            "--config-json",
            r#"{"collection": "landsat-c2-l2", "parallel": false}"#,
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.collection, "landsat-c2-l2");
        assert!(!config.parallel);
        assert_eq!(config.season, AnalysisConfig::default().season);
    }

    #[test]
    fn malformed_config_json_is_reported() {
        let cli = parse(&["--config-json", "{not json"]);
        assert!(config_from_cli(&cli).unwrap_err().contains("--config-json"));
    }

    #[test]
    fn negative_threshold_edges_parse() {
        let cli = parse(&["--thresholds", "-0.3,-0.1,0.1,0.3"]);
        assert_eq!(cli.thresholds, Some(vec![-0.3, -0.1, 0.1, 0.3]));
    }

    #[test]
    fn samples_require_an_output() {
        let base = [
            "verdure",
            "--catalog",
            "c.json",
            "--aoi",
            "a.json",
            "--start-year",
            "2018",
            "--end-year",
            "2023",
            "--samples",
            "10",
        ];
        assert!(Cli::try_parse_from(base).is_err());
    }

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(log_level(0), Level::WARN);
        assert_eq!(log_level(1), Level::INFO);
        assert_eq!(log_level(2), Level::DEBUG);
        assert_eq!(log_level(5), Level::DEBUG);
    }
}
