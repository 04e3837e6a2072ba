//! Plain-text summary report of one analysis.
//!
//! Intended for terminals and plain-text attachments: fixed-width
//! columns, no markup. The report lists the compared acquisitions, the
//! grid, one row per change class and the overall delta distribution.
//!
//! This is a pure function with no I/O. It returns a `String`.

use verdure_pipeline::sampling::{SIGNIFICANT_SAMPLE_DELTA, significant_samples};
use verdure_pipeline::{AnalysisResult, ChangeStatistics, IndexRaster, PointSample};

/// Optional context printed in the report heading.
#[derive(Debug, Clone, Default)]
pub struct ReportMetadata<'a> {
    /// Name of the analyzed area.
    pub area_name: Option<&'a str>,

    /// Export timestamp, emitted as `Generated: <timestamp>`.
    pub timestamp: Option<&'a str>,

    /// Point samples. When present, the report ends with those whose
    /// change exceeds [`SIGNIFICANT_SAMPLE_DELTA`], sorted by change.
    pub samples: Option<&'a [PointSample]>,
}

/// Render `result` as a human-readable report.
///
/// A result with no valid cell still renders: the class table is replaced
/// by a single line saying nothing could be compared.
#[must_use]
pub fn to_text_report(result: &AnalysisResult, metadata: &ReportMetadata<'_>) -> String {
    let stats = &result.statistics;
    let map = &result.change_map;
    let mut lines = Vec::new();

    lines.push(format!("Vegetation Change Report\n{}", "=".repeat(60)));
    if let Some(name) = metadata.area_name {
        lines.push(format!("Area:      {name}"));
    }
    if let Some(timestamp) = metadata.timestamp {
        lines.push(format!("Generated: {timestamp}"));
    }
    lines.push(format!("Before:    {}", acquisition(&result.before)));
    lines.push(format!("After:     {}", acquisition(&result.after)));
    let (rows, cols) = map.spec.shape();
    lines.push(format!(
        "Grid:      {rows}x{cols} cells, {}, cell area {} {}",
        map.spec.crs, stats.pixel_area, stats.area_unit,
    ));
    lines.push(format!(
        "Valid:     {} cells ({} invalid)",
        stats.total_valid, stats.total_invalid,
    ));
    lines.push(String::new());

    if stats.total_valid == 0 {
        lines.push("No cell is valid in both acquisitions; nothing to compare.".to_string());
        return lines.join("\n");
    }

    lines.extend(class_table(stats));
    lines.push(String::new());
    lines.extend(overall_section(stats));
    if let Some(samples) = metadata.samples {
        lines.push(String::new());
        lines.extend(samples_section(samples));
    }
    lines.join("\n")
}

fn acquisition(raster: &IndexRaster) -> String {
    format!("{} ({})", raster.acquired, raster.scenes.join("+"))
}

fn class_table(stats: &ChangeStatistics) -> Vec<String> {
    let mut lines = vec![
        format!(
            "{:<18} {:>8} {:>14} {:>8} {:>11} {:>10}",
            "Class", "Cells", "Area", "Share", "Mean delta", "Std delta"
        ),
        "-".repeat(74),
    ];
    for class in &stats.classes {
        lines.push(format!(
            "{:<18} {:>8} {:>14.6} {:>7.2}% {:>+11.4} {:>10.4}",
            class.class.to_string(),
            class.pixel_count,
            class.area,
            class.percentage,
            class.mean_delta,
            class.std_delta,
        ));
    }
    lines.push("-".repeat(74));
    lines.push(format!(
        "{:<18} {:>8} {:>14.6} {:>7.2}%",
        "Total",
        stats.total_valid,
        stats.valid_area(),
        100.0,
    ));
    lines
}

fn overall_section(stats: &ChangeStatistics) -> Vec<String> {
    let o = &stats.overall;
    vec![
        "Overall change".to_string(),
        format!(
            "  mean {:+.4}  median {:+.4}  std {:.4}",
            o.mean, o.median, o.std
        ),
        format!("  range [{:+.4}, {:+.4}]", o.min, o.max),
        format!(
            "  decrease {} cells ({:.2}%), increase {} cells ({:.2}%)",
            o.decrease_count, o.decrease_percentage, o.increase_count, o.increase_percentage,
        ),
    ]
}

fn samples_section(samples: &[PointSample]) -> Vec<String> {
    let picked = significant_samples(samples, SIGNIFICANT_SAMPLE_DELTA);
    let mut lines = vec![format!(
        "Significant samples (|delta| > {SIGNIFICANT_SAMPLE_DELTA}, {} of {})",
        picked.len(),
        samples.len()
    )];
    if picked.is_empty() {
        lines.push("  none".to_string());
        return lines;
    }
    lines.push(format!(
        "  {:>11} {:>10} {:>8} {:>8} {:>8}  {}",
        "Lon", "Lat", "Before", "After", "Delta", "Class"
    ));
    for s in &picked {
        lines.push(format!(
            "  {:>11.5} {:>10.5} {:>8.4} {:>8.4} {:>+8.4}  {}",
            s.lon, s.lat, s.before, s.after, s.delta, s.class
        ));
    }
    lines
}
