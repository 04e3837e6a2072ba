//! CSV export of change statistics and point samples.
//!
//! Both tables are comma-separated with a single header row. Lines
//! beginning with `#` carry metadata and precede the header; most CSV
//! readers accept a comment prefix (`comment='#'` in pandas, `-c '#'` in
//! csvkit).
//!
//! Deltas and index values use six decimal places and percentages four.
//! Areas are written in full precision because cell areas in square
//! degrees are tiny.
//!
//! This is a pure function with no I/O. It returns a `String`.

use std::fmt::Write;

use verdure_pipeline::{ChangeStatistics, PointSample};

/// Metadata emitted as `#`-prefixed comment lines above the header.
///
/// All fields are optional; an empty metadata block emits nothing.
#[derive(Debug, Clone, Default)]
pub struct CsvMetadata<'a> {
    /// Name of the analyzed area, emitted as `# Area: <name>`.
    pub area_name: Option<&'a str>,

    /// The compared period, e.g. `2018 -> 2023`.
    pub period: Option<&'a str>,

    /// Export timestamp, emitted as `# Exported: <timestamp>`.
    pub timestamp: Option<&'a str>,
}

impl CsvMetadata<'_> {
    fn write_header(&self, out: &mut String) {
        let lines = [
            ("Area", self.area_name),
            ("Period", self.period),
            ("Exported", self.timestamp),
        ];
        for (label, value) in lines {
            if let Some(value) = value {
                for line in value.lines() {
                    let _ = writeln!(out, "# {label}: {line}");
                }
            }
        }
    }
}

/// Column names of [`to_class_csv`].
pub const CLASS_COLUMNS: &str = "class,pixel_count,area,area_unit,percentage,mean_delta,std_delta";

/// Column names of [`to_samples_csv`].
pub const SAMPLE_COLUMNS: &str =
    "lon,lat,row,col,before,after,delta,class,start_date,end_date,start_cloud,end_cloud";

/// One row per change class, loss to gain, followed by a `total` row.
///
/// The `total` row carries the valid cell count and area, 100 percent
/// (0 when nothing was valid), and the overall mean and standard
/// deviation. Invalid cells never appear.
///
/// # Examples
///
/// ```
/// use verdure_export::csv::{CLASS_COLUMNS, CsvMetadata, to_class_csv};
/// # use verdure_pipeline::{AreaUnit, ChangeStatistics, DeltaSummary};
/// # let stats = ChangeStatistics {
/// #     classes: Vec::new(),
/// #     total_valid: 0,
/// #     total_invalid: 4,
/// #     pixel_area: 100.0,
/// #     area_unit: AreaUnit::SquareMetres,
/// #     overall: DeltaSummary::default(),
/// # };
/// let csv = to_class_csv(&stats, &CsvMetadata::default());
/// assert!(csv.starts_with(CLASS_COLUMNS));
/// ```
#[must_use]
pub fn to_class_csv(stats: &ChangeStatistics, metadata: &CsvMetadata<'_>) -> String {
    let mut out = String::new();
    metadata.write_header(&mut out);
    let _ = writeln!(out, "{CLASS_COLUMNS}");

    let unit = area_unit_key(stats);
    for class in &stats.classes {
        let _ = writeln!(
            out,
            "{},{},{},{unit},{:.4},{:.6},{:.6}",
            class.class.key(),
            class.pixel_count,
            class.area,
            class.percentage,
            class.mean_delta,
            class.std_delta,
        );
    }

    let total_percentage = if stats.total_valid > 0 { 100.0 } else { 0.0 };
    let _ = writeln!(
        out,
        "total,{},{},{unit},{total_percentage:.4},{:.6},{:.6}",
        stats.total_valid,
        stats.valid_area(),
        stats.overall.mean,
        stats.overall.std,
    );
    out
}

/// One row per sampled point, in sampling order.
#[must_use]
pub fn to_samples_csv(samples: &[PointSample], metadata: &CsvMetadata<'_>) -> String {
    let mut out = String::new();
    metadata.write_header(&mut out);
    let _ = writeln!(out, "{SAMPLE_COLUMNS}");
    for s in samples {
        let _ = writeln!(
            out,
            "{:.6},{:.6},{},{},{:.6},{:.6},{:.6},{},{},{},{:.4},{:.4}",
            s.lon,
            s.lat,
            s.row,
            s.col,
            s.before,
            s.after,
            s.delta,
            s.class.key(),
            s.start_date,
            s.end_date,
            s.start_cloud,
            s.end_cloud,
        );
    }
    out
}

/// Machine-friendly unit name (no superscripts).
const fn area_unit_key(stats: &ChangeStatistics) -> &'static str {
    match stats.area_unit {
        verdure_pipeline::AreaUnit::SquareMetres => "m2",
        verdure_pipeline::AreaUnit::SquareDegrees => "deg2",
    }
}
