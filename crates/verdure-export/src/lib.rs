//! verdure-export: Pure format serializers for analysis results (sans-IO)
//!
//! Renders change statistics and point samples as text. Currently
//! supports a plain-text summary report and CSV tables. Every function
//! returns a `String`; writing it anywhere is the caller's business.

pub mod csv;
pub mod report;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod testing;

pub use csv::{CsvMetadata, to_class_csv, to_samples_csv};
pub use report::{ReportMetadata, to_text_report};
