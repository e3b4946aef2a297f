//! Output of resolved packages
//!
//! Resolved packages are rendered as JSON lines, readable text or CSV rows.

pub mod formatting;

pub use formatting::{
    ContactRecord, CsvFormatter, JsonFormatter, OutputFormat, PackageRecord, PositionRecord, TextFormatter,
};
