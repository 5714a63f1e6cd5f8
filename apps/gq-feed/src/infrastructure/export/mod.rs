//! Record Export
//!
//! File sinks for canonical records.

mod csv;

pub use self::csv::{CsvExporter, CsvRecord, ExportError};
