//! Terminal report of a finished batch.
//!
//! Prints a per-status summary, one row per image and the critical failures
//! as box-drawn tables.

use prettytable::{format, Cell, Row, Table};
use strum::IntoEnumIterator;

use super::batch::BatchResult;
use super::features::Feature;
use super::{AnalysisResult, AnalysisStatus};
use crate::utils::format_duration;

/// Width of the error column before truncation
const DETAIL_WIDTH: usize = 60;

pub struct BatchReport<'a> {
    batch: &'a BatchResult,
}

impl<'a> BatchReport<'a> {
    pub fn new(batch: &'a BatchResult) -> Self {
        Self { batch }
    }

    /// Print the complete report as formatted tables
    pub fn print(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                      FACE ANALYSIS REPORT                    ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!(
            "📊 STATUS SUMMARY ({} images in {})\n",
            self.batch.len(),
            format_duration(self.batch.elapsed())
        );
        self.status_table().printstd();
        println!();

        if !self.batch.is_empty() {
            println!("🧑 IMAGES\n");
            self.image_table().printstd();
            println!();
        }

        if !self.batch.failures().is_empty() {
            println!("❌ CRITICAL FAILURES ({} total)\n", self.batch.failures().len());
            self.failure_table().printstd();
            println!();
        }
    }

    /// One row per status, zero counts included
    pub fn status_table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(Row::new(vec![Cell::new("Status"), Cell::new("Images")]));

        for status in AnalysisStatus::iter() {
            table.add_row(Row::new(vec![
                Cell::new(status.as_ref()),
                Cell::new(&self.batch.count(status).to_string()),
            ]));
        }
        table
    }

    pub fn image_table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(Row::new(vec![
            Cell::new("Image"),
            Cell::new("Status"),
            Cell::new("Face area"),
            Cell::new("Features"),
            Cell::new("Avg EAR"),
            Cell::new("Detail"),
        ]));

        for result in self.batch.results() {
            table.add_row(image_row(result));
        }
        table
    }

    pub fn failure_table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(Row::new(vec![
            Cell::new("#"),
            Cell::new("Image"),
            Cell::new("Error"),
        ]));

        for failure in self.batch.failures() {
            table.add_row(Row::new(vec![
                Cell::new(&failure.index.to_string()),
                Cell::new(&failure.identifier),
                Cell::new(&truncate(&failure.detail, DETAIL_WIDTH)),
            ]));
        }
        table
    }
}

fn image_row(result: &AnalysisResult) -> Row {
    let face_area = result
        .face_area
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let avg_ear = result
        .features
        .value(Feature::AvgEar)
        .map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "-".to_string());
    let detail = result
        .error_detail
        .as_deref()
        .map(|d| truncate(d, DETAIL_WIDTH))
        .unwrap_or_default();

    Row::new(vec![
        Cell::new(&result.image_identifier),
        Cell::new(result.status.as_ref()),
        Cell::new(&face_area),
        Cell::new(&format!("{}/{}", result.features.defined_count(), result.features.len())),
        Cell::new(&avg_ear),
        Cell::new(&detail),
    ])
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", head)
}
