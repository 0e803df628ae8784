//! JSON lines output for machine consumers
//!
//! When --json-progress is enabled, progress and per-image outcomes are
//! emitted as JSON lines to stdout, suppressing all other output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::face_analysis::batch::BatchResult;
use crate::face_analysis::{AnalysisResult, AnalysisStatus};

/// Last progress emission timestamp (milliseconds since epoch)
static LAST_PROGRESS_MS: AtomicU64 = AtomicU64::new(0);

/// Minimum gap between two progress lines
const PROGRESS_INTERVAL_MS: u64 = 40;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonMessage {
    Progress {
        current: usize,
        total: usize,
        message: String,
    },
    /// An image reached a terminal status other than critical_error
    FileCompleted {
        identifier: String,
        status: String,
        face_area: Option<u64>,
        defined_features: usize,
    },
    /// An image ended in critical_error
    FileFailed { identifier: String, error: String },
    Summary {
        total_files: usize,
        statuses: BTreeMap<String, usize>,
        failed: usize,
        duration_secs: f64,
    },
}

impl JsonMessage {
    /// Emit JSON message to stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    /// Emit a progress line, at most one every 40ms except the final one
    pub fn progress(current: usize, total: usize, message: impl Into<String>) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let last_ms = LAST_PROGRESS_MS.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last_ms) >= PROGRESS_INTERVAL_MS || current == total {
            LAST_PROGRESS_MS.store(now_ms, Ordering::Relaxed);
            Self::Progress {
                current,
                total,
                message: message.into(),
            }
            .emit();
        }
    }

    /// Completion or failure line for one finished image
    pub fn for_result(result: &AnalysisResult) -> Self {
        if result.status == AnalysisStatus::CriticalError {
            Self::FileFailed {
                identifier: result.image_identifier.clone(),
                error: result
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }
        } else {
            Self::FileCompleted {
                identifier: result.image_identifier.clone(),
                status: result.status.to_string(),
                face_area: result.face_area,
                defined_features: result.features.defined_count(),
            }
        }
    }

    pub fn summary(batch: &BatchResult) -> Self {
        Self::Summary {
            total_files: batch.len(),
            statuses: batch
                .status_counts()
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
            failed: batch.failures().len(),
            duration_secs: batch.elapsed().as_secs_f64(),
        }
    }
}
