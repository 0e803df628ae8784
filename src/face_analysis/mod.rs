pub mod alignment;
pub mod batch;
pub mod config;
pub mod detection;
pub mod enhancement;
pub mod features;
pub mod geometry;
pub mod landmarks;
pub mod loader;
pub mod report;
pub mod sidecar;

#[cfg(test)]
pub(crate) mod test_support;

use anyhow::{Context, Result};
use image::DynamicImage;
use log::{debug, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display, EnumIter};
use walkdir::WalkDir;

use crate::utils::has_valid_extension;
use alignment::try_align;
use config::EnhancementConfig;
use detection::{select_best_region, CancelHandle, FaceDetector, LandmarkPredictor};
use enhancement::{enhance, gray_view};
use features::{compute_landmark_features, FeatureMap};
use landmarks::LandmarkSet;
use loader::load_image;

pub use crate::error::AnalysisError;

/// Terminal state of one image's analysis
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnalysisStatus {
    Success,
    LoadFailed,
    NoFaceDetected,
    LandmarkError,
    AlignmentError,
    /// The enhancement chain could not process the aligned image. Failures of
    /// individual steps are logged and skipped and never surface here.
    EnhancementError,
    CriticalError,
}

/// Everything one pipeline run learned about an image
///
/// Fields are filled stage by stage; a stage that did not complete leaves its
/// field `None`. `features` always carries every feature name.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub image_identifier: String,
    pub status: AnalysisStatus,
    pub error_detail: Option<String>,
    pub face_area: Option<u64>,
    pub landmarks: Option<LandmarkSet>,
    #[serde(skip)]
    pub aligned_image: Option<DynamicImage>,
    #[serde(skip)]
    pub final_image: Option<DynamicImage>,
    pub features: FeatureMap,
}

impl AnalysisResult {
    /// Fresh record; stays `critical_error` until a stage decides otherwise
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            image_identifier: identifier.into(),
            status: AnalysisStatus::CriticalError,
            error_detail: None,
            face_area: None,
            landmarks: None,
            aligned_image: None,
            final_image: None,
            features: FeatureMap::undefined(),
        }
    }

    /// Record for a unit that faulted outside the normal stage flow
    pub fn critical(identifier: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut result = Self::new(identifier);
        result.error_detail = Some(detail.into());
        result
    }

    fn finish(mut self, status: AnalysisStatus, detail: Option<String>) -> Self {
        self.status = status;
        if detail.is_some() {
            self.error_detail = detail;
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AnalysisStatus::Success
    }

    /// Drop the image buffers, keeping the tabular fields
    pub fn without_images(mut self) -> Self {
        self.aligned_image = None;
        self.final_image = None;
        self
    }
}

/// Unit of work run by the batch orchestrator, one instance per worker
pub trait ImageAnalyzer {
    fn process(&mut self, identifier: &str) -> Result<AnalysisResult>;

    /// False once the analyzer's backends died and it must be rebuilt
    fn is_usable(&self) -> bool {
        true
    }

    /// Aborts an in-flight `process` call from another thread
    fn cancel_handle(&self) -> Option<CancelHandle> {
        None
    }
}

/// Detect, landmark, align, enhance and featurize one image at a time
pub struct FaceAnalyzer<D, P> {
    detector: D,
    predictor: P,
    config: EnhancementConfig,
}

impl<D: FaceDetector, P: LandmarkPredictor> FaceAnalyzer<D, P> {
    pub fn new(
        detector: D,
        predictor: P,
        config: EnhancementConfig,
    ) -> Result<Self, AnalysisError> {
        config.validate()?;
        Ok(Self {
            detector,
            predictor,
            config,
        })
    }

    /// Load an image file and analyze it
    pub fn process_path(&mut self, path: &Path) -> AnalysisResult {
        let identifier = path.display().to_string();
        match load_image(path) {
            Ok(image) => self.analyze(&identifier, Some(image)),
            Err(e) => {
                debug!("[{}] load failed: {:#}", identifier, e);
                AnalysisResult::new(identifier)
                    .finish(AnalysisStatus::LoadFailed, Some(format!("{:#}", e)))
            }
        }
    }

    /// Run the stage sequence on an already decoded image
    pub fn analyze(&mut self, identifier: &str, image: Option<DynamicImage>) -> AnalysisResult {
        let mut result = AnalysisResult::new(identifier);

        // Stage 1: Load
        let image = match image {
            Some(image) if image.width() > 0 && image.height() > 0 => image,
            Some(_) => {
                let detail = "image has no pixels".to_string();
                return result.finish(AnalysisStatus::LoadFailed, Some(detail));
            }
            None => {
                let detail = "image could not be loaded".to_string();
                return result.finish(AnalysisStatus::LoadFailed, Some(detail));
            }
        };
        let gray = gray_view(&image);

        // Stage 2: Detect
        debug!("[{}] detecting faces ({}x{})", identifier, image.width(), image.height());
        let detected = self.detector.detect(&gray, self.config.detect_upsample);
        let (regions, detect_error) = match detected {
            Ok(regions) => (regions, None),
            Err(e) => {
                warn!("[{}] face detection failed: {:#}", identifier, e);
                (Vec::new(), Some(format!("face detection failed: {:#}", e)))
            }
        };

        // Stage 3: Select
        let Some(region) = select_best_region(&regions).copied() else {
            return result.finish(AnalysisStatus::NoFaceDetected, detect_error);
        };
        result.face_area = Some(region.area());
        debug!("[{}] {} face(s), using {:?}", identifier, regions.len(), region);

        // Stage 4: Landmark
        let landmarks = match self.predictor.predict(&gray, &region) {
            Ok(Some(landmarks)) => landmarks,
            Ok(None) => {
                return result.finish(
                    AnalysisStatus::LandmarkError,
                    Some("landmark predictor returned no shape".to_string()),
                )
            }
            Err(e) => {
                return result.finish(
                    AnalysisStatus::LandmarkError,
                    Some(format!("landmark prediction failed: {:#}", e)),
                )
            }
        };
        result.landmarks = Some(landmarks.clone());

        // Stage 5: Align
        let aligned = match try_align(
            &image,
            &landmarks,
            self.config.align_target_size,
            self.config.align_padding,
        ) {
            Ok(aligned) => aligned,
            Err(e) => return result.finish(AnalysisStatus::AlignmentError, Some(e.to_string())),
        };

        // Stage 6: Enhance
        let Some(enhanced) = enhance(Some(&aligned), &self.config) else {
            result.aligned_image = Some(aligned);
            return result.finish(
                AnalysisStatus::EnhancementError,
                Some("enhancement produced no image".to_string()),
            );
        };
        result.aligned_image = Some(aligned);
        result.final_image = Some(enhanced);

        // Stage 7: Featurize from the raw landmarks
        result.features = compute_landmark_features(Some(&landmarks));
        debug!(
            "[{}] {} of {} features defined",
            identifier,
            result.features.defined_count(),
            result.features.len()
        );
        result.finish(AnalysisStatus::Success, None)
    }
}

impl<D: FaceDetector, P: LandmarkPredictor> ImageAnalyzer for FaceAnalyzer<D, P> {
    fn process(&mut self, identifier: &str) -> Result<AnalysisResult> {
        let result = self.process_path(Path::new(identifier));
        if !self.is_usable() {
            anyhow::bail!("model backend stopped while analyzing {}", identifier);
        }
        Ok(result)
    }

    fn is_usable(&self) -> bool {
        self.detector.is_usable() && self.predictor.is_usable()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        match (self.detector.cancel_handle(), self.predictor.cancel_handle()) {
            (Some(detect), Some(predict)) => Some(std::sync::Arc::new(move || {
                detect();
                predict();
            })),
            (detect, predict) => detect.or(predict),
        }
    }
}

/// Collect image files from files and directories, sorted for a stable batch order
pub fn discover_images(inputs: &[PathBuf], extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();

    for input in inputs {
        if input.is_file() {
            image_files.push(input.clone());
            continue;
        }
        debug!("Scanning directory: {}", input.display());

        for entry in WalkDir::new(input).follow_links(false) {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();
            if path.is_file() && has_valid_extension(path, extensions) {
                image_files.push(path.to_path_buf());
            }
        }
    }

    image_files.sort();
    image_files.dedup();
    debug!("Found {} image files", image_files.len());
    Ok(image_files)
}
