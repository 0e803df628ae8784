// Library exports for reuse by the CLI and other front ends
pub mod cli;
pub mod config_file;
pub mod error;
pub mod face_analysis;
pub mod json_output;
pub mod utils;

// Re-export commonly used types
pub use error::AnalysisError;
pub use face_analysis::batch::{
    run_batch, BatchOptions, BatchProgress, BatchResult, BatchRunner, ResultTable,
};
pub use face_analysis::config::EnhancementConfig;
pub use face_analysis::detection::{FaceDetector, LandmarkPredictor, Region};
pub use face_analysis::features::{
    compute_features, compute_landmark_features, Feature, FeatureMap,
};
pub use face_analysis::landmarks::LandmarkSet;
pub use face_analysis::{AnalysisResult, AnalysisStatus, FaceAnalyzer, ImageAnalyzer};
pub use json_output::JsonMessage;
