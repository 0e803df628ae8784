use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Largest accepted alignment output edge, in pixels
pub const MAX_TARGET_SIZE: u32 = 4096;

/// Options for the alignment and enhancement stages of one analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnhancementConfig {
    /// Face detector upsampling passes
    pub detect_upsample: u32,
    /// Edge of the square aligned crop
    pub align_target_size: u32,
    /// Fractional margin around the canonical face layout
    pub align_padding: f64,
    /// Local histogram equalization on luminance
    pub apply_illumination_norm: bool,
    /// Reduce the final image to a single channel
    pub apply_grayscale: bool,
    /// Edge-preserving smoothing before equalization
    pub apply_bilateral_filter: bool,
    /// Bilateral kernel diameter; non-positive derives it from `bilateral_sigma_space`
    #[serde(alias = "bilateral_d")]
    pub bilateral_diameter: i32,
    pub bilateral_sigma_color: f64,
    pub bilateral_sigma_space: f64,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            detect_upsample: 1,
            align_target_size: 256,
            align_padding: 0.25,
            apply_illumination_norm: true,
            apply_grayscale: true,
            apply_bilateral_filter: true,
            bilateral_diameter: 7,
            bilateral_sigma_color: 50.0,
            bilateral_sigma_space: 50.0,
        }
    }
}

impl EnhancementConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.align_target_size == 0 || self.align_target_size > MAX_TARGET_SIZE {
            return Err(AnalysisError::InvalidConfig(format!(
                "align_target_size must be between 1 and {}, got {}",
                MAX_TARGET_SIZE, self.align_target_size
            )));
        }
        if !self.align_padding.is_finite() || self.align_padding < 0.0 {
            return Err(AnalysisError::InvalidConfig(format!(
                "align_padding must be a non-negative number, got {}",
                self.align_padding
            )));
        }
        if !self.bilateral_sigma_color.is_finite() || !self.bilateral_sigma_space.is_finite() {
            return Err(AnalysisError::InvalidConfig(
                "bilateral sigmas must be finite".to_string(),
            ));
        }
        Ok(())
    }
}
