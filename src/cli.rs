use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::face_analysis::config::EnhancementConfig;

#[derive(Parser, Debug)]
#[command(
    name = "face-feature-processor",
    about = "Batch facial-geometry analysis: detection, alignment, enhancement and \
             landmark features",
    long_about = "
Face Feature Processor

Analyzes photographs in parallel. For every image it locates the primary face,
predicts the 68 facial landmarks, produces an aligned and enhanced crop and
computes landmark-derived geometric descriptors. Every input yields exactly one
result row, even when a stage fails.

Face detection and landmark prediction run in a model sidecar process that
speaks JSON lines on stdin/stdout (see scripts/dlib_sidecar.py).

Example Usage:
  # Analyze a directory and write the feature table
  face-feature-processor -i ~/Photos -o features.json \\
    --sidecar \"python3 scripts/dlib_sidecar.py --predictor shape_68.dat\"

  # Keep color, skip smoothing, bigger crops, 4 workers
  face-feature-processor -i ~/Photos --sidecar \"python3 sidecar.py\" -j 4 \\
    --no-grayscale --no-bilateral --target-size 512

  # Machine-readable progress and a 30 second cap per image
  face-feature-processor -i a.jpg -i b.jpg --sidecar \"python3 sidecar.py\" \\
    --json-progress --timeout 30

  # Only list the images that would be analyzed
  face-feature-processor -i ~/Photos --validate-only"
)]
pub struct Args {
    /// Input directories or single image files (can be specified multiple times)
    #[arg(short = 'i', long = "input", required = true, value_name = "DIR|FILE")]
    pub input_paths: Vec<PathBuf>,

    /// Write the result table as JSON to this file
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Command line that starts the detector/landmark sidecar
    #[arg(long = "sidecar", value_name = "COMMAND")]
    pub sidecar: Option<String>,

    /// JSON file with enhancement and batch settings (command-line flags take precedence)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Comma-separated list of image extensions to process
    #[arg(long = "extensions", default_value = "jpg,jpeg,png,webp,tiff,bmp")]
    pub extensions_str: String,

    /// Number of parallel workers (0 = available cores minus one)
    #[arg(short = 'j', long = "jobs", default_value = "0", value_name = "N")]
    pub jobs: usize,

    /// Abandon an image after this many seconds (0 = no limit)
    #[arg(long = "timeout", default_value = "0", value_name = "SECS")]
    pub timeout_secs: u64,

    /// Face detector upsampling passes
    #[arg(long = "upsample", value_name = "N")]
    pub upsample: Option<u32>,

    /// Edge of the square aligned crop in pixels
    #[arg(long = "target-size", value_name = "PIXELS")]
    pub target_size: Option<u32>,

    /// Fractional margin around the aligned face
    #[arg(long = "padding", value_name = "FRACTION")]
    pub padding: Option<f64>,

    /// Skip local histogram equalization
    #[arg(long = "no-illumination-norm")]
    pub no_illumination_norm: bool,

    /// Keep the final image in color
    #[arg(long = "no-grayscale")]
    pub no_grayscale: bool,

    /// Skip bilateral smoothing
    #[arg(long = "no-bilateral")]
    pub no_bilateral: bool,

    /// Bilateral kernel diameter (0 or less derives it from sigma-space)
    #[arg(long = "bilateral-diameter", value_name = "D", allow_hyphen_values = true)]
    pub bilateral_diameter: Option<i32>,

    /// Bilateral range sigma
    #[arg(long = "sigma-color", value_name = "SIGMA")]
    pub sigma_color: Option<f64>,

    /// Bilateral spatial sigma
    #[arg(long = "sigma-space", value_name = "SIGMA")]
    pub sigma_space: Option<f64>,

    /// Print status and failure tables at the end
    #[arg(long = "report")]
    pub report: bool,

    /// Emit progress as JSON lines on stdout, suppressing all other output
    #[arg(long = "json-progress")]
    pub json_progress: bool,

    /// Skip processing and only list the images that were found
    #[arg(long = "validate-only")]
    pub validate_only: bool,

    /// Enable verbose output with detailed progress information
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Parse the extensions string into a vector
    pub fn parse_extensions(&self) -> Vec<String> {
        self.extensions_str
            .split(',')
            .map(|s| s.trim().trim_start_matches('.').to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn extensions(&self) -> Vec<String> {
        self.parse_extensions()
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Apply explicit command-line overrides on top of `base`
    pub fn apply_overrides(&self, base: &EnhancementConfig) -> EnhancementConfig {
        let mut config = base.clone();
        if let Some(upsample) = self.upsample {
            config.detect_upsample = upsample;
        }
        if let Some(size) = self.target_size {
            config.align_target_size = size;
        }
        if let Some(padding) = self.padding {
            config.align_padding = padding;
        }
        if self.no_illumination_norm {
            config.apply_illumination_norm = false;
        }
        if self.no_grayscale {
            config.apply_grayscale = false;
        }
        if self.no_bilateral {
            config.apply_bilateral_filter = false;
        }
        if let Some(d) = self.bilateral_diameter {
            config.bilateral_diameter = d;
        }
        if let Some(sigma) = self.sigma_color {
            config.bilateral_sigma_color = sigma;
        }
        if let Some(sigma) = self.sigma_space {
            config.bilateral_sigma_space = sigma;
        }
        config
    }
}


// Default implementation for tests
#[cfg(test)]
impl Default for Args {
    fn default() -> Self {
        Self {
            input_paths: vec![],
            output: None,
            sidecar: None,
            config_file: None,
            extensions_str: "jpg,png".to_string(),
            jobs: 0,
            timeout_secs: 0,
            upsample: None,
            target_size: None,
            padding: None,
            no_illumination_norm: false,
            no_grayscale: false,
            no_bilateral: false,
            bilateral_diameter: None,
            sigma_color: None,
            sigma_space: None,
            report: false,
            json_progress: false,
            validate_only: false,
            verbose: false,
        }
    }
}
