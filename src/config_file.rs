use crate::cli::Args;
use crate::face_analysis::config::EnhancementConfig;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// JSON settings file; every key is optional and unknown keys are rejected
///
/// ```json
/// {
///   "sidecar": "python3 scripts/dlib_sidecar.py --predictor shape.dat",
///   "jobs": 4,
///   "timeout_secs": 30,
///   "enhancement": { "apply_grayscale": false, "align_target_size": 512 }
/// }
/// ```
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub sidecar: Option<String>,
    pub jobs: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub extensions: Option<String>,
    #[serde(default)]
    pub enhancement: EnhancementConfig,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

impl Args {
    /// Load the config file (if any), merge it under the command-line arguments
    /// and return the validated enhancement configuration
    pub fn load_and_merge_config(&mut self) -> Result<EnhancementConfig> {
        let file = match self.config_file.clone() {
            Some(path) => {
                let file = ConfigFile::load(&path)?;
                debug!("Loaded configuration from: {:?}", path);
                file
            }
            None => ConfigFile::default(),
        };

        self.merge_from_config(&file);
        let config = self.apply_overrides(&file.enhancement);
        config.validate().context("Invalid enhancement configuration")?;
        Ok(config)
    }

    /// Batch-level settings: file values only fill what the command line left at its default
    fn merge_from_config(&mut self, file: &ConfigFile) {
        if self.sidecar.is_none() {
            self.sidecar = file.sidecar.clone();
        }

        if self.jobs == 0 {
            if let Some(jobs) = file.jobs {
                self.jobs = jobs;
            }
        }

        if self.timeout_secs == 0 {
            if let Some(secs) = file.timeout_secs {
                self.timeout_secs = secs;
            }
        }

        if self.extensions_str == "jpg,jpeg,png,webp,tiff,bmp" {
            if let Some(ext) = &file.extensions {
                self.extensions_str = ext.clone();
            }
        }
    }
}
