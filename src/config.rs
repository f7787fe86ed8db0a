//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri di ottimizzazione
//! - Definisce `OptimizeOptions`, il bundle immutabile passato ad ogni invocazione
//! - Fornisce validazione dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//!
//! ## Parametri di configurazione:
//! - `output_dir`: Directory di output (default: `./epub_image_optimizer_output`)
//! - `max_image_resolution`: Box (larghezza, altezza) in cui far stare le immagini
//! - `tinify_api_key`: Chiave per la compressione remota (mai salvata su file)
//! - `keep_color`: Mantiene il colore invece di convertire in scala di grigi
//! - `mode`: `cover-only` oppure `all-images`
//! - `jpeg_quality`: Qualità JPEG per la ricodifica (1-100, default: 75)
//! - `workers`: Numero di EPUB elaborati in parallelo (default: numero di CPU)
//!
//! ## Esempio:
//! ```ignore
//! let config = Config {
//!     max_image_resolution: Some((1072, 1448)),
//!     mode: ImageMode::AllImages,
//!     ..Default::default()
//! };
//! config.validate()?;
//! let options = config.to_options(None);
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compression::ImageCompressor;

pub const DEFAULT_OUTPUT_DIR: &str = "./epub_image_optimizer_output";
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Which entries of the archive are rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageMode {
    /// Only the resolved cover image
    #[default]
    CoverOnly,
    /// Every jpg/jpeg/png entry
    AllImages,
}

/// Configuration for EPUB image optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Output directory for optimized EPUBs
    pub output_dir: PathBuf,
    /// Fit images within (width, height), never upscaling
    pub max_image_resolution: Option<(u32, u32)>,
    /// Tinify API key; read from the CLI or environment only
    #[serde(skip_serializing)]
    pub tinify_api_key: Option<String>,
    /// Keep color channels instead of converting to grayscale
    pub keep_color: bool,
    /// Cover only or every image
    pub mode: ImageMode,
    /// JPEG quality used when re-encoding (1-100)
    pub jpeg_quality: u8,
    /// Number of EPUBs processed in parallel
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            max_image_resolution: None,
            tinify_api_key: None,
            keep_color: false,
            mode: ImageMode::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            workers: default_workers(),
        }
    }
}

/// Number of available CPUs, at least one
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if let Some((width, height)) = self.max_image_resolution {
            if width < 1 || height < 1 {
                return Err(anyhow::anyhow!(
                    "Max image resolution can not be lower than 1x1 (got {}x{})",
                    width,
                    height
                ));
            }
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(anyhow::anyhow!("JPEG quality must be between 1 and 100"));
        }

        if self.workers == 0 {
            return Err(anyhow::anyhow!("Number of workers must be greater than 0"));
        }

        if let Some(ref key) = self.tinify_api_key {
            if key.trim().is_empty() {
                return Err(anyhow::anyhow!("Tinify API key can not be empty"));
            }
        }

        Ok(())
    }

    /// Build the per-invocation options, with the compression client (if any)
    pub fn to_options(&self, compressor: Option<Arc<dyn ImageCompressor>>) -> OptimizeOptions {
        OptimizeOptions {
            max_resolution: self.max_image_resolution,
            compressor,
            keep_color: self.keep_color,
            mode: self.mode,
            jpeg_quality: self.jpeg_quality,
        }
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

/// Immutable options for a single `optimize` call
#[derive(Clone)]
pub struct OptimizeOptions {
    pub max_resolution: Option<(u32, u32)>,
    pub compressor: Option<Arc<dyn ImageCompressor>>,
    pub keep_color: bool,
    pub mode: ImageMode,
    pub jpeg_quality: u8,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Config::default().to_options(None)
    }
}

impl std::fmt::Debug for OptimizeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizeOptions")
            .field("max_resolution", &self.max_resolution)
            .field("compressor", &self.compressor.as_ref().map(|c| c.name().to_string()))
            .field("keep_color", &self.keep_color)
            .field("mode", &self.mode)
            .field("jpeg_quality", &self.jpeg_quality)
            .finish()
    }
}
