//! # Path Resolution Module
//!
//! Centralizza il calcolo del path di output di un EPUB ottimizzato.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::OptimizeError;

pub const OPTIMIZED_SUFFIX: &str = "_optimized.epub";

/// Utility per calcolare i path di output in modo centralizzato
pub struct PathResolver;

impl PathResolver {
    /// `output_dir / <stem>_optimized.epub`
    pub fn destination_path(source: &Path, output_dir: &Path) -> Result<PathBuf, OptimizeError> {
        let file_stem = source
            .file_stem()
            .ok_or_else(|| {
                OptimizeError::Validation(format!("Invalid file name: {}", source.display()))
            })?
            .to_string_lossy();

        let result = output_dir.join(format!("{}{}", file_stem, OPTIMIZED_SUFFIX));
        debug!("Resolved output path: {} -> {}", source.display(), result.display());
        Ok(result)
    }

    /// Crea la directory di output se necessario
    pub async fn ensure_output_dir(output_dir: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
            anyhow::anyhow!("Can not create output folder {}: {}", output_dir.display(), e)
        })
    }
}
