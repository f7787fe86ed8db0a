//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom della libreria.
//!
//! ## Responsabilità:
//! - Definisce `OptimizeError` enum per categorizzare tutti gli errori possibili
//! - Rende gli errori distinguibili per tipo, così il driver batch può decidere
//!   se continuare con il prossimo EPUB
//! - Integra con `thiserror` per automatic error conversion
//!
//! ## Categorie di errori:
//! - `ArchiveOpen`: Il file sorgente non è un container zip valido
//! - `OpfNotFound`: Nessun package document `.opf` nell'archivio
//! - `CoverNotFound`: Tutte le strategie di ricerca della copertina sono fallite
//! - `NoImagesFound`: Nessuna immagine in modalità all-images
//! - `ImageDecode` / `UnsupportedFormat`: Immagine non decodificabile o non JPEG/PNG
//! - `CompressionService`: Errore del servizio di compressione remoto (fatale)
//! - `Io` / `Zip`: Errori di I/O durante la copia delle entry
//!
//! ## Esempio:
//! ```ignore
//! match optimizer.optimize(&epub, &output_dir).await {
//!     Err(OptimizeError::CoverNotFound { .. }) => warn!("skipping"),
//!     Err(e) if e.is_account_error() => return Err(e.into()),
//!     _ => {}
//! }
//! ```

use std::path::PathBuf;

use crate::compression::CompressionError;

/// Custom error types for EPUB image optimization
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Cannot open archive {}: {source}", .path.display())]
    ArchiveOpen {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("No .opf package document found in archive")]
    OpfNotFound,

    #[error("Cover image not found in EPUB {}", .path.display())]
    CoverNotFound { path: PathBuf },

    #[error("No images found in EPUB {}", .path.display())]
    NoImagesFound { path: PathBuf },

    #[error("Cannot decode image {entry}: {source}")]
    ImageDecode {
        entry: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Unsupported image format for {entry}: {format}")]
    UnsupportedFormat { entry: String, format: String },

    #[error("Image encoding error: {0}")]
    ImageEncode(#[from] image::ImageError),

    #[error("Compression service error: {0}")]
    CompressionService(#[from] CompressionError),

    #[error("Image task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("File validation error: {0}")]
    Validation(String),
}

impl OptimizeError {
    /// True when the remote compression service rejected the credential or the
    /// monthly quota is exhausted. Every further file would fail the same way.
    pub fn is_account_error(&self) -> bool {
        matches!(
            self,
            OptimizeError::CompressionService(CompressionError::Account { .. })
        )
    }
}
