//! # EPUB Image Optimizer Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare dell'applicazione
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore custom per le diverse fasi
//! - `locator`: Ricerca OPF, copertina e immagini dentro l'archivio
//! - `image_processor`: Thumbnail, scala di grigi e ricodifica (JPEG/PNG)
//! - `compression`: Client per la compressione remota (Tinify)
//! - `file_manager`: Operazioni sui file e discovery degli EPUB
//! - `optimizer`: Transcoder del singolo EPUB e orchestratore batch
//! - `progress`: Progress tracking e statistiche
//!
//! ## Utilizzo:
//! ```ignore
//! use epub_image_optimizer::{EpubOptimizer, OptimizeOptions};
//!
//! let mut optimizer = EpubOptimizer::new(OptimizeOptions::default());
//! let optimized = optimizer.optimize(&path, &output_dir).await?;
//! ```

pub mod compression;
pub mod config;
pub mod error;
pub mod file_manager;
pub mod image_processor;
pub mod locator;
pub mod optimizer;
pub mod progress;

pub use compression::{CompressionError, CompressionUsage, ImageCompressor, TinifyClient};
pub use config::{Config, ImageMode, OptimizeOptions};
pub use error::OptimizeError;
pub use locator::{find_cover_image, find_images, find_opf};
pub use optimizer::{optimize, BatchOptimizer, EpubOptimizer};
