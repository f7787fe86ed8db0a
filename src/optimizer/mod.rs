//! # Optimizer Module
//!
//! Separa le responsabilità in sottomoduli:
//! - `epub_optimizer`: Riscrittura di un singolo EPUB (transcoder)
//! - `batch_optimizer`: Orchestratore parallelo su più EPUB
//! - `path_resolver`: Logica di calcolo path centralizzata

pub mod batch_optimizer;
pub mod epub_optimizer;
pub mod path_resolver;

pub use batch_optimizer::BatchOptimizer;
pub use epub_optimizer::{optimize, EpubOptimizer};
pub use path_resolver::PathResolver;
