//! # Batch Optimizer
//!
//! Orchestratore che ottimizza più EPUB in parallelo delegando il lavoro
//! su ogni singolo file a `EpubOptimizer`.
//!
//! ## Responsabilità:
//! - Un task tokio per EPUB, limitati da un `Semaphore` di `workers` permessi
//! - Canale broadcast di stop condiviso (Ctrl-C, quota Tinify esaurita)
//! - Progress bar e statistiche cumulative
//! - Un errore su un file viene loggato e non ferma gli altri

use anyhow::Result;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    compression::ImageCompressor,
    config::{Config, OptimizeOptions},
    error::OptimizeError,
    file_manager::FileManager,
    optimizer::{epub_optimizer::EpubOptimizer, path_resolver::PathResolver},
    progress::{OptimizationStats, ProgressManager},
};

/// Size before and after for one optimized EPUB
type FileOutcome = Result<(u64, u64), OptimizeError>;

pub struct BatchOptimizer {
    config: Config,
    options: OptimizeOptions,
    semaphore: Arc<Semaphore>,
    stop_sender: broadcast::Sender<()>,
    show_progress: bool,
}

impl BatchOptimizer {
    pub fn new(config: Config, compressor: Option<Arc<dyn ImageCompressor>>) -> Result<Self> {
        config.validate()?;

        let options = config.to_options(compressor);
        let semaphore = Arc::new(Semaphore::new(config.workers));
        let (stop_sender, _) = broadcast::channel(16);

        Ok(Self {
            config,
            options,
            semaphore,
            stop_sender,
            show_progress: true,
        })
    }

    /// Disable the progress bar (used by tests and non-interactive runs)
    pub fn without_progress(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Sender that stops every running optimization at its next image.
    pub fn stop_handle(&self) -> broadcast::Sender<()> {
        self.stop_sender.clone()
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Optimize every input and return the aggregated statistics
    pub async fn run(&self, inputs: &[PathBuf]) -> Result<OptimizationStats> {
        let start_time = std::time::Instant::now();
        let mut stats = OptimizationStats::new();

        if inputs.is_empty() {
            info!("No EPUB files found to process");
            return Ok(stats);
        }

        PathResolver::ensure_output_dir(&self.config.output_dir).await?;
        self.log_configuration(inputs.len());

        let progress = if self.show_progress {
            ProgressManager::new(inputs.len() as u64)
        } else {
            ProgressManager::hidden(inputs.len() as u64)
        };

        let mut stop_monitor = self.stop_sender.subscribe();
        let mut tasks = Vec::with_capacity(inputs.len());

        for path in inputs {
            let permit = self.semaphore.clone().acquire_owned().await?;

            if stop_requested(&mut stop_monitor) {
                warn!("Stop requested, {} EPUBs left unprocessed", inputs.len() - tasks.len());
                break;
            }

            let path = path.clone();
            let options = self.options.clone();
            let output_dir = self.config.output_dir.clone();
            let stop_receiver = self.stop_sender.subscribe();
            let stop_sender = self.stop_sender.clone();
            let progress = progress.clone();

            let task = tokio::spawn(async move {
                let _permit = permit;
                debug!("Optimizing {}", path.display());

                let mut optimizer = EpubOptimizer::new_with_cancellation(options, stop_receiver)
                    .with_progress(progress.clone());
                let outcome = optimize_one(&mut optimizer, &path, &output_dir).await;

                let label = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match &outcome {
                    Ok((original, optimized)) => progress.update(&format!(
                        "{}: {:.1}% saved",
                        label,
                        FileManager::calculate_reduction(*original, *optimized)
                    )),
                    Err(e) => {
                        if e.is_account_error() {
                            error!("Tinify account error, stopping remaining work: {}", e);
                            let _ = stop_sender.send(());
                        }
                        progress.update(&format!("{}: failed", label));
                    }
                }

                (path, outcome)
            });

            tasks.push(task);
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok((original, optimized)))) => stats.add_optimized(original, optimized),
                Ok((path, Err(e))) => {
                    stats.add_error();
                    error!("Failed to optimize {}: {}", path.display(), e);
                }
                Err(e) => {
                    stats.add_error();
                    error!("Optimization task panicked: {}", e);
                }
            }
        }

        progress.finish(&stats.format_summary());
        info!(
            "Done in {:.1}s: {}",
            start_time.elapsed().as_secs_f64(),
            stats.format_summary()
        );

        Ok(stats)
    }

    fn log_configuration(&self, file_count: usize) {
        info!("Found {} EPUB files to process", file_count);
        info!("Output directory: {}", self.config.output_dir.display());
        match self.config.max_image_resolution {
            Some((width, height)) => info!("Max image resolution: {}x{}", width, height),
            None => info!("Max image resolution: unchanged"),
        }
        info!(
            "Mode: {:?}, keep color: {}, workers: {}",
            self.config.mode, self.config.keep_color, self.config.workers
        );
        if let Some(ref compressor) = self.options.compressor {
            info!("Remote compression: {}", compressor.name());
        }
    }
}

async fn optimize_one(
    optimizer: &mut EpubOptimizer,
    path: &Path,
    output_dir: &Path,
) -> FileOutcome {
    let original_size = FileManager::get_file_size(path).await.unwrap_or(0);
    let destination = optimizer.optimize(path, output_dir).await?;
    let optimized_size = FileManager::get_file_size(&destination).await.unwrap_or(0);
    Ok((original_size, optimized_size))
}

fn stop_requested(receiver: &mut broadcast::Receiver<()>) -> bool {
    matches!(
        receiver.try_recv(),
        Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_))
    )
}
