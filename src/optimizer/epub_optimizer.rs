//! # EPUB Optimizer (Archive Transcoder)
//!
//! Riscrive un singolo EPUB: le entry immagine passano per la pipeline di
//! trasformazione, tutte le altre vengono copiate così come sono.
//!
//! ## Flusso:
//! 1. Calcola il path di destinazione (`<stem>_optimized.epub`)
//! 2. Apre l'archivio sorgente (`ArchiveOpen` se non è uno zip valido)
//! 3. Determina l'insieme di immagini (copertina o tutte) PRIMA di creare la
//!    destinazione, così un fallimento non lascia file parziali
//! 4. Scorre le entry una volta sola, nell'ordine dell'archivio:
//!    - entry normali: copia raw dei byte compressi, header e timestamp inclusi
//!    - immagini: decode → thumbnail → grigi → encode → compressione remota,
//!      scritte con deflate livello 9 e timestamp corrente
//! 5. Finalizza la central directory e restituisce il path
//!
//! ## Cancellazione:
//! Il segnale di stop viene controllato una volta per immagine. Se arriva,
//! l'archivio viene chiuso con quanto scritto finora e il path viene
//! restituito comunque (output parziale per contratto).
//!
//! Decodifica e ricodifica girano in `spawn_blocking`, la copia delle entry
//! resta sul worker chiamante. La destinazione è scritta tramite `BufWriter`.
//!
//! ## Error handling:
//! Ogni errore successivo alla creazione della destinazione chiude comunque
//! l'archivio (best effort), il file parziale resta al chiamante.

use chrono::{Datelike, Local, Timelike};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    config::{ImageMode, OptimizeOptions},
    error::OptimizeError,
    file_manager::FileManager,
    image_processor::ImageProcessor,
    locator::{self, EntrySource},
    optimizer::path_resolver::PathResolver,
    progress::ProgressManager,
};

/// Counters for one rewritten archive
#[derive(Debug, Default, Clone, Copy)]
struct TranscodeSummary {
    copied: usize,
    images: usize,
    image_bytes_before: u64,
    image_bytes_after: u64,
    cancelled: bool,
}

/// Rewrites one EPUB at a time; holds no state between calls
pub struct EpubOptimizer {
    options: OptimizeOptions,
    image_processor: ImageProcessor,
    /// Cancellation receiver for stopping between images
    stop_receiver: Option<broadcast::Receiver<()>>,
    /// Receives a "N/M images" message after every rewritten image
    progress: Option<ProgressManager>,
}

impl EpubOptimizer {
    pub fn new(options: OptimizeOptions) -> Self {
        Self {
            image_processor: ImageProcessor::new(&options),
            options,
            stop_receiver: None,
            progress: None,
        }
    }

    /// Creates an optimizer that stops at the next image once a signal arrives
    /// on `stop_receiver`.
    pub fn new_with_cancellation(
        options: OptimizeOptions,
        stop_receiver: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stop_receiver: Some(stop_receiver),
            ..Self::new(options)
        }
    }

    /// Report per-image progress on `progress` as `<file>: N/M images`.
    pub fn with_progress(mut self, progress: ProgressManager) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Checks if a stop signal has been received.
    fn should_stop(&mut self) -> bool {
        if let Some(ref mut receiver) = self.stop_receiver {
            match receiver.try_recv() {
                Ok(_) => return true,
                Err(broadcast::error::TryRecvError::Empty) => return false,
                // Signal was sent but we missed it, treat as stop
                Err(broadcast::error::TryRecvError::Lagged(_)) => return true,
                // Sender was dropped, continue processing
                Err(broadcast::error::TryRecvError::Closed) => return false,
            }
        }
        false
    }

    /// Optimize `source_path` into `output_dir` and return the new archive path.
    ///
    /// # Errors
    /// * `ArchiveOpen` - source is not a zip container (no output created)
    /// * `CoverNotFound` / `NoImagesFound` - nothing to rewrite (no output created)
    /// * `ImageDecode`, `UnsupportedFormat`, `CompressionService`, `Io`, `Zip` -
    ///   abort mid-stream, the partial output is left in place
    pub async fn optimize(
        &mut self,
        source_path: &Path,
        output_dir: &Path,
    ) -> Result<PathBuf, OptimizeError> {
        let destination_path = PathResolver::destination_path(source_path, output_dir)?;

        let mut source = open_source(source_path)?;
        let entries = source.entry_names();
        let image_set: HashSet<String> = self
            .resolve_image_set(&mut source, &entries, source_path)?
            .into_iter()
            .collect();

        debug!(
            "{}: {} entries, {} images selected",
            source_path.display(),
            entries.len(),
            image_set.len()
        );

        let label = source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut destination = ZipWriter::new(BufWriter::new(File::create(&destination_path)?));
        let outcome = self
            .transcode(&mut source, &mut destination, &image_set, &label)
            .await;
        let finished = destination
            .finish()
            .and_then(|mut writer| writer.flush().map_err(ZipError::Io));

        let summary = match outcome {
            Ok(summary) => summary,
            Err(e) => {
                if let Err(close_error) = finished {
                    warn!(
                        "Could not finalize partial archive {}: {}",
                        destination_path.display(),
                        close_error
                    );
                }
                return Err(e);
            }
        };
        finished?;

        if summary.cancelled {
            warn!(
                "Optimization of {} cancelled, partial output left at {}",
                source_path.display(),
                destination_path.display()
            );
        } else {
            info!(
                "{}: {} images rewritten ({} -> {}, {:.1}% saved), {} entries copied",
                source_path.display(),
                summary.images,
                FileManager::format_size(summary.image_bytes_before),
                FileManager::format_size(summary.image_bytes_after),
                FileManager::calculate_reduction(
                    summary.image_bytes_before,
                    summary.image_bytes_after
                ),
                summary.copied
            );
        }

        Ok(destination_path)
    }

    /// Entry names to rewrite, according to the mode
    fn resolve_image_set<S: EntrySource>(
        &self,
        source: &mut S,
        entries: &[String],
        epub_path: &Path,
    ) -> Result<Vec<String>, OptimizeError> {
        match self.options.mode {
            ImageMode::CoverOnly => {
                let cover = locator::locate_cover(source, entries, epub_path)?;
                info!("Cover image for {}: {}", epub_path.display(), cover);
                Ok(vec![cover])
            }
            ImageMode::AllImages => {
                if let Err(e) = locator::find_opf(entries) {
                    warn!("{}: {}", epub_path.display(), e);
                }

                let images = locator::find_images(entries);
                if images.is_empty() {
                    return Err(OptimizeError::NoImagesFound {
                        path: epub_path.to_path_buf(),
                    });
                }
                Ok(images)
            }
        }
    }

    /// Single pass over the source, in archive order
    async fn transcode<R, W>(
        &mut self,
        source: &mut ZipArchive<R>,
        destination: &mut ZipWriter<W>,
        image_set: &HashSet<String>,
        label: &str,
    ) -> Result<TranscodeSummary, OptimizeError>
    where
        R: Read + Seek + Send,
        W: Write + Seek + Send,
    {
        let mut summary = TranscodeSummary::default();

        for index in 0..source.len() {
            let name = source.by_index_raw(index)?.name().to_string();

            if !image_set.contains(&name) {
                destination.raw_copy_file(source.by_index_raw(index)?)?;
                summary.copied += 1;
                continue;
            }

            if self.should_stop() {
                debug!("Stop signal received before {}", name);
                summary.cancelled = true;
                break;
            }

            let original = read_entry_at(source, index)?;
            let original_size = original.len() as u64;

            // Decode and re-encode off the async workers
            let processor = self.image_processor.clone();
            let entry = name.clone();
            let processed =
                tokio::task::spawn_blocking(move || processor.process(&entry, &original)).await??;

            let data = match self.options.compressor {
                Some(ref compressor) => {
                    debug!("Compressing {} with {}", name, compressor.name());
                    compressor.compress(&processed.data).await?
                }
                None => processed.data,
            };

            destination.start_file(name.as_str(), image_entry_options())?;
            destination.write_all(&data)?;

            summary.images += 1;
            summary.image_bytes_before += original_size;
            summary.image_bytes_after += data.len() as u64;

            if let Some(ref progress) = self.progress {
                progress.set_message(&format!(
                    "{}: {}/{} images",
                    label,
                    summary.images,
                    image_set.len()
                ));
            }
        }

        Ok(summary)
    }
}

/// One-shot optimization of a single EPUB, without cancellation
pub async fn optimize(
    source_path: &Path,
    output_dir: &Path,
    options: OptimizeOptions,
) -> Result<PathBuf, OptimizeError> {
    EpubOptimizer::new(options)
        .optimize(source_path, output_dir)
        .await
}

fn open_source(path: &Path) -> Result<ZipArchive<File>, OptimizeError> {
    let archive_open = |source: ZipError| OptimizeError::ArchiveOpen {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|e| archive_open(ZipError::Io(e)))?;
    ZipArchive::new(file).map_err(archive_open)
}

fn read_entry_at<R: Read + Seek>(
    source: &mut ZipArchive<R>,
    index: usize,
) -> Result<Vec<u8>, OptimizeError> {
    let mut file = source.by_index(index)?;
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(data)
}

/// Deflate at the highest level, stamped with the current local time
fn image_entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9))
        .last_modified_time(current_timestamp())
}

fn current_timestamp() -> zip::DateTime {
    let now = Local::now();
    zip::DateTime::from_date_and_time(
        now.year().clamp(1980, 2107) as u16,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    )
    .unwrap_or_default()
}
