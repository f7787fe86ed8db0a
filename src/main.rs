//! # EPUB Image Optimizer - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Validazione degli input dell'utente
//! - Validazione della chiave Tinify prima di iniziare
//! - Creazione della configurazione e avvio del batch
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (file o directory, risoluzione, chiave, workers...)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose)
//! 3. Valida input e carica l'eventuale file di configurazione
//! 4. Se presente, valida la chiave Tinify e logga le compressioni residue
//! 5. Installa l'handler Ctrl-C e avvia `BatchOptimizer`
//!
//! ## Esempio di utilizzo:
//! ```bash
//! epub-image-optimizer --input-dir ~/books --max-image-resolution 1072 1448 --all-images
//! ```

use anyhow::Result;
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use epub_image_optimizer::{
    config::DEFAULT_OUTPUT_DIR, file_manager::FileManager, BatchOptimizer, Config, ImageCompressor,
    ImageMode, TinifyClient,
};

#[derive(Parser)]
#[command(name = "epub-image-optimizer", version)]
#[command(about = "Shrink the images inside EPUB files for e-readers")]
#[command(group(ArgGroup::new("input").required(true).args(["input_file", "input_dir"])))]
struct Args {
    /// Single EPUB file to optimize
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// Directory whose EPUB files (first level only) are optimized
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Output directory [default: ./epub_image_optimizer_output]
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Shrink images to fit WIDTH x HEIGHT, keeping the aspect ratio
    #[arg(long, num_args = 2, value_names = ["WIDTH", "HEIGHT"])]
    max_image_resolution: Option<Vec<u32>>,

    /// Tinify API key, enables remote compression
    #[arg(long, env = "TINIFY_API_KEY", hide_env_values = true)]
    tinify_api_key: Option<String>,

    /// Keep colors (default converts images to grayscale)
    #[arg(long)]
    keep_color: bool,

    /// Optimize every image, not just the cover
    #[arg(long)]
    all_images: bool,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// JSON configuration file, command line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let inputs = collect_inputs(&args)?;
    let config = build_config(&args).await?;
    config.validate()?;

    let compressor = match config.tinify_api_key {
        Some(ref key) => Some(validate_tinify_key(key).await?),
        None => None,
    };

    let batch = BatchOptimizer::new(config, compressor)?;

    let stop_sender = batch.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing current images and stopping");
            let _ = stop_sender.send(());
        }
    });

    let stats = batch.run(&inputs).await?;
    info!("Optimized EPUBs written to {}", batch.output_dir().display());

    if stats.errors > 0 {
        return Err(anyhow::anyhow!("{} EPUB files could not be optimized", stats.errors));
    }

    Ok(())
}

/// EPUB files selected by `--input-file` or `--input-dir`
fn collect_inputs(args: &Args) -> Result<Vec<PathBuf>> {
    if let Some(ref file) = args.input_file {
        if !file.is_file() {
            return Err(anyhow::anyhow!("Input file does not exist: {}", file.display()));
        }
        if !FileManager::is_epub(file) {
            return Err(anyhow::anyhow!("Input file is not an EPUB: {}", file.display()));
        }
        return Ok(vec![file.clone()]);
    }

    match args.input_dir {
        Some(ref dir) if dir.is_dir() => FileManager::find_epub_files(dir),
        Some(ref dir) => Err(anyhow::anyhow!("Input directory does not exist: {}", dir.display())),
        None => Err(anyhow::anyhow!("Either --input-file or --input-dir is required")),
    }
}

/// Config file (or defaults) with command line overrides applied
async fn build_config(args: &Args) -> Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    if let Some(ref output_dir) = args.output_dir {
        config.output_dir = output_dir.clone();
    } else if config.output_dir.as_os_str().is_empty() {
        config.output_dir = PathBuf::from(DEFAULT_OUTPUT_DIR);
    }

    if let Some(ref resolution) = args.max_image_resolution {
        if let [width, height] = resolution.as_slice() {
            config.max_image_resolution = Some((*width, *height));
        }
    }

    if args.tinify_api_key.is_some() {
        config.tinify_api_key = args.tinify_api_key.clone();
    }
    if args.keep_color {
        config.keep_color = true;
    }
    if args.all_images {
        config.mode = ImageMode::AllImages;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    Ok(config)
}

/// Check the key against the service before any EPUB is touched
async fn validate_tinify_key(key: &str) -> Result<Arc<dyn ImageCompressor>> {
    let client = TinifyClient::new(key)?;
    let usage = client
        .validate()
        .await
        .map_err(|e| anyhow::anyhow!("Tinify API key validation failed: {}", e))?;

    info!(
        "Tinify API key valid: {} compressions used this month, {} free remaining",
        usage.used, usage.remaining
    );
    if usage.remaining == 0 {
        warn!("Free Tinify compressions exhausted, further requests may be billed or rejected");
    }

    Ok(Arc::new(client))
}
