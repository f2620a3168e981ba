use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use docpipe::{
    config::Config,
    logging,
    processing::{DocumentPipeline, DocumentProcessor, DocumentRequest},
};
use serde_json::{Value, json};
use walkdir::WalkDir;

const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp",
];

#[derive(Parser)]
#[command(
    name = "docpipe-extract",
    about = "Extract, chunk and embed documents without running the HTTP server"
)]
struct Cli {
    /// File or directory to process; directories are walked recursively.
    path: PathBuf,
    /// OCR language hint (`eng`, `eng+deu`).
    #[arg(long)]
    language: Option<String>,
    /// Override CHUNK_TARGET_LENGTH.
    #[arg(long)]
    chunk_target: Option<usize>,
    /// Override CHUNK_OVERLAP.
    #[arg(long)]
    chunk_overlap: Option<usize>,
    /// Pretty-print each result instead of one JSON document per line.
    #[arg(long)]
    pretty: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    logging::init_stderr_tracing();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(target) = cli.chunk_target {
        config.chunk_target_length = target;
    }
    if let Some(overlap) = cli.chunk_overlap {
        config.chunk_overlap = overlap;
    }
    config
        .validate()
        .context("invalid chunking options")?;

    let files = collect_inputs(&cli.path)?;
    if files.is_empty() {
        bail!("no supported documents found under {}", cli.path.display());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let pipeline =
            DocumentPipeline::from_config(&config).context("failed to build pipeline")?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut failures = 0usize;

        for path in &files {
            let record = process_file(&pipeline, path, cli.language.clone()).await?;
            if record.get("error").is_some() {
                failures += 1;
            }
            let line = if cli.pretty {
                serde_json::to_string_pretty(&record)?
            } else {
                serde_json::to_string(&record)?
            };
            writeln!(out, "{line}").context("failed to write result")?;
        }

        let metrics = pipeline.metrics_snapshot();
        tracing::info!(
            documents = files.len(),
            failures,
            pages_native = metrics.pages_native,
            pages_ocr = metrics.pages_ocr,
            chunks = metrics.chunks_embedded,
            "Extraction finished"
        );
        Ok(())
    })
}

fn collect_inputs(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("{} does not exist", path.display());
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && is_supported(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    Ok(files)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

async fn process_file(
    pipeline: &DocumentPipeline,
    path: &Path,
    language: Option<String>,
) -> Result<Value> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let request = DocumentRequest {
        bytes,
        content_type: None,
        language,
        file_name: path.file_name().map(|name| name.to_string_lossy().into_owned()),
    };
    let record = match pipeline.process_document(request).await {
        Ok(result) => json!({ "path": path.display().to_string(), "result": result }),
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "Document failed");
            json!({
                "path": path.display().to_string(),
                "error": error.to_string(),
                "kind": error.kind(),
            })
        }
    };
    Ok(record)
}
