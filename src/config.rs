use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Default tesseract language specification.
pub const DEFAULT_OCR_LANGUAGES: &str = "eng";
/// Default rasterization resolution in dots per inch.
pub const DEFAULT_OCR_DPI: u32 = 300;
/// Default minimum number of non-whitespace characters for a native text layer to be trusted.
pub const DEFAULT_NATIVE_TEXT_MIN_CHARS: usize = 8;
/// Default chunk target length, in chunk units.
pub const DEFAULT_CHUNK_TARGET_LENGTH: usize = 400;
/// Default overlap between consecutive chunks, in chunk units.
pub const DEFAULT_CHUNK_OVERLAP: usize = 60;
/// Default look-back window for sentence/paragraph boundaries, in chunk units.
pub const DEFAULT_CHUNK_BOUNDARY_TOLERANCE: usize = 100;
/// Default multilingual sentence-embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str =
    "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2";
/// Output width of the default embedding model.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
/// Default number of chunks per embedding forward pass.
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 32;
/// Default tokenizer truncation length for the embedding model.
pub const DEFAULT_EMBEDDING_MAX_TOKENS: usize = 128;
/// Conservative characters-per-token ratio for multilingual subword tokenizers.
const CHARS_PER_TOKEN_ESTIMATE: usize = 4;
/// Default number of pages extracted concurrently within one document.
pub const DEFAULT_PAGE_CONCURRENCY: usize = 4;
/// Default upload limit (16 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the extraction service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tesseract language specification used when a request carries no hint (`eng+deu`).
    pub ocr_languages: String,
    /// Resolution used when rasterizing PDF pages for OCR.
    pub ocr_dpi: u32,
    /// Pages whose native text has fewer non-whitespace characters fall back to OCR.
    pub native_text_min_chars: usize,
    /// Unit in which chunk lengths are measured.
    pub chunk_unit: ChunkUnit,
    /// Target chunk length.
    pub chunk_target_length: usize,
    /// Overlap carried from the tail of one chunk into the next.
    pub chunk_overlap: usize,
    /// How far before the target a sentence or paragraph boundary may be used instead.
    pub chunk_boundary_tolerance: usize,
    /// Embedding backend hosting the model.
    pub embedding_backend: EmbeddingBackend,
    /// Embedding model identifier (Hugging Face repository for the candle backend).
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Number of chunks embedded per forward pass.
    pub embedding_batch_size: usize,
    /// Tokenizer truncation length for the embedding model.
    pub embedding_max_tokens: usize,
    /// Pages processed concurrently within one document.
    pub page_concurrency: usize,
    /// Documents processed concurrently by one process.
    pub max_concurrent_documents: usize,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: usize,
    /// Path or name of the tesseract binary.
    pub tesseract_bin: String,
    /// Path or name of the pdftoppm binary.
    pub pdftoppm_bin: String,
    /// Path or name of the pdfinfo binary.
    pub pdfinfo_bin: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Unit used to measure chunk length and overlap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkUnit {
    /// Unicode scalar values.
    #[default]
    Characters,
    /// `cl100k_base` tokens, counted per word.
    Tokens,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// BERT sentence encoder executed in-process with candle.
    Candle,
    /// Deterministic feature-hashing encoder; needs no model download.
    Hashing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ocr_languages: DEFAULT_OCR_LANGUAGES.to_string(),
            ocr_dpi: DEFAULT_OCR_DPI,
            native_text_min_chars: DEFAULT_NATIVE_TEXT_MIN_CHARS,
            chunk_unit: ChunkUnit::Characters,
            chunk_target_length: DEFAULT_CHUNK_TARGET_LENGTH,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            chunk_boundary_tolerance: DEFAULT_CHUNK_BOUNDARY_TOLERANCE,
            embedding_backend: EmbeddingBackend::Candle,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            embedding_batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
            embedding_max_tokens: DEFAULT_EMBEDDING_MAX_TOKENS,
            page_concurrency: DEFAULT_PAGE_CONCURRENCY,
            max_concurrent_documents: 1,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            tesseract_bin: "tesseract".to_string(),
            pdftoppm_bin: "pdftoppm".to_string(),
            pdfinfo_bin: "pdfinfo".to_string(),
            server_port: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            ocr_languages: load_env_optional("OCR_LANGUAGES").unwrap_or(defaults.ocr_languages),
            ocr_dpi: parse_env_or("OCR_DPI", defaults.ocr_dpi)?,
            native_text_min_chars: parse_env_or(
                "NATIVE_TEXT_MIN_CHARS",
                defaults.native_text_min_chars,
            )?,
            chunk_unit: parse_env_or("CHUNK_UNIT", defaults.chunk_unit)?,
            chunk_target_length: parse_env_or(
                "CHUNK_TARGET_LENGTH",
                defaults.chunk_target_length,
            )?,
            chunk_overlap: parse_env_or("CHUNK_OVERLAP", defaults.chunk_overlap)?,
            chunk_boundary_tolerance: parse_env_or(
                "CHUNK_BOUNDARY_TOLERANCE",
                defaults.chunk_boundary_tolerance,
            )?,
            embedding_backend: parse_env_or("EMBEDDING_BACKEND", defaults.embedding_backend)?,
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            embedding_dimension: parse_env_or(
                "EMBEDDING_DIMENSION",
                defaults.embedding_dimension,
            )?,
            embedding_batch_size: parse_env_or(
                "EMBEDDING_BATCH_SIZE",
                defaults.embedding_batch_size,
            )?,
            embedding_max_tokens: parse_env_or(
                "EMBEDDING_MAX_TOKENS",
                defaults.embedding_max_tokens,
            )?,
            page_concurrency: parse_env_or("PAGE_CONCURRENCY", defaults.page_concurrency)?,
            max_concurrent_documents: parse_env_or(
                "MAX_CONCURRENT_DOCUMENTS",
                defaults.max_concurrent_documents,
            )?,
            max_upload_bytes: parse_env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            tesseract_bin: load_env_optional("TESSERACT_BIN").unwrap_or(defaults.tesseract_bin),
            pdftoppm_bin: load_env_optional("PDFTOPPM_BIN").unwrap_or(defaults.pdftoppm_bin),
            pdfinfo_bin: load_env_optional("PDFINFO_BIN").unwrap_or(defaults.pdfinfo_bin),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the pipeline unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("OCR_DPI", self.ocr_dpi as usize),
            ("CHUNK_TARGET_LENGTH", self.chunk_target_length),
            ("EMBEDDING_DIMENSION", self.embedding_dimension),
            ("EMBEDDING_BATCH_SIZE", self.embedding_batch_size),
            ("EMBEDDING_MAX_TOKENS", self.embedding_max_tokens),
            ("PAGE_CONCURRENCY", self.page_concurrency),
            ("MAX_CONCURRENT_DOCUMENTS", self.max_concurrent_documents),
            ("MAX_UPLOAD_BYTES", self.max_upload_bytes),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidValue((*name).to_string()));
        }
        if self.chunk_overlap >= self.chunk_target_length {
            return Err(ConfigError::InvalidValue("CHUNK_OVERLAP".to_string()));
        }
        if self.ocr_languages.trim().is_empty() {
            return Err(ConfigError::InvalidValue("OCR_LANGUAGES".to_string()));
        }
        if let Some(estimated_tokens) = self.chunk_window_overflow() {
            tracing::warn!(
                chunk_target_length = self.chunk_target_length,
                chunk_unit = ?self.chunk_unit,
                estimated_tokens,
                embedding_max_tokens = self.embedding_max_tokens,
                "Chunks may exceed the embedding model window and be truncated"
            );
        }
        Ok(())
    }

    /// Estimated token length of a full chunk when it exceeds `embedding_max_tokens`.
    ///
    /// Only the candle backend truncates; the hashing backend reads whole chunks.
    pub fn chunk_window_overflow(&self) -> Option<usize> {
        if self.embedding_backend != EmbeddingBackend::Candle {
            return None;
        }
        let estimated_tokens = match self.chunk_unit {
            ChunkUnit::Tokens => self.chunk_target_length,
            ChunkUnit::Characters => self.chunk_target_length.div_ceil(CHARS_PER_TOKEN_ESTIMATE),
        };
        (estimated_tokens > self.embedding_max_tokens).then_some(estimated_tokens)
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl FromStr for ChunkUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "characters" | "chars" | "char" => Ok(Self::Characters),
            "tokens" | "token" => Ok(Self::Tokens),
            _ => Err(()),
        }
    }
}

impl FromStr for EmbeddingBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "candle" => Ok(Self::Candle),
            "hashing" | "hash" => Ok(Self::Hashing),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    install_config(config);
}

/// Install an already-built configuration in the global cache.
pub fn install_config(config: Config) {
    tracing::debug!(
        ocr_languages = %config.ocr_languages,
        ocr_dpi = config.ocr_dpi,
        native_text_min_chars = config.native_text_min_chars,
        chunk_unit = ?config.chunk_unit,
        chunk_target_length = config.chunk_target_length,
        chunk_overlap = config.chunk_overlap,
        embedding_backend = ?config.embedding_backend,
        embedding_model = %config.embedding_model,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
