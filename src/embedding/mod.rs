//! Process-wide embedding model host.
//!
//! The model is loaded on the first [`EmbeddingHost::embed`] call, at most once, and then lives
//! for the rest of the process. All calls go through the host, which splits inputs into batches
//! and serializes them against the model.

#[cfg(feature = "candle")]
mod candle;
mod hashing;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::{Config, EmbeddingBackend};

#[cfg(feature = "candle")]
pub use candle::SentenceEmbedder;
pub use hashing::HashingEmbedder;

/// Errors raised while loading or running the embedding model.
#[derive(Debug, Error)]
pub enum EmbeddingModelError {
    /// Model weights or tokenizer could not be loaded.
    #[error("failed to load embedding model '{model}': {reason}")]
    Load {
        /// Model identifier.
        model: String,
        /// Loader error.
        reason: String,
    },
    /// Forward pass or tokenization failed.
    #[error("embedding inference failed: {0}")]
    Inference(String),
    /// Model returned a different number of vectors than it was given inputs.
    #[error("embedding model returned {actual} vectors for {expected} inputs")]
    CountMismatch {
        /// Inputs in the batch.
        expected: usize,
        /// Vectors returned.
        actual: usize,
    },
    /// Returned embedding dimension does not match configuration.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension produced by the model.
        actual: usize,
    },
    /// Background worker panicked or the model lock was poisoned.
    #[error("embedding worker failed: {0}")]
    Worker(String),
}

/// A loaded sentence-embedding model.
///
/// Implementations need not be re-entrant: the host never calls `embed_batch` concurrently.
pub trait EmbeddingModel: Send {
    /// Width of every produced vector.
    fn dimension(&self) -> usize;

    /// Embed one batch; output `i` belongs to input `i`.
    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError>;
}

/// Constructor invoked once, on first use.
pub type ModelLoader =
    Arc<dyn Fn() -> Result<Box<dyn EmbeddingModel>, EmbeddingModelError> + Send + Sync>;

type SharedModel = Arc<Mutex<Box<dyn EmbeddingModel>>>;

/// Lazily initialized, batched access to one embedding model.
pub struct EmbeddingHost {
    model_name: String,
    dimension: usize,
    batch_size: usize,
    loader: ModelLoader,
    model: OnceCell<SharedModel>,
}

impl std::fmt::Debug for EmbeddingHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingHost")
            .field("model_name", &self.model_name)
            .field("dimension", &self.dimension)
            .field("batch_size", &self.batch_size)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl EmbeddingHost {
    /// Create a host; `loader` runs on the first embed call.
    pub fn new(
        model_name: impl Into<String>,
        dimension: usize,
        batch_size: usize,
        loader: ModelLoader,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            dimension,
            batch_size: batch_size.max(1),
            loader,
            model: OnceCell::new(),
        }
    }

    /// Host for the backend selected in `config`.
    pub fn from_config(config: &Config) -> Self {
        let model_name = match config.embedding_backend {
            EmbeddingBackend::Candle => config.embedding_model.clone(),
            EmbeddingBackend::Hashing => format!("hashing-{}", config.embedding_dimension),
        };
        Self::new(
            model_name,
            config.embedding_dimension,
            config.embedding_batch_size,
            backend_loader(config),
        )
    }

    /// Identifier of the hosted model.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Width of every vector this host returns.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether the model has been loaded yet.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> Result<SharedModel, EmbeddingModelError> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                let started = Instant::now();
                let model = tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|error| EmbeddingModelError::Worker(error.to_string()))??;
                if model.dimension() != self.dimension {
                    return Err(EmbeddingModelError::DimensionMismatch {
                        expected: self.dimension,
                        actual: model.dimension(),
                    });
                }
                tracing::info!(
                    model = %self.model_name,
                    dimension = self.dimension,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Embedding model loaded"
                );
                Ok(Arc::new(Mutex::new(model)))
            })
            .await?;
        Ok(Arc::clone(model))
    }

    /// Embed `texts`, returning one vector per input in input order.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model().await?;
        let batch_size = self.batch_size;
        let dimension = self.dimension;
        let model_name = self.model_name.clone();

        tokio::task::spawn_blocking(move || {
            // A panic in an earlier batch poisons the lock; models keep no per-call state.
            let mut model = model.lock().unwrap_or_else(|poisoned| {
                tracing::error!(
                    model = %model_name,
                    "Embedding model panicked in an earlier batch; clearing lock poison"
                );
                model.clear_poison();
                poisoned.into_inner()
            });
            let mut vectors = Vec::with_capacity(texts.len());
            for (batch_index, batch) in texts.chunks(batch_size).enumerate() {
                let output = model.embed_batch(batch)?;
                if output.len() != batch.len() {
                    return Err(EmbeddingModelError::CountMismatch {
                        expected: batch.len(),
                        actual: output.len(),
                    });
                }
                if let Some(vector) = output.iter().find(|vector| vector.len() != dimension) {
                    return Err(EmbeddingModelError::DimensionMismatch {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                tracing::trace!(batch = batch_index, size = batch.len(), "Embedded batch");
                vectors.extend(output);
            }
            Ok(vectors)
        })
        .await
        .map_err(|error| EmbeddingModelError::Worker(error.to_string()))?
    }
}

fn backend_loader(config: &Config) -> ModelLoader {
    let dimension = config.embedding_dimension;
    match config.embedding_backend {
        EmbeddingBackend::Hashing => Arc::new(move || {
            Ok(Box::new(HashingEmbedder::new(dimension)) as Box<dyn EmbeddingModel>)
        }),
        EmbeddingBackend::Candle => candle_loader(config),
    }
}

#[cfg(feature = "candle")]
fn candle_loader(config: &Config) -> ModelLoader {
    let repo = config.embedding_model.clone();
    let max_tokens = config.embedding_max_tokens;
    Arc::new(move || {
        Ok(Box::new(SentenceEmbedder::load(&repo, max_tokens)?) as Box<dyn EmbeddingModel>)
    })
}

#[cfg(not(feature = "candle"))]
fn candle_loader(config: &Config) -> ModelLoader {
    let repo = config.embedding_model.clone();
    Arc::new(move || {
        Err(EmbeddingModelError::Load {
            model: repo.clone(),
            reason: "built without the `candle` feature; set EMBEDDING_BACKEND=hashing".into(),
        })
    })
}

static GLOBAL_HOST: OnceLock<Arc<EmbeddingHost>> = OnceLock::new();

/// The process-wide host, created from `config` on first access.
pub fn global_host(config: &Config) -> Arc<EmbeddingHost> {
    Arc::clone(GLOBAL_HOST.get_or_init(|| Arc::new(EmbeddingHost::from_config(config))))
}
