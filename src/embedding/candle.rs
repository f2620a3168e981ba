use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::{EmbeddingModel, EmbeddingModelError};

/// BERT-family sentence encoder run in-process on the CPU.
///
/// Token embeddings are mean pooled over the attention mask and L2 normalized, matching how
/// `sentence-transformers` checkpoints are meant to be used.
pub struct SentenceEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
    max_tokens: usize,
}

impl std::fmt::Debug for SentenceEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentenceEmbedder")
            .field("device", &self.device)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl SentenceEmbedder {
    /// Download (or reuse from the local cache) and load `repo_id` from the Hugging Face Hub.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingModelError::Load`] if any file cannot be fetched or parsed.
    pub fn load(repo_id: &str, max_tokens: usize) -> Result<Self, EmbeddingModelError> {
        let load_error = |reason: String| EmbeddingModelError::Load {
            model: repo_id.to_string(),
            reason,
        };

        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| load_error(format!("failed to create HuggingFace API client: {e}")))?;
        let repo = api.model(repo_id.to_owned());
        let fetch = |file: &str| {
            repo.get(file)
                .map_err(|e| load_error(format!("failed to download {file}: {e}")))
        };
        let config_path = fetch("config.json")?;
        let tokenizer_path = fetch("tokenizer.json")?;
        let weights_path = fetch("model.safetensors")?;

        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| load_error(format!("failed to read config.json: {e}")))?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .map_err(|e| load_error(format!("invalid BERT config: {e}")))?;
        let dimension = serde_json::from_str::<serde_json::Value>(&config_str)
            .ok()
            .and_then(|value| value.get("hidden_size").and_then(|size| size.as_u64()))
            .ok_or_else(|| load_error("config.json has no hidden_size".into()))?
            as usize;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| load_error(format!("failed to load tokenizer: {e}")))?;
        let padding = match tokenizer.get_padding() {
            Some(existing) => PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                ..existing.clone()
            },
            None => {
                let (pad_token, pad_id) = ["<pad>", "[PAD]"]
                    .into_iter()
                    .find_map(|token| tokenizer.token_to_id(token).map(|id| (token, id)))
                    .unwrap_or(("[PAD]", 0));
                PaddingParams {
                    strategy: PaddingStrategy::BatchLongest,
                    pad_id,
                    pad_token: pad_token.to_string(),
                    ..PaddingParams::default()
                }
            }
        };
        tokenizer.with_padding(Some(padding));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                ..TruncationParams::default()
            }))
            .map_err(|e| load_error(format!("invalid truncation settings: {e}")))?;

        let device = Device::Cpu;
        // SAFETY: the safetensors file comes from the hf-hub cache and is not modified while
        // the VarBuilder maps it.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                .map_err(|e| load_error(format!("failed to map weights: {e}")))?
        };
        let model = BertModel::load(vb, &config)
            .map_err(|e| load_error(format!("failed to build model: {e}")))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension,
            max_tokens,
        })
    }

    fn forward(&self, texts: &[String]) -> candle_core::Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenizer encode failed: {e}")))?;

        let truncated = encodings
            .iter()
            .filter(|encoding| !encoding.get_overflowing().is_empty())
            .count();
        if truncated > 0 {
            tracing::warn!(
                truncated,
                batch = encodings.len(),
                max_tokens = self.max_tokens,
                "Chunks exceed the model window; their tails are not embedded"
            );
        }

        let batch = encodings.len();
        let seq_len = encodings.first().map_or(0, |encoding| encoding.len());
        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }

        let input_ids = Tensor::from_vec(ids, (batch, seq_len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let attention_mask = Tensor::from_vec(mask, (batch, seq_len), &self.device)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean pooling over real (unpadded) tokens
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
        let pooled = summed.broadcast_div(&counts)?;

        let norm = pooled.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12, f64::MAX)?;
        pooled.broadcast_div(&norm)?.to_vec2::<f32>()
    }
}

impl EmbeddingModel for SentenceEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        self.forward(texts)
            .map_err(|e| EmbeddingModelError::Inference(e.to_string()))
    }
}
