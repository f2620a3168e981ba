use sha2::{Digest, Sha256};

use super::{EmbeddingModel, EmbeddingModelError};

/// Deterministic feature-hashing encoder.
///
/// Every lowercased word is hashed into one signed slot of the vector, and the result is L2
/// normalized. Texts that share vocabulary end up close together, which is enough for offline
/// deployments and tests; it carries no semantics beyond word overlap.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Construct an encoder producing `dimension`-wide vectors.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        if text.is_empty() || self.dimension == 0 {
            return embedding;
        }

        for word in text.split_whitespace() {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let mut slot = [0u8; 8];
            slot.copy_from_slice(&digest[..8]);
            let position = (u64::from_le_bytes(slot) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            embedding[position] += sign;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

impl EmbeddingModel for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn vectors_are_unit_length_and_deterministic() {
        let mut embedder = HashingEmbedder::new(64);
        let texts = vec!["Invoice total due".to_string(), "Invoice total due".to_string()];
        let vectors = embedder.embed_batch(&texts).unwrap();
        assert_eq!(vectors[0], vectors[1]);
        let norm = cosine(&vectors[0], &vectors[0]).sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_are_closer_than_disjoint_ones() {
        let mut embedder = HashingEmbedder::new(256);
        let texts = vec![
            "the invoice total is due".to_string(),
            "invoice total due today".to_string(),
            "weather forecast rain".to_string(),
        ];
        let vectors = embedder.embed_batch(&texts).unwrap();
        assert!(cosine(&vectors[0], &vectors[1]) > cosine(&vectors[0], &vectors[2]));
    }

    #[test]
    fn empty_text_is_the_zero_vector() {
        let mut embedder = HashingEmbedder::new(8);
        let vectors = embedder.embed_batch(&[String::new()]).unwrap();
        assert_eq!(vectors[0], vec![0.0; 8]);
    }
}
