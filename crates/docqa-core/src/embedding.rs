//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! plus pure helper functions for vector serialization and similarity
//! computation, and [`HashingEmbedder`], a deterministic local embedder
//! for offline runs and tests.
//!
//! Concrete network providers (OpenAI, Ollama) live in the `docqa`
//! app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{ConfigurationError, EmbeddingServiceError};

/// Trait for embedding backends.
///
/// Implementations must tolerate concurrent callers. A single call makes
/// at most one request to the backing service; retries belong to the
/// caller.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per text in input order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceError>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingServiceError> {
        let mut vectors = self.embed_many(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            EmbeddingServiceError::InvalidResponse("empty embedding response".to_string())
        })
    }
}

/// Check a batch response: one vector per input, each of `expected_dims`.
///
/// A count mismatch is an invalid response; a dimensionality mismatch is
/// a configuration error and must not be retried.
pub fn check_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    expected_dims: usize,
) -> Result<(), EmbeddingServiceError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingServiceError::InvalidResponse(format!(
            "expected {} vectors, got {}",
            expected_count,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected_dims) {
        return Err(ConfigurationError::DimensionMismatch {
            expected: expected_dims,
            actual: bad.len(),
        }
        .into());
    }
    Ok(())
}

/// Embed `texts` and validate the response with [`check_vectors`].
pub async fn embed_checked(
    embedder: &dyn Embedder,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
    let vectors = embedder.embed_many(texts).await?;
    check_vectors(&vectors, texts.len(), embedder.dims())?;
    Ok(vectors)
}

/// Little-endian f32 bytes, the layout used for SQLite BLOB columns.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not fill an f32 are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine of the angle between `a` and `b`.
///
/// `0.0` when the lengths differ, the vectors are empty, or either has
/// zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, x2, y2), (x, y)| {
            (d + x * y, x2 + x * x, y2 + y * y)
        });
    let denom = aa.sqrt() * bb.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Inner product of two vectors (`0.0` when lengths differ).
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Deterministic bag-of-words embedder using the hashing trick.
///
/// Lowercased alphanumeric tokens are hashed (SHA-256) into `dims`
/// buckets and the counts are L2-normalised. Texts sharing words score
/// higher under cosine similarity. No network, no model download.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Embed synchronously; [`Embedder::embed_many`] delegates here.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_layout() {
        let blob = vec_to_blob(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(blob_to_vec(&blob), vec![1.0, -2.5]);
        assert_eq!(blob_to_vec(&blob[..7]), vec![1.0]);
    }

    #[test]
    fn test_cosine_similarity() {
        let v = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(dot_product(&[1.0], &[3.0, 4.0]), 0.0);
    }

    #[test]
    fn test_check_vectors() {
        let ok = vec![vec![0.0; 3], vec![1.0; 3]];
        assert!(check_vectors(&ok, 2, 3).is_ok());

        let err = check_vectors(&ok, 2, 4).unwrap_err();
        assert_eq!(
            err,
            EmbeddingServiceError::Configuration(ConfigurationError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        );
        assert!(!err.is_retryable());

        let err = check_vectors(&ok, 3, 3).unwrap_err();
        assert!(matches!(err, EmbeddingServiceError::InvalidResponse(_)));
    }

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalised() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_text("The sky is blue.");
        let b = e.embed_text("the SKY is blue");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed_text("...").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_hashing_embedder_ranks_shared_words_higher() {
        let e = HashingEmbedder::new(384);
        let q = e.embed("What color is the sky?").await.unwrap();
        let sky = e.embed("The sky is blue.").await.unwrap();
        let fire = e.embed("Fire is hot.").await.unwrap();
        assert!(cosine_similarity(&q, &sky) > cosine_similarity(&q, &fire));
    }

    #[tokio::test]
    async fn test_embed_checked_validates_dims() {
        struct Wrong;
        #[async_trait]
        impl Embedder for Wrong {
            fn model_name(&self) -> &str {
                "wrong"
            }
            fn dims(&self) -> usize {
                8
            }
            async fn embed_many(
                &self,
                texts: &[String],
            ) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
                Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
            }
        }
        let err = embed_checked(&Wrong, &["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingServiceError::Configuration(_)));
    }
}
