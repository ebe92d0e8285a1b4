use serde::{Deserialize, Serialize};

/// Number of buckets in every embedding vector
pub const EMBEDDING_DIM: usize = 256;

/// Marker appended to a feature before hashing it for its sign
const SIGN_SUFFIX: &str = "_sign";
const HASH_SEED: i32 = 17;
const HASH_MULTIPLIER: i32 = 31;

const UNIGRAM_WEIGHT: f32 = 1.0;
const BIGRAM_WEIGHT: f32 = 0.5;

const TOKEN_DELIMITERS: [char; 18] = [
    ' ', '\t', '\n', '\r', '.', ',', '!', '?', ';', ':', '"', '\'', '(', ')', '[', ']', '{', '}',
];

/// Representation of a vector embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingVector {
    pub values: Vec<f32>,
}

impl EmbeddingVector {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm
    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// False when any component is NaN or infinite
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// Capability that turns text into a fixed-length vector.
///
/// Vectors produced by an implementation are persisted and later compared
/// against freshly embedded queries, so `embed` must be a pure function of
/// its input.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> EmbeddingVector;
}

/// Feature-hashing embedder: unigrams and character bigrams are hashed into
/// signed buckets, then the vector is L2-normalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn new() -> Self {
        HashingEmbedder
    }

    fn add_feature(values: &mut [f32], feature: &str, weight: f32) {
        let bucket = bucket_for(stable_hash(feature), values.len());
        let sign_hash = stable_hash(&format!("{feature}{SIGN_SUFFIX}"));
        let sign = if sign_hash % 2 == 0 { 1.0 } else { -1.0 };
        values[bucket] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, text: &str) -> EmbeddingVector {
        let mut values = vec![0.0f32; EMBEDDING_DIM];

        for token in tokenize(text) {
            Self::add_feature(&mut values, &token, UNIGRAM_WEIGHT);

            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 2 {
                for pair in chars.windows(2) {
                    let bigram: String = pair.iter().collect();
                    Self::add_feature(&mut values, &bigram, BIGRAM_WEIGHT);
                }
            }
        }

        let norm = l2_norm(&values);
        if norm > 0.0 {
            for v in values.iter_mut() {
                *v /= norm;
            }
        }

        EmbeddingVector { values }
    }
}

/// Lowercase and split on whitespace and punctuation, dropping empty tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c| TOKEN_DELIMITERS.contains(&c))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Polynomial string hash over UTF-16 code units in wrapping 32-bit arithmetic.
///
/// Part of the on-disk format: persisted vectors are only comparable with
/// new ones while this function stays bit-for-bit the same.
pub fn stable_hash(text: &str) -> i32 {
    text.encode_utf16().fold(HASH_SEED, |acc, unit| {
        acc.wrapping_mul(HASH_MULTIPLIER).wrapping_add(i32::from(unit))
    })
}

fn bucket_for(hash: i32, dimension: usize) -> usize {
    // unsigned_abs keeps i32::MIN well defined
    hash.unsigned_abs() as usize % dimension
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Cosine similarity, 0.0 when either vector has no magnitude, the
/// dimensions differ or the result is not a finite number
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let similarity = dot / (norm_a * norm_b);
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}
