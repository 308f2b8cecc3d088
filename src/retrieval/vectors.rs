//! Hashed term vectors
//!
//! A cheap, deterministic stand-in for embeddings: tokens are hashed into a
//! fixed number of buckets and compared with cosine similarity. No model, no
//! network, identical output for identical input.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Number of buckets in a term vector
pub const VECTOR_DIM: usize = 256;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid token regex"));

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "from", "has", "have",
        "if", "in", "into", "is", "it", "its", "not", "of", "on", "or", "so", "than", "that", "the",
        "then", "there", "these", "this", "to", "was", "were", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// Lowercased word tokens with stop words and single characters removed
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.chars().count() > 1 && !STOP_WORDS.contains(t.as_str()))
        .collect()
}

/// 64-bit FNV-1a. Fixed across builds and platforms, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Project `text` into a signed, L2-normalized bag-of-words vector
pub fn term_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; VECTOR_DIM];

    for token in tokenize(text) {
        let hash = fnv1a(token.as_bytes());

        let bucket = (hash % VECTOR_DIM as u64) as usize;
        // High bit picks the sign so colliding tokens tend to cancel out
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let mag: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag > 0.0 {
        for val in vector.iter_mut() {
            *val /= mag;
        }
    }

    vector
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Look up the Lead in the CRM, then e-mail it!"),
            vec!["look", "up", "lead", "crm", "mail"]
        );
        assert!(tokenize("a I").is_empty());
    }

    #[test]
    fn test_term_vector_deterministic_and_normalized() {
        let v1 = term_vector("qualify a new lead");
        let v2 = term_vector("qualify a new lead");
        assert_eq!(v1, v2);

        let mag: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_term_vector_layout_is_stable() {
        let hash = fnv1a(b"lead");
        let bucket = (hash % VECTOR_DIM as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };

        let v = term_vector("Lead");
        assert_eq!(v[bucket], sign);
        assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 1);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        assert!(term_vector("the and of").iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&term_vector(""), &term_vector("lead")), 0.0);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_word_order_does_not_matter() {
        let a = term_vector("lead lookup failed");
        let b = term_vector("failed lookup lead");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
    }
}
