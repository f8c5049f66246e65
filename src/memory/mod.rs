/// Vector helpers for semantic memories: cosine similarity, BLOB
/// (de)serialization for the repository, and lazy relevance decay.
use anyhow::Result;

/// Half-life for memory relevance decay, in days. Applied at read time;
/// stored scores are never rewritten.
pub const RELEVANCE_HALF_LIFE_DAYS: u32 = 90;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Exponential decay multiplier: `0.5 ^ (age_days / half_life_days)`.
/// A half-life of 0 disables decay.
pub fn relevance_decay(age_days: f64, half_life_days: u32) -> f64 {
    if half_life_days == 0 || age_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_days / f64::from(half_life_days))
}

/// Serialize an embedding to little-endian bytes for BLOB storage.
pub fn serialize_embedding(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for &val in v {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding from little-endian bytes. Errors on a length
/// that is not a multiple of 4 (corruption or truncation).
pub fn deserialize_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if !bytes.len().is_multiple_of(4) {
        anyhow::bail!(
            "invalid embedding blob: {} bytes (not a multiple of 4)",
            bytes.len()
        );
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("chunks_exact yields 4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect())
}
