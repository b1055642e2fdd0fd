/// Width of every stored policy vector.
pub const EMBEDDING_DIM: usize = 384;

const KEYWORDS: [&str; 7] = [
    "leave", "days", "annual", "sick", "approval", "manager", "notice",
];

/// Pseudo-embedding: ten text statistics, zero-padded to `EMBEDDING_DIM`, L2-normalised.
///
/// The statistics are character count, spaces, periods, and the occurrences of each
/// keyword in the lower-cased text.
pub fn embed(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();

    let mut features = Vec::with_capacity(EMBEDDING_DIM);
    features.push(text.chars().count() as f32);
    features.push(text.matches(' ').count() as f32);
    features.push(text.matches('.').count() as f32);
    features.extend(KEYWORDS.iter().map(|k| lower.matches(k).count() as f32));
    features.resize(EMBEDDING_DIM, 0.0);

    let norm = features.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        features.iter_mut().for_each(|v| *v /= norm);
    }
    features
}

/// Cosine similarity; zero when either vector has no magnitude or the widths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
