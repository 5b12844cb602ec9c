/// Similarity between two lines: `1 − edit_distance / max(len_a, len_b)`.
/// Symmetric, and `1.0` for identical inputs (including two empty lines).
pub fn line_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}
