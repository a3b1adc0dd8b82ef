use ndarray::Array1;

/// L2-normalized face embedding vector
pub type Embedding = Array1<f32>;

/// L2 normalize an embedding vector. A zero vector is returned unchanged.
pub fn normalize(mut embedding: Embedding) -> Embedding {
    let norm = embedding.dot(&embedding).sqrt();
    if norm > 0.0 {
        embedding /= norm;
    }
    embedding
}

/// Build a normalized embedding from raw values
pub fn from_vec(values: Vec<f32>) -> Embedding {
    normalize(Array1::from_vec(values))
}

/// Cosine similarity of two unit embeddings (their dot product).
/// Returns `None` when the dimensions differ.
pub fn similarity(a: &Embedding, b: &Embedding) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.dot(b))
}

/// Cosine distance, `1 - similarity`
pub fn cosine_distance(a: &Embedding, b: &Embedding) -> Option<f32> {
    similarity(a, b).map(|sim| 1.0 - sim)
}

/// Exponential moving average of two unit embeddings:
/// `normalize(weight * incoming + (1 - weight) * previous)`.
///
/// Falls back to `incoming` when the blend cancels out to zero or the
/// dimensions differ, so the result always has unit length.
pub fn blend(incoming: &Embedding, previous: &Embedding, weight: f32) -> Embedding {
    if incoming.len() != previous.len() {
        return incoming.clone();
    }

    let mixed = incoming * weight + previous * (1.0 - weight);
    let norm = mixed.dot(&mixed).sqrt();
    if norm <= f32::EPSILON {
        return incoming.clone();
    }
    mixed / norm
}

/// L2 norm, mostly for diagnostics
pub fn norm(embedding: &Embedding) -> f32 {
    embedding.dot(embedding).sqrt()
}
