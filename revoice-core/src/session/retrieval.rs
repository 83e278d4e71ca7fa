//! Retrieval blending against a materialized reference-vector set.
//!
//! The index file is parsed by the backend; once loaded, the full
//! vector set lives in memory and blending is a linear nearest-neighbour
//! scan per frame. This sharpens timbre similarity to the target
//! speaker without touching unvoiced structure.

use crate::error::{Result, RevoiceError};
use crate::session::features::FeatureTensor;

/// Materialized reference vectors from a retrieval index.
#[derive(Debug, Clone)]
pub struct IndexData {
    /// Row-major `[count][dim]` reference vectors.
    pub vectors: Vec<f32>,
    pub count: usize,
    pub dim: usize,
}

impl IndexData {
    pub fn new(vectors: Vec<f32>, count: usize, dim: usize) -> Result<Self> {
        if vectors.len() != count * dim || dim == 0 {
            return Err(RevoiceError::ResourceLoad(format!(
                "index shape mismatch: {} values for {}x{}",
                vectors.len(),
                count,
                dim
            )));
        }
        Ok(Self {
            vectors,
            count,
            dim,
        })
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }
}

/// Mix each frame of `features` toward its nearest reference vector.
///
/// `blend_rate` ∈ [0, 1]: 0 returns the input unchanged, 1 replaces each
/// frame with its neighbour. Dimension mismatch is a processing error
/// (the caller converts it into a silence block).
pub fn nearest_neighbor_blend(
    features: &FeatureTensor,
    index: &IndexData,
    blend_rate: f32,
) -> Result<FeatureTensor> {
    if features.dim() != index.dim {
        return Err(RevoiceError::Processing(format!(
            "retrieval dim mismatch: features {} vs index {}",
            features.dim(),
            index.dim
        )));
    }
    if index.count == 0 || blend_rate <= 0.0 {
        return Ok(features.clone());
    }

    let rate = blend_rate.min(1.0);
    let mut out = features.clone();

    for frame in 0..features.frames() {
        let query = features.row(frame);

        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for i in 0..index.count {
            let dist: f32 = index
                .row(i)
                .iter()
                .zip(query)
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }

        let neighbor = index.row(best);
        for (o, (&q, &n)) in out.row_mut(frame).iter_mut().zip(query.iter().zip(neighbor)) {
            *o = q * (1.0 - rate) + n * rate;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_two_vectors() -> IndexData {
        // Two reference vectors: (0,0) and (10,10).
        IndexData::new(vec![0.0, 0.0, 10.0, 10.0], 2, 2).unwrap()
    }

    #[test]
    fn zero_rate_is_identity() {
        let feats = FeatureTensor::new(vec![1.0, 1.0], 1, 2).unwrap();
        let out = nearest_neighbor_blend(&feats, &index_two_vectors(), 0.0).unwrap();
        assert_eq!(out, feats);
    }

    #[test]
    fn full_rate_replaces_with_nearest() {
        let feats = FeatureTensor::new(vec![9.0, 9.0], 1, 2).unwrap();
        let out = nearest_neighbor_blend(&feats, &index_two_vectors(), 1.0).unwrap();
        assert_eq!(out.row(0), &[10.0, 10.0]);
    }

    #[test]
    fn half_rate_mixes_linearly() {
        let feats = FeatureTensor::new(vec![1.0, 1.0], 1, 2).unwrap();
        let out = nearest_neighbor_blend(&feats, &index_two_vectors(), 0.5).unwrap();
        // Nearest to (1,1) is (0,0) → midpoint (0.5, 0.5).
        assert_eq!(out.row(0), &[0.5, 0.5]);
    }

    #[test]
    fn dim_mismatch_is_processing_error() {
        let feats = FeatureTensor::new(vec![1.0, 2.0, 3.0], 1, 3).unwrap();
        assert!(matches!(
            nearest_neighbor_blend(&feats, &index_two_vectors(), 0.5),
            Err(RevoiceError::Processing(_))
        ));
    }
}
