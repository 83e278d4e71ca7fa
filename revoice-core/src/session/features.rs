//! Per-frame embedding sequence produced by the embedder.

use crate::error::{Result, RevoiceError};

/// A sequence of per-frame embedding vectors, row-major `[frames][dim]`.
///
/// Opaque beyond its shape: the pipeline only reorders, truncates and
/// blends frames; vector contents come from and go to collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    data: Vec<f32>,
    frames: usize,
    dim: usize,
}

impl FeatureTensor {
    pub fn new(data: Vec<f32>, frames: usize, dim: usize) -> Result<Self> {
        if data.len() != frames * dim {
            return Err(RevoiceError::Processing(format!(
                "feature tensor shape mismatch: {} values for {}x{}",
                data.len(),
                frames,
                dim
            )));
        }
        Ok(Self { data, frames, dim })
    }

    /// An all-zero tensor.
    pub fn zeros(frames: usize, dim: usize) -> Self {
        Self {
            data: vec![0.0; frames * dim],
            frames,
            dim,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, frame: usize) -> &[f32] {
        &self.data[frame * self.dim..(frame + 1) * self.dim]
    }

    pub fn row_mut(&mut self, frame: usize) -> &mut [f32] {
        &mut self.data[frame * self.dim..(frame + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Upsample 2× along the frame axis by nearest-neighbour duplication,
    /// matching the generator's expected frame rate.
    pub fn upsampled_2x(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len() * 2);
        for frame in 0..self.frames {
            let row = self.row(frame);
            data.extend_from_slice(row);
            data.extend_from_slice(row);
        }
        Self {
            data,
            frames: self.frames * 2,
            dim: self.dim,
        }
    }

    /// Keep at most the first `frames` rows.
    pub fn truncate_frames(&mut self, frames: usize) {
        if frames < self.frames {
            self.data.truncate(frames * self.dim);
            self.frames = frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_is_rejected() {
        assert!(FeatureTensor::new(vec![0.0; 10], 3, 4).is_err());
        assert!(FeatureTensor::new(vec![0.0; 12], 3, 4).is_ok());
    }

    #[test]
    fn upsample_duplicates_each_frame() {
        let t = FeatureTensor::new(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let up = t.upsampled_2x();
        assert_eq!(up.frames(), 4);
        assert_eq!(up.row(0), &[1.0, 2.0]);
        assert_eq!(up.row(1), &[1.0, 2.0]);
        assert_eq!(up.row(2), &[3.0, 4.0]);
        assert_eq!(up.row(3), &[3.0, 4.0]);
    }

    #[test]
    fn truncate_shrinks_only() {
        let mut t = FeatureTensor::zeros(5, 3);
        t.truncate_frames(8);
        assert_eq!(t.frames(), 5);
        t.truncate_frames(2);
        assert_eq!(t.frames(), 2);
        assert_eq!(t.as_slice().len(), 6);
    }
}
