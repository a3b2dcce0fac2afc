//! Per-frame uniform data.
//!
//! Written directly into each frame slot's persistently-mapped uniform
//! buffer every frame and flushed; bulk data takes the staging path
//! instead.

use bytemuck::{Pod, Zeroable};

/// Uniform block bound at set 0, binding 0.
///
/// Layout matches the shader's std140 block: a column-major 4x4 transform,
/// an RGBA tint, and the elapsed time, padded to a 16-byte multiple.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FrameUniform {
    pub transform: [[f32; 4]; 4],
    pub tint: [f32; 4],
    pub time: f32,
    pub _padding: [f32; 3],
}

impl FrameUniform {
    /// Size in bytes, used to allocate the per-slot uniform buffers.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Identity transform, white tint, time zero.
    pub fn identity() -> Self {
        let mut transform = [[0.0f32; 4]; 4];
        for (i, row) in transform.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            transform,
            tint: [1.0, 1.0, 1.0, 1.0],
            time: 0.0,
            _padding: [0.0; 3],
        }
    }
}

impl Default for FrameUniform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_size_is_std140_friendly() {
        assert_eq!(FrameUniform::SIZE % 16, 0);
        assert_eq!(FrameUniform::SIZE, 96);
    }

    #[test]
    fn test_identity_transform() {
        let uniform = FrameUniform::identity();
        for (i, row) in uniform.transform.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, if i == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_uniform_casts_to_bytes() {
        let uniform = FrameUniform::identity();
        let bytes = bytemuck::bytes_of(&uniform);
        assert_eq!(bytes.len(), FrameUniform::SIZE);
    }
}
