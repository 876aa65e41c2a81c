//! Fixed-size stereo sample blocks, the unit of render-path work.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Frames per chunk.
pub const CHUNK_SIZE: usize = 1024;

/// A block of [`CHUNK_SIZE`] interleaved stereo frames.
///
/// Silence is all-zero. NaN and infinities are carried like any other value.
#[derive(Clone, PartialEq)]
pub struct Chunk {
    frames: Vec<[f32; 2]>,
}

impl Chunk {
    /// A silent chunk.
    pub fn new() -> Self {
        Self {
            frames: vec![[0.0; 2]; CHUNK_SIZE],
        }
    }

    /// Number of frames (always [`CHUNK_SIZE`]).
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false; present for API symmetry with slices.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Zero every frame.
    pub fn silence(&mut self) {
        self.fill(0.0, 0.0);
    }

    /// Set every frame to the same pair.
    pub fn fill(&mut self, left: f32, right: f32) {
        for frame in &mut self.frames {
            *frame = [left, right];
        }
    }

    /// True if every sample is exactly zero.
    pub fn is_silent(&self) -> bool {
        self.frames.iter().all(|f| f[0] == 0.0 && f[1] == 0.0)
    }

    /// The frames as `[left, right]` pairs.
    #[inline]
    pub fn frames(&self) -> &[[f32; 2]] {
        &self.frames
    }

    /// Mutable frames.
    #[inline]
    pub fn frames_mut(&mut self) -> &mut [[f32; 2]] {
        &mut self.frames
    }

    /// Interleaved view: `l0, r0, l1, r1, ...`.
    pub fn as_interleaved(&self) -> &[f32] {
        self.frames.as_flattened()
    }

    /// Overwrite with another chunk's contents.
    pub fn copy_from(&mut self, other: &Chunk) {
        self.frames.copy_from_slice(&other.frames);
    }

    /// Add another chunk into this one.
    pub fn mix_from(&mut self, other: &Chunk) {
        for (dst, src) in self.frames.iter_mut().zip(&other.frames) {
            dst[0] += src[0];
            dst[1] += src[1];
        }
    }

    /// Multiply every sample by `gain`.
    pub fn scale(&mut self, gain: f32) {
        for frame in &mut self.frames {
            frame[0] *= gain;
            frame[1] *= gain;
        }
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peak = self
            .frames
            .iter()
            .flat_map(|fr| fr.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        f.debug_struct("Chunk")
            .field("frames", &self.frames.len())
            .field("peak", &peak)
            .finish()
    }
}

impl Index<usize> for Chunk {
    type Output = [f32; 2];

    fn index(&self, index: usize) -> &Self::Output {
        &self.frames[index]
    }
}

impl IndexMut<usize> for Chunk {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.frames[index]
    }
}
