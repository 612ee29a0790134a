//! Voxel algebra on volumes that share a grid.
//!
//! Every operation returns a new image; inputs are never modified. Binary
//! operations check that both operands live on the same grid first.

use crate::error::Result;
use crate::nifti::{NiftiImage, VoxelSemantic};
use rayon::prelude::*;

/// Which voxels of a map count as "on".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Any nonzero value.
    NonZero,
    /// Strictly positive values.
    Positive,
}

impl Polarity {
    #[inline]
    fn admits(self, v: f32) -> bool {
        match self {
            Self::NonZero => v != 0.0,
            Self::Positive => v > 0.0,
        }
    }
}

/// Number of nonzero voxels.
#[must_use = "this function returns a count that should be used"]
pub fn total_count(volume: &NiftiImage) -> Result<u64> {
    Ok(volume
        .voxels()?
        .par_iter()
        .filter(|&&v| v != 0.0)
        .count() as u64)
}

/// Voxels of `map` admitted by `polarity` that fall inside the nonzero
/// support of `mask`.
///
/// # Errors
/// [`crate::Error::SpaceMismatch`] if the grids differ.
///
/// # Example
/// ```ignore
/// let active_in_roi = masked_count(&activation, &roi, Polarity::NonZero)?;
/// ```
#[must_use = "this function returns a count that should be used"]
pub fn masked_count(map: &NiftiImage, mask: &NiftiImage, polarity: Polarity) -> Result<u64> {
    map.ensure_same_grid(mask, "masked count")?;
    let values = map.voxels()?;
    let support = mask.voxels()?;
    Ok(values
        .par_iter()
        .zip(support.par_iter())
        .filter(|(&v, &m)| m != 0.0 && polarity.admits(v))
        .count() as u64)
}

/// Keep values `>= cutoff`, zero elsewhere.
#[must_use = "this function returns a new image and does not modify the original"]
pub fn threshold_above(volume: &NiftiImage, cutoff: f32) -> Result<NiftiImage> {
    volume.map_voxels(volume.semantic(), move |v| if v >= cutoff { v } else { 0.0 })
}

/// Keep values `> 0`, zero elsewhere.
#[must_use = "this function returns a new image and does not modify the original"]
pub fn threshold_positive(volume: &NiftiImage) -> Result<NiftiImage> {
    volume.map_voxels(volume.semantic(), |v| if v > 0.0 { v } else { 0.0 })
}

/// Multiply `volume` by the binarised support of `mask`.
#[must_use = "this function returns a new image and does not modify the original"]
pub fn mask_apply(volume: &NiftiImage, mask: &NiftiImage) -> Result<NiftiImage> {
    volume.ensure_same_grid(mask, "mask apply")?;
    let values: Vec<f32> = volume
        .voxels()?
        .par_iter()
        .zip(mask.voxels()?.par_iter())
        .map(|(&v, &m)| if m != 0.0 { v } else { 0.0 })
        .collect();
    volume.derive(values, volume.semantic())
}

/// 1 where nonzero, 0 elsewhere.
#[must_use = "this function returns a new image and does not modify the original"]
pub fn binarize(volume: &NiftiImage) -> Result<NiftiImage> {
    volume.map_voxels(VoxelSemantic::Label, |v| if v != 0.0 { 1.0 } else { 0.0 })
}

/// Binary intersection of the supports of `a` and `b`.
#[must_use = "this function returns a new image and does not modify the original"]
pub fn intersect(a: &NiftiImage, b: &NiftiImage) -> Result<NiftiImage> {
    a.ensure_same_grid(b, "intersect")?;
    let values: Vec<f32> = a
        .voxels()?
        .par_iter()
        .zip(b.voxels()?.par_iter())
        .map(|(&x, &y)| if x != 0.0 && y != 0.0 { 1.0 } else { 0.0 })
        .collect();
    a.derive(values, VoxelSemantic::Label)
}

/// True if every voxel is exactly 0 or 1.
pub fn is_binary(volume: &NiftiImage) -> Result<bool> {
    Ok(volume
        .voxels()?
        .par_iter()
        .all(|&v| v == 0.0 || v == 1.0))
}
