//! Left/right partitioning of volumes at the grid midline.

use crate::error::{Error, Result};
use crate::nifti::{NiftiImage, VoxelSemantic};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Hemisphere partition of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hemisphere {
    /// Both hemispheres, no restriction.
    Whole,
    /// Lower index half along the left-right axis.
    Left,
    /// Upper index half along the left-right axis.
    Right,
}

impl Hemisphere {
    /// Report order.
    pub const ALL: [Self; 3] = [Self::Whole, Self::Left, Self::Right];

    /// Suffix appended to ROI labels and file stems.
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Whole => "",
            Self::Left => "_L",
            Self::Right => "_R",
        }
    }
}

/// Where the grid is cut.
///
/// Left keeps `[first_index, width / 2)` along `axis`, right keeps
/// `[width / 2, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HemisphereSplit {
    /// Voxel axis running left to right (0, 1 or 2).
    pub axis: usize,
    /// First index included in the left half.
    pub first_index: usize,
}

impl Default for HemisphereSplit {
    fn default() -> Self {
        Self {
            axis: 0,
            first_index: 1,
        }
    }
}

impl HemisphereSplit {
    /// Index ranges `(left, right)` for a grid of `width` voxels along the axis.
    pub fn bounds(&self, width: usize) -> Result<(Range<usize>, Range<usize>)> {
        if self.axis >= 3 {
            return Err(Error::Configuration(format!(
                "hemisphere axis must be 0, 1 or 2, got {}",
                self.axis
            )));
        }
        let midline = width / 2;
        if self.first_index >= midline {
            return Err(Error::Configuration(format!(
                "hemisphere first_index {} is not below the midline {} (width {})",
                self.first_index, midline, width
            )));
        }
        Ok((self.first_index..midline, midline..width))
    }

    fn range_for(&self, dims: [usize; 3], side: Hemisphere) -> Result<Range<usize>> {
        let width = dims.get(self.axis).copied().unwrap_or(0);
        let (left, right) = self.bounds(width)?;
        Ok(match side {
            Hemisphere::Whole => 0..width,
            Hemisphere::Left => left,
            Hemisphere::Right => right,
        })
    }
}

#[inline]
fn axis_coord(index: usize, dims: [usize; 3], axis: usize) -> usize {
    match axis {
        0 => index % dims[0],
        1 => (index / dims[0]) % dims[1],
        _ => index / (dims[0] * dims[1]),
    }
}

/// Zero every voxel of `volume` outside `side`.
pub fn restrict(volume: &NiftiImage, split: &HemisphereSplit, side: Hemisphere) -> Result<NiftiImage> {
    let dims = volume.dims3()?;
    let keep = split.range_for(dims, side)?;
    let axis = split.axis;
    let values: Vec<f32> = volume
        .voxels()?
        .par_iter()
        .enumerate()
        .map(|(i, &v)| {
            if keep.contains(&axis_coord(i, dims, axis)) {
                v
            } else {
                0.0
            }
        })
        .collect();
    volume.derive(values, volume.semantic())
}

/// Split `volume` into `(left, right)` halves on the input grid.
///
/// # Example
/// ```ignore
/// let (left, right) = split_hemispheres(&roi, &HemisphereSplit::default())?;
/// ```
pub fn split_hemispheres(
    volume: &NiftiImage,
    split: &HemisphereSplit,
) -> Result<(NiftiImage, NiftiImage)> {
    Ok((
        restrict(volume, split, Hemisphere::Left)?,
        restrict(volume, split, Hemisphere::Right)?,
    ))
}

/// Binary mask of `side` on `reference`'s grid; `Whole` is all ones.
pub fn hemisphere_mask(
    reference: &NiftiImage,
    split: &HemisphereSplit,
    side: Hemisphere,
) -> Result<NiftiImage> {
    let dims = reference.dims3()?;
    let keep = split.range_for(dims, side)?;
    let axis = split.axis;
    let n = dims.iter().product::<usize>();
    let values: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| {
            if keep.contains(&axis_coord(i, dims, axis)) {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    reference.derive(values, VoxelSemantic::Label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::voxel::total_count;
    use ndarray::{ArrayD, IxDyn, ShapeBuilder};

    fn ones(dims: [usize; 3]) -> NiftiImage {
        let data = ArrayD::from_elem(IxDyn(&dims).f(), 1.0f32);
        NiftiImage::from_array(
            data,
            [
                [2.0, 0.0, 0.0, 0.0],
                [0.0, 2.0, 0.0, 0.0],
                [0.0, 0.0, 2.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        )
        .with_semantic(VoxelSemantic::Label)
    }

    #[test]
    fn test_ninety_wide_grid_bounds() {
        let (left, right) = HemisphereSplit::default().bounds(90).unwrap();
        assert_eq!(left, 1..45);
        assert_eq!(right, 45..90);
    }

    #[test]
    fn test_split_partitions_declared_width() {
        let vol = ones([90, 4, 3]);
        let (left, right) = split_hemispheres(&vol, &HemisphereSplit::default()).unwrap();
        let plane = 4 * 3;
        assert_eq!(total_count(&left).unwrap(), 44 * plane);
        assert_eq!(total_count(&right).unwrap(), 45 * plane);

        let l = left.voxels().unwrap();
        let r = right.voxels().unwrap();
        assert!(l.iter().zip(r).all(|(a, b)| *a == 0.0 || *b == 0.0));
        assert_eq!(left.data()[[0, 0, 0]], 0.0);
        assert_eq!(left.data()[[44, 2, 1]], 1.0);
        assert_eq!(right.data()[[45, 0, 0]], 1.0);
        assert!(left.same_grid(&vol));
    }

    #[test]
    fn test_split_is_idempotent() {
        let vol = ones([10, 3, 3]);
        let split = HemisphereSplit::default();
        let (left, _) = split_hemispheres(&vol, &split).unwrap();
        let (left_again, right_of_left) = split_hemispheres(&left, &split).unwrap();
        assert_eq!(left_again.voxels().unwrap(), left.voxels().unwrap());
        assert_eq!(total_count(&right_of_left).unwrap(), 0);
    }

    #[test]
    fn test_other_axis() {
        let vol = ones([3, 8, 2]);
        let split = HemisphereSplit {
            axis: 1,
            first_index: 0,
        };
        let mask = hemisphere_mask(&vol, &split, Hemisphere::Right).unwrap();
        assert_eq!(total_count(&mask).unwrap(), 3 * 4 * 2);
        assert_eq!(mask.data()[[0, 4, 0]], 1.0);
        assert_eq!(mask.data()[[0, 3, 0]], 0.0);
        let whole = hemisphere_mask(&vol, &split, Hemisphere::Whole).unwrap();
        assert_eq!(total_count(&whole).unwrap(), 48);
    }

    #[test]
    fn test_invalid_split_rejected() {
        let vol = ones([4, 4, 4]);
        let bad_axis = HemisphereSplit {
            axis: 3,
            first_index: 0,
        };
        assert!(matches!(
            split_hemispheres(&vol, &bad_axis),
            Err(Error::Configuration(_))
        ));
        let past_midline = HemisphereSplit {
            axis: 0,
            first_index: 2,
        };
        assert!(matches!(
            hemisphere_mask(&vol, &past_midline, Hemisphere::Left),
            Err(Error::Configuration(_))
        ));
    }
}
