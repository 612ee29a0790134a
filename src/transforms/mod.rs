//! Volume transforms: voxel algebra, hemisphere partitioning, and
//! resampling between grids and coordinate spaces.

pub mod hemisphere;
pub mod resample;
pub mod voxel;

pub use hemisphere::{hemisphere_mask, restrict, split_hemispheres, Hemisphere, HemisphereSplit};
pub use resample::{
    inverse_warp_to_native, load_registration, resample_to_grid, Interpolation, Space,
};
pub use voxel::{
    binarize, intersect, is_binary, mask_apply, masked_count, threshold_above,
    threshold_positive, total_count, Polarity,
};
