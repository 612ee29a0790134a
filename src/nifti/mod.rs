//! `NIfTI` file format support.
//!
//! Reads `.nii` and `.nii.gz` volumes into column-major `f32` arrays tagged
//! with their voxel semantic, and writes derived volumes back exactly once.

pub(crate) mod header;
pub(crate) mod image;
pub mod io;

pub use header::{DataType, NiftiHeader};
pub use image::{Affine, DeformationField, NiftiImage, VoxelSemantic, GRID_TOLERANCE};
pub use io::{load, load_deformation, load_mask, load_volume, save};
