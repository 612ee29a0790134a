//! In-memory volumes with their voxel grid and declared value semantics.

use super::header::{DataType, NiftiHeader};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use rayon::prelude::*;

/// Row-major 4×4 voxel→world transform.
pub type Affine = [[f64; 4]; 4];

/// Affine tolerance used by grid comparisons, in millimetres.
pub const GRID_TOLERANCE: f64 = 1e-4;

/// What the voxel values mean, which decides how a volume may be resampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoxelSemantic {
    /// Continuous statistic (Z, t, correlation).
    #[default]
    Continuous,
    /// Probability or corrected significance in [0, 1].
    Probability,
    /// Binary or integer label mask.
    Label,
}

impl VoxelSemantic {
    /// On-disk datatype used when a derived volume of this kind is written.
    pub const fn storage_type(self) -> DataType {
        match self {
            Self::Label => DataType::UInt8,
            Self::Continuous | Self::Probability => DataType::Float32,
        }
    }
}

/// A NIfTI volume decoded to `f32` in Fortran (column-major) order.
#[derive(Debug, Clone)]
pub struct NiftiImage {
    header: NiftiHeader,
    data: ArrayD<f32>,
    semantic: VoxelSemantic,
}

impl NiftiImage {
    /// Build an image from an array and its voxel→world affine.
    ///
    /// Arrays that are not already column-major are copied into that layout.
    ///
    /// # Example
    /// ```ignore
    /// let data = ArrayD::<f32>::zeros(IxDyn(&[91, 109, 91]).f());
    /// let img = NiftiImage::from_array(data, affine);
    /// ```
    pub fn from_array(array: ArrayD<f32>, affine: Affine) -> Self {
        let shape = array.shape().to_vec();
        let mut header = NiftiHeader::default();
        header.ndim = shape.len() as u8;
        header.dim = [1; 7];
        for (slot, &d) in header.dim.iter_mut().zip(shape.iter()) {
            *slot = d as i64;
        }
        header.set_affine(affine);

        Self {
            header,
            data: into_fortran(array),
            semantic: VoxelSemantic::Continuous,
        }
    }

    /// Tag the image with a value semantic, updating its storage datatype.
    #[must_use]
    pub fn with_semantic(mut self, semantic: VoxelSemantic) -> Self {
        self.semantic = semantic;
        self.header.datatype = semantic.storage_type();
        self
    }

    /// Decode raw voxel bytes described by `header`.
    ///
    /// Scaling is folded into the values; the returned header is unscaled.
    pub(crate) fn from_bytes(
        mut header: NiftiHeader,
        bytes: &[u8],
        semantic: VoxelSemantic,
    ) -> Result<Self> {
        let expected = header.data_size();
        if bytes.len() < expected {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "voxel data truncated: got {} bytes, need {}",
                    bytes.len(),
                    expected
                ),
            )));
        }
        let bytes = &bytes[..expected];

        let mut values = if header.is_little_endian() {
            decode::<LittleEndian>(bytes, header.datatype)
        } else {
            decode::<BigEndian>(bytes, header.datatype)
        };

        let slope = if header.scl_slope == 0.0 || !header.scl_slope.is_finite() {
            1.0
        } else {
            header.scl_slope as f32
        };
        let inter = if header.scl_inter.is_finite() {
            header.scl_inter as f32
        } else {
            0.0
        };
        if slope != 1.0 || inter != 0.0 {
            values.par_iter_mut().for_each(|v| *v = v.mul_add(slope, inter));
            header.datatype = DataType::Float32;
        }
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;

        squeeze_trailing(&mut header);
        let data = ArrayD::from_shape_vec(IxDyn(&header.shape()).f(), values).map_err(|e| {
            Error::InvalidDimensions(format!("voxel count does not match header: {e}"))
        })?;
        header.little_endian = true;

        Ok(Self {
            header,
            data,
            semantic,
        })
    }

    /// Create a volume on the same grid as `self` from column-major values.
    pub fn derive(&self, values: Vec<f32>, semantic: VoxelSemantic) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(self.shape()).f(), values).map_err(|e| {
            Error::InvalidDimensions(format!("derived volume does not fit grid: {e}"))
        })?;
        let mut header = self.header.clone();
        header.datatype = semantic.storage_type();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        Ok(Self {
            header,
            data,
            semantic,
        })
    }

    /// Apply `f` to every voxel, producing a new volume on the same grid.
    pub fn map_voxels<F>(&self, semantic: VoxelSemantic, f: F) -> Result<Self>
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let values: Vec<f32> = self.voxels()?.par_iter().map(|&v| f(v)).collect();
        self.derive(values, semantic)
    }

    /// Header (datatype, dims, transforms).
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// Mutable header access.
    pub fn header_mut(&mut self) -> &mut NiftiHeader {
        &mut self.header
    }

    /// Declared voxel semantic.
    pub fn semantic(&self) -> VoxelSemantic {
        self.semantic
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Voxel→world affine.
    pub fn affine(&self) -> Affine {
        self.header.affine()
    }

    /// Voxel spacing in millimetres.
    pub fn spacing(&self) -> [f64; 3] {
        self.header.spacing()
    }

    /// Decoded voxel array.
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Voxels in memory (column-major) order.
    pub fn voxels(&self) -> Result<&[f32]> {
        self.data.as_slice_memory_order().ok_or_else(|| {
            Error::InvalidDimensions("voxel buffer is not contiguous".to_string())
        })
    }

    /// Spatial dimensions of a 3D volume.
    pub fn dims3(&self) -> Result<[usize; 3]> {
        match self.shape() {
            &[x, y, z] => Ok([x, y, z]),
            other => Err(Error::InvalidDimensions(format!(
                "expected a 3D volume, got shape {:?}",
                other
            ))),
        }
    }

    /// True if both volumes share shape and affine (within [`GRID_TOLERANCE`]).
    pub fn same_grid(&self, other: &Self) -> bool {
        self.shape() == other.shape() && affines_close(&self.affine(), &other.affine())
    }

    /// Fail with [`Error::SpaceMismatch`] unless the grids match.
    pub fn ensure_same_grid(&self, other: &Self, operation: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::SpaceMismatch {
                operation,
                detail: format!("shape {:?} vs {:?}", self.shape(), other.shape()),
            });
        }
        if !affines_close(&self.affine(), &other.affine()) {
            return Err(Error::SpaceMismatch {
                operation,
                detail: format!("affine {:?} vs {:?}", self.affine(), other.affine()),
            });
        }
        Ok(())
    }

    /// Encode voxels to the header's datatype, little endian.
    ///
    /// Integer targets are rounded and clamped to the type range.
    pub fn data_to_bytes(&self) -> Result<Vec<u8>> {
        let values = self.voxels()?;
        let dtype = self.header.datatype;
        let mut out = Vec::with_capacity(values.len() * dtype.byte_size());

        macro_rules! encode_int {
            ($t:ty) => {
                for &v in values {
                    let v = if v.is_finite() { v.round() } else { 0.0 };
                    let clamped = (v as f64).clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t;
                    out.extend_from_slice(&clamped.to_le_bytes());
                }
            };
        }

        match dtype {
            DataType::UInt8 => encode_int!(u8),
            DataType::Int8 => encode_int!(i8),
            DataType::Int16 => encode_int!(i16),
            DataType::UInt16 => encode_int!(u16),
            DataType::Int32 => encode_int!(i32),
            DataType::UInt32 => encode_int!(u32),
            DataType::Int64 => encode_int!(i64),
            DataType::UInt64 => encode_int!(u64),
            DataType::Float32 => {
                for &v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            DataType::Float64 => {
                for &v in values {
                    out.extend_from_slice(&f64::from(v).to_le_bytes());
                }
            }
        }
        Ok(out)
    }
}

/// Template→native displacement field on the native grid.
///
/// Component `c` at native voxel `v` is the millimetre offset to add to the
/// world position of `v` along world axis `c`.
#[derive(Debug, Clone)]
pub struct DeformationField {
    image: NiftiImage,
    dims: [usize; 3],
}

impl DeformationField {
    /// Wrap a `[x, y, z, 3]` (or `[x, y, z, 1, 3]`) volume.
    pub fn new(image: NiftiImage) -> Result<Self> {
        let shape = image.shape().to_vec();
        let dims = match shape.as_slice() {
            &[x, y, z, 3] | &[x, y, z, 1, 3] => [x, y, z],
            _ => {
                return Err(Error::Transform {
                    operation: "deformation field",
                    reason: format!("expected 3 displacement components, got shape {:?}", shape),
                })
            }
        };

        let image = if shape.len() == 5 {
            let values = image.voxels()?.to_vec();
            let data = ArrayD::from_shape_vec(IxDyn(&[dims[0], dims[1], dims[2], 3]).f(), values)
                .map_err(|e| Error::InvalidDimensions(format!("deformation reshape: {e}")))?;
            let mut header = image.header.clone();
            header.ndim = 4;
            header.dim = [dims[0] as i64, dims[1] as i64, dims[2] as i64, 3, 1, 1, 1];
            NiftiImage {
                header,
                data,
                semantic: VoxelSemantic::Continuous,
            }
        } else {
            image
        };

        Ok(Self { image, dims })
    }

    /// Native grid dimensions.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Native grid affine.
    pub fn affine(&self) -> Affine {
        self.image.affine()
    }

    /// True if the field is defined on `reference`'s grid.
    pub fn matches_grid(&self, reference: &NiftiImage) -> bool {
        reference.shape() == self.dims && affines_close(&self.affine(), &reference.affine())
    }

    /// Displacement components in column-major order: component `c` of
    /// voxel with linear index `i` lives at `c * n + i`.
    pub fn components(&self) -> Result<&[f32]> {
        self.image.voxels()
    }

    /// Underlying 4D image.
    pub fn image(&self) -> &NiftiImage {
        &self.image
    }
}

pub(crate) fn affines_close(a: &Affine, b: &Affine) -> bool {
    a.iter()
        .flatten()
        .zip(b.iter().flatten())
        .all(|(x, y)| (x - y).abs() <= GRID_TOLERANCE)
}

fn into_fortran(array: ArrayD<f32>) -> ArrayD<f32> {
    if array.t().is_standard_layout() {
        return array;
    }
    let mut out = ArrayD::<f32>::zeros(IxDyn(array.shape()).f());
    out.assign(&array);
    out
}

/// Drop trailing singleton dimensions beyond the third.
fn squeeze_trailing(header: &mut NiftiHeader) {
    while header.ndim > 3 && header.dim[header.ndim as usize - 1] == 1 {
        header.ndim -= 1;
    }
    for i in header.ndim as usize..7 {
        header.dim[i] = 1;
    }
}

fn decode<E: ByteOrder>(bytes: &[u8], dtype: DataType) -> Vec<f32> {
    let size = dtype.byte_size();
    let chunks = bytes.par_chunks_exact(size);
    match dtype {
        DataType::UInt8 => bytes.par_iter().map(|&b| f32::from(b)).collect(),
        DataType::Int8 => bytes.par_iter().map(|&b| f32::from(b as i8)).collect(),
        DataType::Int16 => chunks.map(|c| f32::from(E::read_i16(c))).collect(),
        DataType::UInt16 => chunks.map(|c| f32::from(E::read_u16(c))).collect(),
        DataType::Int32 => chunks.map(|c| E::read_i32(c) as f32).collect(),
        DataType::UInt32 => chunks.map(|c| E::read_u32(c) as f32).collect(),
        DataType::Int64 => chunks.map(|c| E::read_i64(c) as f32).collect(),
        DataType::UInt64 => chunks.map(|c| E::read_u64(c) as f32).collect(),
        DataType::Float32 => chunks.map(E::read_f32).collect(),
        DataType::Float64 => chunks.map(|c| E::read_f64(c) as f32).collect(),
    }
}
