//! Moving volumes between voxel grids and coordinate spaces.
//!
//! Both transforms are pull-based: every output voxel is mapped back into
//! the source volume's voxel coordinates and sampled there. Samples that
//! fall outside the source grid take the fill value 0.

use crate::error::{Error, Result};
use crate::nifti::{Affine, DeformationField, NiftiImage, VoxelSemantic};
use rayon::prelude::*;
use std::path::Path;

/// Interpolation method for resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Nearest neighbour. Preserves label values.
    Nearest,
    /// Trilinear.
    Trilinear,
}

impl Interpolation {
    /// Nearest for labels, trilinear for continuous and probability maps.
    pub const fn for_semantic(semantic: VoxelSemantic) -> Self {
        match semantic {
            VoxelSemantic::Label => Self::Nearest,
            VoxelSemantic::Continuous | VoxelSemantic::Probability => Self::Trilinear,
        }
    }

    fn check(self, source: &NiftiImage, operation: &'static str) -> Result<()> {
        if self == Self::Trilinear && source.semantic() == VoxelSemantic::Label {
            return Err(Error::Transform {
                operation,
                reason: "trilinear interpolation would blur label boundaries; use nearest"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Coordinate space a volume lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Shared template space of the statistical maps.
    Template,
    /// The subject's own anatomical space.
    Native,
}

impl Space {
    /// Report order.
    pub const ALL: [Self; 2] = [Self::Template, Self::Native];

    /// Label written to reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Template => "Template",
            Self::Native => "Native",
        }
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Affine helpers
// ============================================================================

/// 4×4 identity.
pub const IDENTITY: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Matrix product `a · b`.
pub fn compose(a: &Affine, b: &Affine) -> Affine {
    let mut out = [[0.0; 4]; 4];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = (0..4).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}

/// Apply an affine to a point.
#[inline]
pub fn apply(m: &Affine, p: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + m[0][3],
        m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + m[1][3],
        m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + m[2][3],
    ]
}

/// Invert an affine (linear block plus translation).
pub fn invert(m: &Affine) -> Result<Affine> {
    let [a, b, c] = [m[0][0], m[0][1], m[0][2]];
    let [d, e, f] = [m[1][0], m[1][1], m[1][2]];
    let [g, h, i] = [m[2][0], m[2][1], m[2][2]];

    let det = a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g);
    if det.abs() < 1e-12 || !det.is_finite() {
        return Err(Error::Transform {
            operation: "affine inversion",
            reason: format!("singular matrix (determinant {det})"),
        });
    }
    let inv_det = 1.0 / det;
    let lin = [
        [
            (e * i - f * h) * inv_det,
            (c * h - b * i) * inv_det,
            (b * f - c * e) * inv_det,
        ],
        [
            (f * g - d * i) * inv_det,
            (a * i - c * g) * inv_det,
            (c * d - a * f) * inv_det,
        ],
        [
            (d * h - e * g) * inv_det,
            (b * g - a * h) * inv_det,
            (a * e - b * d) * inv_det,
        ],
    ];
    let t = [m[0][3], m[1][3], m[2][3]];
    let mut out = IDENTITY;
    for r in 0..3 {
        out[r][..3].copy_from_slice(&lin[r]);
        out[r][3] = -(lin[r][0] * t[0] + lin[r][1] * t[1] + lin[r][2] * t[2]);
    }
    Ok(out)
}

/// Read a world→world registration from a whitespace-separated 4×4 text matrix.
pub fn load_registration<P: AsRef<Path>>(path: P) -> Result<Affine> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::not_found(path, "registration matrix"));
    }
    let text = std::fs::read_to_string(path)?;
    let values = text
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
    if values.len() != 16 {
        return Err(Error::Configuration(format!(
            "{}: expected 16 matrix values, found {}",
            path.display(),
            values.len()
        )));
    }
    let mut m = [[0.0; 4]; 4];
    for (r, row) in m.iter_mut().enumerate() {
        row.copy_from_slice(&values[r * 4..r * 4 + 4]);
    }
    if m[3] != [0.0, 0.0, 0.0, 1.0] {
        return Err(Error::Configuration(format!(
            "{}: last row must be 0 0 0 1",
            path.display()
        )));
    }
    Ok(m)
}

// ============================================================================
// Sampling
// ============================================================================

/// Column-major 3D sampler with zero fill outside the grid.
struct Sampler<'a> {
    values: &'a [f32],
    dims: [usize; 3],
}

impl Sampler<'_> {
    #[inline]
    fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.values[x + self.dims[0] * (y + self.dims[1] * z)]
    }

    #[inline]
    fn nearest(&self, p: [f64; 3]) -> f32 {
        let mut idx = [0usize; 3];
        for axis in 0..3 {
            let r = p[axis].round();
            if r < 0.0 || r >= self.dims[axis] as f64 || !r.is_finite() {
                return 0.0;
            }
            idx[axis] = r as usize;
        }
        self.at(idx[0], idx[1], idx[2])
    }

    #[inline]
    fn trilinear(&self, p: [f64; 3]) -> f32 {
        const EDGE: f64 = 1e-6;
        let mut lo = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let upper = (self.dims[axis] - 1) as f64;
            let c = p[axis];
            if !c.is_finite() || c < -EDGE || c > upper + EDGE {
                return 0.0;
            }
            let c = c.clamp(0.0, upper);
            let base = c.floor().min((upper - 1.0).max(0.0));
            lo[axis] = base as usize;
            frac[axis] = c - base;
        }

        let hi = |axis: usize| (lo[axis] + 1).min(self.dims[axis] - 1);
        let [fx, fy, fz] = frac;
        let mut acc = 0.0f64;
        for (dz, wz) in [(lo[2], 1.0 - fz), (hi(2), fz)] {
            if wz == 0.0 {
                continue;
            }
            for (dy, wy) in [(lo[1], 1.0 - fy), (hi(1), fy)] {
                if wy == 0.0 {
                    continue;
                }
                for (dx, wx) in [(lo[0], 1.0 - fx), (hi(0), fx)] {
                    if wx == 0.0 {
                        continue;
                    }
                    acc += f64::from(self.at(dx, dy, dz)) * wx * wy * wz;
                }
            }
        }
        acc as f32
    }

    #[inline]
    fn sample(&self, p: [f64; 3], interpolation: Interpolation) -> f32 {
        match interpolation {
            Interpolation::Nearest => self.nearest(p),
            Interpolation::Trilinear => self.trilinear(p),
        }
    }
}

#[inline]
fn voxel_of(index: usize, dims: [usize; 3]) -> [f64; 3] {
    let x = index % dims[0];
    let y = (index / dims[0]) % dims[1];
    let z = index / (dims[0] * dims[1]);
    [x as f64, y as f64, z as f64]
}

/// Resample `source` onto `reference`'s voxel grid.
///
/// `registration` maps source world coordinates to reference world
/// coordinates; `None` means both already share a world frame.
///
/// # Example
/// ```ignore
/// let roi_on_stats = resample_to_grid(&roi, &zstat, None, Interpolation::Nearest)?;
/// ```
#[must_use = "this function returns a new image and does not modify the original"]
pub fn resample_to_grid(
    source: &NiftiImage,
    reference: &NiftiImage,
    registration: Option<&Affine>,
    interpolation: Interpolation,
) -> Result<NiftiImage> {
    interpolation.check(source, "resample to grid")?;
    let src_dims = source.dims3()?;
    let out_dims = reference.dims3()?;

    let registration_inv = match registration {
        Some(m) => invert(m)?,
        None => IDENTITY,
    };
    // reference voxel -> reference world -> source world -> source voxel
    let pull = compose(
        &invert(&source.affine())?,
        &compose(&registration_inv, &reference.affine()),
    );

    let sampler = Sampler {
        values: source.voxels()?,
        dims: src_dims,
    };
    let n = out_dims.iter().product::<usize>();
    let values: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| sampler.sample(apply(&pull, voxel_of(i, out_dims)), interpolation))
        .collect();

    reference.derive(values, source.semantic())
}

/// Carry `source` from template space into native space.
///
/// For each native voxel `v` the template world position is
/// `native_affine · v + d(v)`; `source` is sampled there.
///
/// # Errors
/// [`Error::Transform`] if the field is not defined on `native_reference`'s
/// grid or the interpolation is inapplicable to the source semantic.
#[must_use = "this function returns a new image and does not modify the original"]
pub fn inverse_warp_to_native(
    source: &NiftiImage,
    native_reference: &NiftiImage,
    field: &DeformationField,
    interpolation: Interpolation,
) -> Result<NiftiImage> {
    const OPERATION: &str = "inverse warp to native";
    interpolation.check(source, OPERATION)?;
    if !field.matches_grid(native_reference) {
        return Err(Error::Transform {
            operation: OPERATION,
            reason: format!(
                "deformation field grid {:?} does not match native reference {:?}",
                field.dims(),
                native_reference.shape()
            ),
        });
    }

    let out_dims = native_reference.dims3()?;
    let native_affine = native_reference.affine();
    let to_source = invert(&source.affine())?;
    let displacement = field.components()?;
    let n = out_dims.iter().product::<usize>();

    let sampler = Sampler {
        values: source.voxels()?,
        dims: source.dims3()?,
    };
    let values: Vec<f32> = (0..n)
        .into_par_iter()
        .map(|i| {
            let world = apply(&native_affine, voxel_of(i, out_dims));
            let warped = [
                world[0] + f64::from(displacement[i]),
                world[1] + f64::from(displacement[n + i]),
                world[2] + f64::from(displacement[2 * n + i]),
            ];
            sampler.sample(apply(&to_source, warped), interpolation)
        })
        .collect();

    native_reference.derive(values, source.semantic())
}
