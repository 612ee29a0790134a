//! Subject preprocessing: skull-strip, ROI resampling and hemisphere
//! split, and inverse warp of every mask variant into native space.

use super::checkpoint;
use super::context::SubjectContext;
use crate::error::{Error, Result};
use crate::nifti::{self, DeformationField, NiftiImage, VoxelSemantic};
use crate::report::{HemisphereMasks, RoiMasks};
use crate::transforms::{
    binarize, hemisphere_mask, inverse_warp_to_native, load_registration, mask_apply,
    resample_to_grid, split_hemispheres, Hemisphere, HemisphereSplit, Interpolation, Space,
};
use std::path::Path;
use tracing::{debug, info, info_span};

/// Load `path` if it exists, otherwise build it and write it once.
pub(crate) fn cached<F>(path: &Path, semantic: VoxelSemantic, build: F) -> Result<NiftiImage>
where
    F: FnOnce() -> Result<NiftiImage>,
{
    if path.is_file() {
        debug!(path = %path.display(), "reusing cached volume");
        return nifti::load_volume(path, semantic);
    }
    let image = build()?.with_semantic(semantic);
    nifti::save(&image, path)?;
    Ok(image)
}

/// Native and template masks shared read-only by every task of a subject.
#[derive(Debug)]
pub struct PreprocessedSubject {
    /// Skull-stripped anatomical; defines the native grid.
    pub brain: NiftiImage,
    /// Brain mask on the native grid.
    pub brain_mask: NiftiImage,
    pub field: DeformationField,
    template_rois: Vec<RoiMasks>,
    native_rois: Vec<RoiMasks>,
    template_halves: HemisphereMasks,
    native_halves: HemisphereMasks,
}

impl PreprocessedSubject {
    /// ROI masks for `labels` in `space`, in the given order.
    pub fn rois(&self, space: Space, labels: &[String]) -> Result<Vec<RoiMasks>> {
        let library = match space {
            Space::Template => &self.template_rois,
            Space::Native => &self.native_rois,
        };
        labels
            .iter()
            .map(|label| {
                library
                    .iter()
                    .find(|r| &r.label == label)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Configuration(format!("ROI '{}' was not preprocessed", label))
                    })
            })
            .collect()
    }

    /// Hemisphere half-masks in `space`.
    pub fn halves(&self, space: Space) -> &HemisphereMasks {
        match space {
            Space::Template => &self.template_halves,
            Space::Native => &self.native_halves,
        }
    }
}

fn require(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::not_found(path, what))
    }
}

/// Inputs of the inverse warp: missing ones make the warp impossible.
fn require_warp_input(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Transform {
            operation: "inverse warp to native",
            reason: format!("{} not found: {}", what, path.display()),
        })
    }
}

/// Run the preprocessing stage for one subject.
///
/// `stat_reference` is a statistical map whose grid the template ROIs are
/// resampled onto.
///
/// # Errors
/// A missing anatomical volume (the native reference) or deformation field
/// is [`Error::Transform`]; a missing brain mask is [`Error::Io`]. Any
/// expected output missing at the end of the stage is fatal too.
pub fn preprocess_subject(
    ctx: &SubjectContext,
    stat_reference: &NiftiImage,
    split: &HemisphereSplit,
) -> Result<PreprocessedSubject> {
    let span = info_span!("preprocess", subject = %ctx.subject);
    let _enter = span.enter();

    require_warp_input(&ctx.anatomical, "native reference")?;
    require(&ctx.brain_mask, "brain mask")?;
    require_warp_input(&ctx.warp, "deformation field")?;

    let brain_mask = binarize(&nifti::load_mask(&ctx.brain_mask)?)?;
    let brain = cached(&ctx.brain, VoxelSemantic::Continuous, || {
        info!("skull-stripping anatomical volume");
        let anatomical = nifti::load_volume(&ctx.anatomical, VoxelSemantic::Continuous)?;
        mask_apply(&anatomical, &brain_mask)
    })?;
    let field = nifti::load_deformation(&ctx.warp)?;
    if !field.matches_grid(&brain) {
        return Err(Error::Transform {
            operation: "preprocess",
            reason: format!(
                "deformation field grid {:?} does not match the native brain {:?}",
                field.dims(),
                brain.shape()
            ),
        });
    }

    let registration = ctx
        .registration
        .as_deref()
        .map(load_registration)
        .transpose()?;

    let to_native = |image: &NiftiImage| {
        inverse_warp_to_native(image, &brain, &field, Interpolation::Nearest)
    };

    let mut template_rois = Vec::with_capacity(ctx.library.len());
    let mut native_rois = Vec::with_capacity(ctx.library.len());
    for (roi, source_path) in &ctx.library {
        let label = roi.label.as_str();
        info!(roi = label, "preparing ROI variants");

        let whole = cached(
            &ctx.roi_path(Space::Template, label, Hemisphere::Whole),
            VoxelSemantic::Label,
            || {
                require(source_path, "ROI template")?;
                let source = nifti::load_mask(source_path)?;
                resample_to_grid(&source, stat_reference, registration.as_ref(), Interpolation::Nearest)
            },
        )?;

        let left = cached(
            &ctx.roi_path(Space::Template, label, Hemisphere::Left),
            VoxelSemantic::Label,
            || split_hemispheres(&whole, split).map(|(left, _)| left),
        )?;
        let right = cached(
            &ctx.roi_path(Space::Template, label, Hemisphere::Right),
            VoxelSemantic::Label,
            || split_hemispheres(&whole, split).map(|(_, right)| right),
        )?;
        let template = RoiMasks {
            label: label.to_string(),
            whole,
            left,
            right,
        };

        let native = RoiMasks {
            label: label.to_string(),
            whole: cached(
                &ctx.roi_path(Space::Native, label, Hemisphere::Whole),
                VoxelSemantic::Label,
                || to_native(&template.whole),
            )?,
            left: cached(
                &ctx.roi_path(Space::Native, label, Hemisphere::Left),
                VoxelSemantic::Label,
                || to_native(&template.left),
            )?,
            right: cached(
                &ctx.roi_path(Space::Native, label, Hemisphere::Right),
                VoxelSemantic::Label,
                || to_native(&template.right),
            )?,
        };

        template_rois.push(template);
        native_rois.push(native);
    }

    let half = |side: Hemisphere| {
        cached(&ctx.hemisphere_path(Space::Template, side), VoxelSemantic::Label, || {
            hemisphere_mask(stat_reference, split, side)
        })
    };
    let template_halves = HemisphereMasks {
        left: half(Hemisphere::Left)?,
        right: half(Hemisphere::Right)?,
    };
    let native_half = |side: Hemisphere, template: &NiftiImage| {
        cached(&ctx.hemisphere_path(Space::Native, side), VoxelSemantic::Label, || {
            to_native(template)
        })
    };
    let native_halves = HemisphereMasks {
        left: native_half(Hemisphere::Left, &template_halves.left)?,
        right: native_half(Hemisphere::Right, &template_halves.right)?,
    };

    checkpoint("preprocess", &ctx.preprocess_outputs())?;

    Ok(PreprocessedSubject {
        brain,
        brain_mask,
        field,
        template_rois,
        native_rois,
        template_halves,
        native_halves,
    })
}
