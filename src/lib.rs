//! # roistat
//!
//! ROI overlap quantification for fMRI statistical maps.
//!
//! For each subject the pipeline skull-strips the anatomical volume,
//! resamples a library of template ROIs onto the statistical grid, splits
//! them into hemispheres, and warps every mask into native space. Each task
//! then thresholds its GLM, TFCE and ICA maps and reports activation
//! percentages, ratios, Dice and coverage per ROI, hemisphere and
//! threshold, in both spaces, as one CSV.
//!
//! ## Quick start
//!
//! ```ignore
//! use roistat::{Config, Orchestrator};
//!
//! let config = Config::load(Some("roistat.toml".as_ref()))?;
//! let report = Orchestrator::new(config)?.run_subject("sub-01")?;
//! for outcome in &report.outcomes {
//!     println!("{}: {}", outcome.task, outcome.report.display());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`nifti`]: NIfTI-1 reading and writing (`.nii`, `.nii.gz`)
//! - [`transforms`]: voxel algebra, hemisphere splitting, resampling
//! - [`overlap`]: counts, percentages, Dice and coverage
//! - [`report`]: the per-task row grid and its CSV writer
//! - [`pipeline`]: subject preprocessing and task orchestration

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod logging;
pub mod nifti;
pub mod overlap;
pub mod pipeline;
pub mod report;
pub mod transforms;

pub use config::Config;
pub use error::{Error, Result};
pub use nifti::{NiftiImage, VoxelSemantic};
pub use overlap::{Metric, StatKind, ThresholdSpec};
pub use pipeline::{Orchestrator, SubjectReport, SubjectState, TaskOutcome};
pub use report::OverlapRow;
