//! Report grid: one overlap row per space × ROI variant × threshold, and
//! CSV serialisation of the rows.

use crate::error::{Error, Result};
use crate::nifti::NiftiImage;
use crate::overlap::{ComparisonCounts, Metric, OverlapCounts, StatKind, StatSource, ThresholdSpec};
use crate::transforms::voxel::{binarize, intersect, masked_count, threshold_positive, total_count, Polarity};
use crate::transforms::{Hemisphere, Space};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, warn};

/// CSV column order.
pub const HEADERS: [&str; 19] = [
    "Subject",
    "Task",
    "Space",
    "ROI",
    "Threshold",
    "Stat Type",
    "Activated-Voxels-WholeBrain",
    "Activated-Voxels-ROI",
    "Activated-%-WholeBrain",
    "Activated-%-ROI",
    "%ROI-in-%WholeBrain",
    "Activation-Ratio",
    "ROI-Voxel-Count",
    "WholeBrain-Voxel-Count",
    "Dice",
    "Coverage-T(%)",
    "Coverage-Z(%)",
    "Coverage-T-ROI(%)",
    "Coverage-Z-ROI(%)",
];

/// One row of the overlap report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlapRow {
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Task")]
    pub task: String,
    #[serde(rename = "Space")]
    pub space: &'static str,
    #[serde(rename = "ROI")]
    pub roi: String,
    #[serde(rename = "Threshold")]
    pub threshold: String,
    #[serde(rename = "Stat Type")]
    pub stat_type: &'static str,
    #[serde(rename = "Activated-Voxels-WholeBrain")]
    pub active_whole: u64,
    #[serde(rename = "Activated-Voxels-ROI")]
    pub active_roi: u64,
    #[serde(rename = "Activated-%-WholeBrain")]
    pub pct_whole: Metric,
    #[serde(rename = "Activated-%-ROI")]
    pub pct_roi: Metric,
    #[serde(rename = "%ROI-in-%WholeBrain")]
    pub pct_roi_in_whole: Metric,
    #[serde(rename = "Activation-Ratio")]
    pub ratio: Metric,
    #[serde(rename = "ROI-Voxel-Count")]
    pub roi_count: u64,
    #[serde(rename = "WholeBrain-Voxel-Count")]
    pub whole_count: u64,
    #[serde(rename = "Dice")]
    pub dice: Metric,
    #[serde(rename = "Coverage-T(%)")]
    pub coverage_t: Metric,
    #[serde(rename = "Coverage-Z(%)")]
    pub coverage_z: Metric,
    #[serde(rename = "Coverage-T-ROI(%)")]
    pub coverage_t_roi: Metric,
    #[serde(rename = "Coverage-Z-ROI(%)")]
    pub coverage_z_roi: Metric,
}

// ============================================================================
// Grid inputs
// ============================================================================

/// The six statistical maps of one task, all on one grid.
#[derive(Debug, Clone)]
pub struct StatVolumes {
    pub zstat: NiftiImage,
    pub thresh_zstat: NiftiImage,
    pub corrp: NiftiImage,
    pub tstat: NiftiImage,
    pub ica: NiftiImage,
    pub ica_thresh: NiftiImage,
}

impl StatVolumes {
    /// Map for `source`.
    pub fn get(&self, source: StatSource) -> &NiftiImage {
        match source {
            StatSource::Zstat => &self.zstat,
            StatSource::ThreshZstat => &self.thresh_zstat,
            StatSource::Corrp => &self.corrp,
            StatSource::Tstat => &self.tstat,
            StatSource::Ica => &self.ica,
            StatSource::IcaThresh => &self.ica_thresh,
        }
    }

    /// Build from a loader called once per source in [`StatSource::ALL`] order.
    pub fn try_from_fn<F>(mut load: F) -> Result<Self>
    where
        F: FnMut(StatSource) -> Result<NiftiImage>,
    {
        Ok(Self {
            zstat: load(StatSource::Zstat)?,
            thresh_zstat: load(StatSource::ThreshZstat)?,
            corrp: load(StatSource::Corrp)?,
            tstat: load(StatSource::Tstat)?,
            ica: load(StatSource::Ica)?,
            ica_thresh: load(StatSource::IcaThresh)?,
        })
    }
}

/// An ROI and its hemisphere variants, on one grid.
#[derive(Debug, Clone)]
pub struct RoiMasks {
    pub label: String,
    pub whole: NiftiImage,
    pub left: NiftiImage,
    pub right: NiftiImage,
}

impl RoiMasks {
    /// Variant for `side`.
    pub fn variant(&self, side: Hemisphere) -> &NiftiImage {
        match side {
            Hemisphere::Whole => &self.whole,
            Hemisphere::Left => &self.left,
            Hemisphere::Right => &self.right,
        }
    }
}

/// Half-grid masks restricting statistical maps to one hemisphere.
#[derive(Debug, Clone)]
pub struct HemisphereMasks {
    pub left: NiftiImage,
    pub right: NiftiImage,
}

impl HemisphereMasks {
    /// Mask for `side`; `None` for the whole brain.
    pub fn get(&self, side: Hemisphere) -> Option<&NiftiImage> {
        match side {
            Hemisphere::Whole => None,
            Hemisphere::Left => Some(&self.left),
            Hemisphere::Right => Some(&self.right),
        }
    }
}

// ============================================================================
// Grid builder
// ============================================================================

/// Binary maps for one (hemisphere, threshold) cell.
struct CellMaps {
    /// `A ∩ D ∩ H`
    active: NiftiImage,
    /// `|D ∩ H|`
    whole: u64,
    /// `Z ∩ D ∩ H` and `A ∩ Z ∩ D ∩ H`, for compared kinds.
    reference: Option<(NiftiImage, NiftiImage)>,
}

/// Enumerates the report grid for one subject/task.
#[derive(Debug, Clone)]
pub struct GridBuilder {
    subject: String,
    task: String,
    thresholds: Vec<ThresholdSpec>,
    reference: ThresholdSpec,
}

impl GridBuilder {
    /// `reference_label` must name a GLM threshold in `thresholds`.
    pub fn new(
        subject: impl Into<String>,
        task: impl Into<String>,
        thresholds: Vec<ThresholdSpec>,
        reference_label: &str,
    ) -> Result<Self> {
        let reference = thresholds
            .iter()
            .find(|t| t.kind == StatKind::Glm && t.label == reference_label)
            .cloned()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "reference threshold '{}' is not a configured GLM threshold",
                    reference_label
                ))
            })?;
        for spec in &thresholds {
            spec.rule()?;
        }
        Ok(Self {
            subject: subject.into(),
            task: task.into(),
            thresholds,
            reference,
        })
    }

    /// Rows per space for `roi_count` ROIs.
    pub fn rows_per_space(&self, roi_count: usize) -> usize {
        roi_count * Hemisphere::ALL.len() * self.thresholds.len()
    }

    fn activation(spec: &ThresholdSpec, maps: &StatVolumes) -> Result<NiftiImage> {
        let thresholded = spec.rule()?.apply(maps.get(spec.activation_source()))?;
        let active = binarize(&thresholded)?;
        match spec.gate_source() {
            Some(gate) => intersect(&active, &threshold_positive(maps.get(gate))?),
            None => Ok(active),
        }
    }

    fn restrict(volume: &NiftiImage, half: Option<&NiftiImage>) -> Result<NiftiImage> {
        match half {
            Some(mask) => intersect(volume, mask),
            None => Ok(volume.clone()),
        }
    }

    /// Rows for one space, ordered ROI, hemisphere, then threshold.
    ///
    /// # Errors
    /// Structural errors only (grid mismatches, bad thresholds). Empty
    /// ROIs and empty comparison maps are reported in the rows.
    pub fn build_space(
        &self,
        space: Space,
        maps: &StatVolumes,
        rois: &[RoiMasks],
        halves: &HemisphereMasks,
    ) -> Result<Vec<OverlapRow>> {
        let reference_active = Self::activation(&self.reference, maps)?;

        let mut cells: Vec<Vec<CellMaps>> = Vec::with_capacity(Hemisphere::ALL.len());
        for side in Hemisphere::ALL {
            let half = halves.get(side);
            let mut row = Vec::with_capacity(self.thresholds.len());
            for spec in &self.thresholds {
                let support = Self::restrict(&binarize(maps.get(spec.denominator_source()))?, half)?;
                let active = intersect(&Self::activation(spec, maps)?, &support)?;
                let reference = if spec.kind.is_compared() {
                    let z = intersect(&reference_active, &support)?;
                    if total_count(&z)? == 0 {
                        warn!(
                            subject = %self.subject,
                            task = %self.task,
                            space = %space,
                            hemisphere = ?side,
                            threshold = %spec.label,
                            "reference activation is empty; comparison metrics will be 0"
                        );
                    }
                    let shared = intersect(&active, &z)?;
                    Some((z, shared))
                } else {
                    None
                };
                row.push(CellMaps {
                    whole: total_count(&support)?,
                    active,
                    reference,
                });
            }
            cells.push(row);
        }

        let mut rows = Vec::with_capacity(self.rows_per_space(rois.len()));
        for roi in rois {
            for (side, cell_row) in Hemisphere::ALL.iter().zip(&cells) {
                let mask = roi.variant(*side);
                let roi_count = total_count(mask)?;
                let label = format!("{}{}", roi.label, side.suffix());
                if roi_count == 0 {
                    warn!(
                        subject = %self.subject,
                        task = %self.task,
                        space = %space,
                        roi = %label,
                        "ROI mask is empty; ROI metrics reported as 0.0"
                    );
                }

                for (spec, cell) in self.thresholds.iter().zip(cell_row) {
                    let comparison = match &cell.reference {
                        Some((z, shared)) => Some(ComparisonCounts {
                            reference: total_count(z)?,
                            shared: total_count(shared)?,
                            reference_roi: masked_count(z, mask, Polarity::NonZero)?,
                            shared_roi: masked_count(shared, mask, Polarity::NonZero)?,
                        }),
                        None => None,
                    };
                    let counts = OverlapCounts {
                        active_whole: total_count(&cell.active)?,
                        whole: cell.whole,
                        active_roi: masked_count(&cell.active, mask, Polarity::NonZero)?,
                        roi: roi_count,
                        comparison,
                    };
                    rows.push(self.row(space, &label, spec, &counts));
                }
            }
        }

        debug!(task = %self.task, space = %space, rows = rows.len(), "built report rows");
        Ok(rows)
    }

    fn row(&self, space: Space, roi: &str, spec: &ThresholdSpec, counts: &OverlapCounts) -> OverlapRow {
        let m = counts.metrics();
        OverlapRow {
            subject: self.subject.clone(),
            task: self.task.clone(),
            space: space.as_str(),
            roi: roi.to_string(),
            threshold: spec.label.clone(),
            stat_type: spec.kind.as_str(),
            active_whole: counts.active_whole,
            active_roi: counts.active_roi,
            pct_whole: m.pct_whole,
            pct_roi: m.pct_roi,
            pct_roi_in_whole: m.pct_roi_in_whole,
            ratio: m.ratio,
            roi_count: counts.roi,
            whole_count: counts.whole,
            dice: m.dice,
            coverage_t: m.coverage_t,
            coverage_z: m.coverage_z,
            coverage_t_roi: m.coverage_t_roi,
            coverage_z_roi: m.coverage_z_roi,
        }
    }
}

/// CSV sink for overlap rows. The header is always written, even for an
/// empty report.
pub struct ReportWriter {
    writer: csv::Writer<File>,
    rows: usize,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl ReportWriter {
    /// Create a new report at `path`, refusing to overwrite an existing one.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(HEADERS)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write_row(&mut self, row: &OverlapRow) -> Result<()> {
        self.writer.serialize(row)?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and close; returns the number of rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

/// Write `rows` to a new CSV at `path`. Refuses to overwrite.
pub fn write_report<P: AsRef<Path>>(path: P, rows: &[OverlapRow]) -> Result<()> {
    let mut writer = ReportWriter::create(path)?;
    for row in rows {
        writer.write_row(row)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti::{Affine, VoxelSemantic};
    use crate::overlap::default_thresholds;
    use ndarray::{ArrayD, IxDyn, ShapeBuilder};

    const IDENTITY: Affine = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    fn filled(dims: [usize; 3], f: impl Fn(usize, usize, usize) -> f32) -> NiftiImage {
        let data = ArrayD::from_shape_fn(IxDyn(&dims).f(), |ix| f(ix[0], ix[1], ix[2]));
        NiftiImage::from_array(data, IDENTITY)
    }

    fn fixture() -> (StatVolumes, Vec<RoiMasks>, HemisphereMasks) {
        let dims = [8, 4, 4];
        let z = filled(dims, |x, _, _| if x >= 4 { 4.0 } else { 1.0 });
        let maps = StatVolumes {
            thresh_zstat: z.clone(),
            zstat: z.clone(),
            corrp: filled(dims, |x, _, _| if x >= 4 { 0.97 } else { 0.0 }),
            tstat: filled(dims, |_, _, _| 2.0),
            ica: z.clone(),
            ica_thresh: z,
        };
        let label = |f: &dyn Fn(usize) -> bool| {
            filled(dims, |x, _, _| if f(x) { 1.0 } else { 0.0 }).with_semantic(VoxelSemantic::Label)
        };
        let rois = vec![RoiMasks {
            label: "PMC".into(),
            whole: label(&|x| x >= 2 && x < 6),
            left: label(&|x| x >= 2 && x < 4),
            right: label(&|x| x >= 4 && x < 6),
        }];
        let halves = HemisphereMasks {
            left: label(&|x| x >= 1 && x < 4),
            right: label(&|x| x >= 4),
        };
        (maps, rois, halves)
    }

    #[test]
    fn test_row_order_and_count() {
        let (maps, rois, halves) = fixture();
        let builder = GridBuilder::new("sub-01", "motor_hand", default_thresholds(), "Z=3.1").unwrap();
        let rows = builder.build_space(Space::Template, &maps, &rois, &halves).unwrap();
        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0].roi, "PMC");
        assert_eq!(rows[0].threshold, "Z=3.1");
        assert_eq!(rows[3].stat_type, "ICA");
        assert_eq!(rows[4].roi, "PMC_L");
        assert_eq!(rows[8].roi, "PMC_R");
        assert!(rows.iter().all(|r| r.space == "Template"));
    }

    #[test]
    fn test_glm_rows_not_compared() {
        let (maps, rois, halves) = fixture();
        let builder = GridBuilder::new("s", "t", default_thresholds(), "Z=3.1").unwrap();
        let rows = builder.build_space(Space::Template, &maps, &rois, &halves).unwrap();

        let glm = &rows[0];
        assert_eq!(glm.active_whole, 64);
        assert_eq!(glm.whole_count, 128);
        assert_eq!(glm.active_roi, 32);
        assert_eq!(glm.roi_count, 64);
        assert_eq!(glm.pct_whole, Metric::Value(50.0));
        assert_eq!(glm.dice, Metric::NotApplicable);

        // TFCE activation equals the Z=3.1 activation here.
        let tfce = &rows[2];
        assert_eq!(tfce.dice, Metric::Value(1.0));
        assert_eq!(tfce.coverage_t, Metric::Value(100.0));
        assert_eq!(tfce.coverage_z_roi, Metric::Value(100.0));
    }

    #[test]
    fn test_left_hemisphere_restricts_denominator() {
        let (maps, rois, halves) = fixture();
        let builder = GridBuilder::new("s", "t", default_thresholds(), "Z=3.1").unwrap();
        let rows = builder.build_space(Space::Native, &maps, &rois, &halves).unwrap();
        let left_glm = &rows[4];
        // x in [1, 4): 3 planes of 16, none above 3.1.
        assert_eq!(left_glm.whole_count, 48);
        assert_eq!(left_glm.active_whole, 0);
        assert_eq!(left_glm.pct_whole, Metric::Value(0.0));
        assert_eq!(left_glm.pct_roi_in_whole, Metric::Degenerate);
        assert_eq!(left_glm.ratio, Metric::NotApplicable);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        assert!(matches!(
            GridBuilder::new("s", "t", default_thresholds(), "Z=9"),
            Err(Error::Configuration(_))
        ));
        assert!(GridBuilder::new("s", "t", default_thresholds(), "TFCE").is_err());
    }

    #[test]
    fn test_write_report_header_and_tokens() {
        let (maps, rois, halves) = fixture();
        let builder = GridBuilder::new("sub-01", "motor_hand", default_thresholds(), "Z=3.1").unwrap();
        let rows = builder.build_space(Space::Template, &maps, &rois, &halves).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        write_report(&path, &rows).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, HEADERS);
        let first = reader.records().next().unwrap().unwrap();
        assert_eq!(&first[8], "50.000");
        assert_eq!(&first[14], "N/A");

        assert!(write_report(&path, &rows).is_err());
    }

    #[test]
    fn test_empty_report_has_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("empty.csv");
        let rows = ReportWriter::create(&path).unwrap().finish().unwrap();
        assert_eq!(rows, 0);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim_end(), HEADERS.join(","));
    }
}
