//! Overlap metrics between activation maps, denominators, and ROI masks.
//!
//! Percentages and ratios whose denominator is empty are not errors at the
//! row level: they are logged and reported as [`Metric::Degenerate`]
//! (`0.0`) or [`Metric::NotApplicable`] (`N/A`) so one bad ROI never aborts
//! a subject.

use crate::error::{Error, Result};
use crate::nifti::NiftiImage;
use crate::transforms::voxel::{masked_count, threshold_above, threshold_positive, total_count, Polarity};
use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

/// A reported metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    /// Computed value, already rounded to 3 decimals.
    Value(f64),
    /// Denominator was empty or invalid; reported as `0.0`.
    Degenerate,
    /// Not meaningful for this row; reported as `N/A`.
    NotApplicable,
}

impl Metric {
    /// Numeric value, with degenerate metrics read as 0.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            Self::Degenerate => Some(0.0),
            Self::NotApplicable => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{:.3}", v),
            Self::Degenerate => f.write_str("0.0"),
            Self::NotApplicable => f.write_str("N/A"),
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Round to 3 decimal places.
#[inline]
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

// ============================================================================
// Ratios
// ============================================================================

/// `100 · num / den`, rounded to 3 decimals.
///
/// # Errors
/// [`Error::DegenerateDenominator`] when `den` is zero, negative,
/// non-finite, or not a whole number.
pub fn try_percentage(num: f64, den: f64) -> Result<f64> {
    if !den.is_finite() || den <= 0.0 || den.fract() != 0.0 {
        return Err(Error::DegenerateDenominator {
            numerator: num,
            denominator: den,
        });
    }
    Ok(round3(100.0 * num / den))
}

/// Like [`try_percentage`], recovering a degenerate denominator locally.
pub fn percentage(num: f64, den: f64) -> Metric {
    match try_percentage(num, den) {
        Ok(v) => Metric::Value(v),
        Err(e) => {
            warn!(numerator = num, denominator = den, error = %e, "degenerate percentage reported as 0.0");
            Metric::Degenerate
        }
    }
}

/// `2|A∩B| / (|A| + |B|)` from counts, rounded; degenerate when either set
/// is empty.
pub fn dice_counts(intersection: u64, a: u64, b: u64) -> Metric {
    if a == 0 || b == 0 {
        return Metric::Degenerate;
    }
    Metric::Value(round3(2.0 * intersection as f64 / (a + b) as f64))
}

/// `(|A∩B| / |A|, |A∩B| / |B|)` as rounded percentages, each degenerate when
/// its own denominator is empty.
pub fn coverage_counts(intersection: u64, a: u64, b: u64) -> (Metric, Metric) {
    let directional = |den: u64| {
        if den == 0 {
            Metric::Degenerate
        } else {
            Metric::Value(round3(100.0 * intersection as f64 / den as f64))
        }
    };
    (directional(a), directional(b))
}

/// Dice coefficient between the nonzero supports of two volumes; 0 when
/// either support is empty.
pub fn dice(a: &NiftiImage, b: &NiftiImage) -> Result<f64> {
    let both = masked_count(a, b, Polarity::NonZero)?;
    Ok(dice_counts(both, total_count(a)?, total_count(b)?)
        .as_f64()
        .unwrap_or_default())
}

/// Directional coverage between the nonzero supports of two volumes.
pub fn coverage(a: &NiftiImage, b: &NiftiImage) -> Result<(f64, f64)> {
    let both = masked_count(a, b, Polarity::NonZero)?;
    let (cov_a, cov_b) = coverage_counts(both, total_count(a)?, total_count(b)?);
    Ok((
        cov_a.as_f64().unwrap_or_default(),
        cov_b.as_f64().unwrap_or_default(),
    ))
}

/// `pct_roi / pct_wb`.
///
/// A degenerate ROI percentage stays degenerate; an unavailable or zero
/// whole-brain percentage makes the ratio not applicable.
pub fn activation_ratio(pct_roi: Metric, pct_wb: Metric) -> Metric {
    match (pct_roi, pct_wb) {
        (Metric::Degenerate, _) => Metric::Degenerate,
        (Metric::Value(roi), Metric::Value(wb)) if wb != 0.0 => Metric::Value(round3(roi / wb)),
        _ => Metric::NotApplicable,
    }
}

// ============================================================================
// Thresholds and statistic kinds
// ============================================================================

/// Family of statistical map a threshold applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatKind {
    /// GLM Z-statistic.
    #[serde(rename = "GLM", alias = "glm")]
    Glm,
    /// TFCE corrected significance gating the permutation t-statistic.
    #[serde(rename = "TFCE", alias = "tfce")]
    Tfce,
    /// ICA dual-regression spatial correlation.
    #[serde(rename = "ICA", alias = "ica")]
    Ica,
}

impl StatKind {
    /// Label written to the `Stat Type` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Glm => "GLM",
            Self::Tfce => "TFCE",
            Self::Ica => "ICA",
        }
    }

    /// Whether rows of this kind are compared against the reference map.
    pub const fn is_compared(self) -> bool {
        !matches!(self, Self::Glm)
    }

    /// Default activation map.
    pub const fn activation_source(self) -> StatSource {
        match self {
            Self::Glm => StatSource::ThreshZstat,
            Self::Tfce => StatSource::Corrp,
            Self::Ica => StatSource::IcaThresh,
        }
    }

    /// Default denominator (support) map.
    pub const fn denominator_source(self) -> StatSource {
        match self {
            Self::Glm => StatSource::Zstat,
            Self::Tfce => StatSource::Tstat,
            Self::Ica => StatSource::Ica,
        }
    }

    /// Default gate: activation only counts where this map is positive.
    pub const fn gate_source(self) -> Option<StatSource> {
        match self {
            Self::Tfce => Some(StatSource::Tstat),
            Self::Glm | Self::Ica => None,
        }
    }
}

impl std::fmt::Display for StatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six per-task statistical inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatSource {
    /// GLM Z-statistic.
    Zstat,
    /// Cluster-corrected suprathreshold Z.
    ThreshZstat,
    /// TFCE corrected significance (1 - p).
    Corrp,
    /// Permutation t-statistic.
    Tstat,
    /// ICA spatial correlation.
    Ica,
    /// Thresholded ICA spatial correlation.
    IcaThresh,
}

impl StatSource {
    /// All sources, in load order.
    pub const ALL: [Self; 6] = [
        Self::Zstat,
        Self::ThreshZstat,
        Self::Corrp,
        Self::Tstat,
        Self::Ica,
        Self::IcaThresh,
    ];

    /// Position in [`StatSource::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// File stem used for derived native-space copies.
    pub const fn stem(self) -> &'static str {
        match self {
            Self::Zstat => "zstat",
            Self::ThreshZstat => "thresh_zstat",
            Self::Corrp => "tfce_corrp",
            Self::Tstat => "tstat",
            Self::Ica => "ica",
            Self::IcaThresh => "ica_thresh",
        }
    }
}

/// How a threshold turns a statistical map into an activation map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Keep values `>= cutoff`.
    Absolute,
    /// Keep values `> 0`.
    Positive,
}

/// A resolved threshold rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdRule {
    /// Keep values `>= cutoff`.
    Absolute(f32),
    /// Keep values `> 0`.
    Positive,
}

impl ThresholdRule {
    /// Threshold `map` under this rule.
    pub fn apply(self, map: &NiftiImage) -> Result<NiftiImage> {
        match self {
            Self::Absolute(cutoff) => threshold_above(map, cutoff),
            Self::Positive => threshold_positive(map),
        }
    }
}

/// One configured threshold: a labelled rule on a statistic kind.
///
/// Sources default per kind and may be overridden individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    /// Label written to the `Threshold` column.
    pub label: String,
    /// Statistic kind.
    pub kind: StatKind,
    /// Rule family.
    pub rule: RuleKind,
    /// Cutoff for absolute rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<f64>,
    /// Activation map override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<StatSource>,
    /// Denominator map override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominator: Option<StatSource>,
    /// Gate map override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<StatSource>,
}

impl ThresholdSpec {
    /// Absolute-cutoff threshold with default sources.
    pub fn absolute(label: impl Into<String>, kind: StatKind, cutoff: f64) -> Self {
        Self {
            label: label.into(),
            kind,
            rule: RuleKind::Absolute,
            cutoff: Some(cutoff),
            activation: None,
            denominator: None,
            gate: None,
        }
    }

    /// Positive-value threshold with default sources.
    pub fn positive(label: impl Into<String>, kind: StatKind) -> Self {
        Self {
            label: label.into(),
            kind,
            rule: RuleKind::Positive,
            cutoff: None,
            activation: None,
            denominator: None,
            gate: None,
        }
    }

    /// Resolve the rule, failing if an absolute rule has no cutoff.
    pub fn rule(&self) -> Result<ThresholdRule> {
        match (self.rule, self.cutoff) {
            (RuleKind::Positive, _) => Ok(ThresholdRule::Positive),
            (RuleKind::Absolute, Some(c)) if c.is_finite() => Ok(ThresholdRule::Absolute(c as f32)),
            (RuleKind::Absolute, _) => Err(Error::Configuration(format!(
                "threshold '{}' ({}) needs a finite cutoff",
                self.label, self.kind
            ))),
        }
    }

    /// Map thresholded into the activation map.
    pub fn activation_source(&self) -> StatSource {
        self.activation.unwrap_or(self.kind.activation_source())
    }

    /// Map whose support is the whole-brain denominator.
    pub fn denominator_source(&self) -> StatSource {
        self.denominator.unwrap_or(self.kind.denominator_source())
    }

    /// Map whose positive voxels gate the activation, if any.
    pub fn gate_source(&self) -> Option<StatSource> {
        self.gate.or(self.kind.gate_source())
    }
}

/// Motor/language defaults: two GLM cutoffs, TFCE positive, ICA at 3.1.
pub fn default_thresholds() -> Vec<ThresholdSpec> {
    vec![
        ThresholdSpec::absolute("Z=3.1", StatKind::Glm, 3.1),
        ThresholdSpec::absolute("Z=2.35", StatKind::Glm, 2.35),
        ThresholdSpec::positive("TFCE", StatKind::Tfce),
        ThresholdSpec::absolute("Z=3.1", StatKind::Ica, 3.1),
    ]
}

// ============================================================================
// Row metrics
// ============================================================================

/// Voxel counts for one (space, ROI variant, threshold) combination.
///
/// `A` is the activation map, `D` the denominator support, `R` the ROI and
/// `Z` the reference activation, all already restricted to the hemisphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlapCounts {
    /// `|A ∩ D|`
    pub active_whole: u64,
    /// `|D|`
    pub whole: u64,
    /// `|A ∩ D ∩ R|`
    pub active_roi: u64,
    /// `|R|`
    pub roi: u64,
    /// Counts against the reference map; `None` for uncompared kinds.
    pub comparison: Option<ComparisonCounts>,
}

/// Counts for Dice and coverage against the reference map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComparisonCounts {
    /// `|Z ∩ D|`
    pub reference: u64,
    /// `|A ∩ Z ∩ D|`
    pub shared: u64,
    /// `|Z ∩ D ∩ R|`
    pub reference_roi: u64,
    /// `|A ∩ Z ∩ D ∩ R|`
    pub shared_roi: u64,
}

/// Derived metrics for one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapMetrics {
    pub pct_whole: Metric,
    pub pct_roi: Metric,
    pub pct_roi_in_whole: Metric,
    pub ratio: Metric,
    pub dice: Metric,
    pub coverage_t: Metric,
    pub coverage_z: Metric,
    pub coverage_t_roi: Metric,
    pub coverage_z_roi: Metric,
}

impl OverlapCounts {
    /// Evaluate every metric of the row.
    pub fn metrics(&self) -> OverlapMetrics {
        let pct_whole = percentage(self.active_whole as f64, self.whole as f64);
        let pct_roi = percentage(self.active_roi as f64, self.roi as f64);
        let pct_roi_in_whole = percentage(self.active_roi as f64, self.active_whole as f64);
        let ratio = activation_ratio(pct_roi, pct_whole);

        let (dice, coverage_t, coverage_z, coverage_t_roi, coverage_z_roi) = match self.comparison {
            Some(c) => {
                let (t, z) = coverage_counts(c.shared, self.active_whole, c.reference);
                let (t_roi, z_roi) = coverage_counts(c.shared_roi, self.active_roi, c.reference_roi);
                (dice_counts(c.shared, self.active_whole, c.reference), t, z, t_roi, z_roi)
            }
            None => (
                Metric::NotApplicable,
                Metric::NotApplicable,
                Metric::NotApplicable,
                Metric::NotApplicable,
                Metric::NotApplicable,
            ),
        };

        OverlapMetrics {
            pct_whole,
            pct_roi,
            pct_roi_in_whole,
            ratio,
            dice,
            coverage_t,
            coverage_z,
            coverage_t_roi,
            coverage_z_roi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_rounding_and_degenerate() {
        assert_eq!(try_percentage(1.0, 3.0).unwrap(), 33.333);
        assert_eq!(percentage(0.0, 50.0), Metric::Value(0.0));
        assert_eq!(percentage(5.0, 0.0), Metric::Degenerate);
        assert!(matches!(
            try_percentage(1.0, 2.5),
            Err(Error::DegenerateDenominator { .. })
        ));
        assert!(try_percentage(1.0, -4.0).is_err());
        assert!(try_percentage(1.0, f64::NAN).is_err());
    }

    #[test]
    fn test_metric_rendering() {
        assert_eq!(Metric::Value(20.0).to_string(), "20.000");
        assert_eq!(Metric::Value(33.3333).to_string(), "33.333");
        assert_eq!(Metric::Degenerate.to_string(), "0.0");
        assert_eq!(Metric::NotApplicable.to_string(), "N/A");
        assert_eq!(Metric::Degenerate.as_f64(), Some(0.0));
    }

    #[test]
    fn test_dice_bounds() {
        assert_eq!(dice_counts(300, 300, 300), Metric::Value(1.0));
        assert_eq!(dice_counts(0, 10, 20), Metric::Value(0.0));
        assert_eq!(dice_counts(0, 0, 20), Metric::Degenerate);
        assert_eq!(dice_counts(0, 20, 0).to_string(), "0.0");
        assert_eq!(dice_counts(5, 10, 20), Metric::Value(0.333));
    }

    #[test]
    fn test_coverage_independent_denominators() {
        assert_eq!(
            coverage_counts(5, 10, 20),
            (Metric::Value(50.0), Metric::Value(25.0))
        );
        assert_eq!(
            coverage_counts(0, 0, 20),
            (Metric::Degenerate, Metric::Value(0.0))
        );
        assert_eq!(
            coverage_counts(0, 10, 0),
            (Metric::Value(0.0), Metric::Degenerate)
        );
    }

    #[test]
    fn test_activation_ratio_cases() {
        assert_eq!(
            activation_ratio(Metric::Value(100.0), Metric::Value(20.0)),
            Metric::Value(5.0)
        );
        assert_eq!(
            activation_ratio(Metric::Value(0.0), Metric::Value(20.0)),
            Metric::Value(0.0)
        );
        assert_eq!(
            activation_ratio(Metric::Value(10.0), Metric::Value(0.0)),
            Metric::NotApplicable
        );
        assert_eq!(
            activation_ratio(Metric::Degenerate, Metric::Value(20.0)),
            Metric::Degenerate
        );
        assert_eq!(
            activation_ratio(Metric::Value(10.0), Metric::Degenerate),
            Metric::NotApplicable
        );
    }

    #[test]
    fn test_threshold_spec_sources_and_rule() {
        let tfce = ThresholdSpec::positive("TFCE", StatKind::Tfce);
        assert_eq!(tfce.activation_source(), StatSource::Corrp);
        assert_eq!(tfce.denominator_source(), StatSource::Tstat);
        assert_eq!(tfce.gate_source(), Some(StatSource::Tstat));
        assert_eq!(tfce.rule().unwrap(), ThresholdRule::Positive);

        let mut glm = ThresholdSpec::absolute("Z=3.1", StatKind::Glm, 3.1);
        assert_eq!(glm.activation_source(), StatSource::ThreshZstat);
        assert_eq!(glm.gate_source(), None);
        glm.cutoff = None;
        assert!(matches!(glm.rule(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_row_metrics_scenario() {
        let counts = OverlapCounts {
            active_whole: 1000,
            whole: 5000,
            active_roi: 200,
            roi: 200,
            comparison: None,
        };
        let m = counts.metrics();
        assert_eq!(m.pct_whole, Metric::Value(20.0));
        assert_eq!(m.pct_roi, Metric::Value(100.0));
        assert_eq!(m.pct_roi_in_whole, Metric::Value(20.0));
        assert_eq!(m.ratio, Metric::Value(5.0));
        assert_eq!(m.dice, Metric::NotApplicable);
    }

    #[test]
    fn test_empty_roi_row_is_degenerate() {
        let counts = OverlapCounts {
            active_whole: 40,
            whole: 400,
            active_roi: 0,
            roi: 0,
            comparison: Some(ComparisonCounts {
                reference: 40,
                shared: 40,
                reference_roi: 0,
                shared_roi: 0,
            }),
        };
        let m = counts.metrics();
        assert_eq!(m.pct_roi, Metric::Degenerate);
        assert_eq!(m.ratio, Metric::Degenerate);
        assert_eq!(m.pct_whole, Metric::Value(10.0));
        assert_eq!(m.dice, Metric::Value(1.0));
        assert_eq!(m.coverage_t_roi, Metric::Degenerate);
        assert_eq!(m.coverage_z_roi, Metric::Degenerate);
        assert_eq!(m.coverage_t_roi.to_string(), "0.0");
    }
}
