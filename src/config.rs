//! TOML configuration.
//!
//! Loading order:
//! 1. TOML file (or [`Config::default`] when none is given)
//! 2. Environment variable overrides
//! 3. Validation

use crate::error::{Error, Result};
use crate::overlap::{default_thresholds, StatKind, StatSource, ThresholdSpec};
use crate::transforms::HemisphereSplit;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder replaced by the subject identifier in layout templates.
pub const SUBJECT_PLACEHOLDER: &str = "{subject}";
/// Placeholder replaced by the task identifier in layout templates.
pub const TASK_PLACEHOLDER: &str = "{task}";

/// Where inputs are found and outputs go.
///
/// Input templates are relative to `input_root` and may use `{subject}`
/// and `{task}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub roi_dir: PathBuf,
    pub anatomical: String,
    pub brain_mask: String,
    pub warp: String,
    pub zstat: String,
    pub thresh_zstat: String,
    pub corrp: String,
    pub tstat: String,
    pub ica: String,
    pub ica_thresh: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("data"),
            output_root: PathBuf::from("derivatives/roistat"),
            roi_dir: PathBuf::from("rois"),
            anatomical: "{subject}/anat/{subject}_T1w.nii.gz".into(),
            brain_mask: "{subject}/anat/{subject}_brain_mask.nii.gz".into(),
            warp: "{subject}/anat/{subject}_template2native_warp.nii.gz".into(),
            zstat: "{subject}/func/{task}.feat/stats/zstat1.nii.gz".into(),
            thresh_zstat: "{subject}/func/{task}.feat/thresh_zstat1.nii.gz".into(),
            corrp: "{subject}/func/{task}_randomise/{task}_tfce_corrp_tstat1.nii.gz".into(),
            tstat: "{subject}/func/{task}_randomise/{task}_tstat1.nii.gz".into(),
            ica: "{subject}/func/{task}_dualreg/{task}_ica_corr.nii.gz".into(),
            ica_thresh: "{subject}/func/{task}_dualreg/{task}_ica_corr_thresh.nii.gz".into(),
        }
    }
}

impl Layout {
    /// Substitute placeholders in `template`.
    pub fn resolve(template: &str, subject: &str, task: Option<&str>) -> String {
        let path = template.replace(SUBJECT_PLACEHOLDER, subject);
        match task {
            Some(task) => path.replace(TASK_PLACEHOLDER, task),
            None => path,
        }
    }

    fn input(&self, template: &str, subject: &str, task: Option<&str>) -> PathBuf {
        self.input_root.join(Self::resolve(template, subject, task))
    }

    /// Subject's anatomical volume.
    pub fn anatomical_path(&self, subject: &str) -> PathBuf {
        self.input(&self.anatomical, subject, None)
    }

    /// Subject's brain mask.
    pub fn brain_mask_path(&self, subject: &str) -> PathBuf {
        self.input(&self.brain_mask, subject, None)
    }

    /// Subject's template→native deformation field.
    pub fn warp_path(&self, subject: &str) -> PathBuf {
        self.input(&self.warp, subject, None)
    }

    /// One of a task's six statistical inputs.
    pub fn stat_path(&self, source: StatSource, subject: &str, task: &str) -> PathBuf {
        let template = match source {
            StatSource::Zstat => &self.zstat,
            StatSource::ThreshZstat => &self.thresh_zstat,
            StatSource::Corrp => &self.corrp,
            StatSource::Tstat => &self.tstat,
            StatSource::Ica => &self.ica,
            StatSource::IcaThresh => &self.ica_thresh,
        };
        self.input(template, subject, Some(task))
    }
}

/// A library ROI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiEntry {
    /// Label used in reports and file names.
    pub label: String,
    /// File name relative to `layout.roi_dir`.
    pub file: PathBuf,
}

/// A task and the ROIs its report covers, in report order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub rois: Vec<String>,
}

/// Task-level parallelism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Execution {
    /// Upper bound on tasks processed at once per subject.
    pub max_parallel_tasks: usize,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 4,
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GLM threshold label the TFCE and ICA rows are compared against.
    pub reference_threshold: String,
    /// Optional world→world matrix from ROI template space to the
    /// statistical grid's space.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<PathBuf>,
    pub layout: Layout,
    pub hemisphere: HemisphereSplit,
    pub execution: Execution,
    pub rois: Vec<RoiEntry>,
    pub tasks: Vec<TaskEntry>,
    pub thresholds: Vec<ThresholdSpec>,
}

impl Default for Config {
    fn default() -> Self {
        let roi = |label: &str| RoiEntry {
            label: label.to_string(),
            file: PathBuf::from(format!("{label}.nii.gz")),
        };
        let task = |id: &str, rois: &[&str]| TaskEntry {
            id: id.to_string(),
            rois: rois.iter().map(|r| (*r).to_string()).collect(),
        };
        Self {
            reference_threshold: "Z=3.1".to_string(),
            registration: None,
            layout: Layout::default(),
            hemisphere: HemisphereSplit::default(),
            execution: Execution::default(),
            rois: vec![roi("PMC"), roi("STG"), roi("HG")],
            tasks: vec![
                task("motor_hand", &["PMC"]),
                task("motor_foot", &["PMC"]),
                task("motor_lips", &["PMC"]),
                task("language", &["STG", "HG"]),
            ],
            thresholds: default_thresholds(),
        }
    }
}

/// A task with its ROI labels resolved against the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub id: String,
    pub rois: Vec<RoiEntry>,
}

impl Config {
    /// Load TOML from `path`, apply environment overrides, and validate.
    ///
    /// # Errors
    /// I/O, TOML, or [`Error::Configuration`] errors.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::not_found(path, "configuration file"));
        }
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_environment_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let mut config = Self::default();
                config.apply_environment_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables:
    /// - `ROISTAT_MAX_PARALLEL_TASKS` -> `execution.max_parallel_tasks`
    /// - `ROISTAT_OUTPUT_ROOT` -> `layout.output_root`
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ROISTAT_MAX_PARALLEL_TASKS") {
            self.execution.max_parallel_tasks = value.trim().parse().map_err(|_| {
                Error::Configuration(format!(
                    "ROISTAT_MAX_PARALLEL_TASKS must be a positive integer, got '{}'",
                    value
                ))
            })?;
        }
        if let Some(value) = lookup("ROISTAT_OUTPUT_ROOT") {
            self.layout.output_root = PathBuf::from(value);
        }
        Ok(())
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_tasks == 0 {
            return Err(Error::Configuration(
                "execution.max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        if self.hemisphere.axis >= 3 {
            return Err(Error::Configuration(format!(
                "hemisphere.axis must be 0, 1 or 2, got {}",
                self.hemisphere.axis
            )));
        }

        let mut labels = HashSet::new();
        for roi in &self.rois {
            if roi.label.is_empty() {
                return Err(Error::Configuration("ROI label must not be empty".to_string()));
            }
            if !labels.insert(roi.label.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate ROI label '{}'",
                    roi.label
                )));
            }
        }

        if self.tasks.is_empty() {
            return Err(Error::Configuration("no tasks configured".to_string()));
        }
        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(Error::Configuration(format!("duplicate task '{}'", task.id)));
            }
            if task.rois.is_empty() {
                return Err(Error::Configuration(format!(
                    "task '{}' lists no ROIs",
                    task.id
                )));
            }
            if let Some(unknown) = task.rois.iter().find(|r| !labels.contains(r.as_str())) {
                return Err(Error::Configuration(format!(
                    "task '{}' references unknown ROI '{}'",
                    task.id, unknown
                )));
            }
        }

        if self.thresholds.is_empty() {
            return Err(Error::Configuration("no thresholds configured".to_string()));
        }
        let mut keys = HashSet::new();
        for spec in &self.thresholds {
            spec.rule()?;
            if !keys.insert((spec.label.as_str(), spec.kind)) {
                return Err(Error::Configuration(format!(
                    "duplicate threshold '{}' for {}",
                    spec.label, spec.kind
                )));
            }
        }
        if !self
            .thresholds
            .iter()
            .any(|t| t.kind == StatKind::Glm && t.label == self.reference_threshold)
        {
            return Err(Error::Configuration(format!(
                "reference_threshold '{}' does not name a GLM threshold",
                self.reference_threshold
            )));
        }

        Ok(())
    }

    /// Resolve each task's ROI labels against the library.
    pub fn resolve_tasks(&self) -> Result<Vec<ResolvedTask>> {
        self.tasks
            .iter()
            .map(|task| {
                let rois = task
                    .rois
                    .iter()
                    .map(|label| {
                        self.rois
                            .iter()
                            .find(|r| &r.label == label)
                            .cloned()
                            .ok_or_else(|| {
                                Error::Configuration(format!(
                                    "task '{}' references unknown ROI '{}'",
                                    task.id, label
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ResolvedTask {
                    id: task.id.clone(),
                    rois,
                })
            })
            .collect()
    }

    /// Library ROI path.
    pub fn roi_path(&self, roi: &RoiEntry) -> PathBuf {
        self.layout.roi_dir.join(&roi.file)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("cannot serialise configuration: {e}")))
    }
}
