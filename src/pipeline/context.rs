//! Every path a subject or task touches, resolved once from the config.

use crate::config::{Config, ResolvedTask, RoiEntry};
use crate::overlap::StatSource;
use crate::transforms::{Hemisphere, Space};
use std::path::{Path, PathBuf};

/// Inputs and output tree of one subject.
#[derive(Debug, Clone)]
pub struct SubjectContext {
    pub subject: String,
    pub anatomical: PathBuf,
    pub brain_mask: PathBuf,
    pub warp: PathBuf,
    pub registration: Option<PathBuf>,
    /// `<output_root>/<subject>`
    pub output_dir: PathBuf,
    /// Skull-stripped anatomical, the native reference grid.
    pub brain: PathBuf,
    /// Consolidated subject log.
    pub log_file: PathBuf,
    /// Library ROIs and their source files.
    pub library: Vec<(RoiEntry, PathBuf)>,
}

impl SubjectContext {
    pub fn new(config: &Config, subject: &str) -> Self {
        let layout = &config.layout;
        let output_dir = layout.output_root.join(subject);
        Self {
            subject: subject.to_string(),
            anatomical: layout.anatomical_path(subject),
            brain_mask: layout.brain_mask_path(subject),
            warp: layout.warp_path(subject),
            registration: config.registration.clone(),
            brain: output_dir.join("anat").join(format!("{subject}_brain.nii.gz")),
            log_file: Self::log_path(&layout.output_root, subject),
            library: config
                .rois
                .iter()
                .map(|roi| (roi.clone(), config.roi_path(roi)))
                .collect(),
            output_dir,
        }
    }

    /// `<output_root>/<subject>/logs/<subject>_postats.log`
    pub fn log_path(output_root: &Path, subject: &str) -> PathBuf {
        output_root
            .join(subject)
            .join("logs")
            .join(format!("{subject}_postats.log"))
    }

    fn roi_dir(&self, space: Space) -> PathBuf {
        let name = match space {
            Space::Template => "template",
            Space::Native => "native",
        };
        self.output_dir.join("rois").join(name)
    }

    /// Cached ROI variant.
    pub fn roi_path(&self, space: Space, label: &str, side: Hemisphere) -> PathBuf {
        self.roi_dir(space)
            .join(format!("{label}{}.nii.gz", side.suffix()))
    }

    /// Cached hemisphere half-mask (`Left` or `Right`).
    pub fn hemisphere_path(&self, space: Space, side: Hemisphere) -> PathBuf {
        self.roi_dir(space)
            .join(format!("hemisphere{}.nii.gz", side.suffix()))
    }

    /// Every file preprocessing must leave behind.
    pub fn preprocess_outputs(&self) -> Vec<PathBuf> {
        let mut expected = vec![self.brain.clone()];
        for space in Space::ALL {
            for (roi, _) in &self.library {
                for side in Hemisphere::ALL {
                    expected.push(self.roi_path(space, &roi.label, side));
                }
            }
            for side in [Hemisphere::Left, Hemisphere::Right] {
                expected.push(self.hemisphere_path(space, side));
            }
        }
        expected
    }

    /// Paths for one task.
    pub fn task(&self, config: &Config, task: &ResolvedTask) -> TaskContext {
        let output_dir = self.output_dir.join(&task.id);
        TaskContext {
            subject: self.subject.clone(),
            task: task.id.clone(),
            rois: task.rois.iter().map(|r| r.label.clone()).collect(),
            inputs: StatSource::ALL.map(|source| {
                config.layout.stat_path(source, &self.subject, &task.id)
            }),
            report: output_dir.join(format!("{}_{}_overlap.csv", self.subject, task.id)),
            native_dir: output_dir.join("native"),
            output_dir,
        }
    }
}

/// Inputs and outputs of one subject/task unit.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub subject: String,
    pub task: String,
    /// ROI labels in report order.
    pub rois: Vec<String>,
    inputs: [PathBuf; 6],
    pub output_dir: PathBuf,
    /// Native-space copies of the statistical maps.
    pub native_dir: PathBuf,
    pub report: PathBuf,
}

impl TaskContext {
    /// Statistical input for `source`.
    pub fn input(&self, source: StatSource) -> &Path {
        &self.inputs[source.index()]
    }

    /// Native-space copy of `source`.
    pub fn native_path(&self, source: StatSource) -> PathBuf {
        self.native_dir
            .join(format!("{}_{}_native.nii.gz", self.task, source.stem()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_paths() {
        let mut config = Config::default();
        config.layout.output_root = PathBuf::from("/out");
        let ctx = SubjectContext::new(&config, "sub-01");
        assert_eq!(ctx.log_file, PathBuf::from("/out/sub-01/logs/sub-01_postats.log"));
        assert_eq!(
            ctx.roi_path(Space::Native, "PMC", Hemisphere::Left),
            PathBuf::from("/out/sub-01/rois/native/PMC_L.nii.gz")
        );
        // brain + 2 spaces × (3 ROIs × 3 variants + 2 halves)
        assert_eq!(ctx.preprocess_outputs().len(), 1 + 2 * (9 + 2));
    }

    #[test]
    fn test_task_paths() {
        let mut config = Config::default();
        config.layout.output_root = PathBuf::from("/out");
        let tasks = config.resolve_tasks().unwrap();
        let ctx = SubjectContext::new(&config, "sub-01").task(&config, &tasks[3]);
        assert_eq!(ctx.rois, vec!["STG".to_string(), "HG".to_string()]);
        assert_eq!(
            ctx.report,
            PathBuf::from("/out/sub-01/language/sub-01_language_overlap.csv")
        );
        assert!(ctx.input(StatSource::Tstat).ends_with("language_tstat1.nii.gz"));
        assert_eq!(
            ctx.native_path(StatSource::Corrp),
            PathBuf::from("/out/sub-01/language/native/language_tfce_corrp_native.nii.gz")
        );
    }
}
