//! Subject/task orchestration.
//!
//! A subject moves through [`SubjectState::Preprocess`], then
//! [`SubjectState::PerTaskOverlap`] with tasks running on a bounded rayon
//! pool, and reaches [`SubjectState::Done`] only when every task reported
//! success and every report file exists.

pub mod context;
pub mod preprocess;

pub use context::{SubjectContext, TaskContext};
pub use preprocess::{preprocess_subject, PreprocessedSubject};

use crate::config::{Config, ResolvedTask};
use crate::error::{Error, Result};
use crate::nifti::{self, NiftiImage, VoxelSemantic};
use crate::overlap::StatSource;
use crate::report::{write_report, GridBuilder, StatVolumes};
use crate::transforms::{inverse_warp_to_native, mask_apply, Interpolation, Space};
use preprocess::cached;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{error, info, info_span, warn};

/// Lifecycle of one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectState {
    Preprocess,
    PerTaskOverlap,
    Done,
}

/// Result of one subject/task unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task: String,
    pub report: PathBuf,
    /// Rows written; 0 when an existing report was kept.
    pub rows: usize,
    /// True if the report already existed and was left untouched.
    pub skipped: bool,
}

/// Summary of a completed subject.
#[derive(Debug, Clone)]
pub struct SubjectReport {
    pub subject: String,
    pub state: SubjectState,
    pub outcomes: Vec<TaskOutcome>,
}

/// Verify every `expected` file exists, logging the checkpoint outcome.
pub(crate) fn checkpoint(stage: &str, expected: &[PathBuf]) -> Result<()> {
    match expected.iter().find(|p| !p.is_file()) {
        Some(missing) => {
            error!(
                checkpoint = stage,
                status = "fail",
                missing = %missing.display(),
                "expected output missing"
            );
            Err(Error::MissingOutput {
                stage: stage.to_string(),
                missing: missing.clone(),
            })
        }
        None => {
            info!(checkpoint = stage, status = "pass", files = expected.len());
            Ok(())
        }
    }
}

fn semantic_of(source: StatSource) -> VoxelSemantic {
    match source {
        StatSource::Corrp => VoxelSemantic::Probability,
        _ => VoxelSemantic::Continuous,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Runs subjects against one validated configuration.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    tasks: Vec<ResolvedTask>,
}

impl Orchestrator {
    /// Validate `config` and resolve its task table.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let tasks = config.resolve_tasks()?;
        Ok(Self {
            config: Arc::new(config),
            tasks,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Path of the consolidated log for `subject`.
    pub fn log_path(&self, subject: &str) -> PathBuf {
        SubjectContext::log_path(&self.config.layout.output_root, subject)
    }

    fn task(&self, id: &str) -> Result<&ResolvedTask> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::Configuration(format!("unknown task '{}'", id)))
    }

    /// Preprocess `subject`, reusing any cached outputs.
    ///
    /// ROIs are resampled onto the Z-statistic grid of the first task.
    pub fn preprocess(&self, subject: &str) -> Result<PreprocessedSubject> {
        let ctx = SubjectContext::new(&self.config, subject);
        let first = self
            .tasks
            .first()
            .ok_or_else(|| Error::Configuration("no tasks configured".to_string()))?;
        let reference_path = ctx.task(&self.config, first).input(StatSource::Zstat).to_path_buf();
        let reference = nifti::load_volume(&reference_path, VoxelSemantic::Continuous)?;
        preprocess_subject(&ctx, &reference, &self.config.hemisphere)
    }

    /// Check that every statistical input of every pending task exists.
    ///
    /// Tasks whose report already exists are skipped and need no inputs.
    pub fn check_inputs(&self, ctx: &SubjectContext) -> Result<()> {
        for task in &self.tasks {
            let task_ctx = ctx.task(&self.config, task);
            if task_ctx.report.is_file() {
                continue;
            }
            for source in StatSource::ALL {
                let path = task_ctx.input(source);
                if !path.is_file() {
                    error!(
                        checkpoint = "inputs",
                        status = "fail",
                        task = %task.id,
                        missing = %path.display()
                    );
                    return Err(Error::not_found(path, "statistical map"));
                }
            }
        }
        info!(checkpoint = "inputs", status = "pass", tasks = self.tasks.len());
        Ok(())
    }

    /// Full run: preprocess, then every task on the bounded pool.
    ///
    /// # Errors
    /// Missing statistical inputs and preprocessing errors abort before any
    /// report is written. Once one task fails with a structural error, tasks
    /// that have not started yet are cancelled; everything is returned
    /// together as [`Error::TaskFailures`] after the pool drains.
    pub fn run_subject(&self, subject: &str) -> Result<SubjectReport> {
        let span = info_span!("subject", subject);
        let _enter = span.enter();

        let mut state = SubjectState::Preprocess;
        info!(?state, "starting subject");
        let ctx = SubjectContext::new(&self.config, subject);
        self.check_inputs(&ctx)?;
        let prepared = Arc::new(self.preprocess(subject)?);

        state = SubjectState::PerTaskOverlap;
        info!(?state, tasks = self.tasks.len(), "preprocessing complete");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.execution.max_parallel_tasks)
            .thread_name(|i| format!("roistat-task-{i}"))
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build task pool: {e}")))?;

        // None marks a task cancelled before it started.
        let (tx, rx) = mpsc::channel::<(String, Option<Result<TaskOutcome>>)>();
        let aborted = AtomicBool::new(false);
        pool.scope(|scope| {
            for task in &self.tasks {
                let tx = tx.clone();
                let prepared = Arc::clone(&prepared);
                let task_ctx = ctx.task(&self.config, task);
                let parent = span.clone();
                let aborted = &aborted;
                scope.spawn(move |_| {
                    let span = info_span!(parent: &parent, "task", task = %task_ctx.task);
                    let _enter = span.enter();
                    if aborted.load(Ordering::SeqCst) {
                        warn!("subject aborted by an earlier task; not starting");
                        let _ = tx.send((task_ctx.task.clone(), None));
                        return;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| self.run_task(&task_ctx, &prepared)))
                        .unwrap_or_else(|payload| {
                            Err(Error::TaskPanicked {
                                task: task_ctx.task.clone(),
                                message: panic_message(payload.as_ref()),
                            })
                        });
                    if let Err(e) = &result {
                        error!(error = %e, "task failed");
                        if e.is_structural() {
                            aborted.store(true, Ordering::SeqCst);
                        }
                    }
                    // The receiver outlives the scope.
                    let _ = tx.send((task_ctx.task.clone(), Some(result)));
                });
            }
        });
        drop(tx);

        let mut outcomes = Vec::with_capacity(self.tasks.len());
        let mut failures = Vec::new();
        let mut reported: Vec<(String, Option<Result<TaskOutcome>>)> = rx.iter().collect();
        for task in &self.tasks {
            match reported.iter().position(|(id, _)| *id == task.id) {
                Some(index) => match reported.swap_remove(index).1 {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => failures.push((task.id.clone(), e.to_string())),
                    None => failures.push((
                        task.id.clone(),
                        "cancelled after an earlier task failed".to_string(),
                    )),
                },
                None => failures.push((task.id.clone(), "no result reported".to_string())),
            }
        }

        for task in &self.tasks {
            let report = ctx.task(&self.config, task).report;
            if let Err(e) = checkpoint(&format!("report:{}", task.id), &[report]) {
                if !failures.iter().any(|(id, _)| *id == task.id) {
                    failures.push((task.id.clone(), e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::TaskFailures {
                subject: subject.to_string(),
                failures,
            });
        }

        state = SubjectState::Done;
        info!(?state, "subject complete");
        Ok(SubjectReport {
            subject: subject.to_string(),
            state,
            outcomes,
        })
    }

    /// Run one task, preprocessing first if the cache is incomplete.
    pub fn run_single_task(&self, subject: &str, task_id: &str) -> Result<TaskOutcome> {
        let task = self.task(task_id)?;
        let ctx = SubjectContext::new(&self.config, subject);
        let prepared = self.preprocess(subject)?;
        let task_ctx = ctx.task(&self.config, task);
        let outcome = self.run_task(&task_ctx, &prepared)?;
        checkpoint(&format!("report:{}", task.id), &[task_ctx.report.clone()])?;
        Ok(outcome)
    }

    /// Compute and write one subject/task report.
    pub fn run_task(&self, ctx: &TaskContext, prepared: &PreprocessedSubject) -> Result<TaskOutcome> {
        if ctx.report.is_file() {
            warn!(report = %ctx.report.display(), "report already exists; leaving it untouched");
            return Ok(TaskOutcome {
                task: ctx.task.clone(),
                report: ctx.report.clone(),
                rows: 0,
                skipped: true,
            });
        }

        let template = StatVolumes::try_from_fn(|source| {
            let path = ctx.input(source);
            if !path.is_file() {
                return Err(Error::not_found(path, "statistical map"));
            }
            nifti::load_volume(path, semantic_of(source))
        })?;
        info!("loaded statistical maps");

        let native = StatVolumes::try_from_fn(|source| {
            native_map(ctx.native_path(source).as_path(), template.get(source), prepared)
        })?;

        let builder = GridBuilder::new(
            ctx.subject.clone(),
            ctx.task.clone(),
            self.config.thresholds.clone(),
            &self.config.reference_threshold,
        )?;

        let mut rows = Vec::with_capacity(2 * builder.rows_per_space(ctx.rois.len()));
        for (space, maps) in [(Space::Template, &template), (Space::Native, &native)] {
            let rois = prepared.rois(space, &ctx.rois)?;
            rows.extend(builder.build_space(space, maps, &rois, prepared.halves(space))?);
        }

        write_report(&ctx.report, &rows)?;
        info!(report = %ctx.report.display(), rows = rows.len(), "report written");

        Ok(TaskOutcome {
            task: ctx.task.clone(),
            report: ctx.report.clone(),
            rows: rows.len(),
            skipped: false,
        })
    }
}

/// Statistical map warped into native space and restricted to the brain.
fn native_map(path: &Path, template: &NiftiImage, prepared: &PreprocessedSubject) -> Result<NiftiImage> {
    cached(path, template.semantic(), || {
        let warped = inverse_warp_to_native(
            template,
            &prepared.brain,
            &prepared.field,
            Interpolation::for_semantic(template.semantic()),
        )?;
        mask_apply(&warped, &prepared.brain_mask)
    })
}
