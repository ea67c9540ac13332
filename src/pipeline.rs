//! Per-subject pipeline runner.
//!
//! Steps run strictly in order inside the subject's working directory and
//! the first failure aborts the run. External toolkit commands do the image
//! processing; this module only sequences them, resolves artifacts and
//! records what happened.
use crate::artifact::{ArtifactKind, ResolutionOutcome, Subject};
use crate::config::{expand_step_text, PipelineConfig, PipelineStep};
use crate::naming::NamingConvention;
use crate::producer::{locate_program, run_in, CommandProducer};
use crate::qc::{CommandQcReporter, JsonlQcLog, QualityControlReporter};
use crate::resolve::{ArtifactResolver, Producers, ResolverPaths};
use crate::template::Vars;
use crate::util::{path_to_string, sha256_file, write_json};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const REPORT_SCHEMA_VERSION: u32 = 1;
pub const REPORT_FILE_NAME: &str = "cordprep_report.json";
pub const MISSING_OUTPUTS_LOG: &str = "_error_check_output_files.log";

/// Typed paths into an output tree for one subject.
#[derive(Debug, Clone)]
pub struct SubjectPaths {
    output_dir: PathBuf,
    subject: Subject,
}

impl SubjectPaths {
    pub fn new(output_dir: PathBuf, subject: Subject) -> Self {
        Self {
            output_dir,
            subject,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Return the `data_processed/<subject>/anat` working directory.
    pub fn work_dir(&self) -> PathBuf {
        self.output_dir
            .join("data_processed")
            .join(self.subject.as_str())
            .join("anat")
    }

    /// Return the `log/` directory path.
    pub fn log_dir(&self) -> PathBuf {
        self.output_dir.join("log")
    }

    /// Return the `qc/` directory path.
    pub fn qc_dir(&self) -> PathBuf {
        self.output_dir.join("qc")
    }

    /// Return the `results/` directory path.
    pub fn results_dir(&self) -> PathBuf {
        self.output_dir.join("results")
    }

    pub fn report_path(&self) -> PathBuf {
        self.work_dir().join(REPORT_FILE_NAME)
    }

    pub fn missing_outputs_log(&self) -> PathBuf {
        self.log_dir().join(MISSING_OUTPUTS_LOG)
    }

    fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.work_dir(),
            self.log_dir(),
            self.qc_dir(),
            self.results_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Inputs for one `process` run.
pub struct ProcessRequest<'a> {
    pub config: &'a PipelineConfig,
    pub config_path: Option<&'a Path>,
    pub subject: Subject,
    /// Absolute dataset root.
    pub data_dir: PathBuf,
    /// Absolute output root.
    pub output_dir: PathBuf,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize, Clone)]
pub struct StepRecord {
    pub label: String,
    pub elapsed_ms: u128,
    pub status: RunStatus,
}

#[derive(Debug, Serialize, Clone)]
pub struct ResolutionRecord {
    pub kind: ArtifactKind,
    pub image: String,
    pub contrast: String,
    pub outcome: ResolutionOutcome,
    pub sha256: String,
}

/// Machine-readable account of a subject run.
#[derive(Debug, Serialize, Clone)]
pub struct RunReport {
    pub schema_version: u32,
    pub subject: Subject,
    pub started_at_epoch_ms: u128,
    pub elapsed_ms: u128,
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub resolutions: Vec<ResolutionRecord>,
    pub missing_outputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the producers and reporters the resolver borrows.
pub struct ResolverParts {
    segmentation: CommandProducer,
    disc_labels: CommandProducer,
    reporters: Vec<Box<dyn QualityControlReporter>>,
}

impl ResolverParts {
    /// Build producers and reporters; `qc.log` is relative to `output_dir`
    /// and the QC command runs in `work_dir`.
    pub fn build(
        config: &PipelineConfig,
        output_dir: &Path,
        qc_dir: &Path,
        work_dir: &Path,
    ) -> Result<Self> {
        let segmentation = CommandProducer::from_config(&config.producers.segmentation)
            .map_err(|err| anyhow!("producers.segmentation: {err}"))?;
        let disc_labels = CommandProducer::from_config(&config.producers.disc_labels)
            .map_err(|err| anyhow!("producers.disc_labels: {err}"))?;
        let mut reporters: Vec<Box<dyn QualityControlReporter>> = Vec::new();
        if let Some(log) = &config.qc.log {
            reporters.push(Box::new(JsonlQcLog::new(output_dir.join(log))));
        }
        if let Some(command) = &config.qc.command {
            reporters.push(Box::new(CommandQcReporter::new(
                command.clone(),
                qc_dir.to_path_buf(),
                work_dir.to_path_buf(),
            )));
        }
        Ok(Self {
            segmentation,
            disc_labels,
            reporters,
        })
    }

    pub fn resolver<'a>(
        &'a self,
        naming: &'a NamingConvention,
        paths: ResolverPaths,
    ) -> ArtifactResolver<'a> {
        let resolver = ArtifactResolver::new(
            naming,
            paths,
            Producers {
                segmentation: &self.segmentation,
                disc_labels: &self.disc_labels,
            },
        );
        self.reporters
            .iter()
            .fold(resolver, |resolver, reporter| resolver.with_reporter(reporter.as_ref()))
    }
}

/// Fail before running anything when a configured program is missing.
pub fn preflight(config: &PipelineConfig, cwd: &Path) -> Result<()> {
    let missing: Vec<String> = config
        .programs()?
        .into_iter()
        .filter(|program| locate_program(program, cwd).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "required programs not found on PATH: {}",
        missing.join(", ")
    ))
}

fn step_vars(
    request: &ProcessRequest<'_>,
    paths: &SubjectPaths,
    naming: &NamingConvention,
) -> Result<Vars> {
    let mut vars = Vars::new();
    vars.insert("subject", request.subject.to_string());
    vars.insert("data_dir", path_to_string(&request.data_dir, "data dir")?);
    vars.insert("output_dir", path_to_string(&request.output_dir, "output dir")?);
    vars.insert("work_dir", path_to_string(&paths.work_dir(), "work dir")?);
    vars.insert("qc_dir", path_to_string(&paths.qc_dir(), "qc dir")?);
    vars.insert("ext", naming.extension.clone());
    Ok(vars)
}

fn now_epoch_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX epoch")?
        .as_millis())
}

/// Run the configured steps for one subject.
///
/// The report is written to the working directory whether the run succeeds
/// or fails; a failed run still returns the error that stopped it.
pub fn run_subject(request: &ProcessRequest<'_>) -> Result<RunReport> {
    let naming = request.config.naming()?;
    let paths = SubjectPaths::new(request.output_dir.clone(), request.subject.clone());
    paths.create_dirs()?;
    preflight(request.config, &paths.work_dir())?;

    let started = Instant::now();
    let mut report = RunReport {
        schema_version: REPORT_SCHEMA_VERSION,
        subject: request.subject.clone(),
        started_at_epoch_ms: now_epoch_ms()?,
        elapsed_ms: 0,
        data_dir: request.data_dir.clone(),
        work_dir: paths.work_dir(),
        config_path: request.config_path.map(Path::to_path_buf),
        status: RunStatus::Succeeded,
        steps: Vec::new(),
        resolutions: Vec::new(),
        missing_outputs: Vec::new(),
        error: None,
    };
    tracing::info!(
        subject = %request.subject,
        work_dir = %paths.work_dir().display(),
        steps = request.config.steps.len(),
        "starting subject"
    );

    let result = run_steps(request, &naming, &paths, &mut report);
    report.elapsed_ms = started.elapsed().as_millis();
    if let Err(err) = &result {
        report.status = RunStatus::Failed;
        report.error = Some(format!("{err:#}"));
    }
    write_json(&paths.report_path(), &report)?;

    match result {
        Ok(()) => {
            tracing::info!(
                subject = %request.subject,
                elapsed_ms = report.elapsed_ms,
                "subject finished"
            );
            Ok(report)
        }
        Err(err) => {
            let detail = format!("{err:#}");
            tracing::error!(subject = %request.subject, error = %detail, "subject failed");
            Err(err)
        }
    }
}

fn run_steps(
    request: &ProcessRequest<'_>,
    naming: &NamingConvention,
    paths: &SubjectPaths,
    report: &mut RunReport,
) -> Result<()> {
    let vars = step_vars(request, paths, naming)?;
    let work_dir = paths.work_dir();
    let parts =
        ResolverParts::build(request.config, paths.output_dir(), &paths.qc_dir(), &work_dir)?;
    let resolver = parts.resolver(
        naming,
        ResolverPaths {
            work_dir: work_dir.clone(),
            derivatives_root: naming.derivatives_root_in(&request.data_dir),
            qc_dir: paths.qc_dir(),
        },
    );

    for step in &request.config.steps {
        let label = step.label();
        let start = Instant::now();
        tracing::info!(subject = %request.subject, step = %label, "step started");
        let result = run_step(step, request, &vars, &work_dir, &resolver, report)
            .with_context(|| format!("step {label}"));
        let status = if result.is_ok() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        let elapsed_ms = start.elapsed().as_millis();
        report.steps.push(StepRecord {
            label: label.clone(),
            elapsed_ms,
            status,
        });
        result?;
        tracing::info!(subject = %request.subject, step = %label, elapsed_ms, "step finished");
    }

    let missing = missing_outputs(&request.config.expected_outputs, &vars, &work_dir)?;
    if !missing.is_empty() {
        append_missing_outputs(&paths.missing_outputs_log(), &request.subject, &missing)?;
        report.missing_outputs = missing.clone();
        return Err(anyhow!(
            "expected outputs missing for {}: {}",
            request.subject,
            missing.join(", ")
        ));
    }
    Ok(())
}

fn run_step(
    step: &PipelineStep,
    request: &ProcessRequest<'_>,
    vars: &Vars,
    work_dir: &Path,
    resolver: &ArtifactResolver<'_>,
    report: &mut RunReport,
) -> Result<()> {
    match step {
        PipelineStep::CopyInput { source, dest } => {
            let source = request.data_dir.join(expand_step_text(source, vars)?);
            let dest = work_dir.join(expand_step_text(dest, vars)?);
            if !source.is_file() {
                return Err(anyhow!("input image not found at {}", source.display()));
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
            }
            fs::copy(&source, &dest)
                .with_context(|| format!("copy {} -> {}", source.display(), dest.display()))?;
            Ok(())
        }
        PipelineStep::Run {
            command, outputs, ..
        } => {
            let argv = command.expand(vars).map_err(|err| anyhow!(err))?;
            run_in(work_dir, &argv).map_err(|err| anyhow!(err))?;
            let missing = missing_outputs(outputs, vars, work_dir)?;
            if !missing.is_empty() {
                return Err(anyhow!("command did not write {}", missing.join(", ")));
            }
            Ok(())
        }
        PipelineStep::Resolve {
            artifact,
            image,
            contrast,
        } => {
            let image = expand_step_text(image, vars)?;
            let outcome = resolver.resolve(&image, *artifact, &request.subject, contrast)?;
            let sha256 = sha256_file(outcome.path())?;
            report.resolutions.push(ResolutionRecord {
                kind: *artifact,
                image,
                contrast: contrast.clone(),
                outcome,
                sha256,
            });
            Ok(())
        }
    }
}

fn missing_outputs(templates: &[String], vars: &Vars, work_dir: &Path) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for template in templates {
        let rel = expand_step_text(template, vars)?;
        if !work_dir.join(&rel).exists() {
            missing.push(rel);
        }
    }
    Ok(missing)
}

fn append_missing_outputs(log_path: &Path, subject: &Subject, missing: &[String]) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    for rel in missing {
        writeln!(file, "{subject}: missing {rel}")
            .with_context(|| format!("write {}", log_path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
