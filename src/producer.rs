//! Automatic producers: external toolkit commands that compute an artifact
//! from a base image when no curated override exists.
use crate::artifact::{ArtifactKind, Subject};
use crate::template::{command_line, CommandTemplate, Vars};
use crate::util::{failure_detail, path_to_string};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// Placeholders a producer command may reference.
pub const PRODUCER_PLACEHOLDERS: [&str; 9] = [
    "image",
    "image_name",
    "contrast",
    "output",
    "segmentation",
    "subject",
    "work_dir",
    "qc_dir",
    "ext",
];

/// Everything a producer needs to write one artifact.
#[derive(Debug, Clone)]
pub struct ProducerJob<'a> {
    pub kind: ArtifactKind,
    pub subject: &'a Subject,
    /// Absolute path of the base image.
    pub image: &'a Path,
    /// Base name of the image, without extension.
    pub image_name: &'a str,
    pub contrast: &'a str,
    /// Local artifact path the producer must leave behind.
    pub output: &'a Path,
    /// Local segmentation path for the same image (disc labeling input).
    pub segmentation: &'a Path,
    pub work_dir: &'a Path,
    pub qc_dir: &'a Path,
    pub extension: &'a str,
}

/// Why an automatic producer did not deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerError {
    pub tag: String,
    pub detail: String,
}

impl ProducerError {
    fn new(tag: &str, detail: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            detail: detail.into(),
        }
    }
}

/// Capability that computes an artifact for a base image.
pub trait ArtifactProducer {
    /// Short name recorded as provenance for automatic results.
    fn tag(&self) -> &str;

    /// Write the artifact to `job.output`. Called at most once per artifact.
    fn produce(&self, job: &ProducerJob<'_>) -> Result<(), ProducerError>;
}

/// Producer configuration: one or more commands run in sequence.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    /// Optional provenance tag; defaults to the first program's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub commands: Vec<CommandTemplate>,
}

impl ProducerConfig {
    pub fn single(command: &str) -> Self {
        Self {
            tag: None,
            commands: vec![CommandTemplate::Line(command.to_string())],
        }
    }

    pub fn validate(&self, kind: ArtifactKind) -> Result<(), String> {
        if self.commands.is_empty() {
            return Err(format!("producers.{kind}.commands must be non-empty"));
        }
        for command in &self.commands {
            command
                .check_placeholders(&PRODUCER_PLACEHOLDERS)
                .map_err(|err| format!("producers.{kind}: {err}"))?;
        }
        Ok(())
    }

    /// Programs referenced by the commands, for preflight checks.
    pub fn programs(&self) -> Result<Vec<String>, String> {
        self.commands.iter().map(CommandTemplate::program).collect()
    }
}

/// Producer backed by external toolkit commands.
#[derive(Debug, Clone)]
pub struct CommandProducer {
    tag: String,
    commands: Vec<CommandTemplate>,
}

impl CommandProducer {
    pub fn from_config(config: &ProducerConfig) -> Result<Self, String> {
        let first = config
            .commands
            .first()
            .ok_or_else(|| "producer has no commands".to_string())?;
        let tag = match &config.tag {
            Some(tag) => tag.clone(),
            None => first.program_tag()?,
        };
        Ok(Self {
            tag,
            commands: config.commands.clone(),
        })
    }
}

pub fn producer_vars(job: &ProducerJob<'_>) -> Result<Vars, String> {
    let as_string = |path: &Path, label: &str| {
        path_to_string(path, label).map_err(|err| err.to_string())
    };
    let mut vars = Vars::new();
    vars.insert("image", as_string(job.image, "image")?);
    vars.insert("image_name", job.image_name.to_string());
    vars.insert("contrast", job.contrast.to_string());
    vars.insert("output", as_string(job.output, "output")?);
    vars.insert("segmentation", as_string(job.segmentation, "segmentation")?);
    vars.insert("subject", job.subject.to_string());
    vars.insert("work_dir", as_string(job.work_dir, "work dir")?);
    vars.insert("qc_dir", as_string(job.qc_dir, "qc dir")?);
    vars.insert("ext", job.extension.to_string());
    Ok(vars)
}

impl ArtifactProducer for CommandProducer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn produce(&self, job: &ProducerJob<'_>) -> Result<(), ProducerError> {
        let vars = producer_vars(job).map_err(|err| ProducerError::new(&self.tag, err))?;
        tracing::debug!(
            subject = %job.subject,
            kind = %job.kind,
            producer = %self.tag,
            commands = self.commands.len(),
            "producing artifact"
        );
        for template in &self.commands {
            let argv = template
                .expand(&vars)
                .map_err(|err| ProducerError::new(&self.tag, err))?;
            run_in(job.work_dir, &argv).map_err(|err| ProducerError::new(&self.tag, err))?;
        }
        Ok(())
    }
}

/// Run one command to completion in `cwd`, failing on non-zero exit.
pub fn run_in(cwd: &Path, argv: &[String]) -> Result<(), String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;
    let rendered = command_line(argv);
    tracing::debug!(command = %rendered, cwd = %cwd.display(), "running");
    let start = Instant::now();
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|err| format!("spawn {rendered}: {err}"))?;
    let elapsed_ms = start.elapsed().as_millis();
    tracing::info!(
        program = %program,
        elapsed_ms,
        status = %output.status,
        stdout_bytes = output.stdout.len(),
        "command complete"
    );
    if !output.status.success() {
        return Err(format!("{rendered} failed: {}", failure_detail(&output)));
    }
    Ok(())
}

/// Resolve a program the way `Command` will, for preflight reporting.
pub fn locate_program(program: &str, cwd: &Path) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        return candidate.is_file().then_some(candidate);
    }
    which::which(program).ok()
}
