//! Quality-control reporting for resolved artifacts.
//!
//! Reporting is best-effort: the resolver logs reporter failures and keeps
//! going, so nothing in here may abort a run.
use crate::artifact::{ArtifactKind, Provenance, ResolutionOutcome, Subject};
use crate::producer::run_in;
use crate::template::{CommandTemplate, Vars};
use crate::util::path_to_string;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const QC_PLACEHOLDERS: [&str; 6] = ["image", "artifact", "process", "subject", "qc_dir", "kind"];

/// One resolution as seen by QC consumers.
#[derive(Debug, Clone)]
pub struct QcRecord<'a> {
    pub subject: &'a Subject,
    pub kind: ArtifactKind,
    pub image: &'a Path,
    pub outcome: &'a ResolutionOutcome,
}

pub trait QualityControlReporter {
    fn record(&self, record: &QcRecord<'_>) -> Result<(), String>;
}

/// QC section of the config.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QcConfig {
    /// JSONL log of every resolution, relative to the output dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
    /// Report generator run after each resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandTemplate>,
}

impl QcConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(command) = &self.command {
            command
                .check_placeholders(&QC_PLACEHOLDERS)
                .map_err(|err| format!("qc.command: {err}"))?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct QcLogLine<'a> {
    recorded_at_epoch_ms: u128,
    subject: &'a str,
    kind: ArtifactKind,
    image: &'a Path,
    artifact: &'a Path,
    provenance: Provenance,
    producer: &'a str,
}

/// Appends one JSON line per resolution.
#[derive(Debug, Clone)]
pub struct JsonlQcLog {
    path: PathBuf,
}

impl JsonlQcLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl QualityControlReporter for JsonlQcLog {
    fn record(&self, record: &QcRecord<'_>) -> Result<(), String> {
        let recorded_at_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| err.to_string())?
            .as_millis();
        let line = QcLogLine {
            recorded_at_epoch_ms,
            subject: record.subject.as_str(),
            kind: record.kind,
            image: record.image,
            artifact: record.outcome.path(),
            provenance: record.outcome.provenance(),
            producer: record.outcome.producer_tag(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| format!("create {}: {err}", parent.display()))?;
        }
        let mut text = serde_json::to_string(&line).map_err(|err| err.to_string())?;
        text.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("open {}: {err}", self.path.display()))?;
        file.write_all(text.as_bytes())
            .map_err(|err| format!("write {}: {err}", self.path.display()))
    }
}

/// Runs a QC report generator (e.g. `sct_qc`) for each resolution.
#[derive(Debug, Clone)]
pub struct CommandQcReporter {
    command: CommandTemplate,
    qc_dir: PathBuf,
    cwd: PathBuf,
}

impl CommandQcReporter {
    pub fn new(command: CommandTemplate, qc_dir: PathBuf, cwd: PathBuf) -> Self {
        Self {
            command,
            qc_dir,
            cwd,
        }
    }
}

impl QualityControlReporter for CommandQcReporter {
    fn record(&self, record: &QcRecord<'_>) -> Result<(), String> {
        let to_string = |path: &Path, label: &str| path_to_string(path, label).map_err(|e| e.to_string());
        let mut vars = Vars::new();
        vars.insert("image", to_string(record.image, "image")?);
        vars.insert("artifact", to_string(record.outcome.path(), "artifact")?);
        vars.insert("process", record.outcome.producer_tag().to_string());
        vars.insert("subject", record.subject.to_string());
        vars.insert("qc_dir", to_string(&self.qc_dir, "qc dir")?);
        vars.insert("kind", record.kind.to_string());
        let argv = self.command.expand(&vars)?;
        run_in(&self.cwd, &argv)
    }
}
