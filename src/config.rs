//! Pipeline configuration.
//!
//! The config is a single JSON document describing how overrides are named,
//! which external commands produce artifacts, and the ordered per-subject
//! step list. It is loaded and validated once per invocation.
use crate::artifact::ArtifactKind;
use crate::naming::{NamingConvention, DEFAULT_PROFILE, PROFILE_NAMES};
use crate::producer::ProducerConfig;
use crate::qc::QcConfig;
use crate::template::{expand_str, placeholders, CommandTemplate, Vars};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_FILE_NAME: &str = "cordprep.json";

/// Placeholders available to step commands and step paths.
pub const STEP_PLACEHOLDERS: [&str; 6] = [
    "subject",
    "data_dir",
    "output_dir",
    "work_dir",
    "qc_dir",
    "ext",
];

fn default_contrast() -> String {
    "t2".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProducersConfig {
    pub segmentation: ProducerConfig,
    pub disc_labels: ProducerConfig,
}

impl ProducersConfig {
    pub fn for_kind(&self, kind: ArtifactKind) -> &ProducerConfig {
        match kind {
            ArtifactKind::Segmentation => &self.segmentation,
            ArtifactKind::DiscLabels => &self.disc_labels,
        }
    }
}

/// One entry of the per-subject step list.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum PipelineStep {
    /// Copy a raw image from the dataset into the working directory.
    CopyInput { source: String, dest: String },
    /// Run an external toolkit command in the working directory.
    Run {
        name: String,
        command: CommandTemplate,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<String>,
    },
    /// Resolve a segmentation or disc-label artifact for an image.
    Resolve {
        artifact: ArtifactKind,
        image: String,
        #[serde(default = "default_contrast")]
        contrast: String,
    },
}

impl PipelineStep {
    /// Short label for logs and reports.
    pub fn label(&self) -> String {
        match self {
            PipelineStep::CopyInput { dest, .. } => format!("copy_input:{dest}"),
            PipelineStep::Run { name, .. } => format!("run:{name}"),
            PipelineStep::Resolve { artifact, .. } => format!("resolve:{artifact}"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    /// Dataset root holding `<subject>/anat/...` and the derivatives store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Root for `data_processed/`, `log/` and `qc/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Built-in naming profile; ignored when `naming` is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming: Option<NamingConvention>,
    pub producers: ProducersConfig,
    #[serde(default)]
    pub qc: QcConfig,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
    /// Files (relative to the work dir) that must exist after the steps.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

impl PipelineConfig {
    /// Naming convention in effect: explicit section, then profile, then default.
    pub fn naming(&self) -> Result<NamingConvention> {
        if let Some(naming) = &self.naming {
            return Ok(naming.clone());
        }
        let profile = self.naming_profile.as_deref().unwrap_or(DEFAULT_PROFILE);
        NamingConvention::profile(profile).ok_or_else(|| {
            anyhow!(
                "unknown naming_profile {profile:?} (expected one of {})",
                PROFILE_NAMES.join(", ")
            )
        })
    }

    /// Every program the config may run, for preflight checks.
    pub fn programs(&self) -> Result<Vec<String>> {
        let mut programs = Vec::new();
        for kind in ArtifactKind::ALL {
            programs.extend(self.producers.for_kind(kind).programs().map_err(|err| anyhow!(err))?);
        }
        for step in &self.steps {
            if let PipelineStep::Run { command, .. } = step {
                programs.push(command.program().map_err(|err| anyhow!(err))?);
            }
        }
        if let Some(command) = &self.qc.command {
            programs.push(command.program().map_err(|err| anyhow!(err))?);
        }
        programs.sort();
        programs.dedup();
        Ok(programs)
    }
}

/// Build the default config: a T2w preprocessing pipeline using the given
/// naming profile.
pub fn default_config(profile: &str) -> Result<PipelineConfig> {
    if NamingConvention::profile(profile).is_none() {
        return Err(anyhow!(
            "unknown naming profile {profile:?} (expected one of {})",
            PROFILE_NAMES.join(", ")
        ));
    }
    let run = |name: &str, command: &str, outputs: &[&str]| PipelineStep::Run {
        name: name.to_string(),
        command: CommandTemplate::Line(command.to_string()),
        outputs: outputs.iter().map(|value| value.to_string()).collect(),
    };
    let image = "{subject}_T2w_RPI_r";
    Ok(PipelineConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        data_dir: None,
        output_dir: None,
        naming_profile: Some(profile.to_string()),
        naming: None,
        producers: ProducersConfig {
            segmentation: ProducerConfig::single(
                "sct_deepseg_sc -i {image} -c {contrast} -o {output} -qc {qc_dir} -qc-subject {subject}",
            ),
            disc_labels: ProducerConfig::single(
                "sct_label_vertebrae -i {image} -s {segmentation} -c {contrast} -ofolder {work_dir} -qc {qc_dir} -qc-subject {subject}",
            ),
        },
        qc: QcConfig {
            log: Some(PathBuf::from("qc/resolutions.jsonl")),
            command: None,
        },
        steps: vec![
            PipelineStep::CopyInput {
                source: "{subject}/anat/{subject}_T2w.{ext}".to_string(),
                dest: "{subject}_T2w.{ext}".to_string(),
            },
            run(
                "reorient",
                "sct_image -i {subject}_T2w.{ext} -setorient RPI -o {subject}_T2w_RPI.{ext}",
                &["{subject}_T2w_RPI.{ext}"],
            ),
            run(
                "resample",
                "sct_resample -i {subject}_T2w_RPI.{ext} -mm 0.8x0.8x0.8 -o {subject}_T2w_RPI_r.{ext}",
                &["{subject}_T2w_RPI_r.{ext}"],
            ),
            PipelineStep::Resolve {
                artifact: ArtifactKind::Segmentation,
                image: image.to_string(),
                contrast: default_contrast(),
            },
            PipelineStep::Resolve {
                artifact: ArtifactKind::DiscLabels,
                image: image.to_string(),
                contrast: default_contrast(),
            },
            run(
                "register_to_template",
                "sct_register_to_template -i {subject}_T2w_RPI_r.{ext} -s {subject}_T2w_RPI_r_seg.{ext} -ldisc {subject}_T2w_RPI_r_seg_labeled_discs.{ext} -c t2 -qc {qc_dir} -qc-subject {subject}",
                &["warp_template2anat.nii.gz"],
            ),
            run(
                "warp_template",
                "sct_warp_template -d {subject}_T2w_RPI_r.{ext} -w warp_template2anat.nii.gz -a 0 -qc {qc_dir} -qc-subject {subject}",
                &[],
            ),
            run(
                "compute_csa",
                "sct_process_segmentation -i {subject}_T2w_RPI_r_seg.{ext} -vert 2:3 -vertfile label/template/PAM50_levels.nii.gz -o {output_dir}/results/csa-SC_T2w.csv -append 1",
                &[],
            ),
        ],
        expected_outputs: vec![
            "{subject}_T2w_RPI_r_seg.{ext}".to_string(),
            "{subject}_T2w_RPI_r_seg_labeled_discs.{ext}".to_string(),
            "warp_template2anat.nii.gz".to_string(),
        ],
    })
}

/// Find the config to use: explicit path, then `./cordprep.json`, then the
/// user config dir. `None` means built-in defaults.
pub fn locate_config(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(anyhow!("config not found at {}", path.display()));
        }
        return Ok(Some(path.to_path_buf()));
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Ok(Some(local));
    }
    Ok(user_config_path().filter(|path| path.is_file()))
}

/// `<config dir>/cordprep/config.json`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cordprep").join("config.json"))
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: PipelineConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    validate_config(&config).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Load the located config, or fall back to the default profile.
pub fn load_or_default(explicit: Option<&Path>) -> Result<(PipelineConfig, Option<PathBuf>)> {
    match locate_config(explicit)? {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::debug!(config = %path.display(), "loaded config");
            Ok((config, Some(path)))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok((default_config(DEFAULT_PROFILE)?, None))
        }
    }
}

/// Persist a config in a stable JSON format.
pub fn write_config(path: &Path, config: &PipelineConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Validate schema, naming, producers and every step template.
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    config.naming()?.validate().map_err(|err| anyhow!(err))?;
    for kind in ArtifactKind::ALL {
        config
            .producers
            .for_kind(kind)
            .validate(kind)
            .map_err(|err| anyhow!(err))?;
    }
    config.qc.validate().map_err(|err| anyhow!(err))?;
    if let Some(log) = &config.qc.log {
        validate_relative_path(&log.to_string_lossy(), "qc.log")?;
    }

    for (index, step) in config.steps.iter().enumerate() {
        validate_step(step).with_context(|| format!("steps[{index}] ({})", step.label()))?;
    }
    for output in &config.expected_outputs {
        check_step_placeholders(output)?;
        validate_relative_path(output, "expected_outputs")?;
    }
    Ok(())
}

fn validate_step(step: &PipelineStep) -> Result<()> {
    match step {
        PipelineStep::CopyInput { source, dest } => {
            check_step_placeholders(source)?;
            check_step_placeholders(dest)?;
            validate_relative_path(dest, "dest")?;
        }
        PipelineStep::Run {
            name,
            command,
            outputs,
        } => {
            if name.trim().is_empty() {
                return Err(anyhow!("run step name must be non-empty"));
            }
            command
                .check_placeholders(&STEP_PLACEHOLDERS)
                .map_err(|err| anyhow!(err))?;
            for output in outputs {
                check_step_placeholders(output)?;
                validate_relative_path(output, "outputs")?;
            }
        }
        PipelineStep::Resolve {
            image, contrast, ..
        } => {
            check_step_placeholders(image)?;
            if image.trim().is_empty() {
                return Err(anyhow!("resolve image must be non-empty"));
            }
            if contrast.trim().is_empty() {
                return Err(anyhow!("resolve contrast must be non-empty"));
            }
        }
    }
    Ok(())
}

fn check_step_placeholders(text: &str) -> Result<()> {
    for name in placeholders(text) {
        if !STEP_PLACEHOLDERS.contains(&name.as_str()) {
            return Err(anyhow!(
                "unknown placeholder {{{name}}} in {text:?} (allowed: {})",
                STEP_PLACEHOLDERS.join(", ")
            ));
        }
    }
    Ok(())
}

/// Expand a step path template.
pub fn expand_step_text(text: &str, vars: &Vars) -> Result<String> {
    expand_str(text, vars).map_err(|err| anyhow!(err))
}

fn validate_relative_path(rel: &str, label: &str) -> Result<()> {
    let path = Path::new(rel);
    if path.is_absolute() || has_parent_components(path) {
        return Err(anyhow!(
            "{label} entries must be relative paths without '..' (got {rel:?})"
        ));
    }
    Ok(())
}

fn has_parent_components(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
