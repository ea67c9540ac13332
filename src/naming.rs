//! File naming conventions for base images, curated overrides and local
//! artifacts.
//!
//! Conventions are plain configuration. Every path is computed by a pure
//! function of the convention and its inputs, so the several naming schemes
//! used across datasets become named profiles instead of string surgery at
//! call sites.
use crate::artifact::{ArtifactDescriptor, ArtifactKind, Subject};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTENSION: &str = "nii.gz";
pub const DEFAULT_PROFILE: &str = "labels";
pub const PROFILE_NAMES: [&str; 2] = ["labels", "manual_labels"];

/// Suffixes assigned to one artifact kind.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KindSuffixes {
    /// Suffix of the curated file in the derivatives store.
    pub override_suffix: String,
    /// Suffix of the resolved file in the working directory.
    pub local_suffix: String,
}

/// Complete naming policy for one dataset layout.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NamingConvention {
    pub derivatives_root: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Substrings removed (first occurrence each, in order) from the base
    /// name before looking up the curated override.
    #[serde(default)]
    pub strip: Vec<String>,
    pub segmentation: KindSuffixes,
    pub disc_labels: KindSuffixes,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

impl NamingConvention {
    /// Look up one of the built-in profiles by name.
    pub fn profile(name: &str) -> Option<Self> {
        match name {
            "labels" => Some(Self::with_root("derivatives/labels")),
            "manual_labels" => Some(Self::with_root("derivatives/manual_labels")),
            _ => None,
        }
    }

    fn with_root(derivatives_root: &str) -> Self {
        Self {
            derivatives_root: PathBuf::from(derivatives_root),
            extension: default_extension(),
            strip: vec!["_RPI_r".to_string()],
            segmentation: KindSuffixes {
                override_suffix: "seg-manual".to_string(),
                local_suffix: "seg".to_string(),
            },
            disc_labels: KindSuffixes {
                override_suffix: "labels-disc-manual".to_string(),
                local_suffix: "seg_labeled_discs".to_string(),
            },
        }
    }

    pub fn suffixes(&self, kind: ArtifactKind) -> &KindSuffixes {
        match kind {
            ArtifactKind::Segmentation => &self.segmentation,
            ArtifactKind::DiscLabels => &self.disc_labels,
        }
    }

    /// Check that every field can produce a usable path.
    pub fn validate(&self) -> Result<(), String> {
        if self.derivatives_root.as_os_str().is_empty() {
            return Err("naming.derivatives_root must be non-empty".to_string());
        }
        let extension = self.extension.trim();
        if extension.is_empty() || extension.starts_with('.') {
            return Err(format!(
                "naming.extension must be non-empty without a leading dot (got {:?})",
                self.extension
            ));
        }
        if self.strip.iter().any(|value| value.is_empty()) {
            return Err("naming.strip entries must be non-empty".to_string());
        }
        for kind in ArtifactKind::ALL {
            let suffixes = self.suffixes(kind);
            for (label, value) in [
                ("override_suffix", &suffixes.override_suffix),
                ("local_suffix", &suffixes.local_suffix),
            ] {
                if value.trim().is_empty() || value.contains(['/', '\\']) {
                    return Err(format!(
                        "naming.{kind}.{label} must be a non-empty file name fragment (got {value:?})"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Normalize a caller-supplied image identifier to its base name.
    ///
    /// Accepts `sub-01_T2w`, `sub-01_T2w.nii.gz` and paths ending in either.
    pub fn base_name(&self, image: &str) -> String {
        let file_name = Path::new(image)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(image);
        let dotted = format!(".{}", self.extension);
        file_name
            .strip_suffix(&dotted)
            .unwrap_or(file_name)
            .to_string()
    }

    /// Base name with every configured strip fragment removed once.
    pub fn stripped_base_name(&self, base_name: &str) -> String {
        self.strip
            .iter()
            .fold(base_name.to_string(), |name, fragment| {
                name.replacen(fragment.as_str(), "", 1)
            })
    }

    pub fn descriptor(&self, base_name: &str, kind: ArtifactKind) -> ArtifactDescriptor {
        let suffixes = self.suffixes(kind);
        ArtifactDescriptor {
            base_name: base_name.to_string(),
            kind,
            override_suffix: suffixes.override_suffix.clone(),
            local_suffix: suffixes.local_suffix.clone(),
        }
    }

    pub fn file_name(&self, stem: &str) -> String {
        format!("{stem}.{}", self.extension)
    }

    /// `<work_dir>/<base_name>.<ext>`
    pub fn base_image_path(&self, work_dir: &Path, base_name: &str) -> PathBuf {
        work_dir.join(self.file_name(base_name))
    }

    /// `<work_dir>/<base_name>_<local_suffix>.<ext>`
    pub fn local_artifact_path(&self, work_dir: &Path, descriptor: &ArtifactDescriptor) -> PathBuf {
        work_dir.join(self.local_artifact_name(descriptor))
    }

    pub fn local_artifact_name(&self, descriptor: &ArtifactDescriptor) -> String {
        self.file_name(&format!(
            "{}_{}",
            descriptor.base_name, descriptor.local_suffix
        ))
    }

    /// `<derivatives_root>/<subject>/anat/<stripped>_<override_suffix>.<ext>`
    pub fn override_path(
        &self,
        derivatives_root: &Path,
        subject: &Subject,
        descriptor: &ArtifactDescriptor,
    ) -> PathBuf {
        let stripped = self.stripped_base_name(&descriptor.base_name);
        derivatives_root
            .join(subject.as_str())
            .join("anat")
            .join(self.file_name(&format!("{stripped}_{}", descriptor.override_suffix)))
    }

    /// Resolve the configured derivatives root against the dataset root.
    pub fn derivatives_root_in(&self, data_dir: &Path) -> PathBuf {
        if self.derivatives_root.is_absolute() {
            self.derivatives_root.clone()
        } else {
            data_dir.join(&self.derivatives_root)
        }
    }
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self::with_root("derivatives/labels")
    }
}
