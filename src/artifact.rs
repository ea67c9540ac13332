//! Identities for subjects and the derived artifacts resolved for them.
//!
//! These types carry no filesystem state; they are lookup keys and tagged
//! results that the resolver and pipeline pass around by value.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Tag recorded for artifacts copied from the curated store.
pub const MANUAL_PRODUCER_TAG: &str = "manual";

/// One imaging session identifier (e.g. `sub-01`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Validate that the identifier can be used as a single path component.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("subject must be non-empty".to_string());
        }
        let mut components = Path::new(trimmed).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !trimmed.contains(['/', '\\']) => {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(format!(
                "subject must be a single path component (got {trimmed:?})"
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derived artifacts the resolver knows how to locate.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Segmentation,
    DiscLabels,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Segmentation, ArtifactKind::DiscLabels];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Segmentation => "segmentation",
            ArtifactKind::DiscLabels => "disc_labels",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().replace('-', "_").as_str() {
            "segmentation" | "seg" => Ok(ArtifactKind::Segmentation),
            "disc_labels" | "discs" => Ok(ArtifactKind::DiscLabels),
            other => Err(format!(
                "unknown artifact kind {other:?} (expected segmentation or disc_labels)"
            )),
        }
    }
}

/// Lookup key for one derived file: the base image it belongs to plus the
/// kind and the suffixes the active naming convention assigns to that kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub base_name: String,
    pub kind: ArtifactKind,
    pub override_suffix: String,
    pub local_suffix: String,
}

/// Which branch of the resolution policy produced the artifact.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Manual,
    Automatic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Manual => "manual",
            Provenance::Automatic => "automatic",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving one artifact for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "provenance", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Manual {
        path: PathBuf,
        source: PathBuf,
    },
    Automatic {
        path: PathBuf,
        producer: String,
    },
}

impl ResolutionOutcome {
    /// Local artifact path; identical for both branches.
    pub fn path(&self) -> &Path {
        match self {
            ResolutionOutcome::Manual { path, .. } | ResolutionOutcome::Automatic { path, .. } => {
                path
            }
        }
    }

    pub fn provenance(&self) -> Provenance {
        match self {
            ResolutionOutcome::Manual { .. } => Provenance::Manual,
            ResolutionOutcome::Automatic { .. } => Provenance::Automatic,
        }
    }

    /// Producer tag handed to quality-control reporting.
    pub fn producer_tag(&self) -> &str {
        match self {
            ResolutionOutcome::Manual { .. } => MANUAL_PRODUCER_TAG,
            ResolutionOutcome::Automatic { producer, .. } => producer,
        }
    }
}
