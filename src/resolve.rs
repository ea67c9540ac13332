//! Manual-versus-automatic artifact resolution.
//!
//! A curated override in the derivatives store always wins over automatic
//! computation. Resolution is a single decision per artifact with no retry:
//! either the curated file is copied into the working directory or the
//! kind's producer is invoked once, and the outcome records which happened.
use crate::artifact::{ArtifactKind, ResolutionOutcome, Subject};
use crate::naming::NamingConvention;
use crate::producer::{ArtifactProducer, ProducerJob};
use crate::qc::{QcRecord, QualityControlReporter};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("base image {} not found in working directory", path.display())]
    MissingBaseImage { path: PathBuf },
    #[error("{kind} producer `{tag}` failed: {detail}")]
    ProducerFailure {
        kind: ArtifactKind,
        tag: String,
        detail: String,
    },
    #[error("copy curated {kind} {} -> {}: {source}", from.display(), to.display())]
    CopyFailure {
        kind: ArtifactKind,
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// One producer per artifact kind.
pub struct Producers<'a> {
    pub segmentation: &'a dyn ArtifactProducer,
    pub disc_labels: &'a dyn ArtifactProducer,
}

impl Producers<'_> {
    pub fn for_kind(&self, kind: ArtifactKind) -> &dyn ArtifactProducer {
        match kind {
            ArtifactKind::Segmentation => self.segmentation,
            ArtifactKind::DiscLabels => self.disc_labels,
        }
    }
}

/// Paths every resolution in one working directory shares.
#[derive(Debug, Clone)]
pub struct ResolverPaths {
    pub work_dir: PathBuf,
    /// Absolute curated-derivatives root.
    pub derivatives_root: PathBuf,
    pub qc_dir: PathBuf,
}

/// Where a resolution would look and write, without touching anything.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolutionPlan {
    pub kind: ArtifactKind,
    pub base_name: String,
    pub base_image: PathBuf,
    pub override_path: PathBuf,
    pub local_path: PathBuf,
    pub override_present: bool,
}

pub struct ArtifactResolver<'a> {
    naming: &'a NamingConvention,
    paths: ResolverPaths,
    producers: Producers<'a>,
    reporters: Vec<&'a dyn QualityControlReporter>,
}

impl<'a> ArtifactResolver<'a> {
    pub fn new(naming: &'a NamingConvention, paths: ResolverPaths, producers: Producers<'a>) -> Self {
        Self {
            naming,
            paths,
            producers,
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: &'a dyn QualityControlReporter) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Compute paths and the branch `resolve` would take right now.
    pub fn plan(
        &self,
        base_image: &str,
        kind: ArtifactKind,
        subject: &Subject,
    ) -> Result<ResolutionPlan, ResolveError> {
        self.naming.validate().map_err(ResolveError::Configuration)?;
        let base_name = self.naming.base_name(base_image);
        if base_name.is_empty() {
            return Err(ResolveError::Configuration(format!(
                "base image identifier {base_image:?} is empty"
            )));
        }
        let descriptor = self.naming.descriptor(&base_name, kind);
        let override_path =
            self.naming
                .override_path(&self.paths.derivatives_root, subject, &descriptor);
        Ok(ResolutionPlan {
            kind: descriptor.kind,
            base_image: self.naming.base_image_path(&self.paths.work_dir, &base_name),
            base_name,
            local_path: self
                .naming
                .local_artifact_path(&self.paths.work_dir, &descriptor),
            override_present: override_path.is_file(),
            override_path,
        })
    }

    /// Resolve one artifact, preferring the curated override.
    ///
    /// On success a file exists at the conventional local artifact path.
    pub fn resolve(
        &self,
        base_image: &str,
        kind: ArtifactKind,
        subject: &Subject,
        contrast: &str,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let plan = self.plan(base_image, kind, subject)?;
        if !plan.base_image.is_file() {
            return Err(ResolveError::MissingBaseImage {
                path: plan.base_image,
            });
        }

        let outcome = if plan.override_present {
            copy_override(kind, &plan.override_path, &plan.local_path)?;
            ResolutionOutcome::Manual {
                path: plan.local_path.clone(),
                source: plan.override_path.clone(),
            }
        } else {
            let producer = self.producers.for_kind(kind);
            self.produce(producer, &plan, subject, contrast)?;
            ResolutionOutcome::Automatic {
                path: plan.local_path.clone(),
                producer: producer.tag().to_string(),
            }
        };

        tracing::info!(
            subject = %subject,
            kind = %kind,
            provenance = %outcome.provenance(),
            producer = outcome.producer_tag(),
            artifact = %outcome.path().display(),
            "artifact resolved"
        );
        self.report(subject, kind, &plan.base_image, &outcome);
        Ok(outcome)
    }

    fn produce(
        &self,
        producer: &dyn ArtifactProducer,
        plan: &ResolutionPlan,
        subject: &Subject,
        contrast: &str,
    ) -> Result<(), ResolveError> {
        let segmentation = self.naming.local_artifact_path(
            &self.paths.work_dir,
            &self.naming.descriptor(&plan.base_name, ArtifactKind::Segmentation),
        );
        let job = ProducerJob {
            kind: plan.kind,
            subject,
            image: &plan.base_image,
            image_name: &plan.base_name,
            contrast,
            output: &plan.local_path,
            segmentation: &segmentation,
            work_dir: &self.paths.work_dir,
            qc_dir: &self.paths.qc_dir,
            extension: &self.naming.extension,
        };
        tracing::debug!(kind = %plan.kind, producer = producer.tag(), "no curated override, producing");
        // A leftover artifact from an earlier run must not pass the output check.
        if plan.local_path.is_file() {
            std::fs::remove_file(&plan.local_path).map_err(|err| ResolveError::ProducerFailure {
                kind: plan.kind,
                tag: producer.tag().to_string(),
                detail: format!("remove stale {}: {err}", plan.local_path.display()),
            })?;
            tracing::debug!(artifact = %plan.local_path.display(), "removed stale artifact");
        }
        producer
            .produce(&job)
            .map_err(|err| ResolveError::ProducerFailure {
                kind: plan.kind,
                tag: err.tag,
                detail: err.detail,
            })?;
        if !plan.local_path.is_file() {
            return Err(ResolveError::ProducerFailure {
                kind: plan.kind,
                tag: producer.tag().to_string(),
                detail: format!("no artifact written at {}", plan.local_path.display()),
            });
        }
        Ok(())
    }

    fn report(&self, subject: &Subject, kind: ArtifactKind, image: &Path, outcome: &ResolutionOutcome) {
        let record = QcRecord {
            subject,
            kind,
            image,
            outcome,
        };
        for reporter in &self.reporters {
            if let Err(err) = reporter.record(&record) {
                tracing::warn!(subject = %subject, kind = %kind, error = %err, "qc report failed");
            }
        }
    }
}

/// Copy through a temp file in the destination directory, then rename, so a
/// half-written artifact never sits at the local path.
fn copy_override(kind: ArtifactKind, from: &Path, to: &Path) -> Result<(), ResolveError> {
    let copy_failure = |source: io::Error| ResolveError::CopyFailure {
        kind,
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    let dir = to.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir).map_err(copy_failure)?;
    std::fs::copy(from, tmp.path()).map_err(copy_failure)?;
    tmp.persist(to).map_err(|err| copy_failure(err.error))?;
    tracing::debug!(kind = %kind, from = %from.display(), "copied curated override");
    Ok(())
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
