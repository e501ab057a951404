//! Job model — build requests, job descriptors, working directories and outcomes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the directory under the project dir that receives artifacts.
pub const OUT_DIR_NAME: &str = "out";

/// Default zstd level when the client does not send one.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = -1;

// ── Targets ───────────────────────────────────────────────────────────────────

/// One packaging target requested by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpacked_dir_name: Option<String>,
}

impl TargetInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arch: None,
            unpacked_dir_name: None,
        }
    }
}

// ── Request validation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Header {0} is not specified")]
    MissingHeader(&'static str),
    #[error("Header x-targets is malformed: {0}")]
    MalformedTargets(String),
    #[error("Header x-zstd-compression-level is malformed: {0}")]
    MalformedCompression(String),
    /// The upload was staged but its reference never reached us.
    /// Not a client error.
    #[error("Internal error: header x-file is not specified")]
    MissingArchive,
}

impl ValidationError {
    /// True when the failure is the client's fault (400) rather than ours (500).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ValidationError::MissingArchive)
    }
}

/// Build request exactly as it arrived, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawBuildRequest {
    /// Every `x-targets` header value, in order.
    pub targets: Vec<String>,
    pub platform: Option<String>,
    /// `x-file`, the reference to the already-staged upload.
    pub archive: Option<String>,
    pub compression_level: Option<String>,
}

impl RawBuildRequest {
    /// Resolve the staged archive path, applying the optional directory prefix.
    pub fn archive_path(&self, prefix: Option<&Path>) -> Option<PathBuf> {
        let archive = self.archive.as_deref().filter(|a| !a.is_empty())?;
        Some(match prefix {
            Some(prefix) => PathBuf::from(format!("{}{}", prefix.display(), archive)),
            None => PathBuf::from(archive),
        })
    }

    /// Validate headers and build the job descriptor.
    ///
    /// Order matters: client errors are reported before the missing-archive
    /// inconsistency so a bad request never surfaces as a 500.
    pub fn validate(&self, prefix: Option<&Path>) -> Result<JobDescriptor, ValidationError> {
        if self.targets.is_empty() {
            return Err(ValidationError::MissingHeader("x-targets"));
        }
        let platform = match self.platform.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return Err(ValidationError::MissingHeader("x-platform")),
        };
        let targets = parse_targets(&self.targets)?;
        let compression_level = match self.compression_level.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_COMPRESSION_LEVEL,
            Some(raw) => raw
                .parse()
                .map_err(|_| ValidationError::MalformedCompression(raw.to_string()))?,
        };
        let archive = self
            .archive_path(prefix)
            .ok_or(ValidationError::MissingArchive)?;

        Ok(JobDescriptor {
            archive,
            platform,
            targets,
            compression_level,
            archive_size: None,
            upload_time_ms: None,
        })
    }
}

/// Parse `x-targets` values: JSON arrays/objects of `TargetInfo`, or plain
/// comma-separated target names.
fn parse_targets(values: &[String]) -> Result<Vec<TargetInfo>, ValidationError> {
    let mut targets = Vec::new();
    for value in values {
        let value = value.trim();
        if value.starts_with('[') {
            let parsed: Vec<TargetInfo> = serde_json::from_str(value)
                .map_err(|e| ValidationError::MalformedTargets(e.to_string()))?;
            targets.extend(parsed);
        } else if value.starts_with('{') {
            let parsed: TargetInfo = serde_json::from_str(value)
                .map_err(|e| ValidationError::MalformedTargets(e.to_string()))?;
            targets.push(parsed);
        } else {
            targets.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(TargetInfo::named),
            );
        }
    }

    if targets.is_empty() {
        return Err(ValidationError::MalformedTargets("no targets".to_string()));
    }
    for target in &targets {
        if target.name.trim().is_empty() {
            return Err(ValidationError::MalformedTargets("empty target name".to_string()));
        }
        if let Some(dir) = &target.unpacked_dir_name {
            if dir.is_empty() || dir.contains('/') || dir.contains('\\') || dir == ".." {
                return Err(ValidationError::MalformedTargets(format!(
                    "invalid unpackedDirName: {dir}"
                )));
            }
        }
    }
    Ok(targets)
}

// ── Descriptor ────────────────────────────────────────────────────────────────

/// Everything the packaging worker needs. Immutable once handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub archive: PathBuf,
    pub platform: String,
    pub targets: Vec<TargetInfo>,
    pub compression_level: i32,
    /// Stats only, not required for the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_time_ms: Option<u64>,
}

// ── Working directories ───────────────────────────────────────────────────────

/// Per-job working directories. A job owns exactly one of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirs {
    /// Unpacked project; artifacts land in `project/out`.
    pub project: PathBuf,
    /// Scratch space for the packager.
    pub temp: PathBuf,
}

impl JobDirs {
    pub fn for_job(stage_root: &Path, temp_root: &Path, job_id: &str) -> Self {
        Self {
            project: stage_root.join(job_id),
            temp: temp_root.join(job_id),
        }
    }

    pub fn out_dir(&self) -> PathBuf {
        self.project.join(OUT_DIR_NAME)
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

/// One produced file, relative to the job's out directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_artifact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Settlement of one job. Produced once, consumed once.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub result: Result<Vec<Artifact>, String>,
    /// Milliseconds between enqueue and start.
    pub queue_ms: u64,
    /// Milliseconds spent packaging.
    pub build_ms: u64,
}
