//! Packaging step — turns a staged archive into artifacts.
//!
//! `CommandPackager` runs an external command per job. The command sees
//! the job through its environment and its last argument, writes artifacts
//! into `PROJECT_OUT_DIR`, and reports back through
//! `APP_BUILDER_TMP_DIR/build-result.json`: a JSON array of artifacts on
//! success, anything else is taken as the error message.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use foundry_core::{Artifact, JobDescriptor, JobDirs};

/// File the packaging command writes its verdict to, inside the temp dir.
pub const RESULT_FILE: &str = "build-result.json";

#[async_trait]
pub trait Packager: Send + Sync + 'static {
    /// Package one job. Errors are plain text destined for the client.
    async fn package(
        &self,
        job: &JobDescriptor,
        dirs: &JobDirs,
        cancel: CancellationToken,
    ) -> Result<Vec<Artifact>, String>;
}

pub struct CommandPackager {
    program: String,
    args: Vec<String>,
}

impl CommandPackager {
    /// `command[0]` is the program, the rest are leading arguments.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Packager for CommandPackager {
    async fn package(
        &self,
        job: &JobDescriptor,
        dirs: &JobDirs,
        cancel: CancellationToken,
    ) -> Result<Vec<Artifact>, String> {
        let descriptor = serde_json::to_string(job).map_err(|e| e.to_string())?;
        let out_dir = dirs.out_dir();

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&descriptor)
            .current_dir(&dirs.project)
            .env("PROJECT_DIR", &dirs.project)
            .env("PROJECT_OUT_DIR", &out_dir)
            .env("APP_BUILDER_TMP_DIR", &dirs.temp)
            .env("ARCHIVE_FILE", &job.archive)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", self.program, e))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| format!("packager failed: {e}"))?
            }
            _ = cancel.cancelled() => return Err("build cancelled".to_string()),
        };

        match tokio::fs::read_to_string(dirs.temp.join(RESULT_FILE)).await {
            Ok(text) => parse_result(&text, &out_dir).await,
            Err(_) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output.status.code().unwrap_or(-1);
                Err(format!("exit code {}: {}", code, stderr.trim()))
            }
            Err(e) => Err(format!("packager produced no result: {e}")),
        }
    }
}

async fn parse_result(text: &str, out_dir: &Path) -> Result<Vec<Artifact>, String> {
    let text = text.trim();
    if !text.starts_with('[') {
        return Err(text.to_string());
    }
    let mut artifacts: Vec<Artifact> =
        serde_json::from_str(text).map_err(|e| format!("malformed build result: {e}"))?;
    for artifact in &mut artifacts {
        if artifact.size.is_none() {
            if let Ok(meta) = tokio::fs::metadata(out_dir.join(&artifact.file)).await {
                artifact.size = Some(meta.len());
            }
        }
    }
    Ok(artifacts)
}
