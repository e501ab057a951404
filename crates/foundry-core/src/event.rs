//! Build notification events — the out-of-band channel a client listens on.
//!
//! Each event is POSTed to `/publish-build-event?id={job_id}` with the body
//! framed as the decimal byte length of the JSON payload followed by the
//! payload itself: `17{"state":"added"}`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::job::Artifact;

/// Transitional job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Added,
    Started,
}

/// One notification. `Failed` and `Completed` are terminal; exactly one of
/// them is published per admitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildEvent {
    State { state: JobState },
    Failed { error: String },
    Completed { files: Vec<Artifact> },
}

impl BuildEvent {
    pub fn added() -> Self {
        BuildEvent::State {
            state: JobState::Added,
        }
    }

    pub fn started() -> Self {
        BuildEvent::State {
            state: JobState::Started,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        BuildEvent::Failed {
            error: error.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildEvent::State { .. })
    }

    /// Length-prefixed wire body.
    pub fn frame(&self) -> Result<Bytes, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        let len = payload.len().to_string();
        let mut buf = BytesMut::with_capacity(len.len() + payload.len());
        buf.put_slice(len.as_bytes());
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Inverse of `frame`, for listeners and tests.
    pub fn unframe(body: &[u8]) -> Option<Self> {
        let digits = body.iter().take_while(|b| b.is_ascii_digit()).count();
        let len: usize = std::str::from_utf8(&body[..digits]).ok()?.parse().ok()?;
        let payload = body.get(digits..digits + len)?;
        if digits + len != body.len() {
            return None;
        }
        serde_json::from_slice(payload).ok()
    }
}
