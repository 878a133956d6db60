use serde::Serialize;
use std::fmt;

use crate::transcriber::Transcript;

/// Identifier handed out by the worker for every submitted job.
pub type JobId = u64;

/// The three steps every transcription job walks through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ModelLoad,
    Decode,
    Transcribe,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ModelLoad => "model load",
            Stage::Decode => "decode",
            Stage::Transcribe => "transcribe",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Active,
    Completed,
}

/// Messages sent from the background worker to the controlling thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// A stage started or finished
    Progress {
        job: JobId,
        stage: Stage,
        #[serde(rename = "state")]
        status: StageStatus,
        note: String,
    },
    /// Preload finished, model is resident
    Ready { job: JobId, model: String },
    /// Transcription finished with a result
    Complete { job: JobId, transcript: Transcript },
    /// Cancellation flag was observed after `stage` finished
    Cancelled { job: JobId, stage: Stage },
    /// A stage failed; `message` carries the whole error chain
    Error {
        job: JobId,
        stage: Stage,
        message: String,
    },
}

impl WorkerMessage {
    pub fn job(&self) -> JobId {
        match self {
            WorkerMessage::Progress { job, .. }
            | WorkerMessage::Ready { job, .. }
            | WorkerMessage::Complete { job, .. }
            | WorkerMessage::Cancelled { job, .. }
            | WorkerMessage::Error { job, .. } => *job,
        }
    }

    /// Terminal messages end a job; nothing else is sent for it afterwards.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerMessage::Progress { .. })
    }
}
