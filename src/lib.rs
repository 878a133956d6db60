//! Background speech-to-text worker.
//!
//! A [`TranscriptionWorker`] owns one thread that loads a whisper model,
//! decodes audio and runs inference, reporting each stage to the caller as
//! [`WorkerMessage`]s over a channel. Jobs can be cancelled between stages.

pub mod audio;
pub mod cancel;
pub mod config;
pub mod events;
pub mod model;
pub mod state;
pub mod transcriber;
pub mod vad;
pub mod worker;

pub use audio::{AudioSource, DecodedAudio, TARGET_SAMPLE_RATE};
pub use cancel::CancellationFlag;
pub use config::{Config, WhisperModel};
pub use events::{JobId, Stage, StageStatus, WorkerMessage};
pub use model::{LoadOutcome, ModelLoader, ModelManager, WhisperLoader};
pub use state::{ReadinessState, StateManager};
pub use transcriber::{Segment, SpeechModel, TranscribeOptions, Transcript, WhisperTranscriber};
pub use vad::VadProcessor;
pub use worker::{TranscriptionRequest, TranscriptionWorker, WorkerSettings};
