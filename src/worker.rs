use crate::audio::{AudioSource, DecodedAudio};
use crate::cancel::CancellationFlag;
use crate::config::Config;
use crate::events::{JobId, Stage, StageStatus, WorkerMessage};
use crate::model::{LoadOutcome, ModelManager};
use crate::state::ReadinessState;
use crate::transcriber::{SpeechModel, TranscribeOptions, Transcript};
use crate::vad::VadProcessor;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Request to transcribe one piece of audio
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: AudioSource,
    pub options: TranscribeOptions,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Decoded audio at or below this length is rejected
    pub min_samples: usize,
    /// Unload the model after this long without work
    pub idle_timeout: Option<Duration>,
    pub queue_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            min_samples: 1600,
            idle_timeout: None,
            queue_capacity: 1,
        }
    }
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_samples: config.min_samples,
            idle_timeout: config.idle_timeout(),
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

enum WorkerCommand {
    Preload { job: JobId },
    Transcribe { job: JobId, request: TranscriptionRequest },
}

/// Background worker that loads the model, decodes and transcribes off the
/// calling thread. Everything it has to say arrives as [`WorkerMessage`]s.
pub struct TranscriptionWorker {
    command_tx: Option<Sender<WorkerCommand>>,
    cancel: CancellationFlag,
    models: ModelManager,
    next_job: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl TranscriptionWorker {
    pub fn spawn(
        settings: WorkerSettings,
        models: ModelManager,
        vad: Option<VadProcessor>,
        events: Sender<WorkerMessage>,
    ) -> Result<Self> {
        let (command_tx, command_rx) = bounded::<WorkerCommand>(settings.queue_capacity.max(1));
        let cancel = CancellationFlag::new();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let pipeline = Pipeline {
            models: models.clone(),
            vad,
            min_samples: settings.min_samples,
            cancel: cancel.clone(),
            events,
        };
        let idle_timeout = settings.idle_timeout;

        let handle = thread::Builder::new()
            .name("transcription-worker".into())
            .spawn(move || {
                log::info!("Transcription worker started");
                run_loop(&runtime, &pipeline, &command_rx, idle_timeout);
                log::info!("Transcription worker shutting down");
            })?;

        Ok(Self {
            command_tx: Some(command_tx),
            cancel,
            models,
            next_job: AtomicU64::new(1),
            handle: Some(handle),
        })
    }

    /// Queue a transcription. Returns immediately.
    pub fn submit(&self, request: TranscriptionRequest) -> Result<JobId> {
        let job = self.next_job();
        self.send(WorkerCommand::Transcribe { job, request })?;
        log::debug!("Transcription job {} submitted", job);
        Ok(job)
    }

    /// Queue a model load with no audio attached.
    pub fn preload(&self) -> Result<JobId> {
        let job = self.next_job();
        self.send(WorkerCommand::Preload { job })?;
        Ok(job)
    }

    /// Ask the running job to stop at its next step boundary.
    pub fn cancel(&self) {
        log::info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> ReadinessState {
        self.models.state().get()
    }

    pub fn is_model_loaded(&self) -> bool {
        self.models.is_loaded()
    }

    /// Finish queued work and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn next_job(&self) -> JobId {
        self.next_job.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, command: WorkerCommand) -> Result<()> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| anyhow!("Transcription worker stopped"))?;
        match tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Transcription queue full, request rejected");
                Err(anyhow!("Transcription queue full"))
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("Transcription worker disconnected");
                Err(anyhow!("Transcription worker disconnected"))
            }
        }
    }

    fn stop(&mut self) {
        // closing the queue ends the worker loop
        self.command_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Transcription worker panicked");
            }
        }
    }
}

impl Drop for TranscriptionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    runtime: &tokio::runtime::Runtime,
    pipeline: &Pipeline,
    commands: &Receiver<WorkerCommand>,
    idle_timeout: Option<Duration>,
) {
    loop {
        let command = match idle_timeout {
            Some(timeout) => match commands.recv_timeout(timeout) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    if pipeline.models.is_loaded() {
                        log::info!("Idle for {:?}, unloading model", timeout);
                        pipeline.models.unload();
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            WorkerCommand::Preload { job } => runtime.block_on(pipeline.preload(job)),
            WorkerCommand::Transcribe { job, request } => runtime.block_on(pipeline.run(job, request)),
        }
    }
}

/// Why a job stopped before producing a transcript.
#[derive(Debug)]
enum StepError {
    Cancelled(Stage),
    Failed(Stage, anyhow::Error),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Cancelled(stage) => write!(f, "cancelled after {}", stage),
            StepError::Failed(stage, e) => write!(f, "{} failed: {:#}", stage, e),
        }
    }
}

struct Pipeline {
    models: ModelManager,
    vad: Option<VadProcessor>,
    min_samples: usize,
    cancel: CancellationFlag,
    events: Sender<WorkerMessage>,
}

impl Pipeline {
    fn emit(&self, message: WorkerMessage) {
        if self.events.send(message).is_err() {
            log::debug!("Message receiver dropped");
        }
    }

    fn progress(&self, job: JobId, stage: Stage, status: StageStatus, note: impl Into<String>) {
        let note = note.into();
        log::info!("[job {}] {} {:?}: {}", job, stage, status, note);
        self.emit(WorkerMessage::Progress {
            job,
            stage,
            status,
            note,
        });
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled(stage))
        } else {
            Ok(())
        }
    }

    fn finish(&self, job: JobId, outcome: Result<WorkerMessage, StepError>) {
        let message = match outcome {
            Ok(message) => message,
            Err(StepError::Cancelled(stage)) => {
                log::info!("[job {}] cancelled after {}", job, stage);
                WorkerMessage::Cancelled { job, stage }
            }
            Err(StepError::Failed(stage, e)) => {
                log::error!("[job {}] {} failed: {:#}", job, stage, e);
                WorkerMessage::Error {
                    job,
                    stage,
                    message: format!("{:#}", e),
                }
            }
        };

        if self.models.is_loaded() {
            self.models.state().transition_to_ready();
        } else {
            self.models.state().transition_to_cold();
        }
        self.emit(message);
    }

    async fn preload(&self, job: JobId) {
        self.cancel.reset();
        let outcome = self.load_model(job).await.and_then(|model| {
            self.checkpoint(Stage::ModelLoad)?;
            Ok(WorkerMessage::Ready {
                job,
                model: model.name().to_string(),
            })
        });
        self.finish(job, outcome);
    }

    async fn run(&self, job: JobId, request: TranscriptionRequest) {
        self.cancel.reset();
        let outcome = self
            .execute(job, request)
            .await
            .map(|transcript| WorkerMessage::Complete { job, transcript });
        self.finish(job, outcome);
    }

    async fn execute(&self, job: JobId, request: TranscriptionRequest) -> Result<Transcript, StepError> {
        let model = self.load_model(job).await?;
        self.checkpoint(Stage::ModelLoad)?;

        let samples = self.decode(job, request.audio).await?;
        self.checkpoint(Stage::Decode)?;

        let transcript = self.transcribe(job, model, samples, request.options).await?;
        self.checkpoint(Stage::Transcribe)?;

        Ok(transcript)
    }

    async fn load_model(&self, job: JobId) -> Result<Arc<dyn SpeechModel>, StepError> {
        let stage = Stage::ModelLoad;
        let description = self.models.describe();
        let note = if self.models.is_loaded() {
            format!("Using loaded model {}", description)
        } else {
            format!("Loading model {}", description)
        };
        self.progress(job, stage, StageStatus::Active, note);

        let models = self.models.clone();
        let outcome = blocking(stage, move || models.load()).await?;

        let note = match &outcome {
            LoadOutcome::Cached(model) => format!("Model {} already loaded", model.name()),
            LoadOutcome::Loaded(model) => format!("Model {} loaded", model.name()),
        };
        self.progress(job, stage, StageStatus::Completed, note);
        Ok(outcome.into_model())
    }

    async fn decode(&self, job: JobId, audio: AudioSource) -> Result<Vec<f32>, StepError> {
        let stage = Stage::Decode;
        self.models.state().transition_to_decoding();
        self.progress(job, stage, StageStatus::Active, format!("Decoding {}", audio.describe()));

        let vad = self.vad.clone();
        let min_samples = self.min_samples;
        let (decoded, trimmed) = blocking(stage, move || {
            let decoded = audio.decode()?;
            let trimmed = prepare_samples(&decoded, vad.as_ref(), min_samples)?;
            Ok((decoded, trimmed))
        })
        .await?;

        let mut note = format!(
            "Decoded {:.1}s of audio ({} Hz source)",
            decoded.duration_secs(),
            decoded.source_rate
        );
        if trimmed.len() != decoded.samples.len() {
            note.push_str(&format!(
                ", {:.1}s after trimming silence",
                trimmed.len() as f32 / decoded.sample_rate as f32
            ));
        }
        self.progress(job, stage, StageStatus::Completed, note);
        Ok(trimmed)
    }

    async fn transcribe(
        &self,
        job: JobId,
        model: Arc<dyn SpeechModel>,
        samples: Vec<f32>,
        options: TranscribeOptions,
    ) -> Result<Transcript, StepError> {
        let stage = Stage::Transcribe;
        self.models.state().transition_to_transcribing();
        self.progress(job, stage, StageStatus::Active, format!("Transcribing with {}", model.name()));

        let transcript = blocking(stage, move || model.transcribe(&samples, &options)).await?;

        self.progress(job, stage, StageStatus::Completed, completion_note(&transcript));
        Ok(transcript)
    }
}

fn completion_note(transcript: &Transcript) -> String {
    if transcript.is_empty() {
        "Transcription complete, no speech recognised".to_string()
    } else {
        format!("Transcription complete ({} characters)", transcript.text.chars().count())
    }
}

/// Length check and optional silence trimming on decoded audio.
fn prepare_samples(decoded: &DecodedAudio, vad: Option<&VadProcessor>, min_samples: usize) -> Result<Vec<f32>> {
    if decoded.samples.len() <= min_samples {
        return Err(anyhow!(
            "audio too short ({} samples, need more than {})",
            decoded.samples.len(),
            min_samples
        ));
    }

    match vad {
        Some(vad) => keep_speech(&decoded.samples, vad.speech_span(&decoded.samples)),
        None => Ok(decoded.samples.clone()),
    }
}

/// Apply what the detector found. A detector failure falls back to the
/// untrimmed audio.
fn keep_speech(samples: &[f32], detected: Result<Option<Range<usize>>>) -> Result<Vec<f32>> {
    match detected {
        Ok(Some(span)) => {
            log::info!("Kept {} of {} samples as speech", span.len(), samples.len());
            Ok(samples[span].to_vec())
        }
        Ok(None) => Err(anyhow!("no speech detected")),
        Err(e) => {
            log::warn!("VAD failed: {}, using untrimmed audio", e);
            Ok(samples.to_vec())
        }
    }
}

/// Run a blocking step on tokio's blocking pool and await it.
async fn blocking<T, F>(stage: Stage, f: F) -> Result<T, StepError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StepError::Failed(stage, e)),
        Err(join) => Err(StepError::Failed(stage, anyhow!("{} task aborted: {}", stage, join))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::TARGET_SAMPLE_RATE;

    fn decoded(len: usize) -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.1; len],
            sample_rate: TARGET_SAMPLE_RATE,
            source_rate: TARGET_SAMPLE_RATE,
        }
    }

    #[test]
    fn test_prepare_rejects_short_audio() {
        let err = prepare_samples(&decoded(1600), None, 1600).unwrap_err();
        assert!(err.to_string().contains("too short"));
        assert_eq!(prepare_samples(&decoded(1601), None, 1600).unwrap().len(), 1601);
    }

    #[test]
    fn test_prepare_reports_silence_as_no_speech() {
        let vad = VadProcessor::new(0.5, TARGET_SAMPLE_RATE);
        let silent = DecodedAudio {
            samples: vec![0.0; 16_000],
            ..decoded(0)
        };
        let err = prepare_samples(&silent, Some(&vad), 1600).unwrap_err();
        assert_eq!(err.to_string(), "no speech detected");
    }

    #[test]
    fn test_completion_note_counts_characters() {
        let transcript = Transcript {
            text: "grüße, señor".into(),
            segments: Vec::new(),
            language: Some("de".into()),
            duration_secs: 1.0,
        };
        assert_eq!(completion_note(&transcript), "Transcription complete (12 characters)");

        let empty = Transcript {
            text: String::new(),
            ..transcript
        };
        assert_eq!(completion_note(&empty), "Transcription complete, no speech recognised");
    }

    #[test]
    fn test_detected_span_is_kept() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let kept = keep_speech(&samples, Ok(Some(100..900))).unwrap();
        assert_eq!(kept.len(), 800);
        assert_eq!(kept[0], 100.0);
        assert_eq!(kept[799], 899.0);
    }

    #[test]
    fn test_detector_failure_keeps_everything() {
        let samples = vec![0.3f32; 500];
        let kept = keep_speech(&samples, Err(anyhow!("onnx session"))).unwrap();
        assert_eq!(kept, samples);
        assert!(keep_speech(&samples, Ok(None)).is_err());
    }

    #[test]
    fn test_step_error_display() {
        let failed = StepError::Failed(Stage::Decode, anyhow!("bad header"));
        assert_eq!(failed.to_string(), "decode failed: bad header");
        assert_eq!(
            StepError::Cancelled(Stage::ModelLoad).to_string(),
            "cancelled after model load"
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.queue_capacity = 0;
        config.idle_timeout_secs = 0;
        let settings = WorkerSettings::from(&config);
        assert_eq!(settings.queue_capacity, 1);
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.min_samples, 1600);
    }
}
