use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use speech_worker::transcriber::format_timestamp;
use speech_worker::{
    AudioSource, CancellationFlag, Config, JobId, ModelManager, StateManager, TranscriptionRequest,
    TranscriptionWorker, Transcript, VadProcessor, WhisperLoader, WhisperModel, WorkerMessage,
    WorkerSettings, TARGET_SAMPLE_RATE,
};

#[derive(Parser, Debug)]
#[command(name = "speech-worker", version, about = "Transcribe audio files on a background worker")]
struct Cli {
    /// Audio files to transcribe, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Config file (defaults to ~/.speech-worker/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model size: tiny.en, base.en, small.en, tiny, base, small
    #[arg(long)]
    model: Option<WhisperModel>,

    /// Use this ggml weights file instead of the managed one
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Spoken language (ISO 639-1); detected when omitted
    #[arg(long)]
    language: Option<String>,

    /// Translate to English
    #[arg(long)]
    translate: bool,

    /// Print segment timestamps
    #[arg(long)]
    timestamps: bool,

    /// Trim silence before transcribing
    #[arg(long)]
    vad: bool,

    /// Emit every worker message as a JSON line
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(path) = &self.model_path {
            config.model_path = Some(path.clone());
        }
        if let Some(language) = &self.language {
            config.language = Some(language.clone());
        }
        config.translate |= self.translate;
        config.timestamps |= self.timestamps;
        config.vad_enabled |= self.vad;
    }
}

/// How a job ended, from the controller's point of view.
enum JobEnd {
    Done,
    Failed,
    Cancelled,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    cli.apply(&mut config);
    log::info!("Config loaded: {:?}", config);

    let (event_tx, event_rx) = unbounded::<WorkerMessage>();

    let models = ModelManager::new(Arc::new(WhisperLoader::new(config.clone())), StateManager::new());
    let vad = config
        .vad_enabled
        .then(|| VadProcessor::new(config.vad_threshold, TARGET_SAMPLE_RATE));
    let worker = TranscriptionWorker::spawn(WorkerSettings::from(&config), models, vad, event_tx)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    watch_interrupts(worker.cancel_flag(), interrupted.clone());

    let options = config.transcribe_options();
    let mut failures = 0usize;

    for path in &cli.files {
        if interrupted.load(Ordering::SeqCst) {
            log::warn!("Interrupted, skipping remaining files");
            break;
        }

        let request = TranscriptionRequest {
            audio: AudioSource::File(path.clone()),
            options: options.clone(),
        };
        let job = worker.submit(request)?;
        log::info!("Submitted {} as job {}", path.display(), job);

        match relay(job, &event_rx, &cli, &worker.cancel_flag(), &interrupted)? {
            JobEnd::Done => {}
            JobEnd::Failed | JobEnd::Cancelled => failures += 1,
        }
    }

    worker.shutdown();

    if failures > 0 || interrupted.load(Ordering::SeqCst) {
        return Err(anyhow!("{} of {} files not transcribed", failures, cli.files.len()));
    }
    Ok(())
}

/// Forward worker messages for `job` until its terminal message arrives.
///
/// The worker clears the cancel flag when a job starts, so an interrupt that
/// landed while the job was still queued is re-applied once it is running.
fn relay(
    job: JobId,
    events: &Receiver<WorkerMessage>,
    cli: &Cli,
    cancel: &CancellationFlag,
    interrupted: &AtomicBool,
) -> Result<JobEnd> {
    let mut started = false;
    loop {
        let message = events
            .recv()
            .map_err(|_| anyhow!("Transcription worker exited unexpectedly"))?;

        if cli.json {
            println!("{}", serde_json::to_string(&message)?);
        }

        if message.job() != job {
            continue;
        }
        if !started {
            started = true;
            if interrupted.load(Ordering::SeqCst) {
                cancel.cancel();
            }
        }
        if !message.is_terminal() {
            continue;
        }

        return Ok(match message {
            WorkerMessage::Complete { transcript, .. } => {
                if !cli.json {
                    print_transcript(&transcript, cli.timestamps);
                }
                JobEnd::Done
            }
            WorkerMessage::Error { stage, message, .. } => {
                log::error!("Job {} failed during {}: {}", job, stage, message);
                JobEnd::Failed
            }
            WorkerMessage::Cancelled { stage, .. } => {
                log::warn!("Job {} cancelled after {}", job, stage);
                JobEnd::Cancelled
            }
            _ => JobEnd::Done,
        });
    }
}

fn print_transcript(transcript: &Transcript, timestamps: bool) {
    if transcript.is_empty() {
        log::warn!("No speech recognised");
        return;
    }
    if timestamps && !transcript.segments.is_empty() {
        for segment in &transcript.segments {
            println!(
                "[{} --> {}] {}",
                format_timestamp(segment.start_secs),
                format_timestamp(segment.end_secs),
                segment.text
            );
        }
    } else {
        println!("{}", transcript.text);
    }
}

/// Ctrl-C cancels the running job and stops further submissions.
fn watch_interrupts(cancel: CancellationFlag, interrupted: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("interrupt-watcher".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::warn!("Ctrl-C handling unavailable: {}", e);
                    return;
                }
            };
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupt received, cancelling");
                    interrupted.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
            });
        });

    if let Err(e) = spawned {
        log::warn!("Failed to start interrupt watcher: {}", e);
    }
}
