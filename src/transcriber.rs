use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::Path;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::TARGET_SAMPLE_RATE;

/// Whisper emits this for inputs without speech.
const BLANK_AUDIO: &str = "[BLANK_AUDIO]";

/// Something that turns 16 kHz mono samples into text.
pub trait SpeechModel: Send + Sync {
    fn name(&self) -> &str;

    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    /// ISO 639-1 code; `None` lets the model detect it
    pub language: Option<String>,
    pub translate: bool,
    pub timestamps: bool,
    pub threads: usize,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            translate: false,
            timestamps: false,
            threads: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub start_secs: f32,
    pub end_secs: f32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub duration_secs: f32,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// `mm:ss.mmm`, or `h:mm:ss.mmm` past the hour.
pub fn format_timestamp(secs: f32) -> String {
    let total_ms = (secs.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs / 60) % 60, total_secs % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}.{ms:03}")
    } else {
        format!("{minutes:02}:{seconds:02}.{ms:03}")
    }
}

fn clean_segment_text(raw: &str) -> String {
    raw.replace(BLANK_AUDIO, "").trim().to_string()
}

/// Language and translate flag actually passed to the model. English-only
/// weights can neither detect nor translate.
fn effective_language(multilingual: bool, options: &TranscribeOptions) -> (&str, bool) {
    if multilingual {
        (options.language.as_deref().unwrap_or("auto"), options.translate)
    } else {
        if options.language.as_deref().is_some_and(|l| l != "en") || options.translate {
            log::warn!("Model is English-only, ignoring language/translate options");
        }
        ("en", false)
    }
}

pub struct WhisperTranscriber {
    ctx: WhisperContext,
    name: String,
    multilingual: bool,
}

impl WhisperTranscriber {
    pub fn new(model_path: &Path, use_gpu: bool) -> Result<Self> {
        log::info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(anyhow!(
                "Model not found at {:?}. Please download a model first.",
                model_path
            ));
        }

        let path_str = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Model path is not valid UTF-8: {:?}", model_path))?;

        let mut params = WhisperContextParameters::default();
        params.use_gpu(use_gpu);

        let ctx = WhisperContext::new_with_params(path_str, params)
            .map_err(|e| anyhow!("Failed to load model: {}", e))?;

        let name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "whisper".to_string());

        let multilingual = ctx.is_multilingual();
        log::info!("Model loaded successfully (multilingual: {})", multilingual);
        Ok(Self { ctx, name, multilingual })
    }

    pub fn warmup(&self) -> Result<()> {
        log::info!("Warming up model...");
        let silent = vec![0.0f32; TARGET_SAMPLE_RATE as usize];
        let mut state = self.ctx.create_state()?;
        let params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        state.full(params, &silent)?;
        log::info!("Warmup complete");
        Ok(())
    }
}

impl SpeechModel for WhisperTranscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
        let mut state = self.ctx.create_state()?;
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        let (language, translate) = effective_language(self.multilingual, options);
        params.set_n_threads(options.threads as i32);
        params.set_language(Some(language));
        params.set_translate(translate);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(true);
        params.set_no_context(true);
        params.set_no_timestamps(!options.timestamps);
        params.set_single_segment(!options.timestamps);

        state.full(params, samples)?;

        let num_segments = state.full_n_segments()?;
        let mut text = String::new();
        let mut segments = Vec::new();

        for i in 0..num_segments {
            let Ok(raw) = state.full_get_segment_text(i) else {
                continue;
            };
            let cleaned = clean_segment_text(&raw);
            if cleaned.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&cleaned);

            if options.timestamps {
                // whisper reports centiseconds
                let t0 = state.full_get_segment_t0(i)?;
                let t1 = state.full_get_segment_t1(i)?;
                segments.push(Segment {
                    start_secs: t0 as f32 / 100.0,
                    end_secs: t1 as f32 / 100.0,
                    text: cleaned,
                });
            }
        }

        Ok(Transcript {
            text,
            segments,
            language: (language != "auto").then(|| language.to_string()),
            duration_secs: samples.len() as f32 / TARGET_SAMPLE_RATE as f32,
        })
    }
}
