//! Decode step: turn whatever the caller hands us into 16 kHz mono f32.

use anyhow::{anyhow, Context, Result};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate the speech model expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Audio handed to the worker for transcription.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// A file on disk in any container symphonia can probe
    File(PathBuf),
    /// An encoded buffer, e.g. an upload
    Encoded {
        bytes: Vec<u8>,
        mime_type: Option<String>,
    },
    /// Already-decoded mono samples at any rate
    Pcm { samples: Vec<f32>, sample_rate: u32 },
}

#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub source_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

impl AudioSource {
    pub fn describe(&self) -> String {
        match self {
            AudioSource::File(path) => path.display().to_string(),
            AudioSource::Encoded { bytes, mime_type } => format!(
                "{} byte {} buffer",
                bytes.len(),
                mime_type.as_deref().unwrap_or("audio")
            ),
            AudioSource::Pcm { samples, sample_rate } => {
                format!("{} samples at {} Hz", samples.len(), sample_rate)
            }
        }
    }

    pub fn decode(&self) -> Result<DecodedAudio> {
        match self {
            AudioSource::File(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let hint = hint_for_path(path);
                decode_with_hint(bytes, hint)
            }
            AudioSource::Encoded { bytes, mime_type } => decode_audio(bytes, mime_type.as_deref()),
            AudioSource::Pcm { samples, sample_rate } => {
                if *sample_rate == 0 {
                    return Err(anyhow!("sample rate must be non-zero"));
                }
                let resampled = resample(samples, *sample_rate, TARGET_SAMPLE_RATE)?;
                Ok(DecodedAudio {
                    samples: resampled,
                    sample_rate: TARGET_SAMPLE_RATE,
                    source_rate: *sample_rate,
                })
            }
        }
    }
}

/// Decode encoded audio bytes into 16 kHz mono samples.
pub fn decode_audio(data: &[u8], mime_type: Option<&str>) -> Result<DecodedAudio> {
    let mut hint = Hint::new();
    if let Some(mime) = mime_type {
        hint.mime_type(mime);
        if let Some(ext) = extension_for_mime(mime) {
            hint.with_extension(ext);
        }
    }
    decode_with_hint(data.to_vec(), hint)
}

fn hint_for_path(path: &Path) -> Hint {
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    hint
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "audio/wav" | "audio/wave" | "audio/x-wav" => Some("wav"),
        "audio/m4a" | "audio/mp4" | "audio/x-m4a" | "audio/aac" => Some("m4a"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/ogg" => Some("ogg"),
        _ => None,
    }
}

fn decode_with_hint(data: Vec<u8>, hint: Hint) -> Result<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| anyhow!("unrecognised audio container: {}", e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("unsupported codec: {}", e))?;

    let mut source_rate = codec_params.sample_rate.unwrap_or(TARGET_SAMPLE_RATE);
    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(anyhow!("failed to read packet: {}", e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("Skipping corrupt packet: {}", e);
                continue;
            }
            Err(e) => return Err(anyhow!("decode failed: {}", e)),
        };

        let spec = *decoded.spec();
        source_rate = spec.rate;
        let channels = spec.channels.count().max(1);

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        if channels == 1 {
            mono.extend_from_slice(buffer.samples());
        } else {
            for frame in buffer.samples().chunks(channels) {
                mono.push(frame.iter().sum::<f32>() / channels as f32);
            }
        }
    }

    if mono.is_empty() {
        return Err(anyhow!("no audio samples decoded"));
    }

    log::debug!(
        "Decoded {} samples at {} Hz",
        mono.len(),
        source_rate
    );

    let samples = resample(&mono, source_rate, TARGET_SAMPLE_RATE)?;
    Ok(DecodedAudio {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
        source_rate,
    })
}

/// Resample mono audio in one pass. Identity rates return a copy.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| anyhow!("Resampler creation failed: {}", e))?;

    let input = vec![samples.to_vec()];
    let mut output = resampler
        .process(&input, None)
        .map_err(|e| anyhow!("Resampling failed: {}", e))?;

    Ok(output.swap_remove(0))
}
