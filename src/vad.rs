use anyhow::{anyhow, Result};
use std::ops::Range;
use voice_activity_detector::VoiceActivityDetector;

/// Finds where speech starts and ends in decoded audio.
#[derive(Debug, Clone)]
pub struct VadProcessor {
    threshold: f32,
    sample_rate: u32,
}

impl VadProcessor {
    pub fn new(threshold: f32, sample_rate: u32) -> Self {
        Self {
            threshold,
            sample_rate,
        }
    }

    /// Silero accepts 256-sample windows at 8 kHz and 512 otherwise.
    fn window(&self) -> usize {
        if self.sample_rate == 8000 {
            256
        } else {
            512
        }
    }

    /// 50 ms either side of the voiced region.
    fn padding(&self) -> usize {
        self.sample_rate as usize / 20
    }

    /// Anything shorter than 100 ms is treated as a click, not speech.
    fn min_span(&self) -> usize {
        self.sample_rate as usize / 10
    }

    /// Sample range holding speech, padded, or `None` if there is none.
    pub fn speech_span(&self, samples: &[f32]) -> Result<Option<Range<usize>>> {
        let window = self.window();
        let mut detector = VoiceActivityDetector::builder()
            .sample_rate(self.sample_rate as i64)
            .chunk_size(window)
            .build()
            .map_err(|e| anyhow!("VAD creation failed: {}", e))?;

        let scores = samples.chunks_exact(window).map(|frame| {
            detector.predict(frame.iter().map(|&s| (s * i16::MAX as f32) as i16))
        });
        let span = self.span_from_scores(scores, samples.len());

        match &span {
            Some(range) => log::debug!(
                "VAD: speech in {}..{} of {} samples",
                range.start,
                range.end,
                samples.len()
            ),
            None => log::info!("VAD: nothing above {:.2}", self.threshold),
        }
        Ok(span)
    }

    /// Turn per-window speech probabilities into a padded sample range.
    fn span_from_scores(&self, scores: impl IntoIterator<Item = f32>, total: usize) -> Option<Range<usize>> {
        let window = self.window();
        let mut voiced = scores
            .into_iter()
            .enumerate()
            .filter(|&(_, p)| p > self.threshold)
            .map(|(i, _)| i);

        let first = voiced.next()?;
        let last = voiced.last().unwrap_or(first);

        let start = (first * window).saturating_sub(self.padding());
        let end = ((last + 1) * window + self.padding()).min(total);
        (end - start >= self.min_span()).then_some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_has_no_speech() {
        let vad = VadProcessor::new(0.5, 16_000);
        let silence = vec![0.0f32; 16_000];
        assert!(vad.speech_span(&silence).unwrap().is_none());
    }

    #[test]
    fn test_shorter_than_one_window_has_no_speech() {
        let vad = VadProcessor::new(0.5, 16_000);
        assert!(vad.speech_span(&[0.1; 100]).unwrap().is_none());
    }

    #[test]
    fn test_span_covers_voiced_windows_with_padding() {
        let vad = VadProcessor::new(0.5, 16_000);
        // windows 2..=5 voiced, 512 samples each, 800 samples padding
        let scores = [0.1, 0.2, 0.9, 0.7, 0.3, 0.8, 0.1, 0.0];
        let span = vad.span_from_scores(scores, 8 * 512).unwrap();
        assert_eq!(span, (2 * 512 - 800)..(6 * 512 + 800));
    }

    #[test]
    fn test_span_is_clamped_to_audio() {
        let vad = VadProcessor::new(0.5, 16_000);
        let span = vad.span_from_scores([0.9; 4], 4 * 512).unwrap();
        assert_eq!(span, 0..4 * 512);
    }

    #[test]
    fn test_single_window_still_counts() {
        let vad = VadProcessor::new(0.5, 16_000);
        // 512 + 2 * 800 padding clears the 1600-sample minimum
        let span = vad.span_from_scores([0.0, 0.0, 0.0, 0.9, 0.0, 0.0, 0.0], 7 * 512).unwrap();
        assert_eq!(span.len(), 512 + 1600);
    }

    #[test]
    fn test_short_clip_is_not_speech() {
        let vad = VadProcessor::new(0.5, 16_000);
        // whole clip is one window, below the 100 ms minimum
        assert!(vad.span_from_scores([0.9], 512).is_none());
    }

    #[test]
    fn test_below_threshold_is_not_speech() {
        let vad = VadProcessor::new(0.5, 16_000);
        assert!(vad.span_from_scores([0.5, 0.4, 0.49], 3 * 512).is_none());
    }
}
