//! Energy-based utterance segmentation
//!
//! Deliberately simple: a fixed amplitude threshold splits speech from
//! silence, which is good enough for a close microphone in a quiet
//! room and costs nothing per sample.

/// Amplitude at or above which a chunk counts as speech
const SPEECH_THRESHOLD: i16 = 1000;

/// Silence length that ends an utterance
const SILENCE_LIMIT_MS: u64 = 2000;

/// Hard cap on utterance length
const MAX_UTTERANCE_MS: u64 = 10_000;

/// Utterances shorter than this are discarded as noise
const MIN_UTTERANCE_MS: u64 = 250;

/// Splits a continuous sample stream into utterances
pub struct UtteranceSegmenter {
    silence_limit: usize,
    max_samples: usize,
    min_samples: usize,
    buffer: Vec<i16>,
    in_speech: bool,
    trailing_silence: usize,
}

impl UtteranceSegmenter {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        let per_ms = sample_rate as usize / 1000;
        Self {
            silence_limit: per_ms * SILENCE_LIMIT_MS as usize,
            max_samples: per_ms * MAX_UTTERANCE_MS as usize,
            min_samples: per_ms * MIN_UTTERANCE_MS as usize,
            buffer: Vec::new(),
            in_speech: false,
            trailing_silence: 0,
        }
    }

    /// Feed a chunk; returns a completed utterance when one ends
    pub fn push(&mut self, chunk: &[i16]) -> Option<Vec<i16>> {
        let peak = chunk.iter().map(|&s| i32::from(s).abs()).max().unwrap_or(0);
        let is_speech = peak >= i32::from(SPEECH_THRESHOLD);

        if !self.in_speech {
            if !is_speech {
                return None;
            }
            self.in_speech = true;
            self.trailing_silence = 0;
        }

        self.buffer.extend_from_slice(chunk);

        if is_speech {
            self.trailing_silence = 0;
        } else {
            self.trailing_silence += chunk.len();
        }

        if self.trailing_silence >= self.silence_limit || self.buffer.len() >= self.max_samples {
            return self.finish();
        }
        None
    }

    /// Whether speech is currently being buffered
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    fn finish(&mut self) -> Option<Vec<i16>> {
        // Judge length on the speech portion only, not the silence tail
        let speech_len = self.buffer.len().saturating_sub(self.trailing_silence);
        let utterance = std::mem::take(&mut self.buffer);
        self.in_speech = false;
        self.trailing_silence = 0;

        if speech_len >= self.min_samples {
            Some(utterance)
        } else {
            tracing::debug!(samples = speech_len, "discarding too-short utterance");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    fn speech(ms: usize) -> Vec<i16> {
        vec![5000; RATE as usize / 1000 * ms]
    }

    fn silence(ms: usize) -> Vec<i16> {
        vec![10; RATE as usize / 1000 * ms]
    }

    #[test]
    fn utterance_ends_after_silence_limit() {
        let mut seg = UtteranceSegmenter::new(RATE);

        assert!(seg.push(&silence(500)).is_none());
        assert!(seg.push(&speech(1000)).is_none());
        assert!(seg.in_speech());
        assert!(seg.push(&silence(1000)).is_none());

        let utterance = seg.push(&silence(1100)).expect("utterance should close");
        // Speech plus the trailing silence that closed it
        assert!(utterance.len() >= RATE as usize);
        assert!(!seg.in_speech());
    }

    #[test]
    fn silence_alone_never_emits() {
        let mut seg = UtteranceSegmenter::new(RATE);
        for _ in 0..20 {
            assert!(seg.push(&silence(1000)).is_none());
        }
    }

    #[test]
    fn long_speech_is_capped() {
        let mut seg = UtteranceSegmenter::new(RATE);

        let mut emitted = None;
        for _ in 0..11 {
            if let Some(utterance) = seg.push(&speech(1000)) {
                emitted = Some(utterance);
                break;
            }
        }

        let utterance = emitted.expect("cap should close the utterance");
        assert!(utterance.len() <= RATE as usize * 10);
        assert!(!seg.in_speech());
    }

    #[test]
    fn brief_blip_is_discarded() {
        let mut seg = UtteranceSegmenter::new(RATE);
        assert!(seg.push(&speech(100)).is_none());
        assert!(seg.push(&silence(2500)).is_none());
        assert!(!seg.in_speech());
    }

    #[test]
    fn speech_resets_trailing_silence() {
        let mut seg = UtteranceSegmenter::new(RATE);
        seg.push(&speech(500));
        seg.push(&silence(1500));
        seg.push(&speech(500));
        // Silence counter restarted, so this does not close yet
        assert!(seg.push(&silence(1500)).is_none());
        assert!(seg.push(&silence(600)).is_some());
    }
}
