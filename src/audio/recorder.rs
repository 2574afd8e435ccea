//! WAV recorder with AGC and level reporting
//!
//! `start` spawns a dedicated blocking task that acquires the audio
//! peripheral, writes an incrementally-named WAV file, and reports a
//! result exactly once through the returned handle. Any setup failure
//! aborts cleanly with the hardware lock released.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::audio::arbiter::{ACQUIRE_TIMEOUT, Arbiter};
use crate::audio::capture::{SampleSource, SourceFactory};
use crate::{Error, Result};

/// AGC target peak amplitude
const TARGET_PEAK: f32 = 32_000.0;

/// Maximum AGC gain
const MAX_GAIN: f32 = 20.0;

/// Samples read per loop iteration
const SAMPLES_PER_CHUNK: usize = 2048;

/// Per-chunk level callback, 0-100
pub type LevelCallback = Box<dyn Fn(u8) + Send>;

/// Recording parameters, owned by the recording task for its lifetime
pub struct RecordingConfig {
    /// Stop automatically after this long; `None` records until the
    /// stop flag is set
    pub duration: Option<Duration>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channel count (mono capture)
    pub channels: u16,

    /// Apply automatic gain control
    pub enable_agc: bool,

    /// Invoked per chunk with the current level (0-100)
    pub level_callback: Option<LevelCallback>,

    /// Destination directory
    pub directory: PathBuf,

    /// Filename prefix (`<prefix>_000042.wav`)
    pub filename_prefix: String,
}

impl RecordingConfig {
    /// Config for assistant utterance capture into `directory`
    #[must_use]
    pub fn assistant(directory: PathBuf, sample_rate: u32) -> Self {
        Self {
            duration: None,
            sample_rate,
            channels: 1,
            enable_agc: true,
            level_callback: None,
            directory,
            filename_prefix: "assistant".to_string(),
        }
    }
}

/// Outcome of a recording, handed back exactly once
#[derive(Debug, Clone, Default)]
pub struct RecordingResult {
    /// Whether the recording produced a usable file
    pub success: bool,

    /// Path of the written WAV file
    pub file_path: PathBuf,

    /// File size in bytes
    pub file_size_bytes: u64,

    /// Recorded duration in milliseconds
    pub duration_ms: u64,

    /// Sample rate of the recording
    pub sample_rate: u32,
}

/// Handle to an in-flight recording
pub struct RecordingHandle {
    join: tokio::task::JoinHandle<RecordingResult>,
}

impl RecordingHandle {
    /// Block until the recording task completes and take its result
    pub async fn result(self) -> RecordingResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "recording task panicked");
                RecordingResult::default()
            }
        }
    }
}

/// Microphone recorder bound to the hardware arbiter
pub struct Recorder {
    arbiter: Arc<Arbiter>,
    source_factory: SourceFactory,
    is_recording: Arc<AtomicBool>,
    current_level: Arc<AtomicU8>,
}

impl Recorder {
    /// Create a recorder; `source_factory` opens the capture peripheral
    /// for a given sample rate
    #[must_use]
    pub fn new(arbiter: Arc<Arbiter>, source_factory: SourceFactory) -> Self {
        Self {
            arbiter,
            source_factory,
            is_recording: Arc::new(AtomicBool::new(false)),
            current_level: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Start a recording; non-blocking.
    ///
    /// # Errors
    ///
    /// Returns error if a recording is already in progress
    pub fn start(
        &self,
        config: RecordingConfig,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<RecordingHandle> {
        if self.is_recording.swap(true, Ordering::SeqCst) {
            return Err(Error::Audio("recording already in progress".to_string()));
        }

        let arbiter = Arc::clone(&self.arbiter);
        let source = (self.source_factory)(config.sample_rate);
        let is_recording = Arc::clone(&self.is_recording);
        let current_level = Arc::clone(&self.current_level);

        let join = tokio::task::spawn_blocking(move || {
            let result = run_recording(&arbiter, source, &config, &stop_flag, &current_level);
            current_level.store(0, Ordering::Relaxed);
            if let Some(callback) = &config.level_callback {
                callback(0);
            }
            is_recording.store(false, Ordering::SeqCst);
            result
        });

        tracing::info!("recording task started");
        Ok(RecordingHandle { join })
    }

    /// Whether a recording is in progress
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    /// Most recent chunk level (0-100)
    #[must_use]
    pub fn level(&self) -> u8 {
        self.current_level.load(Ordering::Relaxed)
    }
}

fn run_recording(
    arbiter: &Arc<Arbiter>,
    source: Result<Box<dyn SampleSource>>,
    config: &RecordingConfig,
    stop_flag: &AtomicBool,
    current_level: &AtomicU8,
) -> RecordingResult {
    let failed = RecordingResult {
        sample_rate: config.sample_rate,
        ..RecordingResult::default()
    };

    // Exclusive hardware access first; stops playback as a side effect
    let _guard = match arbiter.acquire(ACQUIRE_TIMEOUT) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(error = %e, "failed to acquire audio hardware");
            return failed;
        }
    };

    let mut source = match source {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "failed to open capture peripheral");
            return failed;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.directory) {
        tracing::error!(error = %e, dir = %config.directory.display(), "unable to access recording storage");
        return failed;
    }

    let path = next_recording_path(&config.directory, &config.filename_prefix);
    tracing::info!(path = %path.display(), "recording to file");

    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // hound writes a placeholder header and patches the sizes on finalize
    let mut writer = match hound::WavWriter::create(&path, spec) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(error = %e, "failed to open recording file");
            return failed;
        }
    };

    let started = Instant::now();
    let mut buf = vec![0i16; SAMPLES_PER_CHUNK];
    let mut total_samples: u64 = 0;
    let mut write_failed = false;

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            tracing::info!("recording stop requested");
            break;
        }
        if let Some(limit) = config.duration
            && started.elapsed() >= limit
        {
            tracing::info!("recording duration reached");
            break;
        }

        let count = match source.read_chunk(&mut buf, Duration::from_millis(100)) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "capture read failed");
                write_failed = true;
                break;
            }
        };
        if count == 0 {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        let chunk = &mut buf[..count];
        let peak = process_chunk(chunk, config.enable_agc);

        for &sample in chunk.iter() {
            if writer.write_sample(sample).is_err() {
                write_failed = true;
                break;
            }
        }
        if write_failed {
            tracing::error!("failed writing samples to file");
            break;
        }
        total_samples += count as u64;

        let level = level_percent(peak);
        current_level.store(level, Ordering::Relaxed);
        if let Some(callback) = &config.level_callback {
            callback(level);
        }
    }

    if let Err(e) = writer.finalize() {
        tracing::error!(error = %e, "failed to finalize recording");
        return failed;
    }

    let duration_ms = started.elapsed().as_millis().max(1) as u64;
    let file_size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let success = total_samples > 0 && !write_failed;

    if success {
        tracing::info!(
            path = %path.display(),
            bytes = file_size_bytes,
            duration_ms,
            "recording saved"
        );
    } else {
        tracing::error!("recording failed");
    }

    RecordingResult {
        success,
        file_path: path,
        file_size_bytes,
        duration_ms,
        sample_rate: config.sample_rate,
    }
}

/// Apply AGC in place and return the post-gain peak amplitude
fn process_chunk(samples: &mut [i16], enable_agc: bool) -> i32 {
    let mut peak: i32 = 0;
    for &sample in samples.iter() {
        peak = peak.max(i32::from(sample).abs());
    }

    if !enable_agc || peak == 0 || peak as f32 >= TARGET_PEAK {
        return peak;
    }

    let gain = MAX_GAIN.min(TARGET_PEAK / peak as f32);
    let mut scaled_peak: i32 = 0;
    for sample in samples.iter_mut() {
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (f32::from(*sample) * gain)
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        *sample = scaled;
        scaled_peak = scaled_peak.max(i32::from(scaled).abs());
    }
    scaled_peak
}

fn level_percent(peak: i32) -> u8 {
    ((peak * 100) / i32::from(i16::MAX)).min(100) as u8
}

/// Next non-colliding `<prefix>_NNNNNN.wav` path in `dir`
fn next_recording_path(dir: &Path, prefix: &str) -> PathBuf {
    let next_index = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .filter_map(|entry| parse_recording_index(&entry.file_name().to_string_lossy(), prefix))
                .max()
                .map_or(0, |max| max + 1)
        })
        .unwrap_or(0);

    dir.join(format!("{prefix}_{next_index:06}.wav"))
}

/// Parse the index from `<prefix>_NNNNNN.wav`
fn parse_recording_index(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    rest.strip_suffix(".wav")?.parse().ok()
}
