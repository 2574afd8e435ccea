//! Microphone capture, recording, and hardware arbitration

pub mod arbiter;
pub mod capture;
pub mod recorder;

pub use arbiter::{ACQUIRE_TIMEOUT, Arbiter, ArbiterGuard, NullPlayback, PlaybackControl};
pub use capture::{CpalSource, SampleSource, SourceFactory};
pub use recorder::{Recorder, RecordingConfig, RecordingHandle, RecordingResult};
