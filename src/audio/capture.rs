//! Microphone sample sources
//!
//! The recorder and the capture stage read i16 chunks through the
//! `SampleSource` trait; `CpalSource` is the real device behind it.
//! cpal streams are not `Send`, so the stream lives on its own thread
//! and forwards chunks over a channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Blocking source of mono i16 audio samples
pub trait SampleSource: Send {
    /// Fill `buf` with captured samples, waiting up to `timeout`.
    ///
    /// Returns the number of samples written; 0 means the timeout
    /// elapsed with no data.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying device fails
    fn read_chunk(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize>;
}

/// Factory producing a sample source for a given sample rate.
///
/// Injected so tests can substitute synthetic audio for the device.
pub type SourceFactory = Arc<dyn Fn(u32) -> Result<Box<dyn SampleSource>> + Send + Sync>;

/// Default-input-device sample source
pub struct CpalSource {
    rx: mpsc::Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    stop: Arc<AtomicBool>,
}

impl CpalSource {
    /// Open the default input device at the requested sample rate
    ///
    /// # Errors
    ///
    /// Returns error if no device is available or no mono config at the
    /// requested rate exists
    pub fn new(sample_rate: u32) -> Result<Box<dyn SampleSource>> {
        let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        std::thread::spawn(move || {
            let stream = match build_input_stream(sample_rate, sample_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::error!(error = %e, "failed to start capture stream");
                return;
            }

            while !thread_stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        });

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited during setup".to_string()))??;

        Ok(Box::new(Self {
            rx: sample_rx,
            pending: VecDeque::new(),
            stop,
        }))
    }
}

fn build_input_stream(sample_rate: u32, tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::Audio("no suitable capture config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(SampleRate(sample_rate)).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        "capture source initialized"
    );

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_possible_truncation)]
                let samples: Vec<i16> = data
                    .iter()
                    .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();
                let _ = tx.send(samples);
            },
            |err| {
                tracing::error!(error = %err, "capture stream error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

impl SampleSource for CpalSource {
    fn read_chunk(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(samples) => self.pending.extend(samples),
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(0),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::Audio("capture stream closed".to_string()));
                }
            }
        }

        // Drain whatever else is already queued without blocking
        while let Ok(samples) = self.rx.try_recv() {
            self.pending.extend(samples);
            if self.pending.len() >= buf.len() {
                break;
            }
        }

        let count = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(count) {
            // Length checked above
            if let Some(sample) = self.pending.pop_front() {
                *slot = sample;
            }
        }
        Ok(count)
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
