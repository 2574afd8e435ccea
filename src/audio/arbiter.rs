//! Hardware arbitration for the shared audio peripheral
//!
//! One capture/playback peripheral, one owner at a time. Recording
//! borrows exclusive access from playback: acquisition stops any active
//! playback first, then bounded-waits on the lock. The guard is RAII so
//! a failing owner can never leave the lock held.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Default bounded wait for lock acquisition
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Control surface of the external playback subsystem
pub trait PlaybackControl: Send + Sync {
    /// Stop any active playback and release the peripheral
    fn stop(&self);

    /// Switch between UI and voice operating modes; returns false if the
    /// switch is refused
    fn set_voice_mode(&self, enabled: bool) -> bool;
}

/// Playback stub for deployments without an output path
pub struct NullPlayback;

impl PlaybackControl for NullPlayback {
    fn stop(&self) {}

    fn set_voice_mode(&self, _enabled: bool) -> bool {
        true
    }
}

/// Mutual exclusion over the audio peripheral
pub struct Arbiter {
    playback: Arc<dyn PlaybackControl>,
    held: Mutex<bool>,
    released: Condvar,
}

impl Arbiter {
    /// Create an arbiter wrapping the playback collaborator
    #[must_use]
    pub fn new(playback: Arc<dyn PlaybackControl>) -> Arc<Self> {
        Arc::new(Self {
            playback,
            held: Mutex::new(false),
            released: Condvar::new(),
        })
    }

    /// Acquire exclusive access to the peripheral.
    ///
    /// Stops playback first, then waits up to `timeout` for the lock.
    /// The returned guard releases on drop.
    ///
    /// # Errors
    ///
    /// Returns error if the lock cannot be acquired within the timeout
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<ArbiterGuard> {
        tracing::debug!("requesting exclusive audio access");
        self.playback.stop();

        let deadline = Instant::now() + timeout;
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::Audio("audio lock poisoned".to_string()))?;

        while *held {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Audio("timed out acquiring audio hardware".to_string()));
            }
            let (guard, wait) = self
                .released
                .wait_timeout(held, remaining)
                .map_err(|_| Error::Audio("audio lock poisoned".to_string()))?;
            held = guard;
            if wait.timed_out() && *held {
                return Err(Error::Audio("timed out acquiring audio hardware".to_string()));
            }
        }

        *held = true;
        tracing::debug!("exclusive audio access granted");
        Ok(ArbiterGuard {
            arbiter: Arc::clone(self),
        })
    }

    /// Whether the peripheral is currently held
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.lock().map(|held| *held).unwrap_or(false)
    }

    /// The playback collaborator this arbiter guards
    #[must_use]
    pub fn playback(&self) -> &Arc<dyn PlaybackControl> {
        &self.playback
    }

    fn release(&self) {
        if let Ok(mut held) = self.held.lock() {
            *held = false;
            self.released.notify_one();
            tracing::debug!("exclusive audio access released");
        }
    }
}

/// RAII guard over the audio peripheral
pub struct ArbiterGuard {
    arbiter: Arc<Arbiter>,
}

impl Drop for ArbiterGuard {
    fn drop(&mut self) {
        self.arbiter.release();
    }
}
