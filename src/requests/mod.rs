//! Asynchronous request lifecycle
//!
//! Text requests are accepted immediately with an id, queued FIFO, and
//! processed one at a time by a worker task that drives the voice
//! pipeline. Results stay queryable until a cleanup task evicts them.
//!
//! Two timeout mechanisms run independently: the worker bounds how long
//! it waits for a response and fails the request when none arrives,
//! while the cleanup task stamps a timeout on requests that sat in
//! pending or processing past the same deadline (a worker death, a
//! panicked backend) without ever reaching the worker's own handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::assistant::VoiceAssistant;
use crate::config::Settings;
use crate::{Error, Result};

/// Lifecycle of a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Queued, not yet picked up by the worker
    Pending,

    /// Being processed by the worker
    Processing,

    /// Finished with a response
    Completed,

    /// Finished with an error, including cancellation
    Failed,

    /// Sat in pending/processing past the request timeout and was
    /// stamped by the cleanup task
    TimedOut,
}

impl RequestStatus {
    /// Whether this status is final
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }
}

/// Queryable state of one request
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: String,
    pub status: RequestStatus,

    /// The submitted text
    pub text: String,

    /// Response text once completed
    pub response: String,

    /// Command the pipeline executed for this request, if any
    pub command: String,

    /// Diagnostic when failed or timed out
    pub error: String,

    /// Submission time, Unix milliseconds
    pub submitted_at_ms: i64,

    /// Completion stamp used for result eviction
    pub completed_at_ms: Option<i64>,
}

/// Tuning knobs; defaults match production behavior, tests shrink them
#[derive(Debug, Clone)]
pub struct RequestManagerConfig {
    /// Queue depth before submissions are rejected
    pub max_pending: usize,

    /// Stored results before the oldest finished one is evicted
    pub max_stored_results: usize,

    /// Cleanup task period
    pub cleanup_interval: Duration,

    /// How long finished results stay queryable
    pub completed_ttl: Duration,

    /// Worker deadline for a single request
    pub request_timeout: Duration,
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self {
            max_pending: 10,
            max_stored_results: 50,
            cleanup_interval: Duration::from_secs(30),
            completed_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(180),
        }
    }
}

struct QueuedRequest {
    id: String,
    text: String,
}

struct State {
    tx: mpsc::Sender<QueuedRequest>,
    tasks: Vec<JoinHandle<()>>,
}

type ResultMap = Arc<Mutex<HashMap<String, RequestRecord>>>;

/// FIFO request queue with a single worker and TTL-evicted results
pub struct RequestManager {
    config: RequestManagerConfig,
    assistant: Arc<VoiceAssistant>,
    settings: Arc<Settings>,
    results: ResultMap,
    counter: AtomicU64,
    running: Arc<AtomicBool>,
    state: Mutex<Option<State>>,
}

impl RequestManager {
    #[must_use]
    pub fn new(
        config: RequestManagerConfig,
        assistant: Arc<VoiceAssistant>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            assistant,
            settings,
            results: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        })
    }

    /// Start the worker and cleanup tasks; idempotent
    pub fn begin(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.is_some() {
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.config.max_pending);

        let worker = tokio::spawn(worker_loop(
            rx,
            Arc::clone(&self.results),
            Arc::clone(&self.assistant),
            self.config.clone(),
            Arc::clone(&self.running),
        ));
        let cleanup = tokio::spawn(cleanup_loop(
            Arc::clone(&self.results),
            self.config.clone(),
            Arc::clone(&self.running),
        ));

        *state = Some(State {
            tx,
            tasks: vec![worker, cleanup],
        });
        tracing::info!("request manager started");
    }

    /// Stop the tasks, drop whatever is still queued, and clear the
    /// stored results
    pub async fn end(&self) {
        self.running.store(false, Ordering::SeqCst);

        let taken = self.state.lock().ok().and_then(|mut state| state.take());
        let Some(state) = taken else { return };

        // Closing the channel lets the worker finish its drain pass
        drop(state.tx);
        for mut task in state.tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                tracing::warn!("request task did not stop in time, aborting");
                task.abort();
            }
        }

        if let Ok(mut results) = self.results.lock() {
            results.clear();
        }
        tracing::info!("request manager stopped");
    }

    /// Whether the tasks are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().map(|state| state.is_some()).unwrap_or(false)
    }

    /// Submit text for asynchronous processing, returning the request id
    ///
    /// # Errors
    ///
    /// Returns error if the assistant is disabled, the text is empty,
    /// the manager is stopped, or the queue is full
    pub fn submit(&self, text: &str) -> Result<String> {
        if !self.settings.voice_assistant_enabled() {
            return Err(Error::Request("voice assistant is disabled".to_string()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Request("request text is empty".to_string()));
        }

        let tx = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|s| s.tx.clone()))
            .ok_or_else(|| Error::Request("request manager is not running".to_string()))?;

        let id = self.next_id();
        let record = RequestRecord {
            id: id.clone(),
            status: RequestStatus::Pending,
            text: text.to_string(),
            response: String::new(),
            command: String::new(),
            error: String::new(),
            submitted_at_ms: now_ms(),
            completed_at_ms: None,
        };

        {
            let mut results = self
                .results
                .lock()
                .map_err(|_| Error::Request("result map lock poisoned".to_string()))?;
            if results.len() >= self.config.max_stored_results {
                evict_oldest_finished(&mut results);
            }
            results.insert(id.clone(), record);
        }

        match tx.try_send(QueuedRequest {
            id: id.clone(),
            text: text.to_string(),
        }) {
            Ok(()) => {
                tracing::info!(id = %id, "request queued");
                Ok(id)
            }
            Err(e) => {
                // Roll the record back so a rejected submission leaves
                // no trace
                if let Ok(mut results) = self.results.lock() {
                    results.remove(&id);
                }
                match e {
                    TrySendError::Full(_) => {
                        Err(Error::Request("request queue is full".to_string()))
                    }
                    TrySendError::Closed(_) => {
                        Err(Error::Request("request manager is stopping".to_string()))
                    }
                }
            }
        }
    }

    /// Look up a request by id
    #[must_use]
    pub fn status(&self, id: &str) -> Option<RequestRecord> {
        self.results.lock().ok()?.get(id).cloned()
    }

    /// Cancel a pending or processing request.
    ///
    /// Cooperative, not preemptive: a request already inside the
    /// pipeline runs to completion, but its result is discarded because
    /// the record is already terminal. Returns whether the request was
    /// cancelled; false for terminal or unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        let Ok(mut results) = self.results.lock() else {
            return false;
        };
        match results.get_mut(id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = RequestStatus::Failed;
                record.error = "Cancelled by user".to_string();
                record.completed_at_ms = Some(now_ms());
                tracing::info!(id = %id, "request cancelled");
                true
            }
            _ => false,
        }
    }

    /// Requests sitting in the queue
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .as_ref()
                    .map(|s| s.tx.max_capacity() - s.tx.capacity())
            })
            .unwrap_or(0)
    }

    /// Requests currently being processed
    #[must_use]
    pub fn processing_count(&self) -> usize {
        self.results
            .lock()
            .map(|results| {
                results
                    .values()
                    .filter(|r| r.status == RequestStatus::Processing)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Stored result count, finished or not
    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.results.lock().map(|results| results.len()).unwrap_or(0)
    }

    fn next_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("req_{}_{counter}", now_ms())
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<QueuedRequest>,
    results: ResultMap,
    assistant: Arc<VoiceAssistant>,
    config: RequestManagerConfig,
    running: Arc<AtomicBool>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(request)) => {
                process_request(&request, &results, &assistant, &config).await;
                // Brief pause between requests keeps the pipeline from
                // being hammered back-to-back
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }

    // Fail whatever is still queued so callers are not left polling
    // a Pending record forever
    while let Ok(request) = rx.try_recv() {
        finish(&results, &request.id, |record| {
            record.status = RequestStatus::Failed;
            record.error = "request manager stopped".to_string();
        });
    }
}

async fn process_request(
    request: &QueuedRequest,
    results: &ResultMap,
    assistant: &VoiceAssistant,
    config: &RequestManagerConfig,
) {
    // Claim pending -> processing atomically; a cancelled or evicted
    // request still sitting in the queue is skipped here
    let claimed = results
        .lock()
        .ok()
        .and_then(|mut map| {
            map.get_mut(&request.id).map(|record| {
                if record.status == RequestStatus::Pending {
                    record.status = RequestStatus::Processing;
                    true
                } else {
                    false
                }
            })
        })
        .unwrap_or(false);
    if !claimed {
        tracing::debug!(id = %request.id, "skipping non-pending request");
        return;
    }
    tracing::info!(id = %request.id, "processing request");

    if let Err(e) = assistant.ensure_started().await {
        finish(results, &request.id, |record| {
            record.status = RequestStatus::Failed;
            record.error = format!("voice assistant unavailable: {e}");
        });
        return;
    }

    if let Err(e) = assistant.send_text(&request.text).await {
        finish(results, &request.id, |record| {
            record.status = RequestStatus::Failed;
            record.error = format!("failed to submit text: {e}");
        });
        return;
    }

    match assistant.last_response(config.request_timeout).await {
        Some(response) if response.success => {
            finish(results, &request.id, |record| {
                record.status = RequestStatus::Completed;
                record.response = response.text.clone();
                record.command = response.command.clone();
            });
            tracing::info!(id = %request.id, "request completed");
        }
        Some(response) => {
            finish(results, &request.id, |record| {
                record.status = RequestStatus::Failed;
                record.error = response.text.clone();
            });
            tracing::warn!(id = %request.id, "request failed");
        }
        None => {
            finish(results, &request.id, |record| {
                record.status = RequestStatus::Failed;
                record.error = "no response from voice assistant".to_string();
            });
            tracing::warn!(id = %request.id, "no response before deadline");
        }
    }
}

async fn cleanup_loop(results: ResultMap, config: RequestManagerConfig, running: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(config.cleanup_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    while running.load(Ordering::SeqCst) {
        interval.tick().await;
        if let Ok(mut map) = results.lock() {
            cleanup_pass(&mut map, &config, now_ms());
        }
    }
}

/// One cleanup sweep.
///
/// Phase one stamps: terminal records missing a completion time get one
/// now, and records stuck in processing past the request timeout are
/// forced to `TimedOut`. Phase two evicts: terminal records whose stamp
/// is older than the TTL are dropped. A freshly stamped record
/// therefore survives a full TTL before eviction.
fn cleanup_pass(
    map: &mut HashMap<String, RequestRecord>,
    config: &RequestManagerConfig,
    now: i64,
) {
    #[allow(clippy::cast_possible_truncation)]
    let timeout_ms = config.request_timeout.as_millis() as i64;
    #[allow(clippy::cast_possible_truncation)]
    let ttl_ms = config.completed_ttl.as_millis() as i64;

    for record in map.values_mut() {
        if !record.status.is_terminal() && now - record.submitted_at_ms > timeout_ms {
            tracing::warn!(id = %record.id, status = ?record.status, "request exceeded maximum age, timing out");
            record.status = RequestStatus::TimedOut;
            record.error = "no response within the request timeout".to_string();
            record.completed_at_ms = Some(now);
        } else if record.status.is_terminal() && record.completed_at_ms.is_none() {
            record.completed_at_ms = Some(now);
        }
    }

    let before = map.len();
    map.retain(|_, record| {
        !(record.status.is_terminal()
            && record
                .completed_at_ms
                .is_some_and(|stamp| now - stamp >= ttl_ms))
    });
    let evicted = before - map.len();
    if evicted > 0 {
        tracing::debug!(evicted, "evicted expired request results");
    }
}

/// Drop the oldest finished record to make room; finds nothing when
/// everything is still in flight
fn evict_oldest_finished(map: &mut HashMap<String, RequestRecord>) {
    let oldest = map
        .values()
        .filter(|r| r.status.is_terminal())
        .min_by_key(|r| r.completed_at_ms.unwrap_or(r.submitted_at_ms))
        .map(|r| r.id.clone());

    match oldest {
        Some(id) => {
            tracing::debug!(id = %id, "evicting oldest finished result");
            map.remove(&id);
        }
        None => tracing::warn!("result map full of unfinished requests, not evicting"),
    }
}

/// Apply a terminal transition and stamp the completion time.
///
/// A record that is already terminal (cancelled mid-flight, stamped by
/// cleanup) is left untouched; terminal records are immutable until
/// eviction.
fn finish<F: FnOnce(&mut RequestRecord)>(results: &ResultMap, id: &str, f: F) {
    if let Ok(mut map) = results.lock()
        && let Some(record) = map.get_mut(id)
        && !record.status.is_terminal()
    {
        f(record);
        record.completed_at_ms = Some(now_ms());
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: RequestStatus, submitted: i64, completed: Option<i64>) -> RequestRecord {
        RequestRecord {
            id: id.to_string(),
            status,
            text: String::new(),
            response: String::new(),
            command: String::new(),
            error: String::new(),
            submitted_at_ms: submitted,
            completed_at_ms: completed,
        }
    }

    #[test]
    fn defaults_match_production_tuning() {
        let config = RequestManagerConfig::default();
        assert_eq!(config.max_pending, 10);
        assert_eq!(config.max_stored_results, 50);
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.completed_ttl, Duration::from_secs(300));
        assert_eq!(config.request_timeout, Duration::from_secs(180));
    }

    #[test]
    fn cleanup_stamps_before_evicting() {
        let config = RequestManagerConfig {
            completed_ttl: Duration::from_millis(1000),
            ..RequestManagerConfig::default()
        };
        let mut map = HashMap::new();
        map.insert("a".to_string(), record("a", RequestStatus::Completed, 0, None));

        // First pass stamps the unstamped record instead of evicting it
        cleanup_pass(&mut map, &config, 10_000);
        assert_eq!(map["a"].completed_at_ms, Some(10_000));

        // A pass within the TTL keeps it
        cleanup_pass(&mut map, &config, 10_500);
        assert!(map.contains_key("a"));

        // After the TTL it goes
        cleanup_pass(&mut map, &config, 11_000);
        assert!(!map.contains_key("a"));
    }

    #[test]
    fn cleanup_times_out_stale_unfinished_requests() {
        let config = RequestManagerConfig {
            request_timeout: Duration::from_millis(1000),
            ..RequestManagerConfig::default()
        };
        let mut map = HashMap::new();
        map.insert("a".to_string(), record("a", RequestStatus::Processing, 0, None));
        map.insert("b".to_string(), record("b", RequestStatus::Pending, 0, None));
        map.insert("c".to_string(), record("c", RequestStatus::Processing, 9_800, None));

        cleanup_pass(&mut map, &config, 10_000);
        // Stuck processing and orphaned pending both get stamped
        assert_eq!(map["a"].status, RequestStatus::TimedOut);
        assert_eq!(map["a"].completed_at_ms, Some(10_000));
        assert_eq!(map["b"].status, RequestStatus::TimedOut);
        // Within the deadline, left alone
        assert_eq!(map["c"].status, RequestStatus::Processing);
    }

    #[test]
    fn oldest_finished_is_evicted_first() {
        let mut map = HashMap::new();
        map.insert("old".to_string(), record("old", RequestStatus::Completed, 0, Some(100)));
        map.insert("new".to_string(), record("new", RequestStatus::Completed, 0, Some(200)));
        map.insert("busy".to_string(), record("busy", RequestStatus::Processing, 0, None));

        evict_oldest_finished(&mut map);
        assert!(!map.contains_key("old"));
        assert!(map.contains_key("new"));
        assert!(map.contains_key("busy"));
    }

    #[test]
    fn eviction_spares_unfinished_requests() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), record("a", RequestStatus::Pending, 0, None));
        map.insert("b".to_string(), record("b", RequestStatus::Processing, 0, None));

        evict_oldest_finished(&mut map);
        assert_eq!(map.len(), 2);
    }
}
