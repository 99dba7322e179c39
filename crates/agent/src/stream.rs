//! Server-sent event emitter.
//!
//! Every event is framed as `event: <name>\ndata: <json>\n\n` and pushed into a
//! bounded channel whose receiver is owned by the transport. A full channel
//! suspends the emitter, so the caller's read rate paces the turn.
//!
//! The stream ends on `complete`, `error`, an explicit [`StreamEmitter::close`],
//! or the receiver going away. Whichever comes first cancels the heartbeat and
//! runs the registered cleanup callbacks; later emits return
//! [`StreamError::Closed`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sprout_core::config::{AppConfig, StreamConfig};
use sprout_core::domain::tool::ToolExecutionResult;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    Connected,
    Message,
    ToolStart,
    ToolSuccess,
    ToolError,
    Progress,
    Status,
    Complete,
    Error,
    Heartbeat,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Message => "message",
            Self::ToolStart => "tool_start",
            Self::ToolSuccess => "tool_success",
            Self::ToolError => "tool_error",
            Self::Progress => "progress",
            Self::Status => "status",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
    #[error("failed to serialize `{event}` payload: {message}")]
    Serialize { event: &'static str, message: String },
}

pub fn frame(kind: StreamEventKind, data: &Value) -> Result<String, StreamError> {
    let body = serde_json::to_string(data).map_err(|error| StreamError::Serialize {
        event: kind.as_str(),
        message: error.to_string(),
    })?;
    Ok(format!("event: {}\ndata: {body}\n\n", kind.as_str()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmitterConfig {
    /// Characters per `message` event.
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub heartbeat_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default().stream)
    }
}

impl From<&StreamConfig> for EmitterConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            chunk_delay: config.chunk_delay(),
            heartbeat_interval: config.heartbeat_interval(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamMetrics {
    pub stream_id: String,
    pub events: u64,
    pub chunks: u64,
    pub bytes: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

type CleanupCallback = Box<dyn FnOnce() + Send + 'static>;

struct EmitterInner {
    stream_id: String,
    config: EmitterConfig,
    sender: Mutex<Option<mpsc::Sender<String>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    cleanup: Mutex<Vec<CleanupCallback>>,
    events: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
    ended: OnceLock<(DateTime<Utc>, u64)>,
}

#[derive(Clone)]
pub struct StreamEmitter {
    inner: Arc<EmitterInner>,
}

/// Opens a stream. Must be called from within a tokio runtime: a watcher task
/// tears the emitter down when the receiver is dropped.
pub fn channel(config: EmitterConfig) -> (StreamEmitter, mpsc::Receiver<String>) {
    let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
    let watcher_sender = sender.clone();

    let emitter = StreamEmitter {
        inner: Arc::new(EmitterInner {
            stream_id: uuid::Uuid::new_v4().to_string(),
            config,
            sender: Mutex::new(Some(sender)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            cleanup: Mutex::new(Vec::new()),
            events: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
            ended: OnceLock::new(),
        }),
    };

    let watched = emitter.clone();
    tokio::spawn(async move {
        let cancel = watched.inner.cancel.clone();
        tokio::select! {
            _ = watcher_sender.closed() => watched.shutdown("receiver_dropped"),
            _ = cancel.cancelled() => {}
        }
    });

    (emitter, receiver)
}

impl StreamEmitter {
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Cancelled when the stream ends for any reason.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Runs once when the stream ends. Registered after the end, it runs immediately.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            callback();
            return;
        }

        let mut cleanup = self.inner.cleanup.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_closed() {
            drop(cleanup);
            callback();
        } else {
            cleanup.push(Box::new(callback));
        }
    }

    pub async fn emit(&self, kind: StreamEventKind, data: Value) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let framed = match frame(kind, &data) {
            Ok(framed) => framed,
            Err(error) => {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }
        };
        let Some(sender) = self.sender() else {
            return Err(StreamError::Closed);
        };

        let bytes = framed.len() as u64;
        let sent = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => false,
            result = sender.send(framed) => result.is_ok(),
        };

        if !sent {
            if !self.is_closed() {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                self.shutdown("receiver_dropped");
            }
            return Err(StreamError::Closed);
        }

        self.inner.events.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes.fetch_add(bytes, Ordering::Relaxed);
        debug!(
            event_name = "agent.stream.event",
            stream_id = %self.inner.stream_id,
            kind = kind.as_str(),
            bytes,
            "stream event sent"
        );
        Ok(())
    }

    pub async fn connected(&self, session_id: &str) -> Result<(), StreamError> {
        self.emit(
            StreamEventKind::Connected,
            json!({
                "sessionId": session_id,
                "streamId": self.inner.stream_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await
    }

    /// Splits `content` into `chunk_size`-character pieces with `chunk_delay` between them.
    pub async fn message(&self, content: &str) -> Result<(), StreamError> {
        let chunks = split_chunks(content, self.inner.config.chunk_size);
        let total = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 && !self.inner.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.inner.config.chunk_delay).await;
            }
            self.emit(
                StreamEventKind::Message,
                json!({
                    "content": chunk,
                    "index": index,
                    "total": total,
                    "final": index + 1 == total,
                }),
            )
            .await?;
            self.inner.chunks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn tool_start(
        &self,
        tool_name: &str,
        index: usize,
        total: usize,
    ) -> Result<(), StreamError> {
        self.emit(
            StreamEventKind::ToolStart,
            json!({ "tool": tool_name, "index": index, "total": total }),
        )
        .await
    }

    pub async fn tool_success(&self, result: &ToolExecutionResult) -> Result<(), StreamError> {
        self.emit(
            StreamEventKind::ToolSuccess,
            json!({
                "tool": result.tool_name,
                "result": result.payload,
                "durationMs": result.duration_ms,
                "retries": result.retries,
            }),
        )
        .await
    }

    pub async fn tool_error(&self, result: &ToolExecutionResult) -> Result<(), StreamError> {
        self.emit(
            StreamEventKind::ToolError,
            json!({
                "tool": result.tool_name,
                "error": result.error,
                "timedOut": result.timed_out,
                "durationMs": result.duration_ms,
                "retries": result.retries,
            }),
        )
        .await
    }

    pub async fn progress(&self, stage: &str, percent: u8) -> Result<(), StreamError> {
        self.emit(
            StreamEventKind::Progress,
            json!({ "stage": stage, "percent": percent.min(100) }),
        )
        .await
    }

    pub async fn status(&self, message: &str) -> Result<(), StreamError> {
        self.emit(StreamEventKind::Status, json!({ "message": message })).await
    }

    /// Terminal. The stream is closed afterwards even if the send fails.
    pub async fn complete(&self, data: Value) -> Result<(), StreamError> {
        let sent = self.emit(StreamEventKind::Complete, data).await;
        self.shutdown("complete");
        sent
    }

    /// Terminal. The stream is closed afterwards even if the send fails.
    pub async fn error(&self, message: &str, code: &str) -> Result<(), StreamError> {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .emit(StreamEventKind::Error, json!({ "message": message, "code": code }))
            .await;
        self.shutdown("error");
        sent
    }

    /// Emits `heartbeat` every interval until the stream ends. The first beat
    /// fires one full interval after the call.
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let emitter = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let beat = json!({ "timestamp": Utc::now().to_rfc3339() });
                        if emitter.emit(StreamEventKind::Heartbeat, beat).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn close(&self) {
        self.shutdown("closed");
    }

    pub fn metrics(&self) -> StreamMetrics {
        let ended = self.inner.ended.get().copied();
        let duration_ms = match ended {
            Some((_, duration_ms)) => duration_ms,
            None => self.inner.started.elapsed().as_millis() as u64,
        };

        StreamMetrics {
            stream_id: self.inner.stream_id.clone(),
            events: self.inner.events.load(Ordering::Relaxed),
            chunks: self.inner.chunks.load(Ordering::Relaxed),
            bytes: self.inner.bytes.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            started_at: self.inner.started_at,
            ended_at: ended.map(|(ended_at, _)| ended_at),
            duration_ms,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.inner.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn shutdown(&self, reason: &'static str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.cancel.cancel();
        self.inner.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        let _ = self
            .inner
            .ended
            .set((Utc::now(), self.inner.started.elapsed().as_millis() as u64));

        let callbacks: Vec<CleanupCallback> = std::mem::take(
            &mut *self.inner.cleanup.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for callback in callbacks {
            callback();
        }

        let metrics = self.metrics();
        info!(
            event_name = "agent.stream.closed",
            stream_id = %metrics.stream_id,
            reason,
            events = metrics.events,
            chunks = metrics.chunks,
            bytes = metrics.bytes,
            errors = metrics.errors,
            duration_ms = metrics.duration_ms,
            "stream closed"
        );
    }
}

fn split_chunks(content: &str, chunk_size: usize) -> Vec<String> {
    if content.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = content.chars().collect();
    chars.chunks(chunk_size.max(1)).map(|chunk| chunk.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{channel, frame, split_chunks, EmitterConfig, StreamError, StreamEventKind};

    fn config() -> EmitterConfig {
        EmitterConfig {
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(30),
            channel_capacity: 1,
        }
    }

    fn collect(mut receiver: mpsc::Receiver<String>) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = receiver.recv().await {
                frames.push(frame);
            }
            frames
        })
    }

    #[test]
    fn frames_use_event_and_data_lines() {
        let framed = frame(StreamEventKind::ToolStart, &json!({ "tool": "any_query" }))
            .expect("frame");
        assert_eq!(framed, "event: tool_start\ndata: {\"tool\":\"any_query\"}\n\n");
    }

    #[test]
    fn chunks_split_on_characters_not_bytes() {
        assert_eq!(split_chunks("你好世界朋友", 4), vec!["你好世界", "朋友"]);
        assert_eq!(split_chunks("", 4), vec![""]);
    }

    #[tokio::test]
    async fn message_is_delivered_in_ordered_chunks() {
        let (emitter, receiver) = channel(config());
        let frames = collect(receiver);

        emitter.connected("s1").await.expect("connected");
        emitter.message("abcdefghij").await.expect("message");
        emitter.complete(json!({ "sessionId": "s1" })).await.expect("complete");

        let frames = frames.await.expect("collector");
        assert_eq!(frames.len(), 5);
        assert!(frames[0].starts_with("event: connected\n"));
        assert!(frames[1].contains("\"content\":\"abcd\""));
        assert!(frames[2].contains("\"content\":\"efgh\""));
        assert!(frames[3].contains("\"content\":\"ij\"") && frames[3].contains("\"final\":true"));
        assert!(frames[4].starts_with("event: complete\n"));

        let metrics = emitter.metrics();
        assert_eq!(metrics.events, 5);
        assert_eq!(metrics.chunks, 3);
        assert!(metrics.ended_at.is_some());
        assert_eq!(metrics.bytes, frames.iter().map(|frame| frame.len() as u64).sum::<u64>());
    }

    #[tokio::test]
    async fn receiver_drop_runs_cleanup_exactly_once() {
        let (emitter, receiver) = channel(config());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        emitter.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let heartbeat = emitter.start_heartbeat();

        drop(receiver);
        assert_eq!(emitter.status("working").await, Err(StreamError::Closed));
        assert_eq!(emitter.status("still working").await, Err(StreamError::Closed));
        emitter.close();
        tokio::task::yield_now().await;

        assert!(emitter.is_closed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        heartbeat.await.expect("heartbeat task ends");
        assert!(emitter.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_registered_after_close_runs_immediately() {
        let (emitter, _receiver) = channel(config());
        emitter.close();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        emitter.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_on_interval_and_stops_on_close() {
        let (emitter, mut receiver) = channel(config());
        let heartbeat = emitter.start_heartbeat();

        let first = receiver.recv().await.expect("first heartbeat");
        assert!(first.starts_with("event: heartbeat\n"));

        emitter.close();
        heartbeat.await.expect("heartbeat task ends");
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn error_event_terminates_stream() {
        let (emitter, receiver) = channel(config());
        let frames = collect(receiver);

        emitter.error("session is complete", "session_protocol").await.expect("error event");
        assert_eq!(emitter.message("late").await, Err(StreamError::Closed));

        let frames = frames.await.expect("collector");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"code\":\"session_protocol\""));
        assert_eq!(emitter.metrics().errors, 1);
    }
}
