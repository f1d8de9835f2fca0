//! Multi-mode streaming: the event bus between a running invocation and its
//! subscribers.
//!
//! A [`MultiModeStream`] is constructed with a subset of the four modes and a
//! per-mode buffer capacity. Producers hold a cheap [`EventSink`] handle;
//! subscribers pick one mode each and receive events lazily in emission
//! order. Modes are independent; no cross-mode ordering is guaranteed.

mod combinators;
mod executor;

pub use combinators::{aggregate, filter, merge, transform, FlushPolicy};
pub(crate) use executor::dispatch_tool;
pub use executor::{
    ExecutorMode, ParallelToolExecutor, TaskResult, ToolTask,
};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// The four stream modes a subscriber can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// LLM token deltas, one event per token or logical chunk.
    Messages,
    /// State mutations and tool-call records (key, old value, new value).
    Updates,
    /// Free-form tool progress; opaque to the engine.
    Custom,
    /// Full state snapshots at well-defined checkpoints.
    Values,
}

impl StreamMode {
    pub const ALL: [StreamMode; 4] = [
        StreamMode::Messages,
        StreamMode::Updates,
        StreamMode::Custom,
        StreamMode::Values,
    ];
}

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub mode:       StreamMode,
    /// Free-form tag within the mode: `"token"`, `"tool_call"`, `"error"`, …
    pub event_type: String,
    pub timestamp:  DateTime<Utc>,
    pub payload:    Value,
    pub metadata:   Option<HashMap<String, Value>>,
}

impl StreamEvent {
    pub fn new(mode: StreamMode, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            mode,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// What happens when a mode buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Drop the oldest buffered event and count it. Producers never block.
    #[default]
    DropOldest,
    /// Suspend the producer until a subscriber drains the buffer.
    BlockProducer,
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-mode channel
// ─────────────────────────────────────────────────────────────────────────────

struct ModeChannel {
    capacity: usize,
    policy:   BackpressurePolicy,
    buf:      Mutex<VecDeque<StreamEvent>>,
    readable: Notify,
    writable: Notify,
    dropped:  AtomicU64,
    closed:   AtomicBool,
}

impl ModeChannel {
    fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            buf: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking push with drop-oldest semantics. Returns false if closed.
    fn try_push(&self, event: StreamEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut buf = self.buf.lock().expect("stream buffer poisoned");
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(event);
        drop(buf);
        self.readable.notify_one();
        true
    }

    async fn push(&self, event: StreamEvent) -> bool {
        match self.policy {
            BackpressurePolicy::DropOldest => self.try_push(event),
            BackpressurePolicy::BlockProducer => {
                let mut slot = Some(event);
                loop {
                    if self.is_closed() {
                        return false;
                    }
                    // Register interest before the capacity check: a pop that
                    // lands between check and await must still wake us.
                    let space = self.writable.notified();
                    {
                        let mut buf = self.buf.lock().expect("stream buffer poisoned");
                        if buf.len() < self.capacity {
                            buf.push_back(slot.take().expect("event already consumed"));
                            drop(buf);
                            self.readable.notify_one();
                            return true;
                        }
                    }
                    space.await;
                }
            }
        }
    }

    fn try_pop(&self) -> Option<StreamEvent> {
        let mut buf = self.buf.lock().expect("stream buffer poisoned");
        let event = buf.pop_front();
        drop(buf);
        if event.is_some() {
            self.writable.notify_one();
        }
        event
    }

    async fn pop(&self) -> Option<StreamEvent> {
        loop {
            let readable = self.readable.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                // Drain anything that raced in between the pop and the flag.
                return self.try_pop();
            }
            readable.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MultiModeStream
// ─────────────────────────────────────────────────────────────────────────────

/// The mode multiplexer. Single producer side per invocation, any number of
/// subscribers per mode (competing consumers).
pub struct MultiModeStream {
    channels: Arc<HashMap<StreamMode, Arc<ModeChannel>>>,
}

impl MultiModeStream {
    pub fn new(modes: &[StreamMode], capacity: usize) -> Self {
        Self::with_policy(modes, capacity, BackpressurePolicy::DropOldest)
    }

    pub fn with_policy(modes: &[StreamMode], capacity: usize, policy: BackpressurePolicy) -> Self {
        let channels = modes
            .iter()
            .map(|m| (*m, Arc::new(ModeChannel::new(capacity, policy))))
            .collect::<HashMap<_, _>>();
        Self { channels: Arc::new(channels) }
    }

    /// Producer handle. Cheap to clone; emitting to an unselected mode is a
    /// no-op.
    pub fn sink(&self) -> EventSink {
        EventSink { channels: Arc::clone(&self.channels) }
    }

    /// Subscribe to one mode. Returns `None` when the mode was not selected
    /// at construction.
    pub fn subscribe(&self, mode: StreamMode) -> Option<ModeSubscriber> {
        self.channels
            .get(&mode)
            .map(|c| ModeSubscriber { chan: Arc::clone(c) })
    }

    /// Events dropped on this mode so far under [`BackpressurePolicy::DropOldest`].
    pub fn dropped(&self, mode: StreamMode) -> u64 {
        self.channels
            .get(&mode)
            .map(|c| c.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn modes(&self) -> Vec<StreamMode> {
        self.channels.keys().copied().collect()
    }

    /// Close every mode. Subscribers drain what is buffered, then see end-of-stream.
    pub fn close(&self) {
        for chan in self.channels.values() {
            chan.close();
        }
    }
}

/// Producer handle onto a [`MultiModeStream`].
#[derive(Clone)]
pub struct EventSink {
    channels: Arc<HashMap<StreamMode, Arc<ModeChannel>>>,
}

impl EventSink {
    /// A sink connected to nothing; every emit is a no-op. Useful for code
    /// paths that take a sink unconditionally.
    pub fn disconnected() -> Self {
        Self { channels: Arc::new(HashMap::new()) }
    }

    pub fn is_active(&self, mode: StreamMode) -> bool {
        self.channels.contains_key(&mode)
    }

    /// Emit one event, honoring the channel's back-pressure policy.
    pub async fn emit(&self, mode: StreamMode, event_type: &str, payload: Value) {
        if let Some(chan) = self.channels.get(&mode) {
            chan.push(StreamEvent::new(mode, event_type, payload)).await;
        }
    }

    /// Non-blocking emit for synchronous call sites (tool handlers). Always
    /// drop-oldest, regardless of the configured policy.
    pub fn try_emit(&self, mode: StreamMode, event_type: &str, payload: Value) {
        if let Some(chan) = self.channels.get(&mode) {
            chan.try_push(StreamEvent::new(mode, event_type, payload));
        }
    }

    pub async fn emit_event(&self, event: StreamEvent) {
        if let Some(chan) = self.channels.get(&event.mode) {
            chan.push(event).await;
        }
    }

    /// Close every mode this sink feeds.
    pub fn close(&self) {
        for chan in self.channels.values() {
            chan.close();
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventSink({} modes)", self.channels.len())
    }
}

/// Consumer handle for a single mode.
pub struct ModeSubscriber {
    chan: Arc<ModeChannel>,
}

impl ModeSubscriber {
    /// Next event, or `None` once the stream is closed and drained.
    pub async fn recv(&self) -> Option<StreamEvent> {
        self.chan.pop().await
    }

    /// Drain whatever is currently buffered without waiting.
    pub fn drain_now(&self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(e) = self.chan.try_pop() {
            out.push(e);
        }
        out
    }

    /// Adapt into a lazy [`futures::Stream`].
    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        Box::pin(futures::stream::unfold(self, |sub| async move {
            sub.recv().await.map(|e| (e, sub))
        }))
    }
}
