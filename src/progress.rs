//! Progress fan-out for in-flight server starts
//!
//! One [`ProgressBroadcaster`] exists per start operation. Subscribers see
//! events emitted after they subscribed, in emission order, and always see the
//! terminal (ready or failed) event, even when they subscribe after it was sent.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per subscriber before it starts lagging
const CHANNEL_CAPACITY: usize = 64;

/// One step of a start operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Completion estimate, 0 to 100
    pub percent: u8,
    pub message: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub failed: bool,
    /// Public URL of the server, set on the ready event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ProgressEvent {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent,
            message: message.into(),
            ready: false,
            failed: false,
            url: None,
        }
    }

    pub fn ready(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            percent: 100,
            message: message.into(),
            ready: true,
            failed: false,
            url: Some(url.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            percent: 100,
            message: message.into(),
            ready: false,
            failed: true,
            url: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.ready || self.failed
    }
}

#[derive(Default)]
struct BroadcastState {
    last_percent: u8,
    terminal: Option<ProgressEvent>,
}

/// Single-producer, multi-consumer progress channel for one start operation
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
    state: Arc<Mutex<BroadcastState>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            state: Arc::new(Mutex::new(BroadcastState::default())),
        }
    }

    /// Publish an event. Returns false (and drops the event) once a terminal event was published.
    pub fn emit(&self, mut event: ProgressEvent) -> bool {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return false;
        }

        // Progress never goes backwards within one operation
        event.percent = event.percent.min(100).max(state.last_percent);
        state.last_percent = event.percent;

        if event.is_terminal() {
            state.terminal = Some(event.clone());
        }

        // Sent under the lock so subscribe() either sees the cached terminal or receives it
        let _ = self.tx.send(event);
        true
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        let state = self.state.lock();
        match &state.terminal {
            Some(terminal) => ProgressSubscription {
                rx: None,
                pending_terminal: Some(terminal.clone()),
                state: Arc::clone(&self.state),
                done: false,
            },
            None => ProgressSubscription {
                rx: Some(self.tx.subscribe()),
                pending_terminal: None,
                state: Arc::clone(&self.state),
                done: false,
            },
        }
    }

    /// The terminal event, once the operation has resolved
    pub fn terminal(&self) -> Option<ProgressEvent> {
        self.state.lock().terminal.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of one broadcaster
pub struct ProgressSubscription {
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    pending_terminal: Option<ProgressEvent>,
    state: Arc<Mutex<BroadcastState>>,
    done: bool,
}

impl ProgressSubscription {
    /// Next event, or `None` after the terminal event has been delivered
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        if let Some(terminal) = self.pending_terminal.take() {
            self.done = true;
            return Some(terminal);
        }
        let rx = self.rx.as_mut()?;

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return self.state.lock().terminal.clone();
                }
            }
        }
    }
}
