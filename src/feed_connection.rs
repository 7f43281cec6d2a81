// =============================================================================
// Feed Connection — lifecycle of the single streaming connection
// =============================================================================
//
// State machine:
//
//   Idle → Connecting → Connected ─(error)→ Backoff(n) → Connecting → …
//                  └──────────────(error)→ Backoff(n)
//   Backoff(n) with n > max_attempts        → Failed   (terminal)
//   any non-terminal state, on shutdown      → Idle     (terminal)
//
// Every connection-level error becomes a backoff decision. Exhausting the
// attempt cap is the only fatal outcome: the loop clears its own running
// flag, reports `RetryExhausted`, and is never restarted automatically.
// The attempt counter resets to 0 whenever the link comes up and after
// every clean disconnect.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::notify::{notify_best_effort, SystemEvent};
use crate::ports::{LinkObserver, NotificationSink, StreamingFeed};
use crate::run_flag::RunFlag;
use crate::runtime_config::RuntimeConfig;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Linear backoff with a ceiling: `delay(n) = min(base × n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(cfg.reconnect_base_delay_secs),
            max_delay: Duration::from_secs(cfg.reconnect_max_delay_secs),
            max_attempts: cfg.reconnect_max_attempts,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempt")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Backoff(u32),
    Failed,
}

impl ConnectionState {
    /// Whether `self → next` is an edge of the lifecycle state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Failed, _) => false,
            (Idle, Connecting) => true,
            (Connecting, Connected | Connecting | Backoff(_) | Failed | Idle) => true,
            (Connected, Connecting | Backoff(_) | Failed | Idle) => true,
            (Backoff(_), Connecting | Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Backoff(n) => write!(f, "Backoff({n})"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Read-only view for observability.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    pub state: ConnectionState,
    pub attempt_count: u32,
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Link bookkeeping
// ---------------------------------------------------------------------------

struct LinkState {
    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
    notifier: Arc<dyn NotificationSink>,
}

impl LinkState {
    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state == next {
            return;
        }
        if state.is_terminal() {
            debug!(to = %next, "connection already failed, state kept");
            return;
        }
        if !state.can_transition_to(next) {
            warn!(from = %*state, to = %next, "ignoring invalid connection state transition");
            return;
        }
        debug!(from = %*state, to = %next, "connection state");
        *state = next;
    }

    fn current(&self) -> ConnectionState {
        *self.state.read()
    }
}

impl LinkObserver for LinkState {
    fn established(&self) {
        self.transition(ConnectionState::Connected);
        self.attempts.store(0, Ordering::SeqCst);
        notify_best_effort(self.notifier.as_ref(), SystemEvent::FeedConnected);
    }
}

// ---------------------------------------------------------------------------
// FeedConnection
// ---------------------------------------------------------------------------

/// Sole owner of the streaming connection. Other components only reach it
/// through `subscribe` / `unsubscribe`.
pub struct FeedConnection {
    feed: Arc<dyn StreamingFeed>,
    policy: BackoffPolicy,
    link: Arc<LinkState>,
    notifier: Arc<dyn NotificationSink>,
    /// This loop's own running flag. Cleared on retry exhaustion or `stop()`.
    active: RunFlag,
}

impl FeedConnection {
    pub fn new(
        feed: Arc<dyn StreamingFeed>,
        policy: BackoffPolicy,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            feed,
            policy,
            link: Arc::new(LinkState {
                state: RwLock::new(ConnectionState::Idle),
                attempts: AtomicU32::new(0),
                notifier: notifier.clone(),
            }),
            notifier,
            active: RunFlag::new(),
        }
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            state: self.link.current(),
            attempt_count: self.link.attempts.load(Ordering::SeqCst),
            running: self.active.is_running(),
        }
    }

    /// Explicit shutdown of this loop alone.
    pub fn stop(&self) {
        self.active.stop();
    }

    fn is_running(&self, shutdown: &RunFlag) -> bool {
        self.active.is_running() && shutdown.is_running()
    }

    async fn pause(&self, delay: Duration, shutdown: &RunFlag) -> bool {
        tokio::select! {
            keep_going = shutdown.sleep(delay) => keep_going && self.active.is_running(),
            _ = self.active.stopped() => false,
        }
    }

    /// Keep one connection alive until shutdown or retry exhaustion.
    ///
    /// Returns `Err(RetryExhausted)` only when the attempt cap is exceeded.
    pub async fn run(&self, shutdown: &RunFlag) -> Result<(), FeedError> {
        info!(
            base_delay_secs = self.policy.base_delay.as_secs(),
            max_delay_secs = self.policy.max_delay.as_secs(),
            max_attempts = self.policy.max_attempts,
            "feed connection loop started"
        );

        loop {
            if !self.is_running(shutdown) {
                self.link.transition(ConnectionState::Idle);
                info!("feed connection loop stopped");
                return Ok(());
            }

            self.link.transition(ConnectionState::Connecting);

            let outcome = tokio::select! {
                res = self.feed.connect(self.link.as_ref()) => Some(res),
                _ = shutdown.stopped() => None,
                _ = self.active.stopped() => None,
            };

            match outcome {
                // Shutdown raced the connection; the connect future has been
                // dropped, which closes the socket.
                None => continue,

                Some(Ok(())) => {
                    self.link.attempts.store(0, Ordering::SeqCst);
                    info!("feed disconnected cleanly, reconnecting");
                    notify_best_effort(
                        self.notifier.as_ref(),
                        SystemEvent::FeedDisconnected {
                            reason: "closed".to_string(),
                        },
                    );
                }

                Some(Err(e)) => {
                    if !self.is_running(shutdown) {
                        continue;
                    }

                    let attempt = self.link.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    notify_best_effort(
                        self.notifier.as_ref(),
                        SystemEvent::FeedDisconnected {
                            reason: e.to_string(),
                        },
                    );

                    if attempt > self.policy.max_attempts {
                        self.active.stop();
                        self.link.transition(ConnectionState::Failed);
                        error!(
                            attempts = attempt,
                            max_attempts = self.policy.max_attempts,
                            error = %e,
                            "maximum reconnect attempts exceeded — feed stopped"
                        );
                        notify_best_effort(
                            self.notifier.as_ref(),
                            SystemEvent::FeedRetryExhausted { attempts: attempt },
                        );
                        return Err(FeedError::RetryExhausted { attempts: attempt });
                    }

                    let delay = self.policy.delay(attempt);
                    self.link.transition(ConnectionState::Backoff(attempt));
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_secs = delay.as_secs(),
                        "feed connection failed, reconnecting after backoff"
                    );

                    if !self.pause(delay, shutdown).await {
                        continue;
                    }
                }
            }
        }
    }

    /// Add topics to the live connection. No-op on empty input.
    pub async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        if symbols.is_empty() {
            return Ok(());
        }
        debug!(symbols = ?symbols, "subscribing");
        self.feed.subscribe(symbols).await
    }

    /// Remove topics from the live connection. No-op on empty input.
    pub async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        if symbols.is_empty() {
            return Ok(());
        }
        debug!(symbols = ?symbols, "unsubscribing");
        self.feed.unsubscribe(symbols).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
