//! Session registry and per-session event queues.
//!
//! A POST creates a session and starts its pipeline; the matching GET
//! attaches to the session's bounded queue and drains it as SSE. The
//! registry owns each session; the running pipeline and the attached
//! stream hold non-owning handles. Exactly one stream reader is serviced
//! at a time; a disconnected reader has a short grace window to come back
//! before the run is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventKind, PipelineEvent};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Streaming,
    Complete,
    NeedsInput,
    Error,
    Abandoned,
}

/// Why an attach failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// Unknown id, or the session already finished and was reaped
    NotFound,
    /// Another reader is currently being serviced
    Busy,
}

/// Timing knobs for the registry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    /// How long a full queue may block the pipeline before the session is
    /// abandoned as a slow client
    pub backpressure_timeout: Duration,
    /// Reconnection window after a reader disconnects
    pub grace: Duration,
    /// Absolute session lifetime
    pub session_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            backpressure_timeout: Duration::from_secs(30),
            grace: Duration::from_secs(5),
            session_timeout: Duration::from_secs(1800),
        }
    }
}

/// One analysis session: id, bounded event queue, cancellation token.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Taken (closing the queue) when the session is abandoned
    sender: Mutex<Option<mpsc::Sender<PipelineEvent>>>,
    receiver: Mutex<Option<mpsc::Receiver<PipelineEvent>>>,
    status: Mutex<SessionStatus>,
    /// Terminal event that could not be queued (slow-client abandon);
    /// delivered by the stream once it drains the queue.
    terminal_override: Mutex<Option<PipelineEvent>>,
    cancel: CancellationToken,
    /// Bumped on every attach; grace timers check it to detect reconnects.
    attach_epoch: AtomicU64,
    backpressure_timeout: Duration,
}

impl Session {
    fn new(config: &SessionConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            status: Mutex::new(SessionStatus::Pending),
            terminal_override: Mutex::new(None),
            cancel: CancellationToken::new(),
            attach_epoch: AtomicU64::new(0),
            backpressure_timeout: config.backpressure_timeout,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionStatus::Error)
    }

    fn set_status(&self, status: SessionStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Complete
                | SessionStatus::NeedsInput
                | SessionStatus::Error
                | SessionStatus::Abandoned
        )
    }

    /// The cancellation token derived by every pipeline step.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Enqueue one event, blocking on a full queue for at most the
    /// backpressure window. Timing out abandons the session: the token is
    /// cancelled, the status becomes `Abandoned`, and a `CLIENT_SLOW`
    /// error event is staged for whenever the reader catches up.
    pub async fn emit(&self, event: PipelineEvent) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let terminal_status = match event.kind {
            EventKind::Done => match event.data.get("status").and_then(|s| s.as_str()) {
                Some("needs_input") => Some(SessionStatus::NeedsInput),
                _ => Some(SessionStatus::Complete),
            },
            EventKind::Error => Some(SessionStatus::Error),
            _ => None,
        };

        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(Error::Cancelled)?;

        match sender.send_timeout(event, self.backpressure_timeout).await {
            Ok(()) => {
                if let Some(status) = terminal_status {
                    self.set_status(status);
                } else if self.status() == SessionStatus::Pending {
                    self.set_status(SessionStatus::Streaming);
                }
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(session_id = %self.id, "event queue full past the backpressure window");
                if let Ok(mut slot) = self.terminal_override.lock() {
                    *slot =
                        Some(PipelineEvent::error("CLIENT_SLOW: event queue stayed full"));
                }
                self.abandon();
                Err(Error::Cancelled)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.abandon();
                Err(Error::Cancelled)
            }
        }
    }

    /// Mark abandoned, cancel the run, and close the queue so an attached
    /// (or late) reader observes end-of-stream after draining.
    fn abandon(&self) {
        self.set_status(SessionStatus::Abandoned);
        self.cancel.cancel();
        if let Ok(mut slot) = self.sender.lock() {
            slot.take();
        }
    }

    fn take_terminal_override(&self) -> Option<PipelineEvent> {
        self.terminal_override.lock().ok().and_then(|mut s| s.take())
    }
}

/// Attached reader handle for one session's event stream.
///
/// Dropping it before the terminal event starts the grace window; a
/// reconnect inside the window resumes exactly where this reader stopped.
#[derive(Debug)]
pub struct SessionStream {
    session: Arc<Session>,
    sessions: SharedSessions,
    grace: Duration,
    receiver: Option<mpsc::Receiver<PipelineEvent>>,
    finished: bool,
}

impl SessionStream {
    /// Next event, or `None` once the stream is finished.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        if self.finished {
            return None;
        }
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finish();
                }
                Some(event)
            }
            None => {
                // Producer gone without a queued terminal event; a staged
                // CLIENT_SLOW override is delivered here.
                let staged = self.session.take_terminal_override();
                self.finish();
                staged
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver = None;
        remove_session(&self.sessions, self.session.id);
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        // Park the queue for a reconnecting reader and arm the grace timer.
        if let Ok(mut slot) = self.session.receiver.lock() {
            *slot = Some(receiver);
        }
        let epoch = self.session.attach_epoch.load(Ordering::SeqCst);
        let session = Arc::clone(&self.session);
        let sessions = Arc::clone(&self.sessions);
        let grace = self.grace;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(grace).await;
                let reattached =
                    session.attach_epoch.load(Ordering::SeqCst) != epoch;
                if !reattached && !session.is_terminal() {
                    info!(session_id = %session.id, "grace window elapsed, abandoning session");
                    session.abandon();
                    remove_session(&sessions, session.id);
                }
            });
        }
    }
}

type SharedSessions = Arc<Mutex<HashMap<Uuid, Arc<Session>>>>;

fn remove_session(sessions: &SharedSessions, id: Uuid) {
    if let Ok(mut sessions) = sessions.lock() {
        sessions.remove(&id);
    }
}

/// Owns every live session.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: SharedSessions,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a session and arm its absolute-timeout reaper.
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(&self.config));
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id, Arc::clone(&session));
        }

        let sessions = Arc::clone(&self.sessions);
        let handle = Arc::clone(&session);
        let timeout = self.config.session_timeout;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if !handle.is_terminal() {
                    warn!(session_id = %handle.id, "session exceeded its absolute timeout");
                    handle.abandon();
                }
                remove_session(&sessions, handle.id);
            });
        }

        debug!(session_id = %session.id, "session created");
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().ok()?.get(&id).cloned()
    }

    pub fn remove(&self, id: Uuid) {
        remove_session(&self.sessions, id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach the (single) reader to a session's event stream.
    pub fn attach(&self, id: Uuid) -> std::result::Result<SessionStream, AttachError> {
        let session = self.get(id).ok_or(AttachError::NotFound)?;
        let receiver = session
            .receiver
            .lock()
            .map_err(|_| AttachError::NotFound)?
            .take()
            .ok_or(AttachError::Busy)?;
        session.attach_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(SessionStream {
            session,
            sessions: Arc::clone(&self.sessions),
            grace: self.config.grace,
            receiver: Some(receiver),
            finished: false,
        })
    }
}
