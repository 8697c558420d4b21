//! Target-scoped session surface over the multiplexed connection.
//!
//! A [`Session`] represents one attachment between the connection and a
//! target (page, frame, worker). Commands executed on it are tagged with its
//! session id; events scoped to it arrive on its own emitter. The lifecycle
//! state machine is monotonic: `Open → Crashed`, `Open → Closed`,
//! `Crashed → Closed`; `Closed` is terminal.

use crate::connection::Connection;
use crate::emitter::{EventEmitter, Subscription};
use crate::error::{Error, Result};
use crate::message::{SessionId, TargetId};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Closing a target must go through context cancellation, not a raw command;
/// otherwise the session registry would be mutated behind the multiplexer's
/// back.
const CLOSE_TARGET_METHOD: &str = "Target.closeTarget";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached and accepting commands.
    Open,
    /// The target crashed; new commands fail fast, in-flight ones resolve
    /// on their own path.
    Crashed,
    /// Detached or torn down; terminal.
    Closed,
}

/// A client-side handle to one attachment between the connection and a target.
pub struct Session {
    id: SessionId,
    target_id: TargetId,
    state: Mutex<SessionState>,
    emitter: EventEmitter,
    connection: Weak<Connection>,
}

impl Session {
    pub(crate) fn new(
        connection: &Arc<Connection>,
        id: SessionId,
        target_id: TargetId,
    ) -> Arc<Self> {
        tracing::debug!(sid = %id, tid = %target_id, "session created");
        Arc::new(Self {
            id,
            target_id,
            state: Mutex::new(SessionState::Open),
            emitter: EventEmitter::new(),
            connection: Arc::downgrade(connection),
        })
    }

    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the id of the target this session is bound to.
    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Executes a protocol command scoped to this session.
    ///
    /// Fails before any transport interaction if the method is disallowed at
    /// this layer or the session is no longer open.
    pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
        let connection = self.command_guard(method)?;
        tracing::debug!(sid = %self.id, tid = %self.target_id, method, "session execute");
        connection
            .send(Some(self.id.clone()), method, params)
            .await
    }

    /// Executes a command with a deadline.
    ///
    /// Surfaces expiry as [`Error::Timeout`], distinct from protocol errors:
    /// the command may still run remotely, but its late reply is discarded.
    pub async fn execute_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, self.execute(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "no reply to {method} within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Executes a command without waiting for its reply.
    pub async fn execute_without_reply(&self, method: &str, params: Value) -> Result<()> {
        let connection = self.command_guard(method)?;
        tracing::debug!(sid = %self.id, tid = %self.target_id, method, "session execute (no reply)");
        connection
            .send_without_reply(Some(self.id.clone()), method, params)
            .await
    }

    fn command_guard(&self, method: &str) -> Result<Arc<Connection>> {
        if method == CLOSE_TARGET_METHOD {
            return Err(Error::CloseTargetDenied);
        }
        match self.state() {
            SessionState::Open => {}
            SessionState::Crashed => {
                tracing::debug!(sid = %self.id, tid = %self.target_id, method, "rejecting command, target crashed");
                return Err(Error::TargetCrashed);
            }
            SessionState::Closed => {
                tracing::debug!(sid = %self.id, tid = %self.target_id, method, "rejecting command, session closed");
                return Err(Error::TargetClosed {
                    session: self.id.clone(),
                });
            }
        }
        self.connection.upgrade().ok_or(Error::ConnectionClosed)
    }

    /// Subscribes to events named `name` scoped to this session.
    pub fn on(&self, name: &str) -> Result<Subscription> {
        self.emitter.on(name)
    }

    /// Subscribes to every event on this session, including unclassifiable
    /// messages delivered under an empty name.
    pub fn on_all(&self) -> Result<Subscription> {
        self.emitter.on_all()
    }

    /// Marks the target as crashed: future commands fail fast, commands
    /// already in flight resolve independently.
    pub fn mark_crashed(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Open {
            tracing::debug!(sid = %self.id, tid = %self.target_id, "session marked crashed");
            *state = SessionState::Crashed;
        }
    }

    /// Transitions the session to `Closed` and shuts down its event
    /// distribution. Idempotent: closing an already-closed session is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                tracing::debug!(sid = %self.id, tid = %self.target_id, "session already closed");
                return;
            }
            *state = SessionState::Closed;
        }
        tracing::debug!(sid = %self.id, tid = %self.target_id, "session closed");
        self.emitter.close();
    }

    /// Delivers an inbound event to this session's subscribers.
    pub(crate) fn dispatch_event(&self, method: &str, params: Value) {
        self.emitter.emit(method, params);
    }
}
