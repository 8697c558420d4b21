//! CDP connection layer: command/reply correlation and target demultiplexing.
//!
//! One physical connection carries traffic for many logical targets. The
//! connection owns the transport, assigns monotonically increasing command
//! ids, and routes each inbound envelope to the right place:
//!
//! 1. Caller invokes `send()` with an optional session id, method, and params
//! 2. Connection allocates a unique id and registers a oneshot reply channel
//! 3. The envelope is queued to the transport writer task
//! 4. The caller suspends on the oneshot receiver
//! 5. The dispatch loop receives inbound envelopes in arrival order
//! 6. Replies are correlated by id; events are fanned out to the owning
//!    session's emitter (or the connection's own emitter for browser-level
//!    and unroutable events)
//!
//! Target lifecycle events (`Target.attachedToTarget`,
//! `Target.detachedFromTarget`, `Target.targetCrashed`) additionally mutate
//! the session registry. Dispatch never blocks on consumer delivery: reply
//! handoff is a buffered oneshot send and event fan-out uses bounded
//! per-subscriber queues.

use crate::emitter::{EventEmitter, Subscription};
use crate::error::{Error, Result};
use crate::message::{Message, MessageKind, SessionId, TargetId};
use crate::session::Session;
use crate::transport::{Transport, TransportParts, TransportReceiver};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};

const TARGET_ATTACHED: &str = "Target.attachedToTarget";
const TARGET_DETACHED: &str = "Target.detachedFromTarget";
const TARGET_CRASHED: &str = "Target.targetCrashed";

/// An in-flight command awaiting its reply.
struct PendingCommand {
    /// Session the command was scoped to; lets detach flush exactly the
    /// commands belonging to a departing session.
    session: Option<SessionId>,
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending commands keyed by command id.
type PendingTable = Arc<Mutex<HashMap<i64, PendingCommand>>>;

/// RAII guard ensuring pending-table cleanup when a command future is
/// dropped before its reply arrives (caller cancellation or timeout).
struct CancelGuard {
    id: i64,
    pending: PendingTable,
    completed: bool,
}

impl CancelGuard {
    fn new(id: i64, pending: PendingTable) -> Self {
        Self {
            id,
            pending,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.pending.lock().remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "removed pending command for cancelled call");
        }
    }
}

/// Future returned by [`Connection::send`] with automatic cancellation cleanup.
struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value>>,
    guard: CancelGuard,
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Multiplexed CDP connection to a browser.
///
/// Owns the transport, the pending-command table, and the session registry.
pub struct Connection {
    /// Monotonic command id counter; ids are never reused while pending.
    last_id: AtomicI64,
    /// In-flight commands awaiting replies.
    pending: PendingTable,
    /// Active sessions keyed by session id.
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// Channel feeding the transport writer task.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Connection-scoped events (browser-level traffic, unknown sessions).
    emitter: EventEmitter,
    /// Set once teardown has run; commands fail fast afterwards.
    closed: AtomicBool,
    /// Shutdown signal observed by the dispatch loop and writer task.
    shutdown_tx: watch::Sender<bool>,
    /// Transport sender (taken by run() to start the writer task).
    transport_sender: Mutex<Option<Box<dyn Transport>>>,
    /// Transport receiver (taken by run() to start the reader task).
    transport_receiver: Mutex<Option<Box<dyn TransportReceiver>>>,
    /// Receiver for outbound envelopes (taken by run()).
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Receiver for inbound envelopes (taken by run()).
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl Connection {
    /// Creates a new connection over the given transport.
    pub fn new(parts: TransportParts) -> Self {
        let TransportParts {
            sender,
            receiver,
            message_rx,
        } = parts;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            last_id: AtomicI64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sessions: Mutex::new(HashMap::new()),
            outbound_tx,
            emitter: EventEmitter::new(),
            closed: AtomicBool::new(false),
            shutdown_tx,
            transport_sender: Mutex::new(Some(sender)),
            transport_receiver: Mutex::new(Some(receiver)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            message_rx: Mutex::new(Some(message_rx)),
        }
    }

    fn next_id(&self) -> i64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sends a command and awaits its reply.
    ///
    /// Suspends until the matching reply arrives, the caller drops the
    /// future (cancellation/timeout), or the connection closes, whichever
    /// happens first. The pending-table entry is removed in all three cases.
    pub async fn send(
        &self,
        session: Option<SessionId>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id();
        tracing::debug!(id, session = ?session.as_ref().map(SessionId::as_str), method, "sending command");

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id, PendingCommand { session: session.clone(), tx });
        let guard = CancelGuard::new(id, Arc::clone(&self.pending));

        let envelope = serde_json::to_value(Message::request(id, session, method, params))?;
        if self.outbound_tx.send(envelope).is_err() {
            // Writer task is gone; the guard removes the table entry.
            return Err(Error::ChannelClosed);
        }

        // Teardown may have flushed the table between the closed check above
        // and the insert; if our entry survived that flush, remove it here
        // so the call does not wait on a reply that can never arrive.
        if self.closed.load(Ordering::SeqCst) && self.pending.lock().remove(&id).is_some() {
            return Err(Error::ConnectionClosed);
        }

        ResponseFuture { rx, guard }.await
    }

    /// Sends a command without registering a reply channel.
    pub async fn send_without_reply(
        &self,
        session: Option<SessionId>,
        method: &str,
        params: Value,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id();
        tracing::debug!(id, session = ?session.as_ref().map(SessionId::as_str), method, "sending command (no reply expected)");

        let envelope = serde_json::to_value(Message::request(id, session, method, params))?;
        self.outbound_tx
            .send(envelope)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Runs the dispatch loop until transport closure or [`Connection::close`].
    ///
    /// Spawns the transport reader and writer tasks, then processes inbound
    /// envelopes in arrival order. A single malformed envelope is logged and
    /// skipped. On exit every pending command is resolved with a
    /// connection-closed error and every session is closed.
    pub async fn run(self: &Arc<Self>) {
        let mut receiver = self
            .transport_receiver
            .lock()
            .take()
            .expect("run() can only be called once - transport receiver already taken");
        let mut sender = self
            .transport_sender
            .lock()
            .take()
            .expect("run() can only be called once - transport sender already taken");
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .expect("run() can only be called once - outbound receiver already taken");
        let mut message_rx = self
            .message_rx
            .lock()
            .take()
            .expect("run() can only be called once - message receiver already taken");

        let reader_handle = tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                tracing::error!("transport read error: {e}");
            }
        });

        let mut writer_shutdown = self.shutdown_tx.subscribe();
        let writer_handle = tokio::spawn(async move {
            if *writer_shutdown.borrow_and_update() {
                return;
            }
            loop {
                tokio::select! {
                    _ = writer_shutdown.changed() => break,
                    maybe = outbound_rx.recv() => match maybe {
                        Some(message) => {
                            if let Err(e) = sender.send(message).await {
                                tracing::error!("transport write error: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !*shutdown_rx.borrow_and_update() {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    maybe = message_rx.recv() => match maybe {
                        Some(value) => match serde_json::from_value::<Message>(value) {
                            Ok(message) => self.dispatch(message),
                            Err(e) => tracing::error!("dropping malformed envelope: {e}"),
                        },
                        None => break,
                    }
                }
            }
        }

        // Wake the writer task regardless of which path ended the loop.
        self.shutdown_tx.send_replace(true);
        self.teardown();
        reader_handle.abort();
        let _ = reader_handle.await;
        let _ = writer_handle.await;
    }

    /// Routes one inbound envelope.
    fn dispatch(self: &Arc<Self>, message: Message) {
        match message.kind() {
            MessageKind::Reply => self.dispatch_reply(message),
            MessageKind::Event => self.dispatch_event(message),
            MessageKind::Unknown => {
                tracing::debug!("dropping envelope with neither id nor method");
            }
        }
    }

    fn dispatch_reply(&self, message: Message) {
        let Some(id) = message.id else { return };
        match self.pending.lock().remove(&id) {
            Some(command) => {
                let result = match message.error {
                    Some(err) => Err(Error::Cdp {
                        code: err.code,
                        message: err.message,
                    }),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                // The receiver may be gone if the caller cancelled between
                // table removal here and its own guard firing.
                if command.tx.send(result).is_err() {
                    tracing::debug!(id, "dropping reply for cancelled command");
                }
            }
            None => tracing::debug!(id, "dropping reply for unknown command id"),
        }
    }

    fn dispatch_event(self: &Arc<Self>, message: Message) {
        let method = message.method.unwrap_or_default();
        let params = message.params.unwrap_or(Value::Null);

        match method.as_str() {
            TARGET_ATTACHED => self.on_target_attached(&params),
            TARGET_DETACHED => self.on_target_detached(&params),
            TARGET_CRASHED => self.on_target_crashed(&params),
            _ => {}
        }

        let session = message
            .session_id
            .as_ref()
            .and_then(|sid| self.session(sid));
        match session {
            Some(session) => session.dispatch_event(&method, params),
            None => {
                if let Some(sid) = &message.session_id {
                    tracing::debug!(sid = %sid, method, "event for unknown session routed to connection scope");
                }
                self.emitter.emit(&method, params);
            }
        }
    }

    fn on_target_attached(self: &Arc<Self>, params: &Value) {
        let Some(sid) = params.get("sessionId").and_then(Value::as_str) else {
            tracing::warn!("attachedToTarget event without sessionId");
            return;
        };
        let tid = params
            .pointer("/targetInfo/targetId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.register_session(SessionId::from(sid), TargetId::from(tid));
    }

    fn on_target_detached(&self, params: &Value) {
        let Some(sid) = params.get("sessionId").and_then(Value::as_str) else {
            tracing::warn!("detachedFromTarget event without sessionId");
            return;
        };
        self.detach_session(&SessionId::from(sid));
    }

    // The crash notification carries a target id, not a session id; every
    // live attachment to that target is marked crashed.
    fn on_target_crashed(&self, params: &Value) {
        let Some(tid) = params.get("targetId").and_then(Value::as_str) else {
            tracing::warn!("targetCrashed event without targetId");
            return;
        };
        let tid = TargetId::from(tid);
        let crashed: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| *s.target_id() == tid)
            .cloned()
            .collect();
        for session in crashed {
            session.mark_crashed();
        }
    }

    /// Registers a session for an attached target. Idempotent on session id:
    /// a repeated registration returns the existing session.
    pub fn register_session(
        self: &Arc<Self>,
        id: SessionId,
        target_id: TargetId,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&id) {
            return Arc::clone(existing);
        }
        let session = Session::new(self, id.clone(), target_id);
        sessions.insert(id, Arc::clone(&session));
        session
    }

    /// Looks up an active session by id.
    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Subscribes to connection-scoped events (browser-level traffic,
    /// target lifecycle, events for unknown sessions).
    pub fn on(&self, name: &str) -> Result<Subscription> {
        self.emitter.on(name)
    }

    /// Closes the connection: terminates the dispatch loop, resolves every
    /// pending command with a connection-closed error, closes every session
    /// and the transport. Idempotent.
    pub fn close(&self) {
        // send_replace stores the value even when run() has not subscribed
        // yet, so a close() issued before run() still stops both loops.
        self.shutdown_tx.send_replace(true);
        self.teardown();
    }

    /// Returns true once the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_pending_commands(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    fn detach_session(&self, id: &SessionId) {
        // Resolve session-scoped commands before the registry entry goes away.
        let flushed: Vec<PendingCommand> = {
            let mut pending = self.pending.lock();
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, c)| c.session.as_ref() == Some(id))
                .map(|(cid, _)| *cid)
                .collect();
            ids.into_iter().filter_map(|cid| pending.remove(&cid)).collect()
        };
        for command in flushed {
            let _ = command.tx.send(Err(Error::TargetClosed {
                session: id.clone(),
            }));
        }

        let session = self.sessions.lock().remove(id);
        match session {
            Some(session) => session.close(),
            None => tracing::debug!(sid = %id, "detach for unknown session"),
        }
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("connection teardown");

        let flushed: Vec<PendingCommand> =
            self.pending.lock().drain().map(|(_, c)| c).collect();
        for command in flushed {
            let _ = command.tx.send(Err(Error::ConnectionClosed));
        }

        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }

        self.emitter.close();
    }
}
