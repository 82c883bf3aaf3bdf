//! Connection: one duplex session to the backing store.
//!
//! Multiplexes request/reply exchanges and pub/sub deliveries over a single
//! TCP stream. Replies are matched to handlers by a per-connection request
//! id; messages are matched to subscriptions by channel name.
//!
//! # Architecture
//!
//! ```text
//!  Table ops ──request()──▶ [ State: pending{id→handler}, subscriptions ] ──FrameWriter──▶ store
//!                                          ▲
//!  event loop turn ◀── loop-owned stream ◀── frames (Reply{id} | Message{channel})
//! ```
//!
//! Every handler is removed from the pending map before it runs, so each
//! fires at most once, and no handler runs while the state lock is held.
//! A subscription only delivers messages once its own subscribe request is
//! acknowledged. The store sends the acknowledgement ahead of every later
//! publish on the channel, so a message seen before it belongs to a write
//! made before the subscribe and is dropped.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use gcs_store::protocol::{Command, Outcome, Request, RequestId, ServerFrame, decode_line, encode_line};
use tracing::{debug, error, info, warn};

use crate::error::{Fatal, FatalHandler, GcsError, GcsResult, OpContext, panic_on_fatal};
use crate::event_loop::{EventLoop, FrameWriter};

/// Consumes the outcome of one request. `Err` is reported as fatal.
pub type ReplyHandler = Box<dyn FnOnce(Outcome) -> Result<(), String> + Send>;

/// Receives `(tag, value)` for each message on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) -> Result<(), String> + Send + Sync>;

/// Runs once when the store confirms a subscription.
pub type AckHandler = Box<dyn FnOnce() + Send>;

type SubscriptionId = u64;

enum Pending {
    Reply {
        context: OpContext,
        on_reply: ReplyHandler,
    },
    Subscribe {
        context: OpContext,
        channel: String,
        subscription: SubscriptionId,
        on_ack: AckHandler,
    },
}

impl Pending {
    fn context(&self) -> &OpContext {
        match self {
            Pending::Reply { context, .. } | Pending::Subscribe { context, .. } => context,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    context: OpContext,
    on_message: MessageHandler,
    acked: bool,
}

#[derive(Default)]
struct State {
    address: Option<String>,
    /// Kept for shutdown and status; I/O goes through the loop.
    socket: Option<TcpStream>,
    /// Handed to the event loop on attach.
    stream: Option<TcpStream>,
    writer: Option<FrameWriter>,
    event_loop: Option<Arc<dyn EventLoop>>,
    next_request: RequestId,
    next_subscription: SubscriptionId,
    /// Encoded requests waiting for an event loop.
    queued: Vec<Vec<u8>>,
    pending: HashMap<RequestId, Pending>,
    subscriptions: HashMap<String, Vec<Subscription>>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    fatal_handler: Mutex<FatalHandler>,
    faulted: AtomicBool,
}

/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_request: 1,
                    next_subscription: 1,
                    ..Default::default()
                }),
                fatal_handler: Mutex::new(Arc::new(panic_on_fatal)),
                faulted: AtomicBool::new(false),
            }),
        }
    }

    /// Open the session. Can be called once per connection.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> GcsResult<()> {
        let mut state = self.shared.lock();
        if state.socket.is_some() || state.closed {
            return Err(GcsError::AlreadyConnected);
        }

        let address = format!("{host}:{port}");
        let connection_error = |reason: String| GcsError::Connection {
            address: address.clone(),
            reason,
        };

        let candidates = (host, port)
            .to_socket_addrs()
            .map_err(|e| connection_error(e.to_string()))?;
        let mut last_error = "address resolved to nothing".to_string();
        let mut stream = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        let stream = stream.ok_or_else(|| connection_error(last_error))?;
        stream.set_nodelay(true)?;
        let socket = stream.try_clone()?;

        info!(%address, "connected to store");
        state.address = Some(address);
        state.socket = Some(socket);
        state.stream = Some(stream);
        Ok(())
    }

    /// Hand the stream to `event_loop` and flush requests queued so far.
    pub fn attach(&self, event_loop: Arc<dyn EventLoop>) -> GcsResult<()> {
        let mut state = self.shared.lock();
        if state.event_loop.is_some() {
            return Err(GcsError::AlreadyAttached);
        }
        if state.closed {
            return Err(GcsError::NotConnected);
        }
        let stream = state.stream.take().ok_or(GcsError::NotConnected)?;

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let mut writer = event_loop.register_stream(
            stream,
            Box::new(move |frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_frame(frame);
                }
            }),
        )?;

        let queued = std::mem::take(&mut state.queued);
        for line in &queued {
            writer.write_all(line)?;
        }
        state.writer = Some(writer);
        state.event_loop = Some(event_loop);
        debug!(flushed = queued.len(), "attached to event loop");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        let state = self.shared.lock();
        state.socket.is_some() && !state.closed
    }

    pub fn is_attached(&self) -> bool {
        self.shared.lock().event_loop.is_some()
    }

    /// Store address, once connected.
    pub fn address(&self) -> Option<String> {
        self.shared.lock().address.clone()
    }

    /// Replace the handler that receives the first fatal fault.
    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        *self
            .shared
            .fatal_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Submit `command`; `on_reply` runs on a later loop turn with its outcome.
    pub fn request(
        &self,
        command: Command,
        context: OpContext,
        on_reply: ReplyHandler,
    ) -> GcsResult<RequestId> {
        let mut state = self.shared.lock();
        submit(&mut state, command, Pending::Reply { context, on_reply })
    }

    /// Subscribe to `channel`. `on_ack` runs once the store confirms, and
    /// strictly before the first `on_message` of this subscription.
    pub fn subscribe(
        &self,
        channel: &str,
        context: OpContext,
        on_message: MessageHandler,
        on_ack: AckHandler,
    ) -> GcsResult<RequestId> {
        let mut state = self.shared.lock();
        ensure_connected(&state)?;

        let subscription = state.next_subscription;
        state.next_subscription += 1;
        state
            .subscriptions
            .entry(channel.to_string())
            .or_default()
            .push(Subscription {
                id: subscription,
                context: context.clone(),
                on_message,
                acked: false,
            });

        let command = Command::Subscribe {
            channel: channel.to_string(),
        };
        let pending = Pending::Subscribe {
            context,
            channel: channel.to_string(),
            subscription,
            on_ack,
        };
        let submitted = submit(&mut state, command, pending);
        if submitted.is_err() {
            remove_subscription(&mut state, channel, subscription);
        }
        submitted
    }

    /// Drop every subscription on `channel` and tell the store.
    pub fn unsubscribe(&self, channel: &str, context: OpContext) -> GcsResult<RequestId> {
        let mut state = self.shared.lock();
        ensure_connected(&state)?;
        let dropped = state
            .subscriptions
            .remove(channel)
            .map(|subs| subs.len())
            .unwrap_or(0);
        debug!(%channel, dropped, "unsubscribing");

        let command = Command::Unsubscribe {
            channel: channel.to_string(),
        };
        let on_reply: ReplyHandler = Box::new(|outcome: Outcome| match outcome {
            Outcome::Unsubscribed { .. } => Ok(()),
            other => Err(format!("unexpected reply to unsubscribe: {other:?}")),
        });
        submit(&mut state, command, Pending::Reply { context, on_reply })
    }

    /// Close the session and drop every pending handler and subscription.
    ///
    /// Handlers often hold clones of this connection; clearing them here
    /// releases those cycles.
    pub fn shutdown(&self) {
        let (pending, subscriptions, queued) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(socket) = state.socket.take() {
                let _ = socket.shutdown(Shutdown::Both);
            }
            state.stream = None;
            state.writer = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.queued),
            )
        };
        if !queued.is_empty() {
            warn!(
                discarded = queued.len(),
                "connection shut down before an event loop was attached; queued requests discarded"
            );
        }
        debug!(
            pending = pending.len(),
            channels = subscriptions.len(),
            "connection shut down"
        );
        // Handlers drop here, outside the lock.
        drop(pending);
        drop(subscriptions);
    }
}

fn ensure_connected(state: &State) -> GcsResult<()> {
    if state.socket.is_none() || state.closed {
        return Err(GcsError::NotConnected);
    }
    Ok(())
}

fn submit(state: &mut State, command: Command, pending: Pending) -> GcsResult<RequestId> {
    ensure_connected(state)?;

    let id = state.next_request;
    let op = command.name();
    let line = encode_line(&Request { id, command }).map_err(|e| GcsError::Protocol(e.to_string()))?;
    debug!(id, op, context = %pending.context(), "request submitted");

    state.next_request += 1;
    state.pending.insert(id, pending);
    if state.event_loop.is_none() {
        state.queued.push(line);
        return Ok(id);
    }

    let written = match state.writer.as_mut() {
        Some(writer) => writer.write_all(&line).map_err(GcsError::from),
        None => Err(GcsError::NotConnected),
    };
    if let Err(e) = written {
        state.pending.remove(&id);
        return Err(e);
    }
    Ok(id)
}

fn remove_subscription(state: &mut State, channel: &str, id: SubscriptionId) {
    if let Some(subs) = state.subscriptions.get_mut(channel) {
        subs.retain(|sub| sub.id != id);
        if subs.is_empty() {
            state.subscriptions.remove(channel);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_frame(&self, frame: std::io::Result<Vec<u8>>) {
        if self.faulted.load(Ordering::SeqCst) || self.lock().closed {
            return;
        }
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                self.fatal(OpContext::new("connection"), format!("connection lost: {e}"));
                return;
            }
        };
        match decode_line::<ServerFrame>(&line) {
            Ok(ServerFrame::Reply { id, outcome }) => self.dispatch_reply(id, outcome),
            Ok(ServerFrame::Message {
                channel,
                tag,
                value,
            }) => self.dispatch_message(&channel, &tag, &value),
            Err(e) => self.fatal(OpContext::new("decode frame"), e.to_string()),
        }
    }

    fn dispatch_reply(&self, id: RequestId, outcome: Outcome) {
        let pending = self.lock().pending.remove(&id);
        let Some(pending) = pending else {
            warn!(id, "reply for unknown request dropped");
            return;
        };

        if let Outcome::Error { message } = outcome {
            self.fatal(pending.context().clone(), message);
            return;
        }

        match pending {
            Pending::Reply { context, on_reply } => {
                if let Err(reason) = on_reply(outcome) {
                    self.fatal(context, reason);
                }
            }
            Pending::Subscribe {
                context,
                channel,
                subscription,
                on_ack,
            } => {
                if !matches!(outcome, Outcome::Subscribed { .. }) {
                    self.fatal(context, format!("unexpected reply to subscribe: {outcome:?}"));
                    return;
                }
                self.mark_live(&channel, subscription);
                debug!(%channel, "subscription confirmed");
                on_ack();
            }
        }
    }

    fn mark_live(&self, channel: &str, id: SubscriptionId) {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .get_mut(channel)
            .and_then(|subs| subs.iter_mut().find(|sub| sub.id == id));
        if let Some(sub) = sub {
            sub.acked = true;
        }
    }

    fn dispatch_message(&self, channel: &str, tag: &str, value: &[u8]) {
        let live: Vec<(OpContext, MessageHandler)> = {
            let state = self.lock();
            let Some(subs) = state.subscriptions.get(channel) else {
                debug!(%channel, "message for channel without subscribers dropped");
                return;
            };
            let live: Vec<_> = subs
                .iter()
                .filter(|sub| sub.acked)
                .map(|sub| (sub.context.clone(), Arc::clone(&sub.on_message)))
                .collect();
            if live.len() < subs.len() {
                debug!(
                    %channel,
                    %tag,
                    skipped = subs.len() - live.len(),
                    "message predates unconfirmed subscriptions"
                );
            }
            live
        };

        for (context, on_message) in live {
            if let Err(reason) = on_message(tag, value) {
                self.fatal(context, reason);
                return;
            }
        }
    }

    fn fatal(&self, context: OpContext, reason: String) {
        if self.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        let fatal = Fatal { context, reason };
        error!(context = %fatal.context, reason = %fatal.reason, "fatal GCS fault");
        let handler = self
            .fatal_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handler(&fatal);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.queued.is_empty() {
            warn!(
                discarded = state.queued.len(),
                "connection dropped before an event loop was attached; queued requests discarded"
            );
        }
        if let Some(socket) = state.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}
