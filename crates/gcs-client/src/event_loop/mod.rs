//! Event-loop capability that drives every client callback.
//!
//! All replies, notifications and timers are delivered as tasks on the loop
//! a caller attaches, on the thread that calls [`EventLoop::run`]. Two
//! interchangeable backends are provided:
//!
//! - [`MiniLoop`]: minimal single-threaded reactor (channel queue + deadline-ordered timers)
//! - [`TokioLoop`]: tokio current-thread runtime
//!
//! # Streams
//!
//! `register_stream` takes ownership of a connected socket. Incoming bytes
//! are split into newline-terminated frames and each frame is posted as one
//! task, so frames reach the handler in stream order and always on the
//! loop's thread. End of stream and read errors are delivered once as
//! `Err`. Outgoing bytes go through the returned [`FrameWriter`].
//!
//! `MiniLoop` reads on a dedicated `gcs-reader` thread and writes with
//! blocking calls. `TokioLoop` reads and writes asynchronously on its own
//! runtime, so its I/O only progresses while the loop runs.

mod mini;
mod tokio_loop;

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gcs_core::EventLoopKind;

pub use mini::MiniLoop;
pub use tokio_loop::TokioLoop;

/// A unit of work executed on a loop turn.
pub type LoopTask = Box<dyn FnOnce() + Send + 'static>;

/// Receives frames (without the trailing newline) from a registered stream.
pub type FrameHandler = Box<dyn FnMut(io::Result<Vec<u8>>) + Send + 'static>;

/// Write half of a registered stream. Each `write` carries whole frames.
pub type FrameWriter = Box<dyn Write + Send>;

/// Handle for cancelling a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

pub trait EventLoop: Send + Sync + 'static {
    /// Watch `stream` for incoming frames and return its write half; see
    /// the module docs.
    fn register_stream(
        &self,
        stream: TcpStream,
        on_frame: FrameHandler,
    ) -> io::Result<FrameWriter>;

    /// Run `task` once, no earlier than `delay` from now.
    fn add_timer(&self, delay: Duration, task: LoopTask) -> TimerId;

    /// Cancel a pending timer. Returns `false` if it already fired.
    fn cancel_timer(&self, id: TimerId) -> bool;

    /// Queue `task` for a later turn. Never runs it inline.
    fn post(&self, task: LoopTask);

    /// Drive the loop on the calling thread until [`EventLoop::stop`].
    fn run(&self);

    /// Make `run` return after the current task. `run` may be called again.
    fn stop(&self);
}

/// Build the backend selected in configuration.
pub fn new_event_loop(kind: EventLoopKind) -> io::Result<Arc<dyn EventLoop>> {
    Ok(match kind {
        EventLoopKind::Mini => Arc::new(MiniLoop::new()),
        EventLoopKind::Tokio => Arc::new(TokioLoop::new()?),
    })
}

/// Wrap `on_frame` so each frame becomes one task handed to `post`. The
/// returned closure reports `false` once the loop is gone.
pub(crate) fn frame_poster(
    on_frame: FrameHandler,
    post: impl Fn(LoopTask) -> bool + Send + 'static,
) -> impl FnMut(io::Result<Vec<u8>>) -> bool + Send + 'static {
    let handler = Arc::new(Mutex::new(on_frame));
    move |frame| {
        let handler = Arc::clone(&handler);
        post(Box::new(move || {
            let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
            handler(frame);
        }))
    }
}

pub(crate) fn end_of_stream() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed")
}
