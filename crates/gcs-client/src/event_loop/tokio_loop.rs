//! Event loop backed by a tokio current-thread runtime.
//!
//! Tasks travel over an unbounded channel that `run` drains inside
//! `block_on`. Timers and stream I/O are tasks on the same runtime, so they
//! only make progress while the loop runs.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{end_of_stream, frame_poster, EventLoop, FrameHandler, FrameWriter, LoopTask, TimerId};

pub struct TokioLoop {
    runtime: Runtime,
    sender: mpsc::UnboundedSender<LoopTask>,
    receiver: Mutex<mpsc::UnboundedReceiver<LoopTask>>,
    timers: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_timer: AtomicU64,
    stopping: AtomicBool,
}

impl TokioLoop {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            sender,
            receiver: Mutex::new(receiver),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        })
    }
}

/// Hands outgoing frames to the stream's writer task.
struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream writer stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EventLoop for TokioLoop {
    fn register_stream(
        &self,
        stream: std::net::TcpStream,
        on_frame: FrameHandler,
    ) -> io::Result<FrameWriter> {
        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = self.runtime.enter();
            TcpStream::from_std(stream)?
        };
        let (read_half, mut write_half) = stream.into_split();

        let sender = self.sender.clone();
        let mut deliver = frame_poster(on_frame, move |task| sender.send(task).is_ok());
        self.runtime.spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => {
                        deliver(Err(end_of_stream()));
                        break;
                    }
                    Ok(_) => {
                        if line.last() == Some(&b'\n') {
                            line.pop();
                        }
                        if !deliver(Ok(line)) {
                            break;
                        }
                    }
                    Err(e) => {
                        deliver(Err(e));
                        break;
                    }
                }
            }
            debug!("frame reader finished");
        });

        let (lines, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();
        self.runtime.spawn(async move {
            while let Some(line) = outgoing.recv().await {
                if let Err(e) = write_half.write_all(&line).await {
                    warn!(error = %e, "stream write failed");
                    break;
                }
            }
        });
        Ok(Box::new(ChannelWriter(lines)))
    }

    fn add_timer(&self, delay: Duration, task: LoopTask) -> TimerId {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let sender = self.sender.clone();
        let timers = Arc::clone(&self.timers);

        // Hold the map lock across spawn so the timer cannot fire (and try
        // to remove itself) before its handle is registered.
        let mut registered = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_pending = timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some();
            if still_pending {
                let _ = sender.send(task);
            }
        });
        registered.insert(id, handle.abort_handle());
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let handle = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn post(&self, task: LoopTask) {
        let _ = self.sender.send(task);
    }

    fn run(&self) {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        self.stopping.store(false, Ordering::SeqCst);

        self.runtime.block_on(async {
            while !self.stopping.load(Ordering::SeqCst) {
                match receiver.recv().await {
                    Some(task) => task(),
                    None => break,
                }
            }
        });
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Wake a `run` that is parked on an empty queue.
        let _ = self.sender.send(Box::new(|| {}));
    }
}
