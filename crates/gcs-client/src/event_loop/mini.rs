//! Minimal single-threaded reactor.
//!
//! A channel of tasks plus a deadline-ordered timer map. `run` blocks on
//! the channel with a timeout equal to the next timer deadline. Streams are
//! read by one blocking thread each; writes are plain blocking writes.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead, BufReader, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{end_of_stream, frame_poster, EventLoop, FrameHandler, FrameWriter, LoopTask, TimerId};

enum Event {
    Task(LoopTask),
    /// Re-evaluate timers or the stop flag.
    Wake,
}

#[derive(Default)]
struct Timers {
    by_deadline: BTreeMap<(Instant, u64), LoopTask>,
    deadlines: HashMap<u64, Instant>,
}

impl Timers {
    fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<LoopTask> {
        let (&(deadline, id), _) = self.by_deadline.iter().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.by_deadline.remove(&(deadline, id))
    }
}

pub struct MiniLoop {
    sender: mpsc::Sender<Event>,
    receiver: Mutex<mpsc::Receiver<Event>>,
    timers: Mutex<Timers>,
    next_timer: AtomicU64,
    stopping: AtomicBool,
}

impl Default for MiniLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniLoop {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            timers: Mutex::new(Timers::default()),
            next_timer: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_due_timers(&self) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            let due = self.timers().pop_due(Instant::now());
            match due {
                Some(task) => task(),
                None => return,
            }
        }
    }
}

/// Read newline-terminated frames from `source` on a `gcs-reader` thread
/// until end of stream, the first read error, or the loop going away.
fn spawn_frame_reader(
    source: impl Read + Send + 'static,
    mut deliver: impl FnMut(io::Result<Vec<u8>>) -> bool + Send + 'static,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("gcs-reader".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(source);
            loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line) {
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
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        deliver(Err(e));
                        break;
                    }
                }
            }
            debug!("frame reader finished");
        })?;
    Ok(())
}

impl EventLoop for MiniLoop {
    fn register_stream(
        &self,
        stream: TcpStream,
        on_frame: FrameHandler,
    ) -> io::Result<FrameWriter> {
        let reader = stream.try_clone()?;
        let sender = self.sender.clone();
        let deliver = frame_poster(on_frame, move |task| sender.send(Event::Task(task)).is_ok());
        spawn_frame_reader(reader, deliver)?;
        Ok(Box::new(stream))
    }

    fn add_timer(&self, delay: Duration, task: LoopTask) -> TimerId {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        {
            let mut timers = self.timers();
            timers.by_deadline.insert((deadline, id), task);
            timers.deadlines.insert(id, deadline);
        }
        let _ = self.sender.send(Event::Wake);
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.timers();
        match timers.deadlines.remove(&id.0) {
            Some(deadline) => timers.by_deadline.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    fn post(&self, task: LoopTask) {
        let _ = self.sender.send(Event::Task(task));
    }

    fn run(&self) {
        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        self.stopping.store(false, Ordering::SeqCst);

        while !self.stopping.load(Ordering::SeqCst) {
            self.run_due_timers();
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let next = self.timers().next_deadline();
            let event = match next {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(wait) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                Event::Task(task) => task(),
                Event::Wake => {}
            }
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.sender.send(Event::Wake);
    }
}
