//! Outbound Queue
//!
//! Per-socket FIFO with a single writer thread. Callers enqueue commands and
//! return immediately unless the queue is full; the writer thread encodes
//! them onto the stream in order and reports idle periods through
//! [`QueueHooks::on_timeout`].

use std::io::{self, BufWriter, ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::cipher::BoxWrite;
use crate::error::{LinkError, Result};
use crate::protocol::{encode_command, Command};

/// Default number of commands that may wait in the queue
pub const DEFAULT_CAPACITY: usize = 32;

/// Default idle window before `on_timeout` fires
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive write failures after which the writer gives up
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Callbacks from the writer thread
pub trait QueueHooks: Send + Sync {
    /// The queue stayed empty for a whole idle window
    fn on_timeout(&self) {}

    /// The writer gave up after repeated write failures
    fn on_failed(&self, _error: &LinkError) {}
}

struct NoHooks;

impl QueueHooks for NoHooks {}

/// State shared between the queue handle and its writer thread
struct WriterShared {
    idle_timeout_ms: AtomicU64,
    stopping: AtomicBool,
    abandon: AtomicBool,
}

struct Running {
    sender: Sender<Command>,
    worker: JoinHandle<()>,
    shared: Arc<WriterShared>,
}

/// Asynchronous FIFO writer for one output stream
pub struct OutboundQueue {
    /// Label used for the thread name and logs
    label: String,

    capacity: usize,

    idle_timeout_ms: AtomicU64,

    running: Mutex<Option<Running>>,
}

impl OutboundQueue {
    pub fn new(label: impl Into<String>, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            capacity: capacity.max(1),
            idle_timeout_ms: AtomicU64::new(idle_timeout.as_millis() as u64),
            running: Mutex::new(None),
        }
    }

    /// Start writing to `output` with no hooks
    pub fn start(&self, output: BoxWrite) -> Result<()> {
        self.start_with_hooks(output, Arc::new(NoHooks))
    }

    /// Start the writer thread; fails if it is already running
    pub fn start_with_hooks(&self, output: BoxWrite, hooks: Arc<dyn QueueHooks>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(LinkError::AlreadyRunning);
        }

        let (sender, receiver) = channel::bounded(self.capacity);
        let shared = Arc::new(WriterShared {
            idle_timeout_ms: AtomicU64::new(self.idle_timeout_ms.load(Ordering::Relaxed)),
            stopping: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let label = self.label.clone();
            thread::Builder::new()
                .name(format!("{}-writer", self.label))
                .spawn(move || write_loop(label, BufWriter::new(output), receiver, shared, hooks))?
        };

        tracing::debug!("Outbound queue {} started", self.label);
        *running = Some(Running {
            sender,
            worker,
            shared,
        });
        Ok(())
    }

    /// Enqueue a command, blocking while the queue is full
    pub fn add(&self, command: Command) -> Result<()> {
        let sender = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.sender.clone())
            .ok_or(LinkError::NotRunning)?;

        // Send outside the lock so a full queue only blocks this caller
        sender.send(command).map_err(|_| LinkError::NotRunning)
    }

    /// Stop the queue; idempotent
    ///
    /// With `flush` the call returns after every queued command was written.
    /// Without it, queued commands are dropped.
    pub fn stop(&self, flush: bool) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.shared.stopping.store(true, Ordering::SeqCst);
        if !flush {
            running.shared.abandon.store(true, Ordering::SeqCst);
        }

        let worker_id: ThreadId = running.worker.thread().id();
        // Closing the channel lets the writer drain and exit
        drop(running.sender);

        if flush && worker_id != thread::current().id() {
            if running.worker.join().is_err() {
                tracing::error!("Writer thread of {} panicked", self.label);
            }
        }
        tracing::debug!("Outbound queue {} stopped (flush={})", self.label, flush);
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Commands currently waiting to be written
    pub fn len(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.sender.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the idle window; applies from the next wait
    pub fn set_idle_timeout(&self, timeout: Duration) {
        let ms = timeout.as_millis() as u64;
        self.idle_timeout_ms.store(ms, Ordering::Relaxed);
        if let Some(running) = self.running.lock().as_ref() {
            running.shared.idle_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn write_loop(
    label: String,
    mut output: BufWriter<BoxWrite>,
    receiver: Receiver<Command>,
    shared: Arc<WriterShared>,
    hooks: Arc<dyn QueueHooks>,
) {
    loop {
        if shared.abandon.load(Ordering::SeqCst) {
            break;
        }

        let timeout = Duration::from_millis(shared.idle_timeout_ms.load(Ordering::Relaxed));
        match receiver.recv_timeout(timeout) {
            Ok(command) => {
                if shared.abandon.load(Ordering::SeqCst) {
                    break;
                }
                let bytes = match encode_command(&command) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!("Dropping {} on {}: {}", command.type_name(), label, e);
                        continue;
                    }
                };
                if let Err(e) = write_with_retry(&label, &mut output, &bytes) {
                    tracing::error!("Writer {} giving up on {}: {}", label, command.type_name(), e);
                    hooks.on_failed(&e);
                    return;
                }
                command.command_type().record_sent(bytes.len());
                tracing::trace!("{} -> {} ({} bytes)", label, command, bytes.len());
            }
            Err(RecvTimeoutError::Timeout) => {
                if !shared.stopping.load(Ordering::SeqCst) {
                    hooks.on_timeout();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::trace!("Writer {} exited", label);
}

/// Push one encoded command through the buffer and flush it
///
/// Bytes the buffer accepted are never offered again; after a failure only
/// the remainder and the flush are retried, so the peer sees each command
/// exactly once.
fn write_with_retry(label: &str, output: &mut BufWriter<BoxWrite>, bytes: &[u8]) -> Result<()> {
    let mut written = 0;
    let mut errors = 0;
    loop {
        let attempt = if written < bytes.len() {
            match output.write(&bytes[written..]) {
                Ok(0) => Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    errors = 0;
                    continue;
                }
                Err(e) => Err(e),
            }
        } else {
            output.flush()
        };

        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                errors += 1;
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(e.into());
                }
                tracing::warn!(
                    "Write on {} failed ({}/{}): {}",
                    label,
                    errors,
                    MAX_CONSECUTIVE_ERRORS,
                    e
                );
                thread::sleep(RETRY_DELAY);
            }
        }
    }
}
