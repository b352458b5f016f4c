//! Dispatch Worker
//!
//! A named thread that runs jobs in submission order. Socket readers hand
//! anything that may block (listener callbacks, remote-object invocations)
//! to a worker and keep reading, so a reply to a call made from inside a
//! callback can still be read and resolved.

use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, SendTimeoutError, Sender};

use crate::error::{LinkError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Ordered job runner on its own thread
///
/// Dropping the handle closes the channel; jobs already queued still run,
/// then the thread exits. The thread is never joined, so a job may drop the
/// handle of the worker it runs on.
pub struct Dispatcher {
    label: String,
    sender: Sender<Job>,
}

impl Dispatcher {
    pub fn spawn(label: impl Into<String>, capacity: usize) -> Result<Self> {
        let label = label.into();
        let (sender, receiver) = channel::bounded::<Job>(capacity.max(1));

        let name = label.clone();
        thread::Builder::new().name(label.clone()).spawn(move || {
            for job in receiver.iter() {
                job();
            }
            tracing::trace!("Dispatcher {} exited", name);
        })?;

        Ok(Self { label, sender })
    }

    /// Queue a job, waiting up to `block_timeout` for room
    pub fn submit<F>(&self, job: F, block_timeout: Duration) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.send_timeout(Box::new(job), block_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(LinkError::Timeout(format!(
                "{} blocked for {}ms",
                self.label,
                block_timeout.as_millis()
            ))),
            Err(SendTimeoutError::Disconnected(_)) => Err(LinkError::NotRunning),
        }
    }

    /// Jobs queued and not yet started
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
