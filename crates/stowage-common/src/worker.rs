//! Background workers
//!
//! - `SerialQueue`: one named thread running submitted jobs in order
//! - `Periodic`: one named thread running a tick at a fixed delay
//!
//! Both are stopped and joined when dropped. A worker dropped from its own
//! thread (the last strong reference went away inside a job) detaches
//! instead of joining itself.

use crate::error::Result;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named thread that runs jobs one at a time, in submission order
pub struct SerialQueue {
    name: String,
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl SerialQueue {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Job on queue {} panicked", thread_name);
                }
            }
        })?;
        debug!("Started serial queue {}", name);

        Ok(Self {
            name,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Submit a job; returns false if the queue has shut down
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(Box::new(job)).is_ok())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Disconnect; the worker drains what is queued, then exits
        self.sender.take();
        join_unless_current(&self.name, self.handle.take());
    }
}

/// A fixed-delay recurring task
///
/// The tick runs `interval` after the previous tick finished. Returning
/// `false` from the tick ends the task.
pub struct Periodic {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub fn start(
        name: impl Into<String>,
        interval: Duration,
        mut tick: impl FnMut() -> bool + Send + 'static,
    ) -> Result<Self> {
        let name = name.into();
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        match panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(_) => {
                                error!("Periodic task {} panicked", thread_name);
                                break;
                            }
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Periodic task {} stopped", thread_name);
        })?;
        debug!("Started periodic task {} every {:?}", name, interval);

        Ok(Self {
            name,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Cancel the task and wait for an in-flight tick to finish
    pub fn stop(&mut self) {
        self.stop.take();
        join_unless_current(&self.name, self.handle.take());
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_unless_current(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else { return };
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("Worker {} exited with a panic", name);
    }
}
