//! Disposal of evicted entries
//!
//! Evicted keys and values are always moved out of the store before they
//! are dropped. Where the drop runs is decided by the `ReleasePolicy`.

use parking_lot::{Mutex, RwLock};
use std::mem;
use std::sync::OnceLock;
use stowage_common::{ReleasePolicy, SerialQueue};
use tracing::warn;

/// Process-wide queue for `ReleasePolicy::Background`
fn release_queue() -> Option<&'static SerialQueue> {
    static QUEUE: OnceLock<Option<SerialQueue>> = OnceLock::new();
    QUEUE
        .get_or_init(|| match SerialQueue::new("stowage-release") {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!("Failed to start release queue, releasing inline: {}", e);
                None
            }
        })
        .as_ref()
}

pub(crate) struct Releaser {
    policy: RwLock<ReleasePolicy>,
    deferred: Mutex<Vec<Box<dyn Send>>>,
}

impl Releaser {
    pub(crate) fn new(policy: ReleasePolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn policy(&self) -> ReleasePolicy {
        *self.policy.read()
    }

    pub(crate) fn set_policy(&self, policy: ReleasePolicy) {
        *self.policy.write() = policy;
    }

    /// Drop `garbage` according to the current policy
    pub(crate) fn release<T: Send + 'static>(&self, garbage: T) {
        match self.policy() {
            ReleasePolicy::Inline => drop(garbage),
            ReleasePolicy::Background => match release_queue() {
                // A closed queue hands the job back, which drops it here
                Some(queue) => {
                    queue.dispatch(move || drop(garbage));
                }
                None => drop(garbage),
            },
            ReleasePolicy::Deferred => self.deferred.lock().push(Box::new(garbage)),
        }
    }

    /// Drop everything parked by the deferred policy on the calling thread
    pub(crate) fn drain_deferred(&self) -> usize {
        let parked = mem::take(&mut *self.deferred.lock());
        let count = parked.len();
        drop(parked);
        count
    }
}
