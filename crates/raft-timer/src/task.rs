//! # task
//!
//! why: give callers a way to cancel a scheduled task that races safely with firing
//! relations: tasks are slotted by wheel.rs and executed by the worker pool in driver.rs
//! what: Task (handler + delay), TaskHandle (cancelable view of a task's state)

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const WAITING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

pub(crate) type Handler = Box<dyn Fn() + Send + Sync + 'static>;

/// A scheduled unit of work.
pub(crate) struct Task {
    state: Arc<AtomicU8>,
    /// delay (or period, when repeating) in whole ticks
    pub(crate) ticks: u64,
    pub(crate) repeat: bool,
    handler: Handler,
}

impl Task {
    pub(crate) fn new(ticks: u64, repeat: bool, handler: Handler) -> (Arc<Task>, TaskHandle) {
        let state = Arc::new(AtomicU8::new(WAITING));
        let task = Arc::new(Task {
            state: state.clone(),
            ticks,
            repeat,
            handler,
        });
        (task, TaskHandle { state })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Claim the right to run a one-shot task. Only one caller ever wins,
    /// and never after a successful cancel.
    pub(crate) fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(WAITING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn run(&self) {
        (self.handler)()
    }
}

/// Cancelable handle returned by every schedule call.
///
/// Cancelling a one-shot task that has not fired yet guarantees it never
/// runs. Cancelling a repeating task stops every future run; a run that was
/// already handed to a worker may still complete.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    /// A handle that is not bound to any wheel.
    ///
    /// Useful for callers that drive timers by hand (tests, simulations):
    /// cancel and is_cancelled behave exactly like a scheduled task's.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(WAITING)),
        }
    }

    /// Cancel the task. Returns true if this call prevented a future run.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// True while the task may still run.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }
}
