//! # driver
//!
//! why: advance the wheel in real time and run expired tasks off the driver thread
//! relations: wraps wheel.rs; handed out to raft-core's runtime as a shared scheduler
//! what: WheelConfig, TimingWheel (schedule, schedule_repeat, shutdown)

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::task::{Task, TaskHandle};
use crate::wheel::Wheel;

/// Configuration for a timing wheel.
#[derive(Debug, Clone)]
pub struct WheelConfig {
    /// base time unit; every delay is quantized to a multiple of it
    pub tick: Duration,
    /// the wheel has 2^bits slots
    pub bits: u32,
    /// number of worker threads running expired tasks
    pub workers: usize,
    /// capacity of the queue between the driver and the workers
    pub queue_depth: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            bits: 9,
            workers: 2,
            queue_depth: 1024,
        }
    }
}

struct Shared {
    tick: Duration,
    pending: Mutex<Vec<Arc<Task>>>,
    shutdown: AtomicBool,
    ticks: AtomicU64,
}

/// A hashed timing wheel driven by a dedicated thread.
///
/// Scheduling only pushes onto a pending queue; the driver slots pending
/// tasks on its next advance, so callers never contend on the slot array.
/// Expired tasks run on a bounded worker pool, never on the driver itself.
pub struct TimingWheel {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TimingWheel {
    /// Start the driver and worker threads.
    pub fn new(config: WheelConfig) -> io::Result<Self> {
        if config.tick.is_zero() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tick must be non-zero"));
        }
        let shared = Arc::new(Shared {
            tick: config.tick,
            pending: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        });

        let (dispatch, queue) = bounded::<Arc<Task>>(config.queue_depth.max(1));
        let mut threads = Vec::with_capacity(config.workers + 1);
        for n in 0..config.workers.max(1) {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("wheel-worker-{}", n))
                .spawn(move || work(queue))?;
            threads.push(handle);
        }

        let driver_shared = shared.clone();
        let wheel = Wheel::new(config.bits);
        let handle = thread::Builder::new()
            .name("wheel-driver".to_string())
            .spawn(move || drive(driver_shared, wheel, dispatch))?;
        threads.push(handle);

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Run `handler` once, `delay` from now (rounded down to whole ticks).
    pub fn schedule<F>(&self, delay: Duration, handler: F) -> TaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit(delay, false, Box::new(handler))
    }

    /// Run `handler` every `period` until the handle is cancelled.
    pub fn schedule_repeat<F>(&self, period: Duration, handler: F) -> TaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit(period, true, Box::new(handler))
    }

    fn submit(&self, delay: Duration, repeat: bool, handler: crate::task::Handler) -> TaskHandle {
        let ticks = (delay.as_nanos() / self.shared.tick.as_nanos()) as u64;
        let (task, handle) = Task::new(ticks, repeat, handler);
        if self.shared.shutdown.load(Ordering::Acquire) {
            handle.cancel();
            return handle;
        }
        self.shared.pending.lock().push(task);
        handle
    }

    /// Ticks driven since start.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    pub fn tick(&self) -> Duration {
        self.shared.tick
    }

    /// Stop the driver and wait for the workers to drain.
    ///
    /// Tasks that have not expired yet are dropped without running.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in threads {
            // a handler dropping the wheel must not join its own worker
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("timing wheel thread panicked during shutdown");
            }
        }
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drive(shared: Arc<Shared>, mut wheel: Wheel, dispatch: Sender<Arc<Task>>) {
    let started = Instant::now();
    let tick_nanos = shared.tick.as_nanos() as u64;

    while !shared.shutdown.load(Ordering::Acquire) {
        // sleep towards the absolute deadline of the next tick, so jitter in
        // one sleep is absorbed by the next instead of accumulating
        let deadline = started + Duration::from_nanos(tick_nanos.saturating_mul(wheel.cursor() + 1));
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else if now - deadline > shared.tick {
            debug!(behind_ms = (now - deadline).as_millis() as u64, "timing wheel catching up");
        }

        let pending = std::mem::take(&mut *shared.pending.lock());
        let due = wheel.advance(pending);
        shared.ticks.store(wheel.cursor(), Ordering::Release);

        for task in due {
            if dispatch.send(task).is_err() {
                return;
            }
        }
    }
}

fn work(queue: Receiver<Arc<Task>>) {
    for task in queue.iter() {
        if task.repeat && task.is_cancelled() {
            continue;
        }
        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            warn!("timer task panicked");
        }
    }
}
