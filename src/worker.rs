//! Cooperative worker threads.
//!
//! A [`Worker`] drives a [`Job`] on its own thread: `init`, then `step`
//! followed by an interruptible sleep until the job fails or the worker is
//! killed, then `shutdown`. The controlling thread talks to it through a
//! shared [`WorkerControl`]: request flags are atomics, the lifecycle state
//! lives under a mutex whose condition variable is used both for the
//! worker's sleep and for the controller waiting on state changes.
//!
//! Kill is only observed between steps, at the top of an iteration and on
//! waking from sleep. A step in flight always runs to completion.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::job::Job;

/// How long a paused worker waits between checks of its flags.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `kill` waits between broadcasts while the worker winds down.
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    /// Loop has ended; `shutdown` is running.
    ShuttingDown,
    /// Thread is done and can be joined.
    Closed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a worker's control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub kill_requested: bool,
    pub pause_requested: bool,
    pub failed: bool,
}

#[derive(Debug)]
struct Shared {
    state: WorkerState,
    /// Set by `wake`, consumed by the next sleep.
    wake: bool,
}

/// State shared by a worker thread and its controller.
#[derive(Debug)]
pub struct WorkerControl {
    shared: Mutex<Shared>,
    cond: Condvar,
    kill: AtomicBool,
    pause: AtomicBool,
    failed: AtomicBool,
    interval: Duration,
}

impl WorkerControl {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Mutex::new(Shared {
                state: WorkerState::Created,
                wake: false,
            }),
            cond: Condvar::new(),
            kill: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.state(),
            kill_requested: self.kill_requested(),
            pause_requested: self.pause.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: WorkerState) {
        let mut shared = self.lock();
        shared.state = state;
        self.cond.notify_all();
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
        let _shared = self.lock();
        self.cond.notify_all();
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
        let _shared = self.lock();
        self.cond.notify_all();
    }

    /// Cut the current sleep short.
    pub fn wake(&self) {
        let mut shared = self.lock();
        shared.wake = true;
        self.cond.notify_all();
    }

    /// Sleep for the configured interval unless woken or killed first.
    fn sleep(&self) {
        let shared = self.lock();
        let (mut shared, _) = self
            .cond
            .wait_timeout_while(shared, self.interval, |s| {
                !s.wake && !self.kill.load(Ordering::SeqCst)
            })
            .unwrap_or_else(PoisonError::into_inner);
        shared.wake = false;
    }

    /// Block while a pause is requested and no kill is.
    fn wait_unpaused(&self) {
        let mut shared = self.lock();
        shared.state = WorkerState::Paused;
        self.cond.notify_all();
        while self.pause.load(Ordering::SeqCst) && !self.kill_requested() {
            shared = self
                .cond
                .wait_timeout(shared, PAUSE_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        shared.state = WorkerState::Running;
        self.cond.notify_all();
    }

    /// Broadcast until the worker reports `Closed` or `finished` says its
    /// thread is gone. Returns the number of broadcasts it took.
    pub fn wait_closed(&self, finished: impl Fn() -> bool) -> usize {
        let mut signals = 0;
        let mut shared = self.lock();
        while shared.state != WorkerState::Closed && !finished() {
            self.cond.notify_all();
            signals += 1;
            shared = self
                .cond
                .wait_timeout(shared, KILL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        signals
    }

    /// Wait until the worker has left `Created` or its thread is gone.
    fn wait_started(&self, finished: impl Fn() -> bool) {
        let mut shared = self.lock();
        while shared.state == WorkerState::Created && !finished() {
            shared = self
                .cond
                .wait_timeout(shared, KILL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Handle to one running job.
pub struct Worker {
    name: String,
    control: Arc<WorkerControl>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start `job` on a new thread named after it and wait for its init to
    /// finish.
    pub fn spawn(job: Box<dyn Job>, interval: Duration) -> Result<Self, WorkerError> {
        let name = job.name().to_string();
        let control = Arc::new(WorkerControl::new(interval));

        let thread_control = control.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(job, thread_control))
            .map_err(|source| WorkerError::Spawn {
                name: name.clone(),
                source,
            })?;

        let worker = Self {
            name,
            control,
            thread: Some(thread),
        };
        worker.control.wait_started(|| worker.thread_finished());
        worker.settle_dead_thread();
        debug!(worker = %worker.name, state = %worker.state(), "worker started");
        Ok(worker)
    }

    fn thread_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// A thread that ended without reporting `Closed` died outside its job.
    fn settle_dead_thread(&self) {
        if self.control.state() != WorkerState::Closed && self.thread_finished() {
            warn!(worker = %self.name, "worker thread exited without closing");
            self.control.mark_failed();
            self.control.set_state(WorkerState::Closed);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    pub fn status(&self) -> WorkerStatus {
        self.control.status()
    }

    pub fn pause(&self) {
        self.control.request_pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn wake(&self) {
        self.control.wake();
    }

    pub fn request_kill(&self) {
        self.control.request_kill();
    }

    pub fn wait_closed(&self) {
        let signals = self.control.wait_closed(|| self.thread_finished());
        self.settle_dead_thread();
        debug!(worker = %self.name, signals, "worker closed");
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked outside its job");
            }
        }
    }

    /// Ask the worker to stop, wait for it to close and join it. Returns
    /// at once for a worker that is already closed and joined.
    pub fn kill(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.request_kill();
        self.wait_closed();
        self.join();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

fn run(mut job: Box<dyn Job>, control: Arc<WorkerControl>) {
    let name = job.name().to_string();

    let initialized = match panic::catch_unwind(AssertUnwindSafe(|| job.init())) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(worker = %name, error = %e, "init failed");
            false
        }
        Err(payload) => {
            error!(worker = %name, panic = %panic_message(&*payload), "init panicked");
            false
        }
    };

    if initialized {
        control.set_state(WorkerState::Running);
        info!(worker = %name, interval = ?control.interval(), "worker running");
        run_loop(job.as_mut(), &control, &name);
        control.set_state(WorkerState::ShuttingDown);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.shutdown())) {
            error!(worker = %name, panic = %panic_message(&*payload), "shutdown panicked");
        }
    } else {
        control.mark_failed();
        control.set_state(WorkerState::ShuttingDown);
    }

    info!(worker = %name, failed = control.status().failed, "worker closed");
    control.set_state(WorkerState::Closed);
}

fn run_loop(job: &mut dyn Job, control: &WorkerControl, name: &str) {
    loop {
        if control.kill_requested() {
            break;
        }
        if control.pause.load(Ordering::SeqCst) {
            debug!(worker = %name, "paused");
            control.wait_unpaused();
            if control.kill_requested() {
                break;
            }
            debug!(worker = %name, "resumed");
        }

        match panic::catch_unwind(AssertUnwindSafe(|| job.step())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(worker = %name, error = %e, "step failed");
                control.mark_failed();
                break;
            }
            Err(payload) => {
                error!(worker = %name, panic = %panic_message(&*payload), "step panicked");
                control.mark_failed();
                break;
            }
        }

        if control.kill_requested() {
            break;
        }
        control.sleep();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Counts steps and optionally fails or panics on a given step.
    struct Counter {
        steps: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_at: Option<usize>,
        panic_at: Option<usize>,
        fail_init: bool,
    }

    impl Counter {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let steps = Arc::new(AtomicUsize::new(0));
            let shutdowns = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    steps: steps.clone(),
                    shutdowns: shutdowns.clone(),
                    fail_at: None,
                    panic_at: None,
                    fail_init: false,
                },
                steps,
                shutdowns,
            )
        }
    }

    impl Job for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn init(&mut self) -> Result<(), JobError> {
            if self.fail_init {
                return Err(JobError::Init("no root".into()));
            }
            Ok(())
        }

        fn step(&mut self) -> Result<(), JobError> {
            let n = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_at == Some(n) {
                panic!("step {n} blew up");
            }
            if self.fail_at == Some(n) {
                return Err(JobError::Step(format!("step {n}")));
            }
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn kill_wakes_sleeping_worker_without_another_step() {
        let (job, steps, shutdowns) = Counter::new();
        let mut worker = Worker::spawn(Box::new(job), Duration::from_secs(3600)).unwrap();
        wait_for(|| steps.load(Ordering::SeqCst) == 1);

        let started = Instant::now();
        worker.kill();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.status().failed);
        assert!(worker.status().kill_requested);
    }

    #[test]
    fn kill_is_idempotent() {
        let (job, _, shutdowns) = Counter::new();
        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(5)).unwrap();
        worker.kill();
        worker.kill();
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loops_at_configured_interval() {
        let (job, steps, _) = Counter::new();
        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(2)).unwrap();
        wait_for(|| steps.load(Ordering::SeqCst) >= 3);
        worker.kill();
    }

    #[test]
    fn wake_cuts_sleep_short() {
        let (job, steps, _) = Counter::new();
        let mut worker = Worker::spawn(Box::new(job), Duration::from_secs(3600)).unwrap();
        wait_for(|| steps.load(Ordering::SeqCst) == 1);
        worker.wake();
        wait_for(|| steps.load(Ordering::SeqCst) == 2);
        worker.kill();
    }

    #[test]
    fn pause_blocks_steps_until_resume() {
        let (job, steps, _) = Counter::new();
        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(1)).unwrap();
        wait_for(|| steps.load(Ordering::SeqCst) >= 1);

        worker.pause();
        wait_for(|| worker.state() == WorkerState::Paused);
        let frozen = steps.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(steps.load(Ordering::SeqCst), frozen);

        worker.resume();
        wait_for(|| steps.load(Ordering::SeqCst) > frozen);
        worker.kill();
    }

    #[test]
    fn kill_releases_paused_worker() {
        let (job, steps, _) = Counter::new();
        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(1)).unwrap();
        worker.pause();
        wait_for(|| worker.state() == WorkerState::Paused);
        let frozen = steps.load(Ordering::SeqCst);
        worker.kill();
        assert_eq!(worker.state(), WorkerState::Closed);
        assert_eq!(steps.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn step_error_ends_loop_and_marks_failed() {
        let (mut job, steps, shutdowns) = Counter::new();
        job.fail_at = Some(2);
        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(1)).unwrap();
        wait_for(|| worker.state() == WorkerState::Closed);

        assert!(worker.status().failed);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        worker.kill();
    }

    #[test]
    fn step_panic_is_contained() {
        let (mut job, steps, _) = Counter::new();
        job.panic_at = Some(1);
        let (sibling, sibling_steps, _) = Counter::new();

        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(1)).unwrap();
        let mut other = Worker::spawn(Box::new(sibling), Duration::from_millis(1)).unwrap();
        wait_for(|| worker.state() == WorkerState::Closed);
        assert!(worker.status().failed);
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        let seen = sibling_steps.load(Ordering::SeqCst);
        wait_for(|| sibling_steps.load(Ordering::SeqCst) > seen);
        assert_eq!(other.state(), WorkerState::Running);

        worker.kill();
        other.kill();
    }

    #[test]
    fn init_failure_closes_without_stepping() {
        let (mut job, steps, shutdowns) = Counter::new();
        job.fail_init = true;
        let mut worker = Worker::spawn(Box::new(job), Duration::from_millis(1)).unwrap();
        wait_for(|| worker.state() == WorkerState::Closed);
        assert!(worker.status().failed);
        assert_eq!(steps.load(Ordering::SeqCst), 0);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        worker.kill();
    }

    /// Answers the first name lookup, then panics on the worker thread
    /// before any job code is guarded.
    struct NameOnce(Cell<usize>);

    impl Job for NameOnce {
        fn name(&self) -> &str {
            self.0.set(self.0.get() + 1);
            if self.0.get() > 1 {
                panic!("name lookup failed");
            }
            "name-once"
        }

        fn step(&mut self) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn kill_returns_when_thread_dies_outside_job() {
        let job = NameOnce(Cell::new(0));
        let mut worker = Worker::spawn(Box::new(job), Duration::from_secs(3600)).unwrap();

        let started = Instant::now();
        worker.kill();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(worker.state(), WorkerState::Closed);
        assert!(worker.status().failed);
    }

    #[test]
    fn drop_kills_worker() {
        let (job, _, shutdowns) = Counter::new();
        let worker = Worker::spawn(Box::new(job), Duration::from_secs(3600)).unwrap();
        drop(worker);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
