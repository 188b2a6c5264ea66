mod poller;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::options::Options;

pub use poller::{Descriptor, Interest, descriptor};

/// Something the scheduler drives. Polled registrants are run when their
/// descriptor is readable; timed and dynamic ones when their deadline passes.
pub trait Registrant {
    fn prefix(&self) -> String;
    fn run(&mut self, ctx: &mut Context) -> anyhow::Result<()>;
    /// Idempotent. Called once more during housekeeping after `closed()`
    /// turns true so late notifications can be delivered.
    fn close(&mut self);
    fn closed(&self) -> bool;

    fn fileno(&self) -> Option<Descriptor> {
        None
    }

    fn wants_write(&self) -> bool {
        false
    }

    /// How long until the next run is due. Dynamic registrants are run on
    /// this alone; polled ones are also run when it reaches zero.
    fn time_left(&self, _now: Instant) -> Option<Duration> {
        None
    }
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub enum Registration {
    Polled(Box<dyn Registrant>),
    Timed {
        deadline: Instant,
        task: Box<dyn Registrant>,
    },
    Dynamic(Box<dyn Registrant>),
    Threaded(Job),
    Queued(Job),
}

impl Registration {
    pub fn polled(registrant: impl Registrant + 'static) -> Self {
        Registration::Polled(Box::new(registrant))
    }

    pub fn after(delay: Duration, task: impl Registrant + 'static) -> Self {
        Registration::Timed {
            deadline: Instant::now() + delay,
            task: Box::new(task),
        }
    }

    pub fn dynamic(registrant: impl Registrant + 'static) -> Self {
        Registration::Dynamic(Box::new(registrant))
    }

    pub fn threaded(job: impl FnOnce() + Send + 'static) -> Self {
        Registration::Threaded(Box::new(job))
    }

    pub fn queued(job: impl FnOnce() + Send + 'static) -> Self {
        Registration::Queued(Box::new(job))
    }
}

/// Handed to a running registrant. Registrations made here are applied
/// after the current dispatch round.
pub struct Context {
    pending: Vec<Registration>,
    handle: SchedulerHandle,
}

impl Context {
    pub fn register(&mut self, registration: Registration) {
        self.pending.push(registration);
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }
}

/// One-shot task for the timed queue.
pub struct Timer<F> {
    prefix: String,
    action: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(&mut Context) -> anyhow::Result<()>,
{
    pub fn new(prefix: impl Into<String>, action: F) -> Self {
        Self {
            prefix: prefix.into(),
            action: Some(action),
        }
    }
}

impl<F> Registrant for Timer<F>
where
    F: FnOnce(&mut Context) -> anyhow::Result<()>,
{
    fn prefix(&self) -> String {
        self.prefix.clone()
    }

    fn run(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        match self.action.take() {
            Some(action) => action(ctx),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.action = None;
    }

    fn closed(&self) -> bool {
        self.action.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{prefix}: {error:#}")]
    Registrant {
        prefix: String,
        error: anyhow::Error,
    },
    #[error("readiness wait failed: {0}")]
    Poll(#[from] io::Error),
}

struct QueueState {
    jobs: VecDeque<Job>,
    draining: bool,
}

struct Shared {
    closed: AtomicBool,
    stop: AtomicBool,
    queue: Mutex<QueueState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("background job panicked");
    }
}

/// Thread-safe side of the scheduler: other threads use it to queue work
/// and to ask the loop to stop.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                closed: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                queue: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    draining: false,
                }),
                workers: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Runs `job` on the single queue worker, after everything queued before it.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        let mut queue = lock(&self.shared.queue);
        queue.jobs.push_back(Box::new(job));
        if queue.draining || self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        queue.draining = true;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("daide-queue".into())
            .spawn(move || {
                loop {
                    let job = {
                        let mut queue = lock(&shared.queue);
                        match queue.jobs.pop_front() {
                            Some(job) => job,
                            None => {
                                queue.draining = false;
                                return;
                            }
                        }
                    };
                    run_job(job);
                }
            });
        match spawned {
            Ok(handle) => lock(&self.shared.workers).push(handle),
            Err(e) => {
                log::error!("failed to start queue worker: {}", e);
                queue.draining = false;
            }
        }
    }

    /// Runs `job` on its own thread. Refused once the scheduler has closed.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let mut workers = lock(&self.shared.workers);
        if self.shared.closed.load(Ordering::SeqCst) {
            log::warn!("scheduler closed, refusing threaded job");
            return false;
        }
        match thread::Builder::new()
            .name("daide-worker".into())
            .spawn(move || run_job(Box::new(job)))
        {
            Ok(handle) => {
                workers.push(handle);
                true
            }
            Err(e) => {
                log::error!("failed to start worker thread: {}", e);
                false
            }
        }
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Polled, timed and dynamic registrants alive at the last housekeeping pass.
    pub fn active_registrants(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst) || self.is_closed()
    }

    fn has_background_work(&self) -> bool {
        let queued = {
            let queue = lock(&self.shared.queue);
            queue.draining || !queue.jobs.is_empty()
        };
        queued || lock(&self.shared.workers).iter().any(|h| !h.is_finished())
    }

    fn reap_finished(&self) {
        let mut workers = lock(&self.shared.workers);
        let (finished, running): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|h| h.is_finished());
        *workers = running;
        drop(workers);
        for handle in finished {
            let _ = handle.join();
        }
    }

    /// Marks the scheduler closed, joins every worker and runs whatever is
    /// still queued on the calling thread.
    fn shut_down(&self) {
        {
            let _queue = lock(&self.shared.queue);
            self.shared.closed.store(true, Ordering::SeqCst);
        }
        loop {
            let handles = std::mem::take(&mut *lock(&self.shared.workers));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    log::error!("worker thread panicked");
                }
            }
        }
        let jobs = std::mem::take(&mut lock(&self.shared.queue).jobs);
        for job in jobs {
            run_job(job);
        }
    }
}

fn dispatch(
    registrant: &mut dyn Registrant,
    ctx: &mut Context,
    block_exceptions: bool,
) -> Result<(), SchedulerError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| registrant.run(ctx)));
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) if block_exceptions => {
            log::error!("{}: {:#}", registrant.prefix(), error);
            registrant.close();
            Ok(())
        }
        Ok(Err(error)) => Err(SchedulerError::Registrant {
            prefix: registrant.prefix(),
            error,
        }),
        Err(_) if block_exceptions => {
            log::error!("{}: panicked while running", registrant.prefix());
            registrant.close();
            Ok(())
        }
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Single-threaded reactor multiplexing sockets, deadlines, threads and a
/// work queue.
pub struct Scheduler {
    polled: HashMap<Descriptor, Box<dyn Registrant>>,
    timed: Vec<(Instant, Box<dyn Registrant>)>,
    dynamic: Vec<Box<dyn Registrant>>,
    context: Context,
    wait_time: Duration,
    sleep_time: Duration,
    block_exceptions: bool,
}

impl Scheduler {
    pub fn new(options: &Options) -> Self {
        Self {
            polled: HashMap::new(),
            timed: Vec::new(),
            dynamic: Vec::new(),
            context: Context {
                pending: Vec::new(),
                handle: SchedulerHandle::new(),
            },
            wait_time: options.wait_time(),
            sleep_time: options.sleep_time(),
            block_exceptions: options.block_exceptions,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.context.handle.clone()
    }

    pub fn register(&mut self, registration: Registration) {
        self.context.pending.push(registration);
        self.apply_pending();
    }

    pub fn active_registrants(&self) -> usize {
        self.polled.len() + self.timed.len() + self.dynamic.len()
    }

    /// Runs until every registrant is gone or `stop` is requested, then
    /// closes whatever is left.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        log::debug!("scheduler starting");
        let result = self.run_loop();
        self.close();
        result
    }

    fn run_loop(&mut self) -> Result<(), SchedulerError> {
        while !self.context.handle.stopping() {
            self.housekeeping();
            if self.active_registrants() == 0 && !self.context.handle.has_background_work() {
                log::debug!("no registrants left");
                break;
            }

            let now = Instant::now();
            let timeout = self
                .next_deadline(now)
                .map_or(self.wait_time, |d| d.min(self.wait_time));
            let interest: Vec<Interest> = self
                .polled
                .iter()
                .map(|(fd, r)| Interest {
                    fd: *fd,
                    write: r.wants_write(),
                })
                .collect();

            let ready = poller::wait(&interest, timeout)?;
            let mut fired = !ready.is_empty();
            for fd in ready {
                if let Some(registrant) = self.polled.get_mut(&fd) {
                    if !registrant.closed() {
                        dispatch(registrant.as_mut(), &mut self.context, self.block_exceptions)?;
                    }
                }
            }

            fired |= self.run_due(Instant::now())?;
            self.apply_pending();

            if !fired {
                thread::sleep(self.sleep_time);
            }
        }
        Ok(())
    }

    fn next_deadline(&self, now: Instant) -> Option<Duration> {
        let timed = self
            .timed
            .iter()
            .map(|(deadline, _)| deadline.saturating_duration_since(now));
        let dynamic = self
            .dynamic
            .iter()
            .chain(self.polled.values())
            .filter_map(|r| r.time_left(now));
        timed.chain(dynamic).min()
    }

    fn run_due(&mut self, now: Instant) -> Result<bool, SchedulerError> {
        let mut fired = false;

        let mut tasks = std::mem::take(&mut self.timed).into_iter();
        while let Some((deadline, mut task)) = tasks.next() {
            if deadline > now || task.closed() {
                self.timed.push((deadline, task));
                continue;
            }
            fired = true;
            if let Err(e) = dispatch(task.as_mut(), &mut self.context, self.block_exceptions) {
                self.timed.push((deadline, task));
                self.timed.extend(tasks);
                return Err(e);
            }
            if !task.closed() {
                task.close();
            }
        }

        let due = |r: &dyn Registrant| {
            !r.closed() && r.time_left(now).is_some_and(|left| left.is_zero())
        };
        for registrant in self.dynamic.iter_mut().chain(self.polled.values_mut()) {
            if due(registrant.as_ref()) {
                fired = true;
                dispatch(registrant.as_mut(), &mut self.context, self.block_exceptions)?;
            }
        }

        Ok(fired)
    }

    fn housekeeping(&mut self) {
        self.polled.retain(|_, registrant| {
            if registrant.closed() {
                log::debug!("{}: removed", registrant.prefix());
                registrant.close();
                false
            } else {
                true
            }
        });
        self.timed.retain_mut(|(_, task)| {
            if task.closed() {
                task.close();
                false
            } else {
                true
            }
        });
        self.dynamic.retain_mut(|registrant| {
            if registrant.closed() {
                registrant.close();
                false
            } else {
                true
            }
        });
        self.apply_pending();
        self.context.handle.reap_finished();
        self.context
            .handle
            .shared
            .active
            .store(self.active_registrants(), Ordering::SeqCst);
    }

    fn apply_pending(&mut self) {
        for registration in std::mem::take(&mut self.context.pending) {
            match registration {
                Registration::Polled(mut registrant) => match registrant.fileno() {
                    Some(fd) => {
                        if let Some(mut previous) = self.polled.insert(fd, registrant) {
                            log::warn!("{}: descriptor reused, closing", previous.prefix());
                            previous.close();
                        }
                    }
                    None => {
                        log::error!("{}: polled registrant without a descriptor", registrant.prefix());
                        registrant.close();
                    }
                },
                Registration::Timed { deadline, task } => self.timed.push((deadline, task)),
                Registration::Dynamic(registrant) => self.dynamic.push(registrant),
                Registration::Threaded(job) => {
                    self.context.handle.spawn(job);
                }
                Registration::Queued(job) => self.context.handle.enqueue(job),
            }
        }
    }

    /// Closes every remaining registrant, joins worker threads and drains the queue.
    pub fn close(&mut self) {
        if self.context.handle.is_closed() {
            return;
        }
        self.apply_pending();
        for (_, mut registrant) in self.polled.drain() {
            if !registrant.closed() {
                log::debug!("{}: closing at shutdown", registrant.prefix());
            }
            registrant.close();
        }
        for (_, mut task) in self.timed.drain(..) {
            task.close();
        }
        for mut registrant in self.dynamic.drain(..) {
            registrant.close();
        }
        self.context.handle.shut_down();
        self.context.handle.shared.active.store(0, Ordering::SeqCst);
        log::debug!("scheduler closed");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicU32;

    fn fast_options() -> Options {
        Options {
            wait_time_ms: 20,
            sleep_time_ms: 1,
            ..Options::default()
        }
    }

    struct Countdown {
        left: u32,
        runs: Rc<Cell<u32>>,
        closes: Rc<Cell<u32>>,
        closed: bool,
    }

    impl Registrant for Countdown {
        fn prefix(&self) -> String {
            "countdown".into()
        }

        fn run(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            self.runs.set(self.runs.get() + 1);
            self.left = self.left.saturating_sub(1);
            if self.left == 0 {
                self.closed = true;
            }
            Ok(())
        }

        fn close(&mut self) {
            self.closes.set(self.closes.get() + 1);
            self.closed = true;
        }

        fn closed(&self) -> bool {
            self.closed
        }

        fn time_left(&self, _now: Instant) -> Option<Duration> {
            Some(Duration::ZERO)
        }
    }

    #[test]
    fn test_timer_fires_once_and_loop_exits() {
        let mut scheduler = Scheduler::new(&fast_options());
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        scheduler.register(Registration::after(
            Duration::from_millis(30),
            Timer::new("timer", move |_ctx: &mut Context| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        ));

        let start = Instant::now();
        scheduler.run().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(scheduler.active_registrants(), 0);
    }

    #[test]
    fn test_dynamic_registrant_runs_until_closed() {
        let mut scheduler = Scheduler::new(&fast_options());
        let runs = Rc::new(Cell::new(0));
        let closes = Rc::new(Cell::new(0));
        scheduler.register(Registration::dynamic(Countdown {
            left: 3,
            runs: Rc::clone(&runs),
            closes: Rc::clone(&closes),
            closed: false,
        }));

        scheduler.run().unwrap();
        assert_eq!(runs.get(), 3);
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_failing_registrant_closed_when_blocked() {
        let mut scheduler = Scheduler::new(&fast_options());
        scheduler.register(Registration::after(
            Duration::ZERO,
            Timer::new("broken", |_ctx: &mut Context| anyhow::bail!("boom")),
        ));
        scheduler.run().unwrap();
    }

    #[test]
    fn test_failing_registrant_surfaces_when_unblocked() {
        let options = Options {
            block_exceptions: false,
            ..fast_options()
        };
        let mut scheduler = Scheduler::new(&options);
        scheduler.register(Registration::after(
            Duration::ZERO,
            Timer::new("broken", |_ctx: &mut Context| anyhow::bail!("boom")),
        ));
        let err = scheduler.run().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_failure_leaves_other_due_tasks_to_shutdown() {
        let options = Options {
            block_exceptions: false,
            ..fast_options()
        };
        let mut scheduler = Scheduler::new(&options);
        let runs = Rc::new(Cell::new(0));
        let closes = Rc::new(Cell::new(0));
        scheduler.register(Registration::after(
            Duration::ZERO,
            Timer::new("broken", |_ctx: &mut Context| anyhow::bail!("boom")),
        ));
        scheduler.register(Registration::after(
            Duration::ZERO,
            Countdown {
                left: 1,
                runs: Rc::clone(&runs),
                closes: Rc::clone(&closes),
                closed: false,
            },
        ));

        assert!(scheduler.run().is_err());
        assert_eq!(runs.get(), 0);
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_registration_from_context() {
        let mut scheduler = Scheduler::new(&fast_options());
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);
        scheduler.register(Registration::after(
            Duration::ZERO,
            Timer::new("outer", move |ctx: &mut Context| {
                ctx.register(Registration::queued(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                }));
                Ok(())
            }),
        ));
        scheduler.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_refused_after_close() {
        let mut scheduler = Scheduler::new(&fast_options());
        let handle = scheduler.handle();
        scheduler.close();
        assert!(handle.is_closed());
        assert!(!handle.spawn(|| {}));
    }
}
