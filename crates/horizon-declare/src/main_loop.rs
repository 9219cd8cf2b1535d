//! Cooperative single-threaded main loop.
//!
//! The loop owns three kinds of work, all dispatched on the thread that owns
//! the [`MainContext`]:
//!
//! - **Idle sources**: run on every iteration until they return [`ControlFlow::Break`]
//! - **Timeout sources**: run once their deadline passes, then every `interval`
//!   until they return [`ControlFlow::Break`]
//! - **Local tasks**: futures spawned with [`MainContext::spawn_local`], polled
//!   whenever their waker fires
//!
//! Nothing here blocks except [`MainLoop::run`] on a system clock. With a
//! [`ClockMode::Manual`] clock, time only moves through [`MainContext::advance`],
//! which makes timer-driven behaviour reproducible in tests.
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//! use horizon_declare::{ControlFlow, MainContext};
//!
//! let context = MainContext::manual();
//! let fired = Rc::new(Cell::new(0));
//!
//! let counter = fired.clone();
//! context.timeout_add(Duration::from_millis(100), move || {
//!     counter.set(counter.get() + 1);
//!     ControlFlow::Break
//! });
//!
//! context.advance(Duration::from_millis(99));
//! assert_eq!(fired.get(), 0);
//! context.advance(Duration::from_millis(1));
//! assert_eq!(fired.get(), 1);
//! ```

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::future::LocalBoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::task::{self, ArcWake};
use slotmap::{SlotMap, new_key_type};

use crate::config::{ClockMode, DeclareConfig};
use crate::logging::targets;

new_key_type! {
    /// Identifier of an idle or timeout source attached to a [`MainContext`].
    pub struct SourceId;
}

/// Return value of a source callback.
///
/// `Break` is the removal sentinel: the source is detached after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep the source attached.
    Continue,
    /// Remove the source.
    Break,
}

/// Dispatch priority. Lower variants run first within an iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Ahead of everything else.
    High,
    /// Default for timeouts and deferred callbacks.
    #[default]
    Default,
    /// Idle work that should still beat redraw-style work.
    HighIdle,
    /// Default for background idle work.
    DefaultIdle,
    /// Last.
    Low,
}

/// Errors from source management.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The source was never attached or has already been removed.
    #[error("Invalid or already removed source {0:?}")]
    InvalidSource(SourceId),
}

type SourceFn = Box<dyn FnMut() -> ControlFlow>;

#[derive(Debug, Clone, Copy)]
enum SourceKind {
    Idle,
    Timeout { interval: Duration },
}

struct SourceData {
    kind: SourceKind,
    priority: Priority,
    /// Deadline for timeouts, attach time for idles.
    ready_at: Instant,
    /// Attach order, used as a tie-breaker.
    seq: u64,
    /// `None` while the callback is being dispatched.
    callback: Option<SourceFn>,
}

/// An entry in the timeout queue (min-heap by deadline).
#[derive(Debug, Clone, Copy)]
struct TimeoutEntry {
    id: SourceId,
    ready_at: Instant,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other.ready_at.cmp(&self.ready_at)
    }
}

#[derive(Default)]
struct LoopState {
    sources: SlotMap<SourceId, SourceData>,
    timeouts: BinaryHeap<TimeoutEntry>,
    next_seq: u64,
}

impl LoopState {
    /// Drop queue entries whose source is gone or was rescheduled.
    fn prune_timeouts(&mut self) {
        while let Some(entry) = self.timeouts.peek() {
            let live = self
                .sources
                .get(entry.id)
                .is_some_and(|data| data.ready_at == entry.ready_at);
            if live {
                break;
            }
            self.timeouts.pop();
        }
    }
}

enum Clock {
    System,
    Manual(Cell<Instant>),
}

struct ContextInner {
    state: RefCell<LoopState>,
    clock: Clock,
    tasks: RefCell<FuturesUnordered<LocalBoxFuture<'static, ()>>>,
    spawned: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    live_tasks: Cell<usize>,
    wake: Arc<TaskWake>,
    config: DeclareConfig,
}

/// Raised when any task in the set can make progress.
#[derive(Default)]
struct TaskWake {
    woken: AtomicBool,
}

impl ArcWake for TaskWake {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, atomic::Ordering::Release);
    }
}

/// Handle to a single-threaded main context.
///
/// Cloning the handle is cheap; all clones share the same sources and clock.
#[derive(Clone)]
pub struct MainContext {
    inner: Rc<ContextInner>,
}

impl MainContext {
    /// Create a context on the system clock with default configuration.
    pub fn new() -> Self {
        Self::with_config(DeclareConfig::default())
    }

    /// Create a context driven by a manual clock.
    pub fn manual() -> Self {
        Self::with_config(DeclareConfig::default().with_clock(ClockMode::Manual))
    }

    /// Create a context from an explicit configuration.
    pub fn with_config(config: DeclareConfig) -> Self {
        let clock = match config.clock {
            ClockMode::System => Clock::System,
            ClockMode::Manual => Clock::Manual(Cell::new(Instant::now())),
        };
        Self {
            inner: Rc::new(ContextInner {
                state: RefCell::new(LoopState::default()),
                clock,
                tasks: RefCell::new(FuturesUnordered::new()),
                spawned: RefCell::new(Vec::new()),
                live_tasks: Cell::new(0),
                wake: Arc::default(),
                config,
            }),
        }
    }

    /// The configuration this context was created with.
    pub fn config(&self) -> &DeclareConfig {
        &self.inner.config
    }

    /// Current time as seen by this context.
    pub fn now(&self) -> Instant {
        match &self.inner.clock {
            Clock::System => Instant::now(),
            Clock::Manual(now) => now.get(),
        }
    }

    /// Whether two handles refer to the same context.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach an idle callback at [`Priority::DefaultIdle`].
    pub fn idle_add<F>(&self, callback: F) -> SourceId
    where
        F: FnMut() -> ControlFlow + 'static,
    {
        self.idle_add_full(Priority::DefaultIdle, callback)
    }

    /// Attach an idle callback with an explicit priority.
    pub fn idle_add_full<F>(&self, priority: Priority, callback: F) -> SourceId
    where
        F: FnMut() -> ControlFlow + 'static,
    {
        let now = self.now();
        self.attach(SourceKind::Idle, priority, now, Box::new(callback))
    }

    /// Attach an idle callback that runs exactly once.
    pub fn idle_add_once<F>(&self, callback: F) -> SourceId
    where
        F: FnOnce() + 'static,
    {
        let mut callback = Some(callback);
        self.idle_add(move || {
            if let Some(callback) = callback.take() {
                callback();
            }
            ControlFlow::Break
        })
    }

    /// Attach a timeout at [`Priority::Default`].
    ///
    /// The first call happens `interval` from now; returning
    /// [`ControlFlow::Continue`] re-arms the timeout for another `interval`.
    pub fn timeout_add<F>(&self, interval: Duration, callback: F) -> SourceId
    where
        F: FnMut() -> ControlFlow + 'static,
    {
        self.timeout_add_full(Priority::Default, interval, callback)
    }

    /// Attach a timeout with an explicit priority.
    pub fn timeout_add_full<F>(&self, priority: Priority, interval: Duration, callback: F) -> SourceId
    where
        F: FnMut() -> ControlFlow + 'static,
    {
        let ready_at = self.now() + interval;
        let id = self.attach(
            SourceKind::Timeout { interval },
            priority,
            ready_at,
            Box::new(callback),
        );
        self.inner
            .state
            .borrow_mut()
            .timeouts
            .push(TimeoutEntry { id, ready_at });
        id
    }

    /// Attach a timeout that runs exactly once after `delay`.
    pub fn timeout_add_once<F>(&self, delay: Duration, callback: F) -> SourceId
    where
        F: FnOnce() + 'static,
    {
        let mut callback = Some(callback);
        self.timeout_add(delay, move || {
            if let Some(callback) = callback.take() {
                callback();
            }
            ControlFlow::Break
        })
    }

    fn attach(
        &self,
        kind: SourceKind,
        priority: Priority,
        ready_at: Instant,
        callback: SourceFn,
    ) -> SourceId {
        let mut state = self.inner.state.borrow_mut();
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = state.sources.insert(SourceData {
            kind,
            priority,
            ready_at,
            seq,
            callback: Some(callback),
        });
        tracing::trace!(target: targets::MAIN_LOOP, ?id, ?kind, ?priority, "attached source");
        id
    }

    /// Detach a source. Removing a source from inside its own callback is allowed.
    pub fn source_remove(&self, id: SourceId) -> Result<(), SourceError> {
        let removed = self.inner.state.borrow_mut().sources.remove(id);
        match removed {
            Some(data) => {
                tracing::trace!(target: targets::MAIN_LOOP, ?id, "removed source");
                // The callback is dropped here, outside the state borrow.
                drop(data);
                Ok(())
            }
            None => Err(SourceError::InvalidSource(id)),
        }
    }

    /// Whether a source is still attached.
    pub fn is_pending(&self, id: SourceId) -> bool {
        self.inner.state.borrow().sources.contains_key(id)
    }

    /// Number of attached sources.
    pub fn source_count(&self) -> usize {
        self.inner.state.borrow().sources.len()
    }

    /// Spawn a future onto this context. It is first polled on the next iteration.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.spawned.borrow_mut().push(Box::pin(future));
        self.inner.live_tasks.set(self.inner.live_tasks.get() + 1);
    }

    /// Number of spawned futures that have not completed.
    pub fn task_count(&self) -> usize {
        self.inner.live_tasks.get()
    }

    /// Deadline of the earliest attached timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut state = self.inner.state.borrow_mut();
        state.prune_timeouts();
        state.timeouts.peek().map(|entry| entry.ready_at)
    }

    /// Time until the earliest attached timeout, zero if one is already due.
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = self.now();
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Whether an iteration would dispatch anything right now.
    pub fn pending(&self) -> bool {
        if self.tasks_ready() {
            return true;
        }
        let now = self.now();
        let mut state = self.inner.state.borrow_mut();
        let idle_ready = state
            .sources
            .values()
            .any(|data| matches!(data.kind, SourceKind::Idle) && data.callback.is_some());
        if idle_ready {
            return true;
        }
        state.prune_timeouts();
        state.timeouts.peek().is_some_and(|entry| entry.ready_at <= now)
    }

    /// Run one loop iteration: poll woken tasks, then dispatch every due
    /// timeout and every idle source in priority order.
    ///
    /// Sources attached during the iteration wait for the next one.
    /// Returns `true` if anything was dispatched.
    #[tracing::instrument(skip(self), target = "horizon_declare::main_loop", level = "trace")]
    pub fn iteration(&self) -> bool {
        let polled = self.poll_tasks();
        let ready = self.collect_ready();
        for &id in &ready {
            self.dispatch(id);
        }
        polled || !ready.is_empty()
    }

    /// Iterate until nothing is due. Does not advance a manual clock.
    ///
    /// Returns the number of iterations that dispatched work.
    pub fn run_until_idle(&self) -> usize {
        let mut iterations = 0;
        while self.pending() {
            if !self.iteration() {
                break;
            }
            iterations += 1;
        }
        iterations
    }

    /// Move time forward by `by`, firing timeouts in deadline order.
    ///
    /// On a manual clock the clock steps to each deadline inside the window.
    /// On the system clock this sleeps for `by` and then drains due work.
    pub fn advance(&self, by: Duration) -> usize {
        match &self.inner.clock {
            Clock::Manual(now) => {
                let target = now.get() + by;
                let mut iterations = self.run_until_idle();
                while let Some(deadline) = self.next_deadline() {
                    if deadline > target {
                        break;
                    }
                    if deadline > now.get() {
                        now.set(deadline);
                    }
                    let dispatched = self.run_until_idle();
                    if dispatched == 0 {
                        break;
                    }
                    iterations += dispatched;
                }
                now.set(target);
                iterations + self.run_until_idle()
            }
            Clock::System => {
                std::thread::sleep(by);
                self.run_until_idle()
            }
        }
    }

    fn collect_ready(&self) -> Vec<SourceId> {
        let now = self.now();
        let mut guard = self.inner.state.borrow_mut();
        let state = &mut *guard;
        let mut ready: Vec<(Priority, Instant, u64, SourceId)> = Vec::new();

        while let Some(entry) = state.timeouts.peek() {
            if entry.ready_at > now {
                break;
            }
            let Some(entry) = state.timeouts.pop() else {
                break;
            };
            // Skip stale entries (source removed or re-armed).
            if let Some(data) = state.sources.get(entry.id) {
                if data.ready_at == entry.ready_at && data.callback.is_some() {
                    ready.push((data.priority, data.ready_at, data.seq, entry.id));
                }
            }
        }

        for (id, data) in &state.sources {
            if matches!(data.kind, SourceKind::Idle) && data.callback.is_some() {
                ready.push((data.priority, data.ready_at, data.seq, id));
            }
        }

        ready.sort_by_key(|&(priority, ready_at, seq, _)| (priority, ready_at, seq));
        ready.into_iter().map(|(_, _, _, id)| id).collect()
    }

    fn dispatch(&self, id: SourceId) {
        let callback = self
            .inner
            .state
            .borrow_mut()
            .sources
            .get_mut(id)
            .and_then(|data| data.callback.take());
        // Removed by an earlier callback in this iteration.
        let Some(mut callback) = callback else {
            return;
        };

        tracing::trace!(target: targets::MAIN_LOOP, ?id, "dispatching source");
        let flow = callback();
        let now = self.now();

        let leftover = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            if flow == ControlFlow::Continue {
                if let Some(data) = state.sources.get_mut(id) {
                    if let SourceKind::Timeout { interval } = data.kind {
                        data.ready_at = now + interval;
                        state.timeouts.push(TimeoutEntry {
                            id,
                            ready_at: data.ready_at,
                        });
                    }
                    data.callback = Some(callback);
                    None
                } else {
                    Some(callback)
                }
            } else {
                let removed = state.sources.remove(id);
                drop(removed);
                Some(callback)
            }
        };
        drop(leftover);
    }

    fn tasks_ready(&self) -> bool {
        !self.inner.spawned.borrow().is_empty() || self.inner.wake.woken.load(atomic::Ordering::Acquire)
    }

    /// Poll the task set once if a task was spawned or woken.
    fn poll_tasks(&self) -> bool {
        let spawned = std::mem::take(&mut *self.inner.spawned.borrow_mut());
        let woken = self.inner.wake.woken.swap(false, atomic::Ordering::AcqRel);
        if spawned.is_empty() && !woken {
            return false;
        }

        // Tasks may spawn more tasks while being polled; those land in
        // `spawned` and wait for the next iteration.
        let mut tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        tasks.extend(spawned);

        let waker = task::waker(Arc::clone(&self.inner.wake));
        let mut cx = Context::from_waker(&waker);
        let mut finished = 0;
        while let Poll::Ready(Some(())) = tasks.poll_next_unpin(&mut cx) {
            finished += 1;
        }
        self.inner.live_tasks.set(self.inner.live_tasks.get() - finished);
        tracing::trace!(target: targets::MAIN_LOOP, finished, remaining = tasks.len(), "polled tasks");

        *self.inner.tasks.borrow_mut() = tasks;
        true
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("MainContext")
            .field("sources", &state.sources.len())
            .field("tasks", &self.inner.live_tasks.get())
            .field("clock", &self.inner.config.clock)
            .finish()
    }
}

/// A blocking loop over a [`MainContext`].
#[derive(Clone)]
pub struct MainLoop {
    context: MainContext,
    running: Rc<Cell<bool>>,
}

impl MainLoop {
    /// Create a loop over `context`.
    pub fn new(context: &MainContext) -> Self {
        Self {
            context: context.clone(),
            running: Rc::new(Cell::new(false)),
        }
    }

    /// The context this loop drives.
    pub fn context(&self) -> &MainContext {
        &self.context
    }

    /// Whether [`run`](Self::run) is currently executing.
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Ask a running loop to return after the current iteration.
    pub fn quit(&self) {
        self.running.set(false);
    }

    /// Dispatch until [`quit`](Self::quit) is called or no source is left
    /// that could ever become ready.
    pub fn run(&self) {
        self.running.set(true);
        tracing::debug!(target: targets::MAIN_LOOP, "main loop running");
        while self.running.get() {
            if self.context.iteration() {
                continue;
            }
            match self.context.time_until_next() {
                Some(wait) => {
                    self.context.advance(wait);
                }
                None if self.context.pending() => {}
                None => {
                    tracing::debug!(target: targets::MAIN_LOOP, "no sources left, leaving main loop");
                    break;
                }
            }
        }
        self.running.set(false);
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("running", &self.running.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        (count.clone(), count)
    }

    #[test]
    fn test_idle_runs_until_break() {
        let context = MainContext::manual();
        let (count, inner) = counter();

        context.idle_add(move || {
            inner.set(inner.get() + 1);
            if inner.get() == 3 {
                ControlFlow::Break
            } else {
                ControlFlow::Continue
            }
        });

        assert_eq!(context.run_until_idle(), 3);
        assert_eq!(count.get(), 3);
        assert_eq!(context.source_count(), 0);
    }

    #[test]
    fn test_idle_never_runs_synchronously() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        context.idle_add_once(move || inner.set(1));

        assert_eq!(count.get(), 0);
        context.iteration();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_timeout_fires_at_deadline() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        let id = context.timeout_add_once(Duration::from_millis(50), move || inner.set(1));

        context.advance(Duration::from_millis(49));
        assert_eq!(count.get(), 0);
        assert!(context.is_pending(id));

        context.advance(Duration::from_millis(1));
        assert_eq!(count.get(), 1);
        assert!(!context.is_pending(id));
    }

    #[test]
    fn test_repeating_timeout() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        context.timeout_add(Duration::from_millis(10), move || {
            inner.set(inner.get() + 1);
            ControlFlow::Continue
        });

        context.advance(Duration::from_millis(35));
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_source_remove() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        let id = context.timeout_add_once(Duration::from_millis(10), move || inner.set(1));

        context.source_remove(id).unwrap();
        context.advance(Duration::from_millis(20));
        assert_eq!(count.get(), 0);

        // Removing again fails
        assert_eq!(context.source_remove(id), Err(SourceError::InvalidSource(id)));
    }

    #[test]
    fn test_remove_self_during_dispatch() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        let slot: Rc<Cell<Option<SourceId>>> = Rc::new(Cell::new(None));

        let ctx = context.clone();
        let own_id = slot.clone();
        let id = context.idle_add(move || {
            inner.set(inner.get() + 1);
            if let Some(id) = own_id.get() {
                ctx.source_remove(id).unwrap();
            }
            ControlFlow::Continue
        });
        slot.set(Some(id));

        context.run_until_idle();
        assert_eq!(count.get(), 1);
        assert_eq!(context.source_count(), 0);
    }

    #[test]
    fn test_priority_order() {
        let context = MainContext::manual();
        let order = Rc::new(RefCell::new(Vec::new()));

        let low = order.clone();
        context.idle_add_full(Priority::Low, move || {
            low.borrow_mut().push("low");
            ControlFlow::Break
        });
        let high = order.clone();
        context.idle_add_full(Priority::High, move || {
            high.borrow_mut().push("high");
            ControlFlow::Break
        });

        context.iteration();
        assert_eq!(*order.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn test_spawn_local_runs_to_completion() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        context.spawn_local(async move {
            inner.set(7);
        });

        assert_eq!(context.task_count(), 1);
        context.run_until_idle();
        assert_eq!(count.get(), 7);
        assert_eq!(context.task_count(), 0);
    }

    #[test]
    fn test_woken_task_is_polled_again() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        let (sender, receiver) = tokio::sync::oneshot::channel::<u32>();
        context.spawn_local(async move {
            if let Ok(value) = receiver.await {
                inner.set(value);
            }
        });

        context.run_until_idle();
        assert_eq!(context.task_count(), 1);
        assert!(!context.pending());

        sender.send(3).unwrap();
        assert!(context.pending());
        context.run_until_idle();
        assert_eq!(count.get(), 3);
        assert_eq!(context.task_count(), 0);
    }

    #[test]
    fn test_task_spawned_from_task_runs_next_iteration() {
        let context = MainContext::manual();
        let (count, inner) = counter();
        let spawner = context.clone();
        context.spawn_local(async move {
            spawner.spawn_local(async move {
                inner.set(inner.get() + 1);
            });
        });

        context.iteration();
        assert_eq!(count.get(), 0);
        assert_eq!(context.task_count(), 1);
        context.iteration();
        assert_eq!(count.get(), 1);
        assert_eq!(context.task_count(), 0);
    }

    #[test]
    fn test_main_loop_quit() {
        let context = MainContext::manual();
        let main_loop = MainLoop::new(&context);
        let (count, inner) = counter();

        let handle = main_loop.clone();
        context.timeout_add(Duration::from_millis(5), move || {
            inner.set(inner.get() + 1);
            if inner.get() == 4 {
                handle.quit();
            }
            ControlFlow::Continue
        });

        main_loop.run();
        assert_eq!(count.get(), 4);
        assert!(!main_loop.is_running());
    }
}
