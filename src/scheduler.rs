//! Deterministic virtual-time task scheduler.
//!
//! A [`Scheduler`] owns a [`VirtualClock`] and a queue of pending tasks. Work
//! only runs when a driver calls one of the advance/idle/run operations, and
//! it runs synchronously on the calling thread.
//!
//! # Invariants
//!
//! - **Total order:** tasks run by ascending `(target_ms, placement, seq)`.
//!   Equal targets run in post order; at-front posts run ahead of same-time
//!   tasks (latest at-front first) but never ahead of an earlier target.
//! - **Monotone time:** the clock never moves backwards, and a task never
//!   observes a clock earlier than its own target.
//! - **Reentrancy:** tasks may post, remove, and drain while being run. The
//!   run loop re-fetches the minimum after every task and holds no borrow of
//!   the queue while user code runs.

use crate::clock::{Clock, VirtualClock};
use crate::config::SimConfig;
use crate::error::{Error, Result};
use crate::key::{ContextId, TaskKey, next_identity};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Work to run when a task comes due.
pub type Action = Box<dyn FnOnce() + 'static>;

/// Monotonically increasing sequence counter for deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// Create the initial sequence value.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the next sequence value, incrementing the counter.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// How a scheduler reacts to newly posted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    /// Nothing runs until the driver asks.
    Paused,
    /// Work due now runs as soon as it is posted; future work waits for the
    /// clock to be advanced.
    #[default]
    Unpaused,
    /// All work runs as soon as it is posted, advancing the clock as needed.
    ConstantIdle,
}

impl IdleState {
    /// Parse a user-supplied idle state name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paused" | "pause" => Some(Self::Paused),
            "unpaused" | "running" | "normal" => Some(Self::Unpaused),
            "constant_idle" | "constant-idle" | "constantidle" | "idle_constantly" => {
                Some(Self::ConstantIdle)
            }
            _ => None,
        }
    }
}

/// Where a task sits among tasks with the same target time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placement {
    Front,
    Normal,
}

/// Handle to a single posted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle {
    seq: Seq,
}

impl TaskHandle {
    #[must_use]
    pub const fn seq(self) -> Seq {
        self.seq
    }
}

/// When a pending task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    /// Relative to the scheduler's current time. Negative delays are rejected.
    Delay(i64),
    /// Absolute virtual time; times in the past mean "now".
    At(u64),
    /// Now, ahead of every other task due now.
    Front,
}

/// A task description handed to [`Scheduler::enqueue`].
pub struct PendingTask {
    action: Action,
    when: When,
    key: Option<TaskKey>,
    owner: Option<ContextId>,
    replace: bool,
}

impl PendingTask {
    /// A task due now with no key.
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self {
            action: Box::new(action),
            when: When::Delay(0),
            key: None,
            owner: None,
            replace: false,
        }
    }

    #[must_use]
    pub fn delayed(mut self, delay_ms: i64) -> Self {
        self.when = When::Delay(delay_ms);
        self
    }

    #[must_use]
    pub fn at(mut self, target_ms: u64) -> Self {
        self.when = When::At(target_ms);
        self
    }

    #[must_use]
    pub fn at_front(mut self) -> Self {
        self.when = When::Front;
        self
    }

    #[must_use]
    pub fn keyed(mut self, key: TaskKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn owned_by(mut self, owner: ContextId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Drop any queued task with an equal key before inserting this one.
    #[must_use]
    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }

    #[must_use]
    pub const fn when(&self) -> When {
        self.when
    }

    #[must_use]
    pub const fn key(&self) -> Option<&TaskKey> {
        self.key.as_ref()
    }

    #[must_use]
    pub const fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// Wrap the action, e.g. to run it inside a context guard.
    #[must_use]
    pub(crate) fn wrap_action(mut self, wrap: impl FnOnce(Action) -> Action) -> Self {
        self.action = wrap(self.action);
        self
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("when", &self.when)
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("replace", &self.replace)
            .finish_non_exhaustive()
    }
}

/// A queued task.
pub struct ScheduledTask {
    seq: Seq,
    target_ms: u64,
    placement: Placement,
    key: Option<TaskKey>,
    owner: Option<ContextId>,
    action: Action,
}

impl ScheduledTask {
    #[must_use]
    pub const fn seq(&self) -> Seq {
        self.seq
    }

    #[must_use]
    pub const fn target_ms(&self) -> u64 {
        self.target_ms
    }

    #[must_use]
    pub const fn placement(&self) -> Placement {
        self.placement
    }

    #[must_use]
    pub const fn key(&self) -> Option<&TaskKey> {
        self.key.as_ref()
    }

    #[must_use]
    pub const fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// Same-time tie-break: FIFO for normal posts, LIFO for at-front posts.
    const fn tie_break(&self) -> u64 {
        match self.placement {
            Placement::Front => u64::MAX - self.seq.0,
            Placement::Normal => self.seq.0,
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("seq", &self.seq)
            .field("target_ms", &self.target_ms)
            .field("placement", &self.placement)
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

// Order by (target_ms, placement, tie_break) ascending - min-heap needs reversed comparison.
impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap: earlier target/placement/seq = higher priority
        other
            .target_ms
            .cmp(&self.target_ms)
            .then_with(|| other.placement.cmp(&self.placement))
            .then_with(|| other.tie_break().cmp(&self.tie_break()))
    }
}

struct TaskQueue {
    seq: Seq,
    heap: BinaryHeap<ScheduledTask>,
}

impl TaskQueue {
    fn next_seq(&mut self) -> Seq {
        let current = self.seq;
        self.seq = self.seq.next();
        current
    }
}

struct SchedulerCore {
    instance: u64,
    clock: VirtualClock,
    idle_state: Cell<IdleState>,
    executing: Cell<bool>,
    queue: RefCell<TaskQueue>,
    start_time_ms: u64,
    initial_idle_state: IdleState,
    drain_limit: usize,
    resets: Cell<u64>,
}

/// Restores the "executing" flag even if the task panics.
struct ExecutingGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> ExecutingGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Shared handle to a virtual-time scheduler.
///
/// Clones refer to the same scheduler; use [`Scheduler::ptr_eq`] (or `==`)
/// to compare instances.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<SchedulerCore>,
}

/// Non-owning scheduler handle, for closures stored in the scheduler itself.
#[derive(Clone)]
pub struct WeakScheduler {
    core: Weak<SchedulerCore>,
}

impl WeakScheduler {
    #[must_use]
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.core.upgrade().map(|core| Scheduler { core })
    }
}

impl fmt::Debug for WeakScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakScheduler").finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SimConfig::default())
    }

    /// Create a scheduler whose clock and idle state follow `config`.
    #[must_use]
    pub fn with_config(config: &SimConfig) -> Self {
        Self::build(
            config.start_time_ms,
            config.initial_idle_state,
            config.drain_limit,
        )
    }

    /// Create a scheduler starting at `start_ms`, otherwise default.
    #[must_use]
    pub fn with_start_time(start_ms: u64) -> Self {
        let config = SimConfig::default();
        Self::build(start_ms, config.initial_idle_state, config.drain_limit)
    }

    fn build(start_time_ms: u64, initial_idle_state: IdleState, drain_limit: usize) -> Self {
        let core = SchedulerCore {
            instance: next_identity(),
            clock: VirtualClock::new(start_time_ms),
            idle_state: Cell::new(initial_idle_state),
            executing: Cell::new(false),
            queue: RefCell::new(TaskQueue {
                seq: Seq::zero(),
                heap: BinaryHeap::new(),
            }),
            start_time_ms,
            initial_idle_state,
            drain_limit: drain_limit.max(1),
            resets: Cell::new(0),
        };
        Self {
            core: Rc::new(core),
        }
    }

    /// Whether both handles refer to the same scheduler.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            core: Rc::downgrade(&self.core),
        }
    }

    /// Process-unique id of this scheduler instance, for logs.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.core.instance
    }

    /// Current virtual time in milliseconds.
    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.core.clock.now_ms()
    }

    #[must_use]
    pub fn idle_state(&self) -> IdleState {
        self.core.idle_state.get()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.idle_state() == IdleState::Paused
    }

    /// Whether a task is running right now (i.e. we are being re-entered).
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.core.executing.get()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn size(&self) -> usize {
        self.core.queue.borrow().heap.len()
    }

    /// Change the idle state, running whatever the new state makes runnable.
    pub fn set_idle_state(&self, state: IdleState) {
        self.core.idle_state.set(state);
        tracing::debug!(
            event = "scheduler.idle_state",
            scheduler = self.core.instance,
            state = ?state,
            "Idle state changed"
        );
        match state {
            IdleState::Unpaused => {
                self.advance_by(0);
            }
            IdleState::ConstantIdle => {
                self.advance_to_last_posted_task();
            }
            IdleState::Paused => {}
        }
    }

    pub fn pause(&self) {
        self.set_idle_state(IdleState::Paused);
    }

    /// Leave the paused state and run every task that is already due.
    pub fn unpause(&self) {
        self.set_idle_state(IdleState::Unpaused);
    }

    pub fn idle_constantly(&self, constantly: bool) {
        self.set_idle_state(if constantly {
            IdleState::ConstantIdle
        } else {
            IdleState::Unpaused
        });
    }

    /// Queue a task due now.
    pub fn post(&self, action: impl FnOnce() + 'static) -> TaskHandle {
        self.insert_or_run(PendingTask::new(action), self.current_time(), Placement::Normal, 0)
    }

    /// Queue a task `delay_ms` from now. Negative delays are rejected.
    pub fn post_delayed(&self, action: impl FnOnce() + 'static, delay_ms: i64) -> Result<TaskHandle> {
        self.enqueue(PendingTask::new(action).delayed(delay_ms))
    }

    /// Queue a task ahead of everything else due now.
    pub fn post_at_front_of_queue(&self, action: impl FnOnce() + 'static) -> TaskHandle {
        self.insert_or_run(
            PendingTask::new(action).at_front(),
            self.current_time(),
            Placement::Front,
            0,
        )
    }

    /// Queue (or, depending on the idle state, run) a task.
    pub fn enqueue(&self, task: PendingTask) -> Result<TaskHandle> {
        let now = self.current_time();
        let (target_ms, placement, delay_ms) = match task.when {
            When::Delay(delay) if delay < 0 => {
                return Err(Error::invalid_argument(format!(
                    "delay must be >= 0, got {delay}"
                )));
            }
            When::Delay(delay) => {
                let delay = delay.unsigned_abs();
                (now.saturating_add(delay), Placement::Normal, delay)
            }
            When::At(target) => (target.max(now), Placement::Normal, target.saturating_sub(now)),
            When::Front => (now, Placement::Front, 0),
        };

        if task.replace {
            if let Some(key) = &task.key {
                let replaced = self.remove(key);
                if replaced > 0 {
                    tracing::trace!(
                        event = "scheduler.task.replace",
                        scheduler = self.core.instance,
                        key = %key,
                        replaced,
                        "Replaced queued task with equal key"
                    );
                }
            }
        }

        Ok(self.insert_or_run(task, target_ms, placement, delay_ms))
    }

    fn insert_or_run(
        &self,
        task: PendingTask,
        target_ms: u64,
        placement: Placement,
        delay_ms: u64,
    ) -> TaskHandle {
        let run_now = match self.idle_state() {
            IdleState::Paused => false,
            IdleState::Unpaused => delay_ms == 0,
            IdleState::ConstantIdle => true,
        };
        if run_now && !self.is_executing() {
            return self.run_immediately(task, target_ms);
        }
        self.insert(task, target_ms, placement)
    }

    fn insert(&self, task: PendingTask, target_ms: u64, placement: Placement) -> TaskHandle {
        let mut queue = self.core.queue.borrow_mut();
        let seq = queue.next_seq();
        tracing::trace!(
            event = "scheduler.task.post",
            scheduler = self.core.instance,
            %seq,
            target_ms,
            placement = ?placement,
            key = task.key.as_ref().map(tracing::field::display),
            "Task queued"
        );
        queue.heap.push(ScheduledTask {
            seq,
            target_ms,
            placement,
            key: task.key,
            owner: task.owner,
            action: task.action,
        });
        TaskHandle { seq }
    }

    fn run_immediately(&self, task: PendingTask, target_ms: u64) -> TaskHandle {
        let seq = self.core.queue.borrow_mut().next_seq();
        self.core.clock.advance_to(target_ms);
        tracing::trace!(
            event = "scheduler.task.run_immediate",
            scheduler = self.core.instance,
            %seq,
            now_ms = self.current_time(),
            "Running task without queueing"
        );
        {
            let _executing = ExecutingGuard::enter(&self.core.executing);
            (task.action)();
        }
        // The task may have posted more work that is now runnable.
        match self.idle_state() {
            IdleState::ConstantIdle => {
                self.advance_to_last_posted_task();
            }
            IdleState::Unpaused => {
                self.advance_by(0);
            }
            IdleState::Paused => {}
        }
        TaskHandle { seq }
    }

    fn pop_due(&self, end_ms: u64) -> Option<ScheduledTask> {
        let mut queue = self.core.queue.borrow_mut();
        if queue.heap.peek()?.target_ms > end_ms {
            return None;
        }
        queue.heap.pop()
    }

    fn pop_next(&self) -> Option<ScheduledTask> {
        self.core.queue.borrow_mut().heap.pop()
    }

    fn run_task(&self, task: ScheduledTask) {
        self.core.clock.advance_to(task.target_ms);
        tracing::trace!(
            event = "scheduler.task.run",
            scheduler = self.core.instance,
            seq = %task.seq,
            target_ms = task.target_ms,
            key = task.key.as_ref().map(tracing::field::display),
            "Executing task"
        );
        let _executing = ExecutingGuard::enter(&self.core.executing);
        (task.action)();
    }

    /// Run due tasks (target <= `end_ms`) one at a time.
    fn drain_until(&self, end_ms: u64) -> usize {
        let mut ran = 0usize;
        while let Some(task) = self.pop_due(end_ms) {
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    fn warn_drain_limit(&self, ran: usize) {
        tracing::warn!(
            event = "scheduler.drain_limit",
            scheduler = self.core.instance,
            ran,
            remaining = self.size(),
            "Stopped draining: task limit reached (a task is probably re-posting itself)"
        );
    }

    /// Run everything due within the next `duration_ms`, then move the clock
    /// to the end of that window. Returns true if any task ran.
    pub fn advance_by(&self, duration_ms: u64) -> bool {
        self.advance_to(self.current_time().saturating_add(duration_ms))
    }

    /// Run everything due at or before `end_ms`, then move the clock there.
    ///
    /// Tasks posted while draining run in the same call if their target falls
    /// inside the window. A time in the past runs nothing and leaves the
    /// clock alone. If a task resets this scheduler, the clock stays at the
    /// reset start time.
    pub fn advance_to(&self, end_ms: u64) -> bool {
        let now = self.current_time();
        if end_ms < now {
            tracing::trace!(
                event = "scheduler.advance.past",
                scheduler = self.core.instance,
                end_ms,
                now_ms = now,
                "Ignoring advance into the past"
            );
            return false;
        }
        let generation = self.core.resets.get();
        let ran = self.drain_until(end_ms);
        if self.core.resets.get() != generation {
            tracing::trace!(
                event = "scheduler.advance.reset",
                scheduler = self.core.instance,
                end_ms,
                ran,
                "Scheduler reset while draining; clock left at start time"
            );
            return ran > 0;
        }
        self.core.clock.advance_to(end_ms);
        tracing::trace!(
            event = "scheduler.advance",
            scheduler = self.core.instance,
            end_ms,
            ran,
            "Advanced clock"
        );
        ran > 0
    }

    /// Run tasks due now without moving the clock.
    pub fn idle(&self) -> bool {
        self.advance_by(0)
    }

    /// Run tasks due within `duration_ms`, advancing the clock by that much.
    pub fn idle_for(&self, duration_ms: u64) -> bool {
        self.advance_by(duration_ms)
    }

    /// Run exactly one task, the earliest queued, whether or not it is due.
    pub fn run_one_task(&self) -> bool {
        match self.pop_next() {
            Some(task) => {
                self.run_task(task);
                true
            }
            None => false,
        }
    }

    /// Advance to the earliest queued target, running every task due then.
    pub fn run_to_next_task(&self) -> bool {
        match self.peek_next_target() {
            Some(target) => self.advance_to(target),
            None => false,
        }
    }

    /// Advance to the latest target queued right now.
    pub fn advance_to_last_posted_task(&self) -> bool {
        match self.peek_last_target() {
            Some(target) => self.advance_to(target),
            None => false,
        }
    }

    /// Drain the whole queue, including work posted while draining.
    pub fn run_to_end_of_tasks(&self) -> bool {
        let mut ran = 0usize;
        while self.run_one_task() {
            ran += 1;
            if ran >= self.core.drain_limit {
                self.warn_drain_limit(ran);
                break;
            }
        }
        ran > 0
    }

    /// True iff nothing is due at the current time.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let now = self.current_time();
        self.peek_next_target().is_none_or(|target| target > now)
    }

    #[must_use]
    pub fn are_any_runnable(&self) -> bool {
        !self.is_idle()
    }

    fn peek_next_target(&self) -> Option<u64> {
        self.core.queue.borrow().heap.peek().map(|task| task.target_ms)
    }

    fn peek_last_target(&self) -> Option<u64> {
        self.core
            .queue
            .borrow()
            .heap
            .iter()
            .map(|task| task.target_ms)
            .max()
    }

    /// Earliest queued target, or 0 when the queue is empty.
    #[must_use]
    pub fn next_scheduled_task_time(&self) -> u64 {
        self.peek_next_target().unwrap_or(0)
    }

    /// Latest queued target, or 0 when the queue is empty.
    #[must_use]
    pub fn last_scheduled_task_time(&self) -> u64 {
        self.peek_last_target().unwrap_or(0)
    }

    /// Remove every queued task whose key equals `key`.
    pub fn remove(&self, key: &TaskKey) -> usize {
        self.retain_tasks("key", |task| task.key.as_ref() != Some(key))
    }

    /// Remove every keyed task for which `matches` returns true.
    pub fn remove_matching(&self, matches: impl Fn(&TaskKey) -> bool) -> usize {
        self.retain_tasks("predicate", |task| !task.key.as_ref().is_some_and(&matches))
    }

    /// Remove every task posted on behalf of `owner`.
    pub fn remove_owned_by(&self, owner: ContextId) -> usize {
        self.retain_tasks("owner", |task| task.owner != Some(owner))
    }

    /// Cancel one task. Returns false if it already ran or was removed.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.retain_tasks("handle", |task| task.seq != handle.seq) > 0
    }

    /// Clear the queue unconditionally.
    pub fn remove_all(&self) -> usize {
        self.retain_tasks("all", |_| false)
    }

    fn retain_tasks(&self, reason: &'static str, keep: impl Fn(&ScheduledTask) -> bool) -> usize {
        // Dropping removed actions may run user destructors; do it after the borrow ends.
        let removed: Vec<ScheduledTask> = {
            let mut queue = self.core.queue.borrow_mut();
            let (kept, removed): (Vec<_>, Vec<_>) =
                std::mem::take(&mut queue.heap).into_iter().partition(|task| keep(task));
            queue.heap = BinaryHeap::from(kept);
            removed
        };
        if !removed.is_empty() {
            tracing::trace!(
                event = "scheduler.task.remove",
                scheduler = self.core.instance,
                reason,
                removed = removed.len(),
                "Removed queued tasks"
            );
        }
        removed.len()
    }

    #[must_use]
    pub fn contains(&self, key: &TaskKey) -> bool {
        self.has_matching(|candidate| candidate == key)
    }

    #[must_use]
    pub fn has_matching(&self, matches: impl Fn(&TaskKey) -> bool) -> bool {
        self.core
            .queue
            .borrow()
            .heap
            .iter()
            .any(|task| task.key.as_ref().is_some_and(&matches))
    }

    /// Keys of queued tasks in execution order.
    #[must_use]
    pub fn queued_keys(&self) -> Vec<Option<TaskKey>> {
        let queue = self.core.queue.borrow();
        let mut tasks: Vec<&ScheduledTask> = queue.heap.iter().collect();
        tasks.sort_by(|a, b| b.cmp(a));
        tasks.into_iter().map(|task| task.key.clone()).collect()
    }

    /// Discard all tasks and restore the start time and initial idle state.
    pub fn reset(&self) {
        let discarded = self.remove_all();
        self.core.idle_state.set(self.core.initial_idle_state);
        self.core.clock.rewind(self.core.start_time_ms);
        self.core.executing.set(false);
        self.core.resets.set(self.core.resets.get().wrapping_add(1));
        tracing::debug!(
            event = "scheduler.reset",
            scheduler = self.core.instance,
            discarded,
            "Scheduler reset"
        );
    }
}

impl Clock for Scheduler {
    fn now_ms(&self) -> u64 {
        self.current_time()
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Scheduler {}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance", &self.core.instance)
            .field("current_time", &self.current_time())
            .field("idle_state", &self.idle_state())
            .field("task_count", &self.size())
            .finish_non_exhaustive()
    }
}
