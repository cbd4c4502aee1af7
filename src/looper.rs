//! Per-context looper handles.
//!
//! A [`Looper`] is the lifecycle wrapper around whichever scheduler its
//! context is currently bound to. Work posted through it is tagged with the
//! owning context, runs with that context entered in the registry, and is
//! silently dropped once the looper has quit.

use crate::error::Result;
use crate::key::ContextId;
use crate::registry::SchedulerRegistry;
use crate::scheduler::{Action, PendingTask, Scheduler, TaskHandle};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub(crate) struct LooperState {
    pub(crate) context: ContextId,
    pub(crate) name: String,
    pub(crate) main: bool,
    scheduler: RefCell<Scheduler>,
    pub(crate) quit: Cell<bool>,
}

impl LooperState {
    pub(crate) const fn new(context: ContextId, name: String, main: bool, scheduler: Scheduler) -> Self {
        Self {
            context,
            name,
            main,
            scheduler: RefCell::new(scheduler),
            quit: Cell::new(false),
        }
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        self.scheduler.borrow().clone()
    }

    pub(crate) fn bind(&self, scheduler: Scheduler) {
        *self.scheduler.borrow_mut() = scheduler;
    }
}

/// Handle to one simulated thread's looper.
#[derive(Clone)]
pub struct Looper {
    registry: SchedulerRegistry,
    state: Rc<LooperState>,
}

impl Looper {
    pub(crate) const fn new(registry: SchedulerRegistry, state: Rc<LooperState>) -> Self {
        Self { registry, state }
    }

    #[must_use]
    pub fn context(&self) -> ContextId {
        self.state.context
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    #[must_use]
    pub fn is_main(&self) -> bool {
        self.state.main
    }

    #[must_use]
    pub fn registry(&self) -> &SchedulerRegistry {
        &self.registry
    }

    /// The scheduler this looper is bound to right now.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.state.scheduler()
    }

    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.scheduler().current_time()
    }

    pub fn post(&self, action: impl FnOnce() + 'static) -> Result<Option<TaskHandle>> {
        self.enqueue(PendingTask::new(action))
    }

    pub fn post_delayed(
        &self,
        action: impl FnOnce() + 'static,
        delay_ms: i64,
    ) -> Result<Option<TaskHandle>> {
        self.enqueue(PendingTask::new(action).delayed(delay_ms))
    }

    pub fn post_at_front_of_queue(
        &self,
        action: impl FnOnce() + 'static,
    ) -> Result<Option<TaskHandle>> {
        self.enqueue(PendingTask::new(action).at_front())
    }

    /// Queue a task on this looper's scheduler.
    ///
    /// Returns `Ok(None)` without queueing or running anything once the
    /// looper has quit.
    pub fn enqueue(&self, task: PendingTask) -> Result<Option<TaskHandle>> {
        if self.state.quit.get() {
            tracing::trace!(
                event = "looper.post.dropped",
                context = %self.state.context,
                name = %self.state.name,
                "Dropping post to quit looper"
            );
            return Ok(None);
        }
        let context = self.state.context;
        let registry = self.registry.downgrade();
        let task = task.owned_by(context).wrap_action(move |action| -> Action {
            Box::new(move || match registry.upgrade() {
                Some(registry) => {
                    let _entered = registry.enter(context);
                    action();
                }
                None => action(),
            })
        });
        self.scheduler().enqueue(task).map(Some)
    }

    pub fn pause(&self) {
        self.scheduler().pause();
    }

    pub fn unpause(&self) {
        self.scheduler().unpause();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.scheduler().is_paused()
    }

    /// Set the paused flag, returning the previous value.
    pub fn set_paused(&self, paused: bool) -> bool {
        let previous = self.is_paused();
        if paused {
            self.pause();
        } else {
            self.unpause();
        }
        previous
    }

    /// Run `f` with the looper paused, restoring the previous state afterwards.
    pub fn run_paused<R>(&self, f: impl FnOnce() -> R) -> R {
        let was_paused = self.set_paused(true);
        let result = f();
        self.set_paused(was_paused);
        result
    }

    pub fn idle(&self) -> bool {
        self.scheduler().idle()
    }

    pub fn idle_for(&self, duration_ms: u64) -> bool {
        self.scheduler().idle_for(duration_ms)
    }

    pub fn idle_constantly(&self, constantly: bool) {
        self.scheduler().idle_constantly(constantly);
    }

    pub fn run_one_task(&self) -> bool {
        self.scheduler().run_one_task()
    }

    pub fn run_to_next_task(&self) -> bool {
        self.scheduler().run_to_next_task()
    }

    pub fn run_to_end_of_tasks(&self) -> bool {
        self.scheduler().run_to_end_of_tasks()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.scheduler().is_idle()
    }

    #[must_use]
    pub fn next_scheduled_task_time(&self) -> u64 {
        self.scheduler().next_scheduled_task_time()
    }

    #[must_use]
    pub fn last_scheduled_task_time(&self) -> u64 {
        self.scheduler().last_scheduled_task_time()
    }

    pub fn quit(&self) -> Result<()> {
        self.registry.quit(self.state.context)
    }

    pub fn quit_safely(&self) -> Result<()> {
        self.registry.quit_safely(self.state.context)
    }

    #[must_use]
    pub fn has_quit(&self) -> bool {
        self.state.quit.get()
    }

    pub fn reset(&self) -> Result<()> {
        self.registry.reset(self.state.context)
    }
}

impl PartialEq for Looper {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Looper {}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("context", &self.state.context)
            .field("name", &self.state.name)
            .field("main", &self.state.main)
            .field("quit", &self.state.quit.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() -> Box<dyn FnOnce()>) {
        let count = Rc::new(Cell::new(0));
        let handle = Rc::clone(&count);
        let make = move || -> Box<dyn FnOnce()> {
            let count = Rc::clone(&handle);
            Box::new(move || count.set(count.get() + 1))
        };
        (count, make)
    }

    #[test]
    fn post_to_quit_looper_is_dropped() {
        let registry = SchedulerRegistry::default();
        let looper = registry.prepare_looper("worker");
        looper.quit().unwrap();

        let (count, make) = counter();
        assert!(looper.post(make()).unwrap().is_none());
        assert!(looper.post_delayed(make(), 10).unwrap().is_none());
        looper.run_to_end_of_tasks();
        assert_eq!(count.get(), 0);
        assert_eq!(looper.scheduler().size(), 0);
    }

    #[test]
    fn reset_revives_quit_looper() {
        let registry = SchedulerRegistry::default();
        let looper = registry.prepare_looper("worker");
        let before = looper.scheduler();
        looper.quit().unwrap();
        looper.reset().unwrap();

        assert!(!looper.has_quit());
        assert_ne!(looper.scheduler(), before);
        let (count, make) = counter();
        assert!(looper.post(make()).unwrap().is_some());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn tasks_run_with_their_context_entered() {
        let registry = SchedulerRegistry::default();
        let worker = registry.prepare_looper("worker");
        worker.pause();
        let seen = Rc::new(Cell::new(None));
        let probe = Rc::clone(&seen);
        let inner = registry.clone();
        worker
            .post(move || probe.set(Some(inner.current_context())))
            .unwrap();

        worker.idle();
        assert_eq!(seen.get(), Some(worker.context()));
        assert_eq!(registry.current_context(), registry.main_context());
    }

    #[test]
    fn quit_on_shared_master_only_discards_own_tasks() {
        let registry = SchedulerRegistry::new(SimConfig {
            use_global_scheduler: true,
            ..SimConfig::default()
        });
        let main = registry.main_looper();
        let worker = registry.prepare_looper("worker");
        main.pause();
        let (count, make) = counter();
        main.post_delayed(make(), 10).unwrap();
        worker.post_delayed(make(), 10).unwrap();
        worker.post_delayed(make(), 20).unwrap();
        assert_eq!(main.scheduler().size(), 3);

        worker.quit().unwrap();
        assert_eq!(main.scheduler().size(), 1);
        main.run_to_end_of_tasks();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn run_paused_restores_state() {
        let registry = SchedulerRegistry::default();
        let looper = registry.main_looper();
        assert!(!looper.is_paused());
        let (count, make) = counter();
        looper.run_paused(|| {
            looper.post(make()).unwrap();
            assert_eq!(count.get(), 0);
        });
        // Unpausing drains what was queued while paused.
        assert_eq!(count.get(), 1);
        assert!(!looper.is_paused());
    }

    #[test]
    fn set_paused_returns_previous() {
        let registry = SchedulerRegistry::default();
        let looper = registry.main_looper();
        assert!(!looper.set_paused(true));
        assert!(looper.set_paused(false));
    }

    #[test]
    fn quit_safely_delivers_due_work_first() {
        let registry = SchedulerRegistry::default();
        let looper = registry.prepare_looper("worker");
        looper.pause();
        let (count, make) = counter();
        looper.post(make()).unwrap();
        looper.post_delayed(make(), 100).unwrap();

        looper.quit_safely().unwrap();
        assert_eq!(count.get(), 1);
        assert!(looper.has_quit());
        assert_eq!(looper.scheduler().size(), 0);
    }
}
