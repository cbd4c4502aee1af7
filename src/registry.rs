//! Binding of simulated execution contexts to schedulers.
//!
//! The registry is an explicit object, not process-wide state: every looper,
//! handler, and alarm simulator is created from one and keeps a handle to it.
//! It owns the main context, the master scheduler (the shared timeline used in
//! global-scheduler mode), the background scheduler, and the notion of which
//! context is "current".

use crate::config::SimConfig;
use crate::error::{Error, Result};
use crate::key::ContextId;
use crate::looper::{Looper, LooperState};
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Name of the main context's looper.
pub const MAIN_LOOPER_NAME: &str = "main";

pub(crate) struct RegistryInner {
    config: SimConfig,
    main: Rc<LooperState>,
    loopers: RefCell<BTreeMap<ContextId, Rc<LooperState>>>,
    master: RefCell<Scheduler>,
    background: RefCell<Scheduler>,
    use_global_scheduler: Cell<bool>,
    current: Cell<ContextId>,
}

/// Shared handle to a context registry. Clones refer to the same registry.
#[derive(Clone)]
pub struct SchedulerRegistry {
    inner: Rc<RegistryInner>,
}

/// Non-owning registry handle, held by tasks queued through a looper.
#[derive(Clone)]
pub(crate) struct WeakRegistry {
    inner: Weak<RegistryInner>,
}

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<SchedulerRegistry> {
        self.inner.upgrade().map(|inner| SchedulerRegistry { inner })
    }
}

/// Restores the previously current context when dropped.
#[must_use = "the context is only current while the guard is alive"]
pub struct ContextGuard {
    registry: SchedulerRegistry,
    previous: ContextId,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.registry.inner.current.set(self.previous);
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SchedulerRegistry {
    /// Create a registry with a main context bound to a fresh master scheduler.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let master = Scheduler::with_config(&config);
        let background = Self::fresh_background(&config);
        let main = Rc::new(LooperState::new(
            ContextId::fresh(),
            MAIN_LOOPER_NAME.to_string(),
            true,
            master.clone(),
        ));
        let mut loopers = BTreeMap::new();
        loopers.insert(main.context, Rc::clone(&main));
        let current = main.context;

        tracing::debug!(
            event = "registry.create",
            main = %current,
            global = config.use_global_scheduler,
            "Scheduler registry created"
        );

        Self {
            inner: Rc::new(RegistryInner {
                use_global_scheduler: Cell::new(config.use_global_scheduler),
                config,
                main,
                loopers: RefCell::new(loopers),
                master: RefCell::new(master),
                background: RefCell::new(background),
                current: Cell::new(current),
            }),
        }
    }

    fn fresh_background(config: &SimConfig) -> Scheduler {
        let background = Scheduler::with_config(config);
        if config.background_paused {
            background.pause();
        }
        background
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn main_context(&self) -> ContextId {
        self.inner.main.context
    }

    #[must_use]
    pub fn main_looper(&self) -> Looper {
        Looper::new(self.clone(), Rc::clone(&self.inner.main))
    }

    /// Create a new non-main context with a looper.
    ///
    /// The looper gets its own scheduler, or the master scheduler when
    /// global-scheduler mode is on.
    pub fn prepare_looper(&self, name: impl Into<String>) -> Looper {
        let name = name.into();
        let scheduler = self.binding_for_non_main();
        let state = Rc::new(LooperState::new(ContextId::fresh(), name, false, scheduler));
        tracing::debug!(
            event = "looper.prepare",
            context = %state.context,
            name = %state.name,
            shared = self.use_global_scheduler(),
            "Looper prepared"
        );
        self.inner
            .loopers
            .borrow_mut()
            .insert(state.context, Rc::clone(&state));
        Looper::new(self.clone(), state)
    }

    fn binding_for_non_main(&self) -> Scheduler {
        if self.use_global_scheduler() {
            self.master_scheduler()
        } else {
            Scheduler::with_config(&self.inner.config)
        }
    }

    fn state(&self, context: ContextId) -> Result<Rc<LooperState>> {
        self.inner
            .loopers
            .borrow()
            .get(&context)
            .cloned()
            .ok_or_else(|| Error::illegal_state(format!("unknown context {context}")))
    }

    /// Looper for a known context.
    pub fn looper(&self, context: ContextId) -> Result<Looper> {
        Ok(Looper::new(self.clone(), self.state(context)?))
    }

    /// Every known looper, main first, then in creation order.
    #[must_use]
    pub fn loopers(&self) -> Vec<Looper> {
        let states: Vec<Rc<LooperState>> = self.inner.loopers.borrow().values().cloned().collect();
        states
            .into_iter()
            .map(|state| Looper::new(self.clone(), state))
            .collect()
    }

    /// Scheduler currently bound to `context`.
    pub fn scheduler_for(&self, context: ContextId) -> Result<Scheduler> {
        Ok(self.state(context)?.scheduler())
    }

    /// Whether `scheduler` is the master or bound to any context other than `except`.
    fn is_shared(&self, scheduler: &Scheduler, except: ContextId) -> bool {
        if scheduler.ptr_eq(&self.inner.master.borrow()) {
            return true;
        }
        self.inner
            .loopers
            .borrow()
            .values()
            .any(|state| state.context != except && state.scheduler().ptr_eq(scheduler))
    }

    /// Discard the pending work of `state` without touching other contexts' work.
    fn discard_pending(&self, state: &LooperState) -> usize {
        let scheduler = state.scheduler();
        if self.is_shared(&scheduler, state.context) {
            scheduler.remove_owned_by(state.context)
        } else {
            let discarded = scheduler.size();
            scheduler.reset();
            discarded
        }
    }

    /// Quit a looper, discarding its queued work. Quitting twice is a no-op.
    pub fn quit(&self, context: ContextId) -> Result<()> {
        let state = self.state(context)?;
        if state.main {
            return Err(Error::illegal_state("Main thread not allowed to quit"));
        }
        if state.quit.replace(true) {
            return Ok(());
        }
        let discarded = self.discard_pending(&state);
        tracing::debug!(
            event = "looper.quit",
            context = %context,
            name = %state.name,
            discarded,
            "Looper quit"
        );
        Ok(())
    }

    /// Deliver work that is already due, then quit.
    pub fn quit_safely(&self, context: ContextId) -> Result<()> {
        let state = self.state(context)?;
        if state.main {
            return Err(Error::illegal_state("Main thread not allowed to quit"));
        }
        if !state.quit.get() {
            let _entered = self.enter(context);
            state.scheduler().idle();
        }
        self.quit(context)
    }

    pub fn has_quit(&self, context: ContextId) -> Result<bool> {
        Ok(self.state(context)?.quit.get())
    }

    /// Rebind a context to a clean scheduler and clear its quit flag.
    pub fn reset(&self, context: ContextId) -> Result<()> {
        let state = self.state(context)?;
        if state.main {
            self.reset_main();
            return Ok(());
        }

        let discarded = if state.quit.get() {
            0
        } else {
            self.discard_pending(&state)
        };
        state.bind(self.binding_for_non_main());
        state.quit.set(false);
        tracing::debug!(
            event = "looper.reset",
            context = %context,
            name = %state.name,
            discarded,
            "Looper reset"
        );
        Ok(())
    }

    fn reset_main(&self) {
        let main = &self.inner.main;
        if self.use_global_scheduler() {
            let master = self.master_scheduler();
            master.reset();
            main.bind(master);
        } else {
            let fresh = Scheduler::with_config(&self.inner.config);
            let previous = self.inner.master.replace(fresh.clone());
            main.bind(fresh);
            if !self.is_shared(&previous, main.context) {
                previous.remove_all();
            }
        }
        main.quit.set(false);
        tracing::debug!(
            event = "looper.reset",
            context = %main.context,
            name = %main.name,
            global = self.use_global_scheduler(),
            "Main looper reset"
        );
    }

    /// Return every context to a clean state. Must be called from main.
    ///
    /// Live non-main loopers are quit; the schedulers of already-quit loopers
    /// are reset; the background scheduler and the main looper start over.
    pub fn reset_all(&self) -> Result<()> {
        let current = self.current_context();
        if current != self.main_context() {
            return Err(Error::illegal_state(format!(
                "reset_all must be called from the main context, not {current}"
            )));
        }

        let others: Vec<Rc<LooperState>> = self
            .inner
            .loopers
            .borrow()
            .values()
            .filter(|state| !state.main)
            .cloned()
            .collect();
        for state in &others {
            if state.quit.get() {
                let scheduler = state.scheduler();
                if !self.is_shared(&scheduler, state.context) {
                    scheduler.reset();
                }
            } else {
                self.quit(state.context)?;
            }
        }

        let background = Self::fresh_background(&self.inner.config);
        let previous = self.inner.background.replace(background);
        previous.reset();

        self.reset_main();
        tracing::debug!(
            event = "registry.reset_all",
            loopers = others.len(),
            "All loopers reset"
        );
        Ok(())
    }

    /// Make `context` current until the returned guard is dropped.
    pub fn enter(&self, context: ContextId) -> ContextGuard {
        let previous = self.inner.current.replace(context);
        ContextGuard {
            registry: self.clone(),
            previous,
        }
    }

    #[must_use]
    pub fn current_context(&self) -> ContextId {
        self.inner.current.get()
    }

    /// Looper of the current context.
    pub fn my_looper(&self) -> Result<Looper> {
        self.looper(self.current_context())
    }

    #[must_use]
    pub fn master_scheduler(&self) -> Scheduler {
        self.inner.master.borrow().clone()
    }

    /// Replace the master scheduler. Loopers bound afterwards use the new one.
    pub fn set_master_scheduler(&self, scheduler: Scheduler) {
        tracing::debug!(
            event = "registry.master",
            scheduler = scheduler.instance_id(),
            "Master scheduler replaced"
        );
        *self.inner.master.borrow_mut() = scheduler;
    }

    #[must_use]
    pub fn use_global_scheduler(&self) -> bool {
        self.inner.use_global_scheduler.get()
    }

    /// Toggle global-scheduler mode. Takes effect at the next prepare/reset.
    pub fn set_use_global_scheduler(&self, enabled: bool) {
        self.inner.use_global_scheduler.set(enabled);
    }

    #[must_use]
    pub fn background_scheduler(&self) -> Scheduler {
        self.inner.background.borrow().clone()
    }

    /// Run every task queued on the background scheduler.
    pub fn flush_background_scheduler(&self) -> bool {
        self.background_scheduler().advance_to_last_posted_task()
    }
}

impl fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("main", &self.inner.main.context)
            .field("current", &self.current_context())
            .field("loopers", &self.inner.loopers.borrow().len())
            .field("use_global_scheduler", &self.use_global_scheduler())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::IdleState;

    fn global_config() -> SimConfig {
        SimConfig {
            use_global_scheduler: true,
            ..SimConfig::default()
        }
    }

    #[test]
    fn main_looper_cannot_quit() {
        let registry = SchedulerRegistry::default();
        let err = registry.quit(registry.main_context()).unwrap_err();
        assert!(err.is_illegal_state());
        assert!(!registry.has_quit(registry.main_context()).unwrap());
    }

    #[test]
    fn unknown_context_is_illegal_state() {
        let registry = SchedulerRegistry::default();
        let err = registry.quit(ContextId::from_raw(u64::MAX)).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn non_main_loopers_get_isolated_schedulers() {
        let registry = SchedulerRegistry::default();
        let a = registry.prepare_looper("a");
        let b = registry.prepare_looper("b");
        assert_ne!(a.scheduler(), b.scheduler());
        assert_ne!(a.scheduler(), registry.master_scheduler());
        assert_eq!(registry.main_looper().scheduler(), registry.master_scheduler());
    }

    #[test]
    fn global_mode_binds_master() {
        let registry = SchedulerRegistry::new(global_config());
        let a = registry.prepare_looper("a");
        assert_eq!(a.scheduler(), registry.master_scheduler());
    }

    #[test]
    fn quit_on_isolated_scheduler_resets_it() {
        let registry = SchedulerRegistry::default();
        let looper = registry.prepare_looper("worker");
        let scheduler = looper.scheduler();
        scheduler.pause();
        scheduler.post_delayed(|| {}, 10).unwrap();
        scheduler.advance_by(5);

        registry.quit(looper.context()).unwrap();
        assert!(registry.has_quit(looper.context()).unwrap());
        assert_eq!(scheduler.size(), 0);
        assert_eq!(scheduler.current_time(), 100);

        // Idempotent.
        registry.quit(looper.context()).unwrap();
    }

    #[test]
    fn reset_main_installs_fresh_master() {
        let registry = SchedulerRegistry::default();
        let before = registry.master_scheduler();
        registry.reset(registry.main_context()).unwrap();
        let after = registry.master_scheduler();
        assert_ne!(before, after);
        assert_eq!(registry.main_looper().scheduler(), after);
    }

    #[test]
    fn reset_main_in_global_mode_keeps_master() {
        let registry = SchedulerRegistry::new(global_config());
        let master = registry.master_scheduler();
        master.pause();
        master.post(|| {});
        registry.reset(registry.main_context()).unwrap();
        assert_eq!(registry.master_scheduler(), master);
        assert_eq!(master.size(), 0);
        assert_eq!(master.idle_state(), IdleState::Unpaused);
    }

    #[test]
    fn reset_all_requires_main_context() {
        let registry = SchedulerRegistry::default();
        let worker = registry.prepare_looper("worker");
        {
            let _entered = registry.enter(worker.context());
            assert!(registry.reset_all().unwrap_err().is_illegal_state());
        }
        registry.reset_all().unwrap();
        assert!(worker.has_quit());
    }

    #[test]
    fn enter_guard_restores_previous_context() {
        let registry = SchedulerRegistry::default();
        let worker = registry.prepare_looper("worker");
        assert_eq!(registry.current_context(), registry.main_context());
        {
            let _entered = registry.enter(worker.context());
            assert_eq!(registry.my_looper().unwrap(), worker);
        }
        assert_eq!(registry.current_context(), registry.main_context());
    }

    #[test]
    fn background_scheduler_starts_paused_and_flushes() {
        let registry = SchedulerRegistry::default();
        let background = registry.background_scheduler();
        assert!(background.is_paused());
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        background.post_delayed(move || flag.set(true), 50).unwrap();
        assert!(!ran.get());

        assert!(registry.flush_background_scheduler());
        assert!(ran.get());
    }
}
