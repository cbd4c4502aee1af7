//! AlarmManager-style scheduling on top of a looper.
//!
//! Each live alarm owns exactly one task on the looper's scheduler, keyed by
//! [`TaskKey::Alarm`]. Setting an alarm for a target that already has one
//! cancels the old task first. A repeating alarm is re-registered at
//! `trigger + interval` before its target runs, so the cadence does not drift
//! and the callback may cancel or replace the next occurrence.

use crate::clock::{Clock, RtcClock};
use crate::error::{Error, Result};
use crate::key::{AlarmId, CallbackId, TaskKey};
use crate::looper::Looper;
use crate::registry::SchedulerRegistry;
use crate::scheduler::PendingTask;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Which clock an alarm's trigger time is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    ElapsedRealtime,
    ElapsedRealtimeWakeup,
    Rtc,
    RtcWakeup,
}

impl AlarmType {
    #[must_use]
    pub const fn is_rtc(self) -> bool {
        matches!(self, Self::Rtc | Self::RtcWakeup)
    }

    #[must_use]
    pub const fn is_wakeup(self) -> bool {
        matches!(self, Self::ElapsedRealtimeWakeup | Self::RtcWakeup)
    }
}

/// Broadcast target, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingIntent {
    pub action: String,
    #[serde(default)]
    pub request_code: i32,
}

impl PendingIntent {
    pub fn broadcast(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            request_code: 0,
        }
    }

    #[must_use]
    pub const fn with_request_code(mut self, request_code: i32) -> Self {
        self.request_code = request_code;
        self
    }
}

/// Direct-callback alarm target. Clones share identity.
#[derive(Clone)]
pub struct OnAlarmListener {
    id: CallbackId,
    callback: Rc<dyn Fn()>,
}

impl OnAlarmListener {
    pub fn new(callback: impl Fn() + 'static) -> Self {
        Self {
            id: CallbackId::fresh(),
            callback: Rc::new(callback),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CallbackId {
        self.id
    }

    fn on_alarm(&self) {
        (self.callback)();
    }
}

impl PartialEq for OnAlarmListener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OnAlarmListener {}

impl fmt::Debug for OnAlarmListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnAlarmListener")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// What an alarm invokes when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmTarget {
    Operation(PendingIntent),
    Listener {
        tag: String,
        listener: OnAlarmListener,
    },
}

impl AlarmTarget {
    fn label(&self) -> String {
        match self {
            Self::Operation(intent) => intent.action.clone(),
            Self::Listener { tag, listener } => format!("{tag}/{}", listener.id),
        }
    }
}

/// Next user-visible alarm clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmClockInfo {
    pub trigger_time_ms: u64,
    #[serde(default)]
    pub show_intent: Option<PendingIntent>,
}

/// A live (set, not yet fired or cancelled) alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAlarm {
    pub id: AlarmId,
    pub alarm_type: AlarmType,
    pub trigger_at_ms: u64,
    pub interval_ms: u64,
    pub window_length_ms: u64,
    pub exact: bool,
    pub allow_while_idle: bool,
    pub target: AlarmTarget,
    pub work_source: Option<String>,
    pub alarm_clock: Option<AlarmClockInfo>,
}

impl ScheduledAlarm {
    #[must_use]
    pub const fn is_repeating(&self) -> bool {
        self.interval_ms > 0
    }

    #[must_use]
    pub const fn operation(&self) -> Option<&PendingIntent> {
        match &self.target {
            AlarmTarget::Operation(intent) => Some(intent),
            AlarmTarget::Listener { .. } => None,
        }
    }
}

/// Parameters of one `set*` call.
#[derive(Debug, Clone)]
pub struct AlarmRequest {
    alarm_type: AlarmType,
    trigger_at_ms: u64,
    interval_ms: i64,
    window_length_ms: i64,
    exact: bool,
    allow_while_idle: bool,
    target: AlarmTarget,
    work_source: Option<String>,
    alarm_clock: Option<AlarmClockInfo>,
}

impl AlarmRequest {
    #[must_use]
    pub const fn new(alarm_type: AlarmType, trigger_at_ms: u64, target: AlarmTarget) -> Self {
        Self {
            alarm_type,
            trigger_at_ms,
            interval_ms: 0,
            window_length_ms: 0,
            exact: false,
            allow_while_idle: false,
            target,
            work_source: None,
            alarm_clock: None,
        }
    }

    #[must_use]
    pub fn interval(mut self, interval_ms: i64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn window(mut self, window_length_ms: i64) -> Self {
        self.window_length_ms = window_length_ms;
        self
    }

    #[must_use]
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    #[must_use]
    pub fn allow_while_idle(mut self) -> Self {
        self.allow_while_idle = true;
        self
    }

    #[must_use]
    pub fn work_source(mut self, work_source: impl Into<String>) -> Self {
        self.work_source = Some(work_source.into());
        self
    }

    fn validate(self, id: AlarmId) -> Result<ScheduledAlarm> {
        let interval_ms = u64::try_from(self.interval_ms).map_err(|_| {
            Error::invalid_argument(format!("alarm interval must be >= 0, got {}", self.interval_ms))
        })?;
        let window_length_ms = u64::try_from(self.window_length_ms).map_err(|_| {
            Error::invalid_argument(format!(
                "alarm window length must be >= 0, got {}",
                self.window_length_ms
            ))
        })?;
        Ok(ScheduledAlarm {
            id,
            alarm_type: self.alarm_type,
            trigger_at_ms: self.trigger_at_ms,
            interval_ms,
            window_length_ms,
            exact: self.exact,
            allow_while_idle: self.allow_while_idle,
            target: self.target,
            work_source: self.work_source,
            alarm_clock: self.alarm_clock,
        })
    }
}

type BroadcastSink = Rc<dyn Fn(&PendingIntent)>;

struct AlarmInner {
    looper: Looper,
    rtc_epoch_ms: u64,
    alarms: RefCell<Vec<ScheduledAlarm>>,
    can_schedule_exact_alarms: Cell<bool>,
    fired: RefCell<Vec<PendingIntent>>,
    broadcast_sink: RefCell<Option<BroadcastSink>>,
}

/// Alarm service simulation bound to one looper.
#[derive(Clone)]
pub struct AlarmSimulator {
    inner: Rc<AlarmInner>,
}

impl AlarmSimulator {
    /// Alarms on `looper`, with RTC time `rtc_epoch_ms` ahead of elapsed time.
    #[must_use]
    pub fn new(looper: Looper, rtc_epoch_ms: u64) -> Self {
        Self {
            inner: Rc::new(AlarmInner {
                looper,
                rtc_epoch_ms,
                alarms: RefCell::new(Vec::new()),
                can_schedule_exact_alarms: Cell::new(true),
                fired: RefCell::new(Vec::new()),
                broadcast_sink: RefCell::new(None),
            }),
        }
    }

    /// Alarms on the registry's main looper, using its configured RTC epoch.
    #[must_use]
    pub fn for_registry(registry: &SchedulerRegistry) -> Self {
        Self::new(registry.main_looper(), registry.config().rtc_epoch_ms)
    }

    #[must_use]
    pub fn looper(&self) -> &Looper {
        &self.inner.looper
    }

    /// Elapsed-realtime "now".
    #[must_use]
    pub fn elapsed_realtime(&self) -> u64 {
        self.inner.looper.scheduler().now_ms()
    }

    /// Wall-clock "now".
    #[must_use]
    pub fn current_time_millis(&self) -> u64 {
        RtcClock::new(self.inner.looper.scheduler(), self.inner.rtc_epoch_ms).now_ms()
    }

    fn now_for(&self, alarm_type: AlarmType) -> u64 {
        if alarm_type.is_rtc() {
            self.current_time_millis()
        } else {
            self.elapsed_realtime()
        }
    }

    /// Receive every broadcast an operation alarm delivers.
    pub fn set_broadcast_sink(&self, sink: impl Fn(&PendingIntent) + 'static) {
        *self.inner.broadcast_sink.borrow_mut() = Some(Rc::new(sink));
    }

    pub fn set(&self, alarm_type: AlarmType, trigger_at_ms: u64, operation: PendingIntent) -> Result<()> {
        self.schedule(AlarmRequest::new(
            alarm_type,
            trigger_at_ms,
            AlarmTarget::Operation(operation),
        ))
    }

    pub fn set_exact(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        operation: PendingIntent,
    ) -> Result<()> {
        self.schedule(
            AlarmRequest::new(alarm_type, trigger_at_ms, AlarmTarget::Operation(operation)).exact(),
        )
    }

    pub fn set_window(
        &self,
        alarm_type: AlarmType,
        window_start_ms: u64,
        window_length_ms: i64,
        operation: PendingIntent,
    ) -> Result<()> {
        self.schedule(
            AlarmRequest::new(alarm_type, window_start_ms, AlarmTarget::Operation(operation))
                .window(window_length_ms),
        )
    }

    pub fn set_repeating(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        interval_ms: i64,
        operation: PendingIntent,
    ) -> Result<()> {
        self.schedule(
            AlarmRequest::new(alarm_type, trigger_at_ms, AlarmTarget::Operation(operation))
                .interval(interval_ms)
                .exact(),
        )
    }

    pub fn set_inexact_repeating(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        interval_ms: i64,
        operation: PendingIntent,
    ) -> Result<()> {
        self.schedule(
            AlarmRequest::new(alarm_type, trigger_at_ms, AlarmTarget::Operation(operation))
                .interval(interval_ms),
        )
    }

    pub fn set_and_allow_while_idle(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        operation: PendingIntent,
    ) -> Result<()> {
        self.schedule(
            AlarmRequest::new(alarm_type, trigger_at_ms, AlarmTarget::Operation(operation))
                .allow_while_idle(),
        )
    }

    pub fn set_exact_and_allow_while_idle(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        operation: PendingIntent,
    ) -> Result<()> {
        self.schedule(
            AlarmRequest::new(alarm_type, trigger_at_ms, AlarmTarget::Operation(operation))
                .exact()
                .allow_while_idle(),
        )
    }

    pub fn set_listener(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        tag: impl Into<String>,
        listener: &OnAlarmListener,
    ) -> Result<()> {
        self.schedule(AlarmRequest::new(
            alarm_type,
            trigger_at_ms,
            AlarmTarget::Listener {
                tag: tag.into(),
                listener: listener.clone(),
            },
        ))
    }

    pub fn set_exact_listener(
        &self,
        alarm_type: AlarmType,
        trigger_at_ms: u64,
        tag: impl Into<String>,
        listener: &OnAlarmListener,
    ) -> Result<()> {
        let target = AlarmTarget::Listener {
            tag: tag.into(),
            listener: listener.clone(),
        };
        self.schedule(AlarmRequest::new(alarm_type, trigger_at_ms, target).exact())
    }

    /// Set a user-visible alarm clock; it is an exact RTC wakeup alarm.
    pub fn set_alarm_clock(&self, info: AlarmClockInfo, operation: PendingIntent) -> Result<()> {
        let mut request = AlarmRequest::new(
            AlarmType::RtcWakeup,
            info.trigger_time_ms,
            AlarmTarget::Operation(operation),
        )
        .exact();
        request.alarm_clock = Some(info);
        self.schedule(request)
    }

    /// Register an alarm, replacing any live alarm for the same target.
    pub fn schedule(&self, request: AlarmRequest) -> Result<()> {
        let alarm = request.validate(AlarmId::fresh())?;
        self.cancel_where("replace", |live| live.target == alarm.target);
        self.register(alarm)
    }

    fn register(&self, alarm: ScheduledAlarm) -> Result<()> {
        let now = self.now_for(alarm.alarm_type);
        let delay = alarm.trigger_at_ms.saturating_sub(now);
        let delay = i64::try_from(delay).unwrap_or(i64::MAX);
        let id = alarm.id;

        let weak: Weak<AlarmInner> = Rc::downgrade(&self.inner);
        let task = PendingTask::new(move || {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.fire(id);
            }
        })
        .delayed(delay)
        .keyed(TaskKey::Alarm(id));

        tracing::trace!(
            event = "alarm.set",
            alarm = %id,
            target = %alarm.target.label(),
            alarm_type = ?alarm.alarm_type,
            trigger_at_ms = alarm.trigger_at_ms,
            interval_ms = alarm.interval_ms,
            delay_ms = delay,
            "Alarm scheduled"
        );
        self.inner.alarms.borrow_mut().push(alarm);
        if self.inner.looper.enqueue(task)?.is_none() {
            // The looper has quit: nothing will ever fire this alarm.
            self.inner.alarms.borrow_mut().retain(|live| live.id != id);
        }
        Ok(())
    }

    fn fire(&self, id: AlarmId) {
        let alarm = {
            let mut alarms = self.inner.alarms.borrow_mut();
            let Some(index) = alarms.iter().position(|live| live.id == id) else {
                return;
            };
            alarms.remove(index)
        };

        tracing::debug!(
            event = "alarm.fire",
            alarm = %id,
            target = %alarm.target.label(),
            trigger_at_ms = alarm.trigger_at_ms,
            now_ms = self.elapsed_realtime(),
            "Alarm fired"
        );

        if alarm.is_repeating() {
            let mut next = alarm.clone();
            next.id = AlarmId::fresh();
            next.trigger_at_ms = alarm.trigger_at_ms.saturating_add(alarm.interval_ms);
            if let Err(err) = self.register(next) {
                tracing::warn!(
                    event = "alarm.repeat.failed",
                    alarm = %id,
                    error = %err,
                    "Could not re-register repeating alarm"
                );
            }
        }

        match alarm.target {
            AlarmTarget::Listener { listener, .. } => listener.on_alarm(),
            AlarmTarget::Operation(intent) => {
                self.inner.fired.borrow_mut().push(intent.clone());
                let sink = self.inner.broadcast_sink.borrow().clone();
                if let Some(sink) = sink {
                    sink(&intent);
                }
            }
        }
    }

    /// Forget live alarms whose task is gone from the looper's scheduler,
    /// as happens when the looper quits or its scheduler is reset or rebound.
    fn prune_orphaned(&self) {
        let scheduler = self.inner.looper.scheduler();
        let quit = self.inner.looper.has_quit();
        let mut alarms = self.inner.alarms.borrow_mut();
        let before = alarms.len();
        alarms.retain(|live| !quit && scheduler.contains(&TaskKey::Alarm(live.id)));
        let dropped = before - alarms.len();
        if dropped > 0 {
            tracing::debug!(
                event = "alarm.orphaned",
                dropped,
                "Dropped alarms whose scheduler task was discarded"
            );
        }
    }

    fn cancel_where(&self, reason: &'static str, matches: impl Fn(&ScheduledAlarm) -> bool) -> usize {
        self.prune_orphaned();
        let removed: Vec<AlarmId> = {
            let mut alarms = self.inner.alarms.borrow_mut();
            let removed = alarms.iter().filter(|&a| matches(a)).map(|a| a.id).collect();
            alarms.retain(|a| !matches(a));
            removed
        };
        let scheduler = self.inner.looper.scheduler();
        for id in &removed {
            scheduler.remove(&TaskKey::Alarm(*id));
            tracing::trace!(event = "alarm.cancel", alarm = %id, reason, "Alarm cancelled");
        }
        removed.len()
    }

    /// Cancel the alarm for `operation`. No-op when there is none.
    pub fn cancel(&self, operation: &PendingIntent) -> usize {
        self.cancel_where("cancel", |live| live.operation() == Some(operation))
    }

    /// Cancel every alarm delivered to `listener`, whatever its tag.
    pub fn cancel_listener(&self, listener: &OnAlarmListener) -> usize {
        self.cancel_where("cancel", |live| {
            matches!(&live.target, AlarmTarget::Listener { listener: l, .. } if l == listener)
        })
    }

    /// Cancel the alarm for one (tag, listener) pair.
    pub fn cancel_tagged_listener(&self, tag: &str, listener: &OnAlarmListener) -> usize {
        self.cancel_where("cancel", |live| {
            matches!(&live.target, AlarmTarget::Listener { tag: t, listener: l } if t == tag && l == listener)
        })
    }

    /// Earliest live alarm, without removing it.
    #[must_use]
    pub fn peek_next_scheduled_alarm(&self) -> Option<ScheduledAlarm> {
        self.prune_orphaned();
        self.inner
            .alarms
            .borrow()
            .iter()
            .min_by_key(|alarm| alarm.trigger_at_ms)
            .cloned()
    }

    /// Remove and return the earliest live alarm; it will not fire.
    pub fn next_scheduled_alarm(&self) -> Option<ScheduledAlarm> {
        let next = self.peek_next_scheduled_alarm()?;
        self.cancel_where("consume", |live| live.id == next.id);
        Some(next)
    }

    /// Live alarms in registration order.
    #[must_use]
    pub fn scheduled_alarms(&self) -> Vec<ScheduledAlarm> {
        self.prune_orphaned();
        self.inner.alarms.borrow().clone()
    }

    #[must_use]
    pub fn scheduled_alarm_count(&self) -> usize {
        self.prune_orphaned();
        self.inner.alarms.borrow().len()
    }

    /// The earliest live alarm clock.
    #[must_use]
    pub fn next_alarm_clock(&self) -> Option<AlarmClockInfo> {
        self.prune_orphaned();
        self.inner
            .alarms
            .borrow()
            .iter()
            .filter_map(|alarm| alarm.alarm_clock.clone())
            .min_by_key(|info| info.trigger_time_ms)
    }

    #[must_use]
    pub fn can_schedule_exact_alarms(&self) -> bool {
        self.inner.can_schedule_exact_alarms.get()
    }

    pub fn set_can_schedule_exact_alarms(&self, allowed: bool) {
        self.inner.can_schedule_exact_alarms.set(allowed);
    }

    /// Operations delivered so far, oldest first.
    #[must_use]
    pub fn fired_broadcasts(&self) -> Vec<PendingIntent> {
        self.inner.fired.borrow().clone()
    }

    /// Cancel every live alarm and forget delivery history.
    pub fn reset(&self) {
        let cancelled = self.cancel_where("reset", |_| true);
        self.inner.fired.borrow_mut().clear();
        self.inner.can_schedule_exact_alarms.set(true);
        tracing::debug!(event = "alarm.reset", cancelled, "Alarm simulator reset");
    }
}

impl fmt::Debug for AlarmSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmSimulator")
            .field("looper", &self.inner.looper)
            .field("alarms", &self.scheduled_alarm_count())
            .field("fired", &self.inner.fired.borrow().len())
            .finish_non_exhaustive()
    }
}
