//! End-to-end alarm behavior: cadence, replacement, cancellation, reentrancy.

mod common;

use common::{Recorder, init_tracing};
use looper_sim::alarm::AlarmTarget;
use looper_sim::alarm::AlarmClockInfo;
use looper_sim::{
    AlarmSimulator, AlarmType, OnAlarmListener, PendingIntent, SchedulerRegistry, SimConfig,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn setup() -> (SchedulerRegistry, AlarmSimulator) {
    init_tracing();
    let registry = SchedulerRegistry::default();
    let alarms = AlarmSimulator::for_registry(&registry);
    (registry, alarms)
}

#[test]
fn delayed_post_runs_exactly_once_at_deadline() {
    let (registry, _alarms) = setup();
    let main = registry.main_looper();
    let recorder = Recorder::new();
    main.post_delayed(recorder.task("task"), 2000).unwrap();

    main.idle_for(1999);
    assert_eq!(recorder.count("task"), 0);
    main.idle_for(1);
    assert_eq!(recorder.count("task"), 1);
    main.idle_for(10_000);
    assert_eq!(recorder.count("task"), 1);
}

#[test]
fn repeating_alarm_fires_on_cadence_until_cancelled() {
    let (_registry, alarms) = setup();
    let recorder = Recorder::new();
    let listener = OnAlarmListener::new(recorder.callback("tick"));
    let now = alarms.elapsed_realtime();
    let intent = PendingIntent::broadcast("repeat");
    alarms
        .set_repeating(AlarmType::ElapsedRealtime, now + 10, 20, intent.clone())
        .unwrap();
    // A listener alarm alongside keeps the test honest about per-target state.
    alarms
        .set_exact_listener(AlarmType::ElapsedRealtime, now + 1_000, "other", &listener)
        .unwrap();

    alarms.looper().idle_for(10);
    assert_eq!(alarms.fired_broadcasts().len(), 1);
    alarms.looper().idle_for(20);
    assert_eq!(alarms.fired_broadcasts().len(), 2);

    assert_eq!(alarms.cancel(&intent), 1);
    alarms.looper().idle_for(200);
    assert_eq!(alarms.fired_broadcasts().len(), 2);
    assert_eq!(recorder.count("tick"), 0);
}

#[test]
fn repeat_is_rescheduled_from_trigger_not_from_now() {
    let (_registry, alarms) = setup();
    let now = alarms.elapsed_realtime();
    alarms
        .set_repeating(AlarmType::ElapsedRealtime, now + 10, 20, PendingIntent::broadcast("r"))
        .unwrap();

    // Fire late: the clock jumps well past the trigger in one step.
    alarms.looper().idle_for(15);
    let next = alarms.peek_next_scheduled_alarm().unwrap();
    assert_eq!(next.trigger_at_ms, now + 30);
    assert_eq!(next.interval_ms, 20);
}

#[test]
fn second_set_for_same_listener_replaces_first() {
    let (_registry, alarms) = setup();
    let recorder = Recorder::new();
    let listener = OnAlarmListener::new(recorder.callback("fired"));
    let now = alarms.elapsed_realtime();

    alarms
        .set_listener(AlarmType::ElapsedRealtime, now + 10, "tag", &listener)
        .unwrap();
    alarms
        .set_listener(AlarmType::ElapsedRealtime, now + 20, "tag", &listener)
        .unwrap();

    assert_eq!(alarms.scheduled_alarm_count(), 1);
    let only = alarms.peek_next_scheduled_alarm().unwrap();
    assert_eq!(only.trigger_at_ms, now + 20);
    assert!(matches!(only.target, AlarmTarget::Listener { ref tag, .. } if tag == "tag"));

    alarms.looper().idle_for(100);
    assert_eq!(recorder.count("fired"), 1);
}

#[test]
fn cancelling_both_pending_alarms_empties_the_set() {
    let (_registry, alarms) = setup();
    let recorder = Recorder::new();
    let a = OnAlarmListener::new(recorder.callback("a"));
    let b = OnAlarmListener::new(recorder.callback("b"));
    let now = alarms.elapsed_realtime();
    alarms.set_listener(AlarmType::ElapsedRealtime, now + 10, "a", &a).unwrap();
    alarms.set_listener(AlarmType::ElapsedRealtime, now + 20, "b", &b).unwrap();

    alarms.cancel_listener(&a);
    alarms.cancel_listener(&b);
    assert_eq!(alarms.scheduled_alarm_count(), 0);
    assert!(alarms.peek_next_scheduled_alarm().is_none());

    alarms.looper().idle_for(1_000);
    assert!(recorder.snapshot().is_empty());

    // Cancelling again is a silent no-op.
    assert_eq!(alarms.cancel_listener(&a), 0);
    assert_eq!(alarms.cancel(&PendingIntent::broadcast("never-set")), 0);
}

#[test]
fn past_due_alarm_fires_on_next_idle() {
    let (registry, alarms) = setup();
    let main = registry.main_looper();
    main.pause();
    main.idle_for(1_000);
    let recorder = Recorder::new();
    let listener = OnAlarmListener::new(recorder.callback("late"));

    alarms
        .set_exact_listener(AlarmType::ElapsedRealtime, 10, "past", &listener)
        .unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 1);

    main.idle();
    assert_eq!(recorder.count("late"), 1);
    assert_eq!(alarms.scheduled_alarm_count(), 0);
}

#[test]
fn reentrant_alarm_rearms_itself_indefinitely() {
    let (_registry, alarms) = setup();
    let fired = Rc::new(Cell::new(0u32));
    let delay = 50;

    // The listener needs a handle to itself to re-register.
    let slot: Rc<RefCell<Option<OnAlarmListener>>> = Rc::new(RefCell::new(None));
    let listener = {
        let alarms = alarms.clone();
        let fired = Rc::clone(&fired);
        let slot = Rc::clone(&slot);
        OnAlarmListener::new(move || {
            fired.set(fired.get() + 1);
            if let Some(me) = slot.borrow().as_ref() {
                let at = alarms.elapsed_realtime() + delay;
                alarms
                    .set_exact_listener(AlarmType::ElapsedRealtime, at, "self", me)
                    .unwrap();
                assert_eq!(alarms.peek_next_scheduled_alarm().map(|a| a.trigger_at_ms), Some(at));
            }
        })
    };
    *slot.borrow_mut() = Some(listener.clone());

    let start = alarms.elapsed_realtime();
    alarms
        .set_exact_listener(AlarmType::ElapsedRealtime, start + delay, "self", &listener)
        .unwrap();

    for expected in 1..=5 {
        alarms.looper().idle_for(delay);
        assert_eq!(fired.get(), expected);
        assert_eq!(alarms.scheduled_alarm_count(), 1);
    }

    // Break the self-reference so the listener can be dropped.
    slot.borrow_mut().take();
}

#[test]
fn repeating_callback_may_cancel_its_next_occurrence() {
    let (_registry, alarms) = setup();
    let intent = PendingIntent::broadcast("stop-after-first");
    let canceller = alarms.clone();
    let target = intent.clone();
    alarms.set_broadcast_sink(move |fired| {
        if *fired == target {
            canceller.cancel(fired);
        }
    });
    let now = alarms.elapsed_realtime();
    alarms
        .set_repeating(AlarmType::ElapsedRealtime, now + 5, 5, intent)
        .unwrap();

    alarms.looper().idle_for(100);
    assert_eq!(alarms.fired_broadcasts().len(), 1);
    assert_eq!(alarms.scheduled_alarm_count(), 0);
}

#[test]
fn reset_all_discards_live_alarms() {
    let (registry, alarms) = setup();
    let now = alarms.elapsed_realtime();
    alarms
        .set(AlarmType::ElapsedRealtime, now + 10, PendingIntent::broadcast("stale"))
        .unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 1);

    registry.reset_all().unwrap();
    alarms.looper().idle_for(1000);

    assert!(alarms.fired_broadcasts().is_empty());
    assert_eq!(alarms.scheduled_alarm_count(), 0);
    assert!(alarms.peek_next_scheduled_alarm().is_none());
    assert!(alarms.next_scheduled_alarm().is_none());
}

#[test]
fn main_reset_discards_alarms_and_accepts_new_ones() {
    let (registry, alarms) = setup();
    let recorder = Recorder::new();
    let listener = OnAlarmListener::new(recorder.callback("fresh"));
    let now = alarms.elapsed_realtime();
    alarms
        .set_alarm_clock(
            AlarmClockInfo {
                trigger_time_ms: now + 500,
                show_intent: None,
            },
            PendingIntent::broadcast("clock"),
        )
        .unwrap();
    assert!(alarms.next_alarm_clock().is_some());

    registry.reset(registry.main_context()).unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 0);
    assert!(alarms.next_alarm_clock().is_none());
    assert!(alarms.scheduled_alarms().is_empty());

    let now = alarms.elapsed_realtime();
    alarms
        .set_exact_listener(AlarmType::ElapsedRealtime, now + 20, "after-reset", &listener)
        .unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 1);
    alarms.looper().idle_for(20);
    assert_eq!(recorder.count("fresh"), 1);
    assert!(alarms.fired_broadcasts().is_empty());
}

#[test]
fn quitting_the_alarm_looper_discards_its_alarms() {
    let (registry, _main_alarms) = setup();
    let worker = registry.prepare_looper("alarm-worker");
    let alarms = AlarmSimulator::new(worker.clone(), 0);
    let recorder = Recorder::new();
    let listener = OnAlarmListener::new(recorder.callback("worker"));
    let now = alarms.elapsed_realtime();
    alarms
        .set_listener(AlarmType::ElapsedRealtime, now + 10, "w", &listener)
        .unwrap();
    alarms
        .set(AlarmType::ElapsedRealtime, now + 30, PendingIntent::broadcast("w"))
        .unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 2);

    worker.quit().unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 0);
    assert!(alarms.peek_next_scheduled_alarm().is_none());

    // Alarms set after quitting are dropped too.
    alarms
        .set_listener(AlarmType::ElapsedRealtime, now + 10, "late", &listener)
        .unwrap();
    assert_eq!(alarms.scheduled_alarm_count(), 0);
    worker.scheduler().advance_by(1000);
    assert_eq!(recorder.count("worker"), 0);
}

#[test]
fn idle_past_the_drain_limit_fires_every_due_alarm() {
    init_tracing();
    let registry = SchedulerRegistry::new(SimConfig {
        drain_limit: 3,
        ..SimConfig::default()
    });
    let alarms = AlarmSimulator::for_registry(&registry);
    let recorder = Recorder::new();
    let listener = OnAlarmListener::new(recorder.callback("due"));
    let now = alarms.elapsed_realtime();
    for offset in 1..=6u64 {
        alarms
            .set_exact_listener(AlarmType::ElapsedRealtime, now + offset, format!("t{offset}"), &listener)
            .unwrap();
    }

    alarms.looper().idle_for(100);
    assert_eq!(recorder.count("due"), 6);
    assert_eq!(alarms.scheduled_alarm_count(), 0);
    assert!(alarms.looper().is_idle());
    assert_eq!(alarms.elapsed_realtime(), now + 100);
}
