//! Declarative scenarios.
//!
//! A [`Scenario`] is a JSON list of driver steps (post, idle, advance, quit,
//! alarms, expectations) run against a fresh [`SchedulerRegistry`]. Every
//! labelled task that runs is recorded with its looper and virtual time, and
//! the [`Transcript`] is the serializable result of the whole run.

use crate::alarm::{AlarmSimulator, AlarmType, PendingIntent};
use crate::config::SimConfig;
use crate::error::{Error, Result};
use crate::key::TaskKey;
use crate::looper::Looper;
use crate::registry::{MAIN_LOOPER_NAME, SchedulerRegistry};
use crate::scheduler::PendingTask;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Replaces the runner's base configuration when present.
    #[serde(default)]
    pub config: Option<SimConfig>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json_str(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }
}

/// One driver action. `looper` defaults to the main looper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    PrepareLooper {
        looper: String,
    },
    Post {
        label: String,
        #[serde(default)]
        looper: Option<String>,
        #[serde(default)]
        delay_ms: i64,
        /// Removal key; defaults to the label.
        #[serde(default)]
        key: Option<String>,
        /// Replace a queued task with the same key instead of adding another.
        #[serde(default)]
        replace: bool,
    },
    PostAtFront {
        label: String,
        #[serde(default)]
        looper: Option<String>,
    },
    Remove {
        key: String,
        #[serde(default)]
        looper: Option<String>,
    },
    Pause {
        #[serde(default)]
        looper: Option<String>,
    },
    Unpause {
        #[serde(default)]
        looper: Option<String>,
    },
    Idle {
        #[serde(default)]
        looper: Option<String>,
    },
    IdleFor {
        duration_ms: u64,
        #[serde(default)]
        looper: Option<String>,
    },
    AdvanceTo {
        time_ms: u64,
        #[serde(default)]
        looper: Option<String>,
    },
    RunOneTask {
        #[serde(default)]
        looper: Option<String>,
    },
    RunToNextTask {
        #[serde(default)]
        looper: Option<String>,
    },
    RunToEnd {
        #[serde(default)]
        looper: Option<String>,
    },
    Quit {
        looper: String,
    },
    Reset {
        #[serde(default)]
        looper: Option<String>,
    },
    ResetAll,
    /// Set an alarm on the main looper whose target broadcasts `label`.
    SetAlarm {
        label: String,
        #[serde(default = "default_alarm_type")]
        alarm_type: AlarmType,
        /// Absolute trigger time; wins over `delay_ms`.
        #[serde(default)]
        trigger_at_ms: Option<u64>,
        #[serde(default)]
        delay_ms: u64,
        #[serde(default)]
        interval_ms: i64,
    },
    CancelAlarm {
        label: String,
    },
    /// Labels run since the previous expectation, in order.
    ExpectRan {
        labels: Vec<String>,
    },
}

const fn default_alarm_type() -> AlarmType {
    AlarmType::ElapsedRealtime
}

impl Step {
    /// Wire name of the step, as used in the `op` tag.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::PrepareLooper { .. } => "prepare_looper",
            Self::Post { .. } => "post",
            Self::PostAtFront { .. } => "post_at_front",
            Self::Remove { .. } => "remove",
            Self::Pause { .. } => "pause",
            Self::Unpause { .. } => "unpause",
            Self::Idle { .. } => "idle",
            Self::IdleFor { .. } => "idle_for",
            Self::AdvanceTo { .. } => "advance_to",
            Self::RunOneTask { .. } => "run_one_task",
            Self::RunToNextTask { .. } => "run_to_next_task",
            Self::RunToEnd { .. } => "run_to_end",
            Self::Quit { .. } => "quit",
            Self::Reset { .. } => "reset",
            Self::ResetAll => "reset_all",
            Self::SetAlarm { .. } => "set_alarm",
            Self::CancelAlarm { .. } => "cancel_alarm",
            Self::ExpectRan { .. } => "expect_ran",
        }
    }
}

/// A labelled task that ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedTask {
    pub label: String,
    pub looper: String,
    pub time_ms: u64,
}

/// What a step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: String,
    pub looper: String,
    /// Looper time after the step.
    pub time_ms: u64,
    /// For drive steps: whether any task ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ran: Option<bool>,
    /// For post steps: whether the looper accepted the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    /// For remove/cancel steps: how many entries went away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub scenario: String,
    pub executed: Vec<ExecutedTask>,
    pub steps: Vec<StepOutcome>,
}

impl Transcript {
    /// Executed labels in order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.executed.iter().map(|task| task.label.as_str()).collect()
    }
}

type ExecutionLog = Rc<RefCell<Vec<ExecutedTask>>>;

/// Runs scenario steps against one registry.
pub struct ScenarioRunner {
    registry: SchedulerRegistry,
    alarms: AlarmSimulator,
    loopers: BTreeMap<String, Looper>,
    executed: ExecutionLog,
    cursor: usize,
}

#[derive(Default)]
struct Effect {
    ran: Option<bool>,
    accepted: Option<bool>,
    removed: Option<usize>,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let registry = SchedulerRegistry::new(config);
        let alarms = AlarmSimulator::for_registry(&registry);
        let executed: ExecutionLog = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&executed);
        let main = registry.main_looper();
        alarms.set_broadcast_sink(move |intent: &PendingIntent| {
            log.borrow_mut().push(ExecutedTask {
                label: intent.action.clone(),
                looper: main.name().to_string(),
                time_ms: main.current_time(),
            });
        });

        let mut loopers = BTreeMap::new();
        let main = registry.main_looper();
        loopers.insert(main.name().to_string(), main);

        Self {
            registry,
            alarms,
            loopers,
            executed,
            cursor: 0,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &SchedulerRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn alarms(&self) -> &AlarmSimulator {
        &self.alarms
    }

    /// Run `scenario` from a fresh registry.
    pub fn run(scenario: &Scenario, base: SimConfig) -> Result<Transcript> {
        let config = scenario.config.clone().unwrap_or(base);
        let mut runner = Self::new(config);
        tracing::debug!(
            event = "scenario.start",
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "Running scenario"
        );

        let mut outcomes = Vec::with_capacity(scenario.steps.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            let outcome = runner.apply(index, step).map_err(|err| match err {
                Error::Expectation(message) => {
                    Error::expectation(format!("step {index} ({}): {message}", step.op()))
                }
                other => other,
            })?;
            outcomes.push(outcome);
        }

        let transcript = Transcript {
            scenario: scenario.name.clone(),
            executed: runner.executed.borrow().clone(),
            steps: outcomes,
        };
        tracing::debug!(
            event = "scenario.finish",
            scenario = %scenario.name,
            executed = transcript.executed.len(),
            "Scenario finished"
        );
        Ok(transcript)
    }

    fn looper(&self, name: Option<&str>) -> Result<Looper> {
        let name = name.unwrap_or(MAIN_LOOPER_NAME);
        self.loopers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("unknown looper {name:?}")))
    }

    fn labelled(&self, looper: &Looper, label: &str) -> impl FnOnce() + 'static {
        let log = Rc::clone(&self.executed);
        let looper = looper.clone();
        let label = label.to_string();
        move || {
            log.borrow_mut().push(ExecutedTask {
                label,
                looper: looper.name().to_string(),
                time_ms: looper.current_time(),
            });
        }
    }

    /// Apply one step.
    pub fn apply(&mut self, index: usize, step: &Step) -> Result<StepOutcome> {
        tracing::trace!(event = "scenario.step", index, op = step.op(), "Applying step");
        let (looper, effect) = match step {
            Step::PrepareLooper { looper } => {
                if self.loopers.contains_key(looper) {
                    return Err(Error::invalid_argument(format!(
                        "looper {looper:?} already exists"
                    )));
                }
                let prepared = self.registry.prepare_looper(looper.clone());
                self.loopers.insert(looper.clone(), prepared.clone());
                (prepared, Effect::default())
            }
            Step::Post {
                label,
                looper,
                delay_ms,
                key,
                replace,
            } => {
                let looper = self.looper(looper.as_deref())?;
                let key = TaskKey::named(key.clone().unwrap_or_else(|| label.clone()));
                let mut task = PendingTask::new(self.labelled(&looper, label))
                    .delayed(*delay_ms)
                    .keyed(key);
                if *replace {
                    task = task.replacing();
                }
                let accepted = looper.enqueue(task)?.is_some();
                (looper, Effect { accepted: Some(accepted), ..Effect::default() })
            }
            Step::PostAtFront { label, looper } => {
                let looper = self.looper(looper.as_deref())?;
                let task = PendingTask::new(self.labelled(&looper, label))
                    .at_front()
                    .keyed(TaskKey::named(label.clone()));
                let accepted = looper.enqueue(task)?.is_some();
                (looper, Effect { accepted: Some(accepted), ..Effect::default() })
            }
            Step::Remove { key, looper } => {
                let looper = self.looper(looper.as_deref())?;
                let removed = looper.scheduler().remove(&TaskKey::named(key.clone()));
                (looper, Effect { removed: Some(removed), ..Effect::default() })
            }
            Step::Pause { looper } => {
                let looper = self.looper(looper.as_deref())?;
                looper.pause();
                (looper, Effect::default())
            }
            Step::Unpause { looper } => {
                let looper = self.looper(looper.as_deref())?;
                looper.unpause();
                (looper, Effect::default())
            }
            Step::Idle { looper } => self.drive(looper.as_deref(), Looper::idle)?,
            Step::IdleFor { duration_ms, looper } => {
                self.drive(looper.as_deref(), |l| l.idle_for(*duration_ms))?
            }
            Step::AdvanceTo { time_ms, looper } => {
                self.drive(looper.as_deref(), |l| l.scheduler().advance_to(*time_ms))?
            }
            Step::RunOneTask { looper } => self.drive(looper.as_deref(), Looper::run_one_task)?,
            Step::RunToNextTask { looper } => {
                self.drive(looper.as_deref(), Looper::run_to_next_task)?
            }
            Step::RunToEnd { looper } => {
                self.drive(looper.as_deref(), Looper::run_to_end_of_tasks)?
            }
            Step::Quit { looper } => {
                let looper = self.looper(Some(looper))?;
                looper.quit()?;
                (looper, Effect::default())
            }
            Step::Reset { looper } => {
                let looper = self.looper(looper.as_deref())?;
                if looper.is_main() {
                    self.alarms.reset();
                }
                looper.reset()?;
                (looper, Effect::default())
            }
            Step::ResetAll => {
                self.alarms.reset();
                self.registry.reset_all()?;
                (self.registry.main_looper(), Effect::default())
            }
            Step::SetAlarm {
                label,
                alarm_type,
                trigger_at_ms,
                delay_ms,
                interval_ms,
            } => {
                let now = if alarm_type.is_rtc() {
                    self.alarms.current_time_millis()
                } else {
                    self.alarms.elapsed_realtime()
                };
                let trigger = trigger_at_ms.unwrap_or_else(|| now.saturating_add(*delay_ms));
                let operation = PendingIntent::broadcast(label.clone());
                if *interval_ms == 0 {
                    self.alarms.set_exact(*alarm_type, trigger, operation)?;
                } else {
                    self.alarms
                        .set_repeating(*alarm_type, trigger, *interval_ms, operation)?;
                }
                (self.alarms.looper().clone(), Effect::default())
            }
            Step::CancelAlarm { label } => {
                let removed = self.alarms.cancel(&PendingIntent::broadcast(label.clone()));
                (
                    self.alarms.looper().clone(),
                    Effect { removed: Some(removed), ..Effect::default() },
                )
            }
            Step::ExpectRan { labels } => {
                let actual: Vec<String> = self.executed.borrow()[self.cursor..]
                    .iter()
                    .map(|task| task.label.clone())
                    .collect();
                if &actual != labels {
                    return Err(Error::expectation(format!(
                        "expected {labels:?} to have run, got {actual:?}"
                    )));
                }
                self.cursor += actual.len();
                (self.registry.main_looper(), Effect::default())
            }
        };

        Ok(StepOutcome {
            index,
            op: step.op().to_string(),
            looper: looper.name().to_string(),
            time_ms: looper.current_time(),
            ran: effect.ran,
            accepted: effect.accepted,
            removed: effect.removed,
        })
    }

    fn drive(&self, name: Option<&str>, f: impl FnOnce(&Looper) -> bool) -> Result<(Looper, Effect)> {
        let looper = self.looper(name)?;
        let ran = f(&looper);
        Ok((
            looper,
            Effect {
                ran: Some(ran),
                ..Effect::default()
            },
        ))
    }
}

impl std::fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("registry", &self.registry)
            .field("loopers", &self.loopers.keys().collect::<Vec<_>>())
            .field("executed", &self.executed.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(json: &str) -> Result<Transcript> {
        let scenario = Scenario::from_json_str(json)?;
        ScenarioRunner::run(&scenario, SimConfig::default())
    }

    #[test]
    fn step_wire_names_match_serde_tags() {
        let steps = vec![
            Step::ResetAll,
            Step::IdleFor {
                duration_ms: 5,
                looper: None,
            },
            Step::PostAtFront {
                label: "x".into(),
                looper: None,
            },
        ];
        for step in steps {
            let value = serde_json::to_value(&step).unwrap();
            assert_eq!(value["op"], step.op());
        }
    }

    #[test]
    fn delayed_post_runs_at_its_time() {
        let transcript = run(
            r#"{
              "name": "delayed",
              "steps": [
                { "op": "post", "label": "a", "delay_ms": 2000 },
                { "op": "idle_for", "duration_ms": 1999 },
                { "op": "expect_ran", "labels": [] },
                { "op": "idle_for", "duration_ms": 1 },
                { "op": "expect_ran", "labels": ["a"] }
              ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            transcript.executed,
            vec![ExecutedTask {
                label: "a".into(),
                looper: "main".into(),
                time_ms: 2100,
            }]
        );
        assert_eq!(transcript.steps[1].ran, Some(false));
        assert_eq!(transcript.steps[3].ran, Some(true));
    }

    #[test]
    fn failed_expectation_names_the_step() {
        let err = run(
            r#"{
              "name": "bad",
              "steps": [
                { "op": "post", "label": "a" },
                { "op": "expect_ran", "labels": ["b"] }
              ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Expectation(_)));
        assert!(err.to_string().contains("step 1 (expect_ran)"));
    }

    #[test]
    fn unknown_looper_is_rejected() {
        let err = run(r#"{ "name": "x", "steps": [ { "op": "idle", "looper": "nope" } ] }"#)
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Scenario::from_json_str(
            r#"{ "name": "x", "steps": [ { "op": "idle", "duration": 3 } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn quit_looper_drops_posts() {
        let transcript = run(
            r#"{
              "name": "quit",
              "steps": [
                { "op": "prepare_looper", "looper": "worker" },
                { "op": "quit", "looper": "worker" },
                { "op": "post", "label": "late", "looper": "worker" },
                { "op": "run_to_end", "looper": "worker" }
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(transcript.steps[2].accepted, Some(false));
        assert!(transcript.executed.is_empty());
    }

    #[test]
    fn repeating_alarm_cadence() {
        let transcript = run(
            r#"{
              "name": "alarm",
              "steps": [
                { "op": "set_alarm", "label": "tick", "delay_ms": 10, "interval_ms": 20 },
                { "op": "idle_for", "duration_ms": 10 },
                { "op": "idle_for", "duration_ms": 20 },
                { "op": "cancel_alarm", "label": "tick" },
                { "op": "idle_for", "duration_ms": 100 }
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(transcript.labels(), vec!["tick", "tick"]);
        assert_eq!(transcript.steps[3].removed, Some(1));
    }
}
