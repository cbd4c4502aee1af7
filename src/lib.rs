//! Deterministic virtual-time simulation of looper/handler message passing.
//!
//! Nothing here spawns a thread or reads a real clock. Work is queued on a
//! [`Scheduler`] and only runs when a driver advances or idles it, so test
//! code decides exactly when asynchronous work happens.
//!
//! - [`scheduler`]: the virtual-time task queue.
//! - [`registry`] and [`looper`]: execution contexts and their lifecycle.
//! - [`handler`]: runnables and messages keyed for removal.
//! - [`alarm`]: AlarmManager-style scheduling on top of a looper.
//! - [`scenario`]: JSON-driven scenarios and transcripts.
#![forbid(unsafe_code)]

pub mod alarm;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod key;
pub mod looper;
pub mod registry;
pub mod scenario;
pub mod scheduler;

pub use alarm::{AlarmSimulator, AlarmType, OnAlarmListener, PendingIntent, ScheduledAlarm};
pub use clock::{Clock, RtcClock, VirtualClock};
pub use config::SimConfig;
pub use error::{Error, Result};
pub use handler::{Handler, Message, Runnable};
pub use key::{ContextId, TaskKey, Token};
pub use looper::Looper;
pub use registry::SchedulerRegistry;
pub use scenario::{Scenario, ScenarioRunner, Transcript};
pub use scheduler::{IdleState, PendingTask, Scheduler, TaskHandle};
