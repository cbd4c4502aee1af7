//! Shared helpers for the integration tests.
//!
//! - Tracing setup that routes events through the test writer
//! - A label recorder for asserting execution order

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::OnceLock;

/// Install a tracing subscriber once per test binary.
///
/// Set `RUST_LOG=looper_sim=trace` to see per-task events for a failing test.
#[allow(dead_code)]
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Records labels in execution order.
#[allow(dead_code)]
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    labels: Rc<RefCell<Vec<String>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A one-shot task that records `label` when run.
    pub fn task(&self, label: impl Into<String>) -> impl FnOnce() + 'static {
        let labels = Rc::clone(&self.labels);
        let label = label.into();
        move || labels.borrow_mut().push(label)
    }

    /// A reusable callback that records `label` each time it runs.
    pub fn callback(&self, label: impl Into<String>) -> impl Fn() + 'static {
        let labels = Rc::clone(&self.labels);
        let label = label.into();
        move || labels.borrow_mut().push(label.clone())
    }

    pub fn push(&self, label: impl Into<String>) {
        self.labels.borrow_mut().push(label.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.labels.borrow().clone()
    }

    /// Labels recorded so far, clearing the log.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.labels.borrow_mut())
    }

    pub fn count(&self, label: &str) -> usize {
        self.labels.borrow().iter().filter(|l| *l == label).count()
    }
}
