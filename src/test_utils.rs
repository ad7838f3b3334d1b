use std::cell::RefCell;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use crate::report::Incident;
use crate::scheduler::Scheduler;
use crate::task::Task;

/// Ordered log of what the code under test did.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Rc<RefCell<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    /// Task that records `entry` when it runs.
    pub fn task(&self, entry: &'static str) -> Task {
        let journal = self.clone();
        Task::new(move || journal.record(entry))
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }
}

/// Scheduler whose incidents are collected instead of logged.
pub fn collecting_scheduler() -> (Scheduler, Rc<RefCell<Vec<Incident>>>) {
    init_tracing();
    let incidents = Rc::new(RefCell::new(Vec::new()));
    let sink = incidents.clone();
    let scheduler = Scheduler::builder()
        .reporter(move |incident: &Incident| sink.borrow_mut().push(incident.clone()))
        .build();
    (scheduler, incidents)
}

/// Honors `RUST_LOG` when running tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
