#![allow(dead_code)]

use std::sync::Arc;
use tollgate::{InMemoryCounterStore, ManualClock, SharedStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// A store and the clock it evaluates TTLs against.
pub struct Harness {
    pub clock: ManualClock,
    pub store: InMemoryCounterStore,
}

impl Harness {
    pub fn at_secs(secs: u64) -> Self {
        let clock = ManualClock::at_secs(secs);
        let store = InMemoryCounterStore::with_clock(clock.clone());
        Self { clock, store }
    }

    pub fn shared(&self) -> SharedStore {
        Arc::new(self.store.clone())
    }
}
