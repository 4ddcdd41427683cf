use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Read-only view of a job's service-level attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSlaSnapshot {
    pub job_id: String,
    pub priority: i32,
    pub max_nodes: u32,
    pub suspended: bool,
    /// Named admission policy; the engine default applies when `None`.
    pub admission_policy: Option<String>,
}

impl JobSlaSnapshot {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            priority: 0,
            max_nodes: u32::MAX,
            suspended: false,
            admission_policy: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: u32) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn with_policy(mut self, name: impl Into<String>) -> Self {
        self.admission_policy = Some(name.into());
        self
    }
}

/// Number of nodes currently executing part of one job.
#[derive(Debug, Default)]
pub struct DispatchCounter(AtomicU32);

impl DispatchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saturates at `u32::MAX`. Returns the new count.
    pub fn increment(&self) -> u32 {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
        {
            Ok(previous) => previous + 1,
            Err(_) => u32::MAX,
        }
    }

    /// Saturates at zero. Returns the new count.
    pub fn decrement(&self) -> u32 {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Dispatch counters keyed by job id.
#[derive(Debug, Default)]
pub struct DispatchTracker {
    counters: RwLock<HashMap<String, Arc<DispatchCounter>>>,
}

impl DispatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, job_id: &str) -> Arc<DispatchCounter> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
        {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(counters.entry(job_id.to_string()).or_default())
    }

    pub fn current(&self, job_id: &str) -> u32 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map_or(0, |c| c.current())
    }

    /// Drops a finished job's counter.
    pub fn remove(&self, job_id: &str) -> Option<u32> {
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id)
            .map(|c| c.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sla_defaults_are_unrestricted() {
        let sla = JobSlaSnapshot::new("job-1");
        assert_eq!(sla.priority, 0);
        assert_eq!(sla.max_nodes, u32::MAX);
        assert!(!sla.suspended);
        assert!(sla.admission_policy.is_none());

        let sla = sla.with_priority(7).with_max_nodes(3).with_policy("max-nodes");
        assert_eq!(sla.admission_policy.as_deref(), Some("max-nodes"));
    }

    #[test]
    fn counter_saturates_at_zero() {
        let counter = DispatchCounter::new();
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.current(), 1);
    }

    #[test]
    fn counter_saturates_at_max() {
        let counter = DispatchCounter(AtomicU32::new(u32::MAX - 1));
        assert_eq!(counter.increment(), u32::MAX);
        assert_eq!(counter.increment(), u32::MAX);
        assert_eq!(counter.current(), u32::MAX);
        assert_eq!(counter.decrement(), u32::MAX - 1);
    }

    #[test]
    fn tracker_shares_counters_across_threads() {
        let tracker = Arc::new(DispatchTracker::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.counter("job-1").increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert_eq!(tracker.current("job-1"), 400);
        assert_eq!(tracker.current("job-2"), 0);
        assert_eq!(tracker.remove("job-1"), Some(400));
        assert_eq!(tracker.current("job-1"), 0);
    }
}
