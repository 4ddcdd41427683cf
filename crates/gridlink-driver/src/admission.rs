//! Dispatch admission: may a job receive one more dispatch right now?
//!
//! Policies are pure functions of live statistics, the job's SLA snapshot
//! and the job's current dispatch count. They are looked up by name so a
//! job can carry its own policy choice.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gridlink_core::GridError;
use tracing::trace;

use crate::sla::JobSlaSnapshot;
use crate::stats::{GridStatistics, StatisticsView, NODES};

pub const PRIORITY_SHARE: &str = "priority-share";
pub const MAX_NODES: &str = "max-nodes";
pub const NOT_SUSPENDED: &str = "not-suspended";
pub const STANDARD: &str = "standard";

pub trait AdmissionPolicy: Send + Sync {
    fn accepts(
        &self,
        stats: &dyn StatisticsView,
        sla: &JobSlaSnapshot,
        current_dispatch_count: u32,
    ) -> Result<bool, GridError>;
}

/// Fraction of the grid a job of priority `prio` may occupy.
///
/// `<= 1` (negatives included) maps to 0.1, `>= 9` to 0.9, anything in
/// between to `prio / 10`.
pub fn max_share_for_priority(prio: i32) -> f64 {
    if prio <= 1 {
        0.1
    } else if prio >= 9 {
        0.9
    } else {
        f64::from(prio) / 10.0
    }
}

/// Strict comparison: a count equal to the share rejects, and so does an
/// empty grid.
pub fn priority_share_accepts(total_nodes: f64, prio: i32, current_dispatch_count: u32) -> bool {
    f64::from(current_dispatch_count) < total_nodes * max_share_for_priority(prio)
}

/// Caps each job's concurrent dispatches to a priority-dependent share of
/// the connected nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityShareAdmission;

impl AdmissionPolicy for PriorityShareAdmission {
    fn accepts(
        &self,
        stats: &dyn StatisticsView,
        sla: &JobSlaSnapshot,
        current_dispatch_count: u32,
    ) -> Result<bool, GridError> {
        let total_nodes = stats
            .latest(NODES)
            .ok_or_else(|| GridError::configuration(format!("no '{NODES}' statistic available")))?;
        Ok(priority_share_accepts(
            total_nodes,
            sla.priority,
            current_dispatch_count,
        ))
    }
}

/// Honors the SLA's `max_nodes` cap.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaxNodesAdmission;

impl AdmissionPolicy for MaxNodesAdmission {
    fn accepts(
        &self,
        _stats: &dyn StatisticsView,
        sla: &JobSlaSnapshot,
        current_dispatch_count: u32,
    ) -> Result<bool, GridError> {
        Ok(current_dispatch_count < sla.max_nodes)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NotSuspendedAdmission;

impl AdmissionPolicy for NotSuspendedAdmission {
    fn accepts(
        &self,
        _stats: &dyn StatisticsView,
        sla: &JobSlaSnapshot,
        _current_dispatch_count: u32,
    ) -> Result<bool, GridError> {
        Ok(!sla.suspended)
    }
}

/// Accepts only when every inner policy accepts. Stops at the first reject.
pub struct AllOf {
    policies: Vec<Arc<dyn AdmissionPolicy>>,
}

impl AllOf {
    pub fn new(policies: Vec<Arc<dyn AdmissionPolicy>>) -> Self {
        Self { policies }
    }
}

impl AdmissionPolicy for AllOf {
    fn accepts(
        &self,
        stats: &dyn StatisticsView,
        sla: &JobSlaSnapshot,
        current_dispatch_count: u32,
    ) -> Result<bool, GridError> {
        for policy in &self.policies {
            if !policy.accepts(stats, sla, current_dispatch_count)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Not suspended, under `max_nodes`, within its priority share.
pub fn standard_policy() -> AllOf {
    AllOf::new(vec![
        Arc::new(NotSuspendedAdmission),
        Arc::new(MaxNodesAdmission),
        Arc::new(PriorityShareAdmission),
    ])
}

#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Arc<dyn AdmissionPolicy>>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(PRIORITY_SHARE, Arc::new(PriorityShareAdmission));
        registry.register(MAX_NODES, Arc::new(MaxNodesAdmission));
        registry.register(NOT_SUSPENDED, Arc::new(NotSuspendedAdmission));
        registry.register(STANDARD, Arc::new(standard_policy()));
        registry
    }

    /// Replaces any policy already registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, policy: Arc<dyn AdmissionPolicy>) {
        self.policies.insert(name.into(), policy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AdmissionPolicy>> {
        self.policies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }
}

/// Resolves a job's policy by name and evaluates it against live statistics.
pub struct AdmissionEngine {
    stats: Arc<GridStatistics>,
    policies: PolicyRegistry,
    default_policy: String,
}

impl fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("policies", &self.policies)
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

impl AdmissionEngine {
    /// Fails when `default_policy` is not registered.
    pub fn new(
        stats: Arc<GridStatistics>,
        policies: PolicyRegistry,
        default_policy: impl Into<String>,
    ) -> Result<Self, GridError> {
        let default_policy = default_policy.into();
        if !policies.contains(&default_policy) {
            return Err(unknown_policy(&default_policy));
        }
        Ok(Self {
            stats,
            policies,
            default_policy,
        })
    }

    pub fn default_policy(&self) -> &str {
        &self.default_policy
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn accepts(&self, sla: &JobSlaSnapshot, current_dispatch_count: u32) -> Result<bool, GridError> {
        let name = sla
            .admission_policy
            .as_deref()
            .unwrap_or(&self.default_policy);
        let policy = self.policies.get(name).ok_or_else(|| unknown_policy(name))?;
        let accepted = policy.accepts(self.stats.as_ref(), sla, current_dispatch_count)?;
        trace!(
            "admission job={} policy={} prio={} count={} accepted={}",
            sla.job_id,
            name,
            sla.priority,
            current_dispatch_count,
            accepted
        );
        Ok(accepted)
    }
}

fn unknown_policy(name: &str) -> GridError {
    GridError::configuration(format!("unknown admission policy '{name}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    fn nodes(total: f64) -> HashMap<String, f64> {
        HashMap::from([(NODES.to_string(), total)])
    }

    fn sla(prio: i32) -> JobSlaSnapshot {
        JobSlaSnapshot::new("job").with_priority(prio)
    }

    #[test]
    fn share_buckets() {
        for prio in [-5, 0, 1] {
            assert_eq!(max_share_for_priority(prio), 0.1);
        }
        for prio in [9, 10, 42, i32::MAX] {
            assert_eq!(max_share_for_priority(prio), 0.9);
        }
        for prio in 2..9 {
            assert_eq!(max_share_for_priority(prio), f64::from(prio) / 10.0);
        }
    }

    #[test]
    fn worked_examples() {
        let policy = PriorityShareAdmission;
        let cases = [
            (0, 100.0, 9, true),
            (0, 100.0, 10, false),
            (9, 10.0, 8, true),
            (9, 10.0, 9, false),
            (5, 20.0, 9, true),
            (5, 20.0, 10, false),
        ];
        for (prio, total, count, expected) in cases {
            assert_eq!(
                policy.accepts(&nodes(total), &sla(prio), count).expect("nodes present"),
                expected,
                "prio={prio} total={total} count={count}"
            );
        }
    }

    #[test]
    fn empty_grid_always_rejects() {
        for prio in [-1, 0, 5, 9, 100] {
            for count in [0, 1, 50] {
                assert!(!priority_share_accepts(0.0, prio, count));
            }
        }
    }

    #[test]
    fn monotonic_in_total_nodes() {
        for prio in -2..12 {
            for count in 0..30 {
                let mut accepted_before = false;
                for total in 0..200 {
                    let accepted = priority_share_accepts(f64::from(total), prio, count);
                    assert!(
                        accepted || !accepted_before,
                        "prio={prio} count={count} total={total} flipped to reject"
                    );
                    accepted_before = accepted;
                }
            }
        }
    }

    #[test]
    fn missing_nodes_statistic_is_a_configuration_error() {
        let empty = HashMap::<String, f64>::new();
        let err = PriorityShareAdmission
            .accepts(&empty, &sla(5), 0)
            .expect_err("no nodes statistic");
        assert!(matches!(err, GridError::Configuration(_)));
    }

    #[test]
    fn standard_policy_combines_sla_checks() {
        let policy = standard_policy();
        let stats = nodes(100.0);
        assert!(policy.accepts(&stats, &sla(9), 5).expect("accepts"));
        assert!(!policy
            .accepts(&stats, &sla(9).suspended(true), 0)
            .expect("suspended"));
        assert!(!policy
            .accepts(&stats, &sla(9).with_max_nodes(5), 5)
            .expect("capped"));
        assert!(!policy.accepts(&stats, &sla(0), 10).expect("share"));
    }

    #[test]
    fn engine_resolves_named_policies() {
        let stats = Arc::new(GridStatistics::with_topology_gauges());
        stats.set_value(NODES, 20.0);
        let engine = AdmissionEngine::new(Arc::clone(&stats), PolicyRegistry::with_builtin(), PRIORITY_SHARE)
            .expect("engine");

        assert!(engine.accepts(&sla(5), 9).expect("default policy"));
        assert!(!engine.accepts(&sla(5), 10).expect("default policy"));
        assert!(engine
            .accepts(&sla(5).with_policy(MAX_NODES), 10)
            .expect("max-nodes"));

        let err = engine
            .accepts(&sla(5).with_policy("scripted"), 0)
            .expect_err("unknown policy");
        assert!(matches!(err, GridError::Configuration(_)));
    }

    #[test]
    fn engine_rejects_unknown_default() {
        let stats = Arc::new(GridStatistics::new());
        let err = AdmissionEngine::new(stats, PolicyRegistry::with_builtin(), "nope")
            .expect_err("unknown default");
        assert!(err.to_string().contains("nope"));
    }

    struct EvenCountsOnly;

    impl AdmissionPolicy for EvenCountsOnly {
        fn accepts(
            &self,
            _stats: &dyn StatisticsView,
            _sla: &JobSlaSnapshot,
            current_dispatch_count: u32,
        ) -> Result<bool, GridError> {
            Ok(current_dispatch_count % 2 == 0)
        }
    }

    #[test]
    fn custom_policies_can_be_registered() {
        let mut policies = PolicyRegistry::with_builtin();
        policies.register("even", Arc::new(EvenCountsOnly));
        let engine = AdmissionEngine::new(Arc::new(GridStatistics::new()), policies, "even")
            .expect("engine");
        assert!(engine.accepts(&sla(0), 2).expect("even"));
        assert!(!engine.accepts(&sla(0), 3).expect("odd"));
    }

    #[test]
    fn engine_is_shareable_across_threads() {
        let stats = Arc::new(GridStatistics::with_topology_gauges());
        stats.set_value(NODES, 10.0);
        let engine = Arc::new(
            AdmissionEngine::new(stats, PolicyRegistry::with_builtin(), STANDARD).expect("engine"),
        );
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.accepts(&sla(9), i).expect("accepts"))
            })
            .collect();
        let accepted: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().expect("worker thread"))
            .collect();
        assert_eq!(accepted, vec![true; 8]);
    }
}
