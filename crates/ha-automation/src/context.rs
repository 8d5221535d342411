//! Execution contexts
//!
//! One [`ExecutionContext`] exists per rule run. It carries the run's
//! variables, a label stack, a trace of evaluated steps with per-phase
//! metrics, and a cancellation token derived from the caller's token.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Variables;

/// Which phase of a run a trace entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracePhase {
    Trigger,
    Condition,
    Action,
}

impl TracePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TracePhase::Trigger => "trigger",
            TracePhase::Condition => "condition",
            TracePhase::Action => "action",
        }
    }
}

impl fmt::Display for TracePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluated step
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub phase: TracePhase,

    pub id: String,
    pub name: String,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration: Duration,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl TraceEntry {
    pub fn new(
        phase: TracePhase,
        id: impl Into<String>,
        name: impl Into<String>,
        success: bool,
        duration: Duration,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            id: id.into(),
            name: name.into(),
            success,
            error: None,
            duration,
            data: Map::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// Per-phase counters and cumulative durations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub triggers_evaluated: usize,
    pub conditions_evaluated: usize,
    pub actions_executed: usize,
    pub trigger_duration: Duration,
    pub condition_duration: Duration,
    pub action_duration: Duration,

    /// Time since the context was created, filled in on read
    pub total_duration: Duration,
}

/// Point-in-time description of a context
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub id: String,
    pub rule_id: String,
    pub trigger_id: String,
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub variables_count: usize,
    pub stack_depth: usize,
    pub metrics: ExecutionMetrics,
}

#[derive(Debug, Default)]
struct ContextState {
    variables: Variables,
    stack: Vec<String>,
    trace: Vec<TraceEntry>,
    metrics: ExecutionMetrics,
}

/// State of a single rule run
#[derive(Debug)]
pub struct ExecutionContext {
    id: String,
    rule_id: String,
    trigger_id: String,
    start_time: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    state: RwLock<ContextState>,
}

impl ExecutionContext {
    /// Create a context whose token is a child of `parent`
    pub fn new(
        parent: &CancellationToken,
        rule_id: impl Into<String>,
        trigger_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.into(),
            trigger_id: trigger_id.into(),
            start_time: Utc::now(),
            started: Instant::now(),
            cancel: parent.child_token(),
            state: RwLock::new(ContextState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn trigger_id(&self) -> &str {
        &self.trigger_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Token cancelled with this context
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // Poisoning is ignored
    fn read(&self) -> RwLockReadGuard<'_, ContextState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContextState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.write().variables.insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<Value> {
        self.read().variables.get(key).cloned()
    }

    /// Copy of all variables
    pub fn variables(&self) -> Variables {
        self.read().variables.clone()
    }

    pub fn extend_variables(&self, variables: impl IntoIterator<Item = (String, Value)>) {
        self.write().variables.extend(variables);
    }

    pub fn push_stack(&self, label: impl Into<String>) {
        self.write().stack.push(label.into());
    }

    pub fn pop_stack(&self) -> Option<String> {
        self.write().stack.pop()
    }

    pub fn stack(&self) -> Vec<String> {
        self.read().stack.clone()
    }

    /// Append a trace entry and update the phase counters
    pub fn add_trace(&self, entry: TraceEntry) {
        let (phase, duration) = (entry.phase, entry.duration);
        let mut state = self.write();
        match phase {
            TracePhase::Trigger => {
                state.metrics.triggers_evaluated += 1;
                state.metrics.trigger_duration += duration;
            }
            TracePhase::Condition => {
                state.metrics.conditions_evaluated += 1;
                state.metrics.condition_duration += duration;
            }
            TracePhase::Action => {
                state.metrics.actions_executed += 1;
                state.metrics.action_duration += duration;
            }
        }
        state.trace.push(entry);
    }

    pub fn trace(&self) -> Vec<TraceEntry> {
        self.read().trace.clone()
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        let mut metrics = self.read().metrics.clone();
        metrics.total_duration = self.elapsed();
        metrics
    }

    pub fn summary(&self) -> ContextSummary {
        let state = self.read();
        let successful_steps = state.trace.iter().filter(|t| t.success).count();
        let mut metrics = state.metrics.clone();
        metrics.total_duration = self.elapsed();

        ContextSummary {
            id: self.id.clone(),
            rule_id: self.rule_id.clone(),
            trigger_id: self.trigger_id.clone(),
            start_time: self.start_time,
            duration: metrics.total_duration,
            total_steps: state.trace.len(),
            successful_steps,
            failed_steps: state.trace.len() - successful_steps,
            variables_count: state.variables.len(),
            stack_depth: state.stack.len(),
            metrics,
        }
    }

    /// Log every trace entry at info level
    pub fn log_trace(&self) {
        let state = self.read();
        info!(
            execution_id = %self.id,
            rule_id = %self.rule_id,
            trigger_id = %self.trigger_id,
            steps = state.trace.len(),
            "Execution trace"
        );
        for (i, entry) in state.trace.iter().enumerate() {
            info!(
                execution_id = %self.id,
                step = i + 1,
                phase = %entry.phase,
                id = %entry.id,
                name = %entry.name,
                success = entry.success,
                duration = ?entry.duration,
                error = entry.error.as_deref().unwrap_or(""),
                "Trace entry"
            );
        }
    }
}

/// Context counts grouped by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextStatusCounts {
    pub active: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextStatistics {
    pub total_contexts: usize,
    pub by_rule: HashMap<String, usize>,
    pub by_status: ContextStatusCounts,
}

/// Index of live execution contexts, by execution id and by owning rule
#[derive(Debug, Default)]
pub struct ExecutionContextManager {
    contexts: DashMap<String, Arc<ExecutionContext>>,
    by_rule: DashMap<String, HashSet<String>>,
}

impl ExecutionContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a context under `parent`
    pub fn create_context(
        &self,
        parent: &CancellationToken,
        rule_id: &str,
        trigger_id: &str,
    ) -> Arc<ExecutionContext> {
        let context = Arc::new(ExecutionContext::new(parent, rule_id, trigger_id));
        let id = context.id().to_string();
        self.contexts.insert(id.clone(), Arc::clone(&context));
        self.by_rule
            .entry(rule_id.to_string())
            .or_default()
            .insert(id);
        debug!(
            execution_id = %context.id(),
            rule_id = %rule_id,
            trigger_id = %trigger_id,
            "Created execution context"
        );
        context
    }

    pub fn context(&self, id: &str) -> Option<Arc<ExecutionContext>> {
        self.contexts.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Remove and cancel a context
    pub fn remove_context(&self, id: &str) {
        if let Some((_, context)) = self.contexts.remove(id) {
            context.cancel();
            self.unindex(context.rule_id(), id);
            debug!(execution_id = %id, "Removed execution context");
        }
    }

    fn unindex(&self, rule_id: &str, id: &str) {
        if let Some(mut ids) = self.by_rule.get_mut(rule_id) {
            ids.remove(id);
        }
        self.by_rule.remove_if(rule_id, |_, ids| ids.is_empty());
    }

    /// Contexts that are not cancelled
    pub fn active_contexts(&self) -> Vec<Arc<ExecutionContext>> {
        self.contexts
            .iter()
            .filter(|c| !c.is_cancelled())
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn contexts_for_rule(&self, rule_id: &str) -> Vec<Arc<ExecutionContext>> {
        let ids: Vec<String> = match self.by_rule.get(rule_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.context(id)).collect()
    }

    /// Cancel every context of a rule; returns how many were cancelled
    pub fn cancel_contexts_for_rule(&self, rule_id: &str) -> usize {
        let contexts = self.contexts_for_rule(rule_id);
        for context in &contexts {
            context.cancel();
        }
        if !contexts.is_empty() {
            debug!(rule_id = %rule_id, cancelled = contexts.len(), "Cancelled execution contexts");
        }
        contexts.len()
    }

    /// Drop contexts older than `max_age` or already cancelled
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let mut removed = Vec::new();
        self.contexts.retain(|id, context| {
            let expired = context.elapsed() > max_age || context.is_cancelled();
            if expired {
                context.cancel();
                removed.push((context.rule_id().to_string(), id.clone()));
            }
            !expired
        });
        for (rule_id, id) in &removed {
            self.unindex(rule_id, id);
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Cleaned up expired execution contexts");
        }
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn statistics(&self) -> ContextStatistics {
        let mut stats = ContextStatistics {
            total_contexts: self.contexts.len(),
            ..Default::default()
        };
        stats.by_rule = self
            .by_rule
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        for context in self.contexts.iter() {
            if context.is_cancelled() {
                stats.by_status.cancelled += 1;
            } else {
                stats.by_status.active += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variables_and_stack() {
        let root = CancellationToken::new();
        let context = ExecutionContext::new(&root, "rule_1", "t1");

        context.set_variable("a", json!(1));
        context.extend_variables([("b".to_string(), json!("two"))]);
        assert_eq!(context.variable("a"), Some(json!(1)));
        assert_eq!(context.variables().len(), 2);
        assert_eq!(context.variable("missing"), None);

        context.push_stack("condition");
        context.push_stack("condition_0");
        assert_eq!(context.stack(), vec!["condition", "condition_0"]);
        assert_eq!(context.pop_stack().as_deref(), Some("condition_0"));
        assert_eq!(context.stack().len(), 1);
    }

    #[test]
    fn test_trace_updates_metrics() {
        let context = ExecutionContext::new(&CancellationToken::new(), "rule_1", "t1");
        context.add_trace(TraceEntry::new(
            TracePhase::Condition,
            "c0",
            "condition_0",
            true,
            Duration::from_millis(2),
        ));
        context.add_trace(
            TraceEntry::new(TracePhase::Action, "a0", "action_0", false, Duration::from_millis(5))
                .with_error("boom"),
        );

        let metrics = context.metrics();
        assert_eq!(metrics.conditions_evaluated, 1);
        assert_eq!(metrics.actions_executed, 1);
        assert_eq!(metrics.triggers_evaluated, 0);
        assert_eq!(metrics.action_duration, Duration::from_millis(5));

        let summary = context.summary();
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.successful_steps, 1);
        assert_eq!(summary.failed_steps, 1);

        let trace = context.trace();
        assert_eq!(trace[1].error.as_deref(), Some("boom"));
        assert_eq!(serde_json::to_value(&trace[0]).unwrap()["type"], "condition");
    }

    #[test]
    fn test_cancellation_follows_parent() {
        let root = CancellationToken::new();
        let context = ExecutionContext::new(&root, "rule_1", "t1");
        assert!(!context.is_cancelled());
        root.cancel();
        assert!(context.is_cancelled());

        let other = ExecutionContext::new(&CancellationToken::new(), "rule_1", "t1");
        other.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_manager_lifecycle() {
        let manager = ExecutionContextManager::new();
        let root = CancellationToken::new();

        let a = manager.create_context(&root, "rule_a", "t1");
        let b = manager.create_context(&root, "rule_a", "t2");
        let c = manager.create_context(&root, "rule_b", "t1");
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len(), 3);
        assert!(manager.context(a.id()).is_some());
        assert_eq!(manager.contexts_for_rule("rule_a").len(), 2);

        assert_eq!(manager.cancel_contexts_for_rule("rule_a"), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert_eq!(manager.active_contexts().len(), 1);

        let stats = manager.statistics();
        assert_eq!(stats.total_contexts, 3);
        assert_eq!(stats.by_rule.get("rule_a"), Some(&2));
        assert_eq!(stats.by_status.cancelled, 2);
        assert_eq!(stats.by_status.active, 1);

        manager.remove_context(c.id());
        assert!(c.is_cancelled());
        assert!(manager.context(c.id()).is_none());
    }

    #[test]
    fn test_cleanup_expired() {
        let manager = ExecutionContextManager::new();
        let root = CancellationToken::new();

        let cancelled = manager.create_context(&root, "rule_a", "t1");
        let fresh = manager.create_context(&root, "rule_a", "t2");
        cancelled.cancel();

        assert_eq!(manager.cleanup_expired(Duration::from_secs(60)), 1);
        assert!(manager.context(fresh.id()).is_some());

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.cleanup_expired(Duration::from_millis(1)), 1);
        assert!(fresh.is_cancelled());
        assert!(manager.is_empty());
        assert!(manager.contexts_for_rule("rule_a").is_empty());
        assert!(manager.statistics().by_rule.is_empty());
    }

    #[test]
    fn test_cancel_one_rule_among_many() {
        let manager = ExecutionContextManager::new();
        let root = CancellationToken::new();

        let mut target = Vec::new();
        let mut others = Vec::new();
        for i in 0..20 {
            others.push(manager.create_context(&root, &format!("rule_{}", i), "t1"));
            target.push(manager.create_context(&root, "garage", &format!("t{}", i % 3)));
        }

        assert_eq!(manager.contexts_for_rule("garage").len(), 20);
        assert_eq!(manager.cancel_contexts_for_rule("garage"), 20);
        assert!(target.iter().all(|c| c.is_cancelled()));
        assert!(others.iter().all(|c| !c.is_cancelled()));

        manager.remove_context(target[0].id());
        assert_eq!(manager.contexts_for_rule("garage").len(), 19);
        assert_eq!(manager.cancel_contexts_for_rule("unknown"), 0);

        for context in &target[1..] {
            manager.remove_context(context.id());
        }
        assert!(manager.contexts_for_rule("garage").is_empty());
        assert!(!manager.statistics().by_rule.contains_key("garage"));
        assert_eq!(manager.len(), 20);
    }
}
