//! Automation execution engine
//!
//! The [`AutomationEngine`] owns the rule registry and drives the
//! trigger → condition → action pipeline:
//!
//! - Incoming events are matched against every trigger of every enabled rule
//!   ([`AutomationEngine::handle_event`]). Matches become execution requests
//!   on a bounded queue.
//! - Time triggers are registered with the [`Scheduler`], which invokes the
//!   rule's trigger handler directly. The handler enqueues a request too.
//! - A fixed pool of workers pulls requests, creates an
//!   [`ExecutionContext`] and runs the rule under the execution timeout.
//!
//! Per-rule concurrency is advisory ([`Rule::can_execute`]).

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use ha_core::{events, Event, EventPayload};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::action::{
    ActionEnv, LoggingNotificationSink, LoggingServiceCaller, NotificationSink, ServiceCaller,
};
use crate::context::{ExecutionContext, ExecutionContextManager, TraceEntry, TracePhase};
use crate::error::{AutomationError, AutomationResult};
use crate::rule::{Rule, RuleStatus};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::trigger::{HandlerFuture, Trigger, TriggerError, TriggerHandler};
use crate::Variables;

/// Source recorded on events created by the engine itself
const ENGINE_SOURCE: &str = "automation_engine";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of execution workers
    pub workers: usize,

    /// Capacity of the execution queue
    pub queue_size: usize,

    /// Upper bound for the condition and action phases of one run
    pub execution_timeout: Duration,

    /// How often expired contexts are swept
    pub cleanup_interval: Duration,

    /// Age after which a context is swept
    pub context_max_age: Duration,

    /// Limit on concurrent trigger evaluations per event (`None` = unbounded)
    pub max_concurrent_evaluations: Option<usize>,

    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_size: 1000,
            execution_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5 * 60),
            context_max_age: Duration::from_secs(30 * 60),
            max_concurrent_evaluations: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatistics {
    pub total_rules: usize,
    pub active_rules: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time: Duration,
    pub queue_length: usize,
    pub active_workers: usize,
}

#[derive(Debug, Default)]
struct ExecutionCounters {
    total: u64,
    successful: u64,
    failed: u64,
    average: Duration,
}

/// A queued request to run one rule
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub rule_id: String,
    pub trigger_id: String,
    pub event: Event,

    /// Variables extracted by the matching trigger
    pub trigger_data: Variables,

    /// Parent scope; `None` runs under the engine scope
    pub parent: Option<CancellationToken>,
}

/// Result of [`AutomationEngine::test_rule`]
///
/// The context is returned even when the run failed so its trace can be
/// inspected.
#[derive(Debug)]
pub struct TestRun {
    pub context: Arc<ExecutionContext>,
    pub outcome: AutomationResult<()>,
}

enum RunOutcome {
    ConditionsNotMet,
    Completed,
}

/// Rule registry and executor
pub struct AutomationEngine {
    config: EngineConfig,
    rules: RwLock<HashMap<String, Rule>>,
    scheduler: Arc<Scheduler>,
    contexts: Arc<ExecutionContextManager>,
    env: ActionEnv,
    queue_tx: mpsc::Sender<ExecutionRequest>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ExecutionRequest>>>,
    scheduler_events: Arc<Mutex<Option<mpsc::Receiver<Event>>>>,
    counters: Mutex<ExecutionCounters>,
    active_workers: AtomicUsize,
    running: AtomicBool,
    root: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AutomationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationEngine")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AutomationEngine {
    /// Create an engine that logs service calls and notifications
    pub fn new(config: EngineConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(LoggingServiceCaller),
            Arc::new(LoggingNotificationSink),
        )
    }

    pub fn with_collaborators(
        config: EngineConfig,
        service_caller: Arc<dyn ServiceCaller>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let scheduler_events = scheduler.take_event_receiver();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));

        Self {
            rules: RwLock::new(HashMap::new()),
            scheduler,
            contexts: Arc::new(ExecutionContextManager::new()),
            env: ActionEnv::new(service_caller, notifier),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            scheduler_events: Arc::new(Mutex::new(scheduler_events)),
            counters: Mutex::new(ExecutionCounters::default()),
            active_workers: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            root: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn context_manager(&self) -> &Arc<ExecutionContextManager> {
        &self.contexts
    }

    /// Variables written by global-scope variable actions
    pub fn global_variables(&self) -> Arc<DashMap<String, Value>> {
        Arc::clone(&self.env.globals)
    }

    fn root_token(&self) -> CancellationToken {
        self.root.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // --- Lifecycle ---

    /// Start the scheduler, the worker pool and the background loops
    pub fn start(self: &Arc<Self>) -> AutomationResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AutomationError::AlreadyRunning);
        }

        info!("Starting automation engine");

        if let Err(e) = self.scheduler.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let root = self.root_token();
        let workers = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(workers + 2);

        for worker_id in 0..workers {
            let engine = Arc::clone(self);
            let token = root.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker_id, token).await
            }));
        }

        let engine = Arc::clone(self);
        let token = root.clone();
        handles.push(tokio::spawn(async move {
            engine.scheduler_event_loop(token).await
        }));

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(async move { engine.cleanup_loop(root).await }));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        info!(workers, "Automation engine started");
        Ok(())
    }

    /// Stop background work and cancel every live execution
    pub async fn stop(&self) -> AutomationResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(AutomationError::NotRunning);
        }

        info!("Stopping automation engine");

        if let Err(e) = self.scheduler.stop().await {
            warn!(error = %e, "Error stopping scheduler");
        }

        // Fresh scope so test runs and a later start are not born cancelled
        let old_root = std::mem::replace(
            &mut *self.root.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        old_root.cancel();

        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }

        info!("Automation engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // --- Registry ---

    /// Validate and register a rule
    ///
    /// An empty id is replaced by a generated one, which is returned. A rule
    /// already registered under the same id is replaced and its live
    /// executions are cancelled, as with [`update_rule`](Self::update_rule).
    pub async fn add_rule(&self, mut rule: Rule) -> AutomationResult<String> {
        if rule.id.is_empty() {
            rule.id = Ulid::new().to_string();
        }

        let validation = rule.validate();
        if !validation.valid {
            return Err(AutomationError::InvalidRule(validation.errors));
        }

        rule.status = RuleStatus::Idle;
        rule.touch();

        let mut rules = self.rules.write().await;
        if let Some(previous) = rules.get_mut(&rule.id) {
            self.cleanup_triggers(previous);
        }
        if let Err(e) = self.setup_triggers(&mut rule) {
            if let Some(previous) = rules.get_mut(&rule.id) {
                if let Err(restore) = self.setup_triggers(previous) {
                    error!(rule_id = %previous.id, error = %restore, "Failed to restore rule triggers");
                }
            }
            return Err(e);
        }

        if rules.contains_key(&rule.id) {
            let cancelled = self.contexts.cancel_contexts_for_rule(&rule.id);
            debug!(rule_id = %rule.id, cancelled_executions = cancelled, "Replacing existing rule");
        }

        info!(rule_id = %rule.id, rule_name = %rule.name, "Automation rule added");
        let id = rule.id.clone();
        rules.insert(id.clone(), rule);
        Ok(id)
    }

    /// Replace a rule, keeping its creation time
    ///
    /// Live executions of the old rule are cancelled. If the new triggers
    /// cannot be set up the old rule is restored.
    pub async fn update_rule(&self, mut rule: Rule) -> AutomationResult<()> {
        if rule.id.is_empty() {
            return Err(AutomationError::InvalidRule(vec![
                crate::rule::ValidationError::new("id", "Rule ID is required for update"),
            ]));
        }

        let mut rules = self.rules.write().await;
        let Some(mut old) = rules.remove(&rule.id) else {
            return Err(AutomationError::NotFound(rule.id));
        };

        let validation = rule.validate();
        if !validation.valid {
            rules.insert(old.id.clone(), old);
            return Err(AutomationError::InvalidRule(validation.errors));
        }

        rule.created_at = old.created_at;
        rule.status = RuleStatus::Idle;
        rule.touch();

        self.cleanup_triggers(&mut old);
        self.contexts.cancel_contexts_for_rule(&rule.id);

        if let Err(e) = self.setup_triggers(&mut rule) {
            if let Err(restore) = self.setup_triggers(&mut old) {
                error!(rule_id = %old.id, error = %restore, "Failed to restore rule triggers");
            }
            rules.insert(old.id.clone(), old);
            return Err(e);
        }

        info!(rule_id = %rule.id, rule_name = %rule.name, "Automation rule updated");
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Remove a rule, unsubscribing its triggers and cancelling live runs
    pub async fn remove_rule(&self, rule_id: &str) -> AutomationResult<Rule> {
        let mut rules = self.rules.write().await;
        let mut rule = rules
            .remove(rule_id)
            .ok_or_else(|| AutomationError::NotFound(rule_id.to_string()))?;
        drop(rules);

        self.cleanup_triggers(&mut rule);
        let cancelled = self.contexts.cancel_contexts_for_rule(rule_id);

        info!(
            rule_id = %rule_id,
            rule_name = %rule.name,
            cancelled_executions = cancelled,
            "Automation rule removed"
        );
        Ok(rule)
    }

    pub async fn enable_rule(&self, rule_id: &str) -> AutomationResult<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| AutomationError::NotFound(rule_id.to_string()))?;

        if rule.enabled {
            return Ok(());
        }

        rule.enabled = true;
        rule.touch();
        if let Err(e) = self.setup_triggers(rule) {
            rule.enabled = false;
            return Err(e);
        }

        info!(rule_id = %rule_id, "Rule enabled");
        Ok(())
    }

    pub async fn disable_rule(&self, rule_id: &str) -> AutomationResult<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| AutomationError::NotFound(rule_id.to_string()))?;

        if !rule.enabled {
            return Ok(());
        }

        rule.enabled = false;
        rule.touch();
        self.cleanup_triggers(rule);
        drop(rules);

        self.contexts.cancel_contexts_for_rule(rule_id);
        info!(rule_id = %rule_id, "Rule disabled");
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: &str) -> AutomationResult<Rule> {
        self.rules
            .read()
            .await
            .get(rule_id)
            .cloned()
            .ok_or_else(|| AutomationError::NotFound(rule_id.to_string()))
    }

    pub async fn get_all_rules(&self) -> Vec<Rule> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Subscribe every trigger and register time triggers
    ///
    /// On failure everything set up so far is torn down again.
    fn setup_triggers(&self, rule: &mut Rule) -> AutomationResult<()> {
        if !rule.enabled {
            return Ok(());
        }

        let handler = self.trigger_handler(&rule.id);
        let mut failure = None;
        for trigger in &mut rule.triggers {
            trigger.subscribe(Arc::clone(&handler));

            let Some(time) = trigger.as_time().filter(|t| t.enabled) else {
                continue;
            };
            if let Err(e) = self
                .scheduler
                .schedule_trigger(&rule.id, time, Some(Arc::clone(&handler)))
            {
                failure = Some(AutomationError::TriggerSetup {
                    trigger_id: time.id.clone(),
                    reason: e.to_string(),
                });
                break;
            }
        }

        match failure {
            Some(e) => {
                self.cleanup_triggers(rule);
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn cleanup_triggers(&self, rule: &mut Rule) {
        for trigger in &mut rule.triggers {
            trigger.unsubscribe();
        }
        self.scheduler.unschedule_triggers_for_rule(&rule.id);
    }

    /// Handler shared by every trigger of a rule: enqueue without blocking
    fn trigger_handler(&self, rule_id: &str) -> TriggerHandler {
        let queue = self.queue_tx.clone();
        let rule_id = rule_id.to_string();

        Arc::new(move |trigger: Trigger, event: Event| {
            let trigger_data = trigger
                .as_time()
                .map(|t| t.fire_data(&event))
                .unwrap_or_default();
            let request = ExecutionRequest {
                rule_id: rule_id.clone(),
                trigger_id: trigger.id().to_string(),
                event,
                trigger_data,
                parent: None,
            };
            let result = queue
                .try_send(request)
                .map_err(|_| AutomationError::QueueFull);
            Box::pin(async move { result }) as HandlerFuture
        })
    }

    // --- Event intake ---

    /// Match an event against every trigger of every enabled rule
    ///
    /// Matches are queued; returns how many requests were queued. A full
    /// queue drops the request with a warning. Time triggers never match
    /// here, whatever the event source: scheduler fires reach the rule
    /// through the trigger handler.
    pub async fn handle_event(&self, event: &Event) -> usize {
        let candidates: Vec<(String, Trigger)> = {
            let rules = self.rules.read().await;
            rules
                .values()
                .filter(|rule| rule.enabled)
                .flat_map(|rule| {
                    rule.triggers
                        .iter()
                        .filter(|t| !matches!(t, Trigger::Time(_)))
                        .map(|t| (rule.id.clone(), t.clone()))
                })
                .collect()
        };

        let queued = AtomicUsize::new(0);
        let limit = self.config.max_concurrent_evaluations;
        stream::iter(candidates)
            .for_each_concurrent(limit, |(rule_id, trigger)| {
                let queued = &queued;
                async move {
                    match trigger.evaluate(event) {
                        Ok(Some(trigger_data)) => {
                            debug!(
                                rule_id = %rule_id,
                                trigger_id = %trigger.id(),
                                event_type = %event.event_type,
                                "Trigger matched"
                            );
                            let request = ExecutionRequest {
                                rule_id,
                                trigger_id: trigger.id().to_string(),
                                event: event.clone(),
                                trigger_data,
                                parent: None,
                            };
                            match self.queue_tx.try_send(request) {
                                Ok(()) => {
                                    queued.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(mpsc::error::TrySendError::Full(r)) => {
                                    warn!(rule_id = %r.rule_id, "Execution queue full, dropping request");
                                }
                                Err(mpsc::error::TrySendError::Closed(r)) => {
                                    warn!(rule_id = %r.rule_id, "Execution queue closed, dropping request");
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(
                                rule_id = %rule_id,
                                trigger_id = %trigger.id(),
                                error = %e,
                                "Trigger evaluation failed"
                            );
                        }
                    }
                }
            })
            .await;

        queued.into_inner()
    }

    /// Push-dispatch an event through a trigger's subscribed handler
    pub async fn fire_trigger(
        &self,
        rule_id: &str,
        trigger_id: &str,
        event: Event,
    ) -> AutomationResult<()> {
        let (trigger, handler) = {
            let rules = self.rules.read().await;
            let rule = rules
                .get(rule_id)
                .ok_or_else(|| AutomationError::NotFound(rule_id.to_string()))?;
            let trigger = rule
                .triggers
                .iter()
                .find(|t| t.id() == trigger_id)
                .ok_or_else(|| {
                    AutomationError::NotFound(format!("{}/{}", rule_id, trigger_id))
                })?;
            let handler = trigger
                .handler()
                .ok_or_else(|| TriggerError::NotSubscribed(trigger_id.to_string()))?;
            (trigger.clone(), handler)
        };
        handler(trigger, event).await
    }

    /// Run a rule immediately with a `manual_test` event carrying `data`
    pub async fn test_rule(&self, rule_id: &str, data: EventPayload) -> AutomationResult<TestRun> {
        if !self.rules.read().await.contains_key(rule_id) {
            return Err(AutomationError::NotFound(rule_id.to_string()));
        }

        let event = Event::new(events::MANUAL_TEST, ENGINE_SOURCE).with_data(data);
        let context = self
            .contexts
            .create_context(&self.root_token(), rule_id, events::MANUAL_TEST);
        let outcome = self.execute_rule(&context, &event, Variables::new()).await;

        Ok(TestRun { context, outcome })
    }

    pub async fn statistics(&self) -> EngineStatistics {
        let (total_rules, active_rules) = {
            let rules = self.rules.read().await;
            (rules.len(), rules.values().filter(|r| r.enabled).count())
        };
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        EngineStatistics {
            total_rules,
            active_rules,
            total_executions: counters.total,
            successful_executions: counters.successful,
            failed_executions: counters.failed,
            average_execution_time: counters.average,
            queue_length: self.queue_tx.max_capacity() - self.queue_tx.capacity(),
            active_workers: self.active_workers.load(Ordering::SeqCst),
        }
    }

    // --- Execution ---

    async fn worker_loop(self: Arc<Self>, worker_id: usize, token: CancellationToken) {
        debug!(worker_id, "Worker started");
        loop {
            let request = {
                let mut queue = self.queue_rx.lock().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    request = queue.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                }
            };

            self.active_workers.fetch_add(1, Ordering::SeqCst);
            self.process_request(request).await;
            self.active_workers.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn process_request(&self, request: ExecutionRequest) {
        let parent = request.parent.unwrap_or_else(|| self.root_token());
        let context = self
            .contexts
            .create_context(&parent, &request.rule_id, &request.trigger_id);

        if let Err(e) = self
            .execute_rule(&context, &request.event, request.trigger_data)
            .await
        {
            error!(
                rule_id = %request.rule_id,
                trigger_id = %request.trigger_id,
                execution_id = %context.id(),
                error = %e,
                "Rule execution failed"
            );
        }

        self.contexts.remove_context(context.id());
    }

    /// Run one rule inside `context`
    ///
    /// A false condition ends the run successfully without running actions
    /// and without counting as a successful execution.
    async fn execute_rule(
        &self,
        context: &ExecutionContext,
        event: &Event,
        trigger_data: Variables,
    ) -> AutomationResult<()> {
        let rule_id = context.rule_id().to_string();
        let start = Instant::now();
        let started_at = Utc::now();

        // Check and mark running under one lock
        let rule = {
            let mut rules = self.rules.write().await;
            let rule = rules
                .get_mut(&rule_id)
                .ok_or_else(|| AutomationError::NotFound(rule_id.clone()))?;

            self.counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .total += 1;

            info!(
                rule_id = %rule.id,
                rule_name = %rule.name,
                execution_id = %context.id(),
                "Executing automation rule"
            );

            context.extend_variables(rule.variables.clone());
            seed_event_variables(context, event);
            context.extend_variables(trigger_data);

            if !rule.can_execute() {
                return Err(AutomationError::CannotExecute(rule_id));
            }
            rule.status = RuleStatus::Running;
            rule.clone()
        };

        let timeout = self.config.execution_timeout;
        let result = tokio::select! {
            _ = context.cancellation_token().cancelled() => Err(AutomationError::Cancelled),
            run = tokio::time::timeout(timeout, self.run_steps(context, &rule)) => {
                run.unwrap_or_else(|_| {
                    context.cancel();
                    Err(AutomationError::Timeout(timeout))
                })
            }
        };

        let duration = start.elapsed();
        if let Some(stored) = self.rules.write().await.get_mut(&rule_id) {
            stored.status = RuleStatus::Idle;
            stored.last_run = Some(started_at);
            stored.run_count += 1;
        }

        {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters.average = if counters.average.is_zero() {
                duration
            } else {
                (counters.average + duration) / 2
            };
            match &result {
                Ok(RunOutcome::Completed) => counters.successful += 1,
                Ok(RunOutcome::ConditionsNotMet) => {}
                Err(_) => counters.failed += 1,
            }
        }

        match result {
            Ok(RunOutcome::Completed) => {
                info!(
                    rule_id = %rule_id,
                    execution_id = %context.id(),
                    ?duration,
                    "Rule execution completed successfully"
                );
                Ok(())
            }
            Ok(RunOutcome::ConditionsNotMet) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run_steps(&self, context: &ExecutionContext, rule: &Rule) -> AutomationResult<RunOutcome> {
        let variables = context.variables();
        for (index, condition) in rule.conditions.iter().enumerate() {
            let started = Instant::now();
            let result = condition.evaluate(&variables);
            let passed = matches!(result, Ok(true));

            let mut entry = TraceEntry::new(
                TracePhase::Condition,
                condition.id(),
                format!("condition_{}", index),
                passed,
                started.elapsed(),
            );
            if let Err(e) = &result {
                entry = entry.with_error(e.to_string());
            }
            context.add_trace(entry);

            match result {
                Err(source) => return Err(AutomationError::ConditionFailed { index, source }),
                Ok(false) => {
                    debug!(
                        rule_id = %rule.id,
                        condition_id = %condition.id(),
                        "Rule condition not met"
                    );
                    return Ok(RunOutcome::ConditionsNotMet);
                }
                Ok(true) => {}
            }
        }

        let mut data = variables;
        for (index, action) in rule.actions.iter().enumerate() {
            let started = Instant::now();
            context.push_stack(format!("action_{}", index));
            let result = action
                .execute(&self.env, context.cancellation_token(), &mut data)
                .await;
            context.pop_stack();

            let mut entry = TraceEntry::new(
                TracePhase::Action,
                action.id(),
                format!("action_{}", index),
                result.is_ok(),
                started.elapsed(),
            );
            if let Err(e) = &result {
                entry = entry.with_error(e.to_string());
            }
            context.add_trace(entry);

            if let Err(source) = result {
                context.extend_variables(data);
                return Err(AutomationError::ActionFailed { index, source });
            }
        }
        context.extend_variables(data);

        Ok(RunOutcome::Completed)
    }

    // --- Background loops ---

    async fn scheduler_event_loop(self: Arc<Self>, token: CancellationToken) {
        let receiver = self
            .scheduler_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            warn!("Scheduler event channel unavailable");
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => {
                        self.handle_event(&event).await;
                    }
                    None => break,
                },
            }
        }

        // Hand the receiver back for the next start
        *self
            .scheduler_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }

    async fn cleanup_loop(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.cleanup_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.contexts.cleanup_expired(self.config.context_max_age);
                    if removed > 0 {
                        debug!(removed, "Expired execution contexts removed");
                    }
                }
            }
        }
    }
}

/// Seed the event into the context
///
/// Adds `trigger_event`, `trigger_type` and `trigger_source`, copies any
/// `entity_<id>` entries from the payload, and for state changes provides the
/// new state of the changed entity unless the payload already did.
fn seed_event_variables(context: &ExecutionContext, event: &Event) {
    context.set_variable("trigger_event", Value::Object(event.data.clone()));
    context.set_variable("trigger_type", json!(event.event_type.as_str()));
    context.set_variable("trigger_source", json!(event.source));

    context.extend_variables(
        event
            .data
            .iter()
            .filter(|(key, _)| key.starts_with("entity_"))
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    if event.event_type != events::STATE_CHANGED {
        return;
    }
    let Some(entity_id) = event.entity_id.as_deref() else {
        return;
    };
    let key = format!("entity_{}", entity_id);
    if context.variable(&key).is_some() {
        return;
    }
    let state = event.data.get("new_state").cloned().unwrap_or(Value::Null);
    let attributes = event
        .data
        .get("attributes")
        .cloned()
        .unwrap_or_else(|| json!({}));
    context.set_variable(key, json!({"state": state, "attributes": attributes}));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{DelayAction, ServiceAction, VariableAction};
    use crate::condition::NumericCondition;
    use crate::scheduler::SCHEDULER_SOURCE;
    use crate::trigger::{StateTrigger, TimeTrigger};
    use serde_json::Map;

    fn engine() -> AutomationEngine {
        AutomationEngine::new(EngineConfig {
            workers: 1,
            ..Default::default()
        })
    }

    fn motion_rule(id: &str) -> Rule {
        Rule::new(id, "Motion light")
            .with_trigger(StateTrigger::new("t1", "binary_sensor.motion").to_state("on"))
            .with_action(ServiceAction::new("a1", "light.turn_on"))
    }

    fn payload(value: Value) -> EventPayload {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_add_rule_subscribes_triggers() {
        let engine = engine();
        let id = engine.add_rule(motion_rule("r1")).await.unwrap();
        assert_eq!(id, "r1");

        let rules = engine.rules.read().await;
        assert!(rules["r1"].triggers[0].is_subscribed());
    }

    #[tokio::test]
    async fn test_add_rule_generates_id() {
        let engine = engine();
        let id = engine.add_rule(motion_rule("")).await.unwrap();
        assert!(!id.is_empty());
        assert!(engine.get_rule(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_invalid_rule_rejected() {
        let engine = engine();
        let err = engine.add_rule(Rule::new("r1", "Empty")).await.unwrap_err();
        assert!(matches!(err, AutomationError::InvalidRule(ref errors) if errors.len() >= 2));
        assert!(engine.get_all_rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_time_trigger_registered_and_removed() {
        let engine = engine();
        let rule = motion_rule("r1").with_trigger(TimeTrigger::interval("t2", "5m"));
        engine.add_rule(rule).await.unwrap();
        assert_eq!(engine.scheduler().statistics().total_triggers, 1);

        engine.disable_rule("r1").await.unwrap();
        assert_eq!(engine.scheduler().statistics().total_triggers, 0);

        engine.enable_rule("r1").await.unwrap();
        assert_eq!(engine.scheduler().statistics().total_triggers, 1);

        engine.remove_rule("r1").await.unwrap();
        assert_eq!(engine.scheduler().statistics().total_triggers, 0);
        assert!(matches!(
            engine.remove_rule("r1").await,
            Err(AutomationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_rule_restores_on_setup_failure() {
        let engine = engine();
        engine.add_rule(motion_rule("r1")).await.unwrap();
        let created_at = engine.get_rule("r1").await.unwrap().created_at;

        // Validates, but the scheduler only accepts whitelisted intervals
        let bad = motion_rule("r1").with_trigger(TimeTrigger::interval("t2", "7m"));
        let err = engine.update_rule(bad).await.unwrap_err();
        assert!(matches!(err, AutomationError::TriggerSetup { .. }));

        let stored = engine.get_rule("r1").await.unwrap();
        assert_eq!(stored.triggers.len(), 1);
        assert_eq!(stored.created_at, created_at);
        assert_eq!(engine.scheduler().statistics().total_triggers, 0);

        let mut renamed = motion_rule("r1");
        renamed.name = "Renamed".to_string();
        engine.update_rule(renamed).await.unwrap();
        let stored = engine.get_rule("r1").await.unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.created_at, created_at);
    }

    #[tokio::test]
    async fn test_handle_event_queues_matches() {
        let engine = engine();
        engine.add_rule(motion_rule("r1")).await.unwrap();
        let mut other = motion_rule("r2");
        other.enabled = false;
        engine.add_rule(other).await.unwrap();

        let event = Event::new(events::STATE_CHANGED, "test")
            .with_entity_id("binary_sensor.motion")
            .with_field("old_state", json!("off"))
            .with_field("new_state", json!("on"));
        assert_eq!(engine.handle_event(&event).await, 1);
        assert_eq!(engine.statistics().await.queue_length, 1);

        let unrelated = Event::new(events::STATE_CHANGED, "test").with_entity_id("light.kitchen");
        assert_eq!(engine.handle_event(&unrelated).await, 0);
    }

    #[tokio::test]
    async fn test_time_events_never_fan_out_to_time_triggers() {
        let engine = engine();
        for id in ["r1", "r2"] {
            engine
                .add_rule(motion_rule(id).with_trigger(TimeTrigger::interval("t2", "1m")))
                .await
                .unwrap();
        }

        let tick = Event::new(events::TIME_TRIGGER, SCHEDULER_SOURCE)
            .with_field("rule_id", json!("r1"));
        assert_eq!(engine.handle_event(&tick).await, 0);

        let external = Event::new(events::TIME_TRIGGER, "webhook-client");
        assert_eq!(engine.handle_event(&external).await, 0);
    }

    #[tokio::test]
    async fn test_scheduled_fire_seeds_trigger_variables() {
        let engine = engine();
        let rule = Rule::new("r1", "Morning")
            .with_trigger(TimeTrigger::at("t1", "07:00"))
            .with_action(VariableAction::new("a1", "seen", "{{ trigger_type }}"));
        engine.add_rule(rule).await.unwrap();

        let fired = Event::new(events::TIME_TRIGGER, SCHEDULER_SOURCE)
            .with_field("trigger_time", json!("2024-06-05T07:00:00+00:00"));
        engine.fire_trigger("r1", "t1", fired).await.unwrap();

        let request = engine.queue_rx.lock().await.recv().await.unwrap();
        assert_eq!(request.trigger_data["trigger_type"], "time");

        let context = engine
            .contexts
            .create_context(&CancellationToken::new(), "r1", &request.trigger_id);
        engine
            .execute_rule(&context, &request.event, request.trigger_data)
            .await
            .unwrap();
        assert_eq!(context.variable("seen"), Some(json!("time")));
        assert_eq!(
            context.variable("trigger_time"),
            Some(json!("2024-06-05T07:00:00+00:00"))
        );
    }

    #[tokio::test]
    async fn test_missing_rule_not_counted() {
        let engine = engine();
        let context = engine
            .contexts
            .create_context(&CancellationToken::new(), "ghost", "t1");
        let err = engine
            .execute_rule(&context, &Event::new(events::MANUAL_TEST, "test"), Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::NotFound(_)));
        assert_eq!(engine.statistics().await.total_executions, 0);
    }

    #[tokio::test]
    async fn test_add_rule_replacing_cancels_live_runs() {
        let engine = engine();
        engine.add_rule(motion_rule("r1")).await.unwrap();
        let live = engine
            .contexts
            .create_context(&CancellationToken::new(), "r1", "t1");
        let other = engine
            .contexts
            .create_context(&CancellationToken::new(), "r2", "t1");

        engine.add_rule(motion_rule("r1")).await.unwrap();
        assert!(live.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(engine.get_all_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fire_trigger_enqueues() {
        let engine = engine();
        engine.add_rule(motion_rule("r1")).await.unwrap();

        engine
            .fire_trigger("r1", "t1", Event::new(events::WEBHOOK, "test"))
            .await
            .unwrap();
        assert_eq!(engine.statistics().await.queue_length, 1);

        assert!(engine
            .fire_trigger("r1", "missing", Event::new(events::WEBHOOK, "test"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_queue_full_from_handler() {
        let engine = AutomationEngine::new(EngineConfig {
            workers: 1,
            queue_size: 1,
            ..Default::default()
        });
        engine.add_rule(motion_rule("r1")).await.unwrap();

        let event = Event::new(events::WEBHOOK, "test");
        engine.fire_trigger("r1", "t1", event.clone()).await.unwrap();
        assert!(matches!(
            engine.fire_trigger("r1", "t1", event).await,
            Err(AutomationError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_test_rule_traces_and_counts() {
        let engine = engine();
        let rule = motion_rule("r1").with_condition(
            NumericCondition::new("c1", "sensor.temp").above(20.0),
        );
        engine.add_rule(rule).await.unwrap();

        let run = engine
            .test_rule(
                "r1",
                payload(json!({"entity_sensor.temp": {"state": 25, "attributes": {}}})),
            )
            .await
            .unwrap();
        run.outcome.unwrap();

        let trace = run.context.trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].name, "condition_0");
        assert_eq!(trace[1].name, "action_0");
        assert!(trace.iter().all(|t| t.success));
        assert_eq!(
            run.context.variable("trigger_type"),
            Some(json!(events::MANUAL_TEST))
        );

        let stats = engine.statistics().await;
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful_executions, 1);

        let stored = engine.get_rule("r1").await.unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.status, RuleStatus::Idle);
        assert!(stored.last_run.is_some());
    }

    #[tokio::test]
    async fn test_condition_false_is_not_failure() {
        let engine = engine();
        let rule = motion_rule("r1").with_condition(
            NumericCondition::new("c1", "sensor.temp").above(20.0),
        );
        engine.add_rule(rule).await.unwrap();

        let run = engine
            .test_rule("r1", payload(json!({"entity_sensor.temp": {"state": 15}})))
            .await
            .unwrap();
        assert!(run.outcome.is_ok());
        assert_eq!(run.context.trace().len(), 1);

        let stats = engine.statistics().await;
        assert_eq!(stats.successful_executions, 0);
        assert_eq!(stats.failed_executions, 0);
    }

    #[tokio::test]
    async fn test_condition_error_fails_run() {
        let engine = engine();
        let rule = motion_rule("r1").with_condition(
            NumericCondition::new("c1", "sensor.missing").above(20.0),
        );
        engine.add_rule(rule).await.unwrap();

        let run = engine.test_rule("r1", EventPayload::new()).await.unwrap();
        let err = run.outcome.unwrap_err();
        assert!(err.to_string().starts_with("condition 0 failed"));
        assert!(run.context.trace()[0].error.is_some());
        assert_eq!(engine.statistics().await.failed_executions, 1);
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let engine = AutomationEngine::new(EngineConfig {
            workers: 1,
            execution_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let rule = Rule::new("r1", "Slow")
            .with_trigger(StateTrigger::new("t1", "binary_sensor.motion"))
            .with_action(DelayAction::new("a1", "5s"));
        engine.add_rule(rule).await.unwrap();

        let run = engine.test_rule("r1", EventPayload::new()).await.unwrap();
        assert!(matches!(run.outcome, Err(AutomationError::Timeout(_))));
        assert!(run.context.is_cancelled());
        assert_eq!(engine.get_rule("r1").await.unwrap().status, RuleStatus::Idle);
    }

    #[tokio::test]
    async fn test_state_change_seeds_entity() {
        let engine = engine();
        let context = engine
            .contexts
            .create_context(&CancellationToken::new(), "r1", "t1");
        let event = Event::new(events::STATE_CHANGED, "test")
            .with_entity_id("sensor.temp")
            .with_field("new_state", json!(21.5));

        seed_event_variables(&context, &event);
        assert_eq!(
            context.variable("entity_sensor.temp"),
            Some(json!({"state": 21.5, "attributes": {}}))
        );
        assert_eq!(context.variable("trigger_source"), Some(json!("test")));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let engine = Arc::new(engine());
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.scheduler().is_running());
        assert!(matches!(engine.start(), Err(AutomationError::AlreadyRunning)));

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        assert!(matches!(engine.stop().await, Err(AutomationError::NotRunning)));

        // Restartable
        engine.start().unwrap();
        engine.stop().await.unwrap();
    }
}
