//! Time trigger scheduling
//!
//! Every registered [`TimeTrigger`] becomes a cron entry. A single dispatcher
//! task sleeps until the earliest entry is due, then for each due entry:
//!
//! 1. publishes a `time_trigger` event on a bounded channel (dropped with a
//!    warning when the channel is full), and
//! 2. invokes the entry's handler under a timeout. Handler errors are only
//!    logged. An entry whose previous handler call is still running is
//!    skipped for that tick.
//!
//! Cron expressions take an optional seconds field first; five-field
//! expressions get a `0` seconds field prepended. Numeric days of the week
//! follow standard cron (0 or 7 is Sunday, 6 is Saturday) and are rewritten
//! for the `cron` crate, which counts 1 (Sunday) to 7 (Saturday). Day names
//! pass through unchanged.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use dashmap::DashMap;
use ha_core::{events, parse_duration, Event};
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::trigger::{parse_time_of_day, TimeTrigger, Trigger, TriggerHandler};

/// Wait used when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Maximum entries reported in statistics
const MAX_NEXT_SCHEDULES: usize = 10;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unsupported interval: {0} (use cron expression instead)")]
    UnsupportedInterval(String),

    #[error("no scheduling method specified in trigger")]
    NoSchedule,

    #[error("trigger {0} not found")]
    NotFound(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Source recorded on fire events
pub const SCHEDULER_SOURCE: &str = "scheduler";

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Parse a cron expression, accepting 5, 6 or 7 fields
pub(crate) fn parse_cron(expr: &str) -> SchedulerResult<Schedule> {
    let expr = expr.trim();
    let invalid = |reason: String| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };

    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if let Some(weekdays) = fields.get_mut(5) {
        *weekdays = crate_weekdays(weekdays).map_err(invalid)?;
    }

    Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(e.to_string()))
}

/// Rewrite a standard day-of-week field (0-7, Sunday = 0 or 7) into the
/// `cron` crate's 1-7 numbering
fn crate_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let parse_day = |s: &str| -> Result<u32, String> {
        match s.parse::<u32>() {
            Ok(day) if day <= 7 => Ok(day),
            _ => Err(format!("invalid day of week: {}", s)),
        }
    };

    let mut days = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<u32>() {
                Ok(step) if step > 0 => (range, step),
                _ => return Err(format!("invalid step: {}", item)),
            },
            None => (item, 1),
        };
        let (start, end) = match range {
            "*" | "?" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                // "n/step" runs to the end of the week
                None if step > 1 => (parse_day(range)?, 6),
                None => {
                    let day = parse_day(range)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(format!("invalid day range: {}", item));
        }
        days.extend((start..=end).step_by(step as usize).map(|day| day % 7 + 1));
    }

    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Translate a time trigger into a cron expression
fn cron_expression(trigger: &TimeTrigger) -> SchedulerResult<String> {
    if let Some(expr) = trigger.cron.as_deref().filter(|s| !s.is_empty()) {
        parse_cron(expr)?;
        return Ok(expr.to_string());
    }

    if let Some(at) = trigger.at.as_deref().filter(|s| !s.is_empty()) {
        let time = parse_time_of_day(at)
            .ok_or_else(|| SchedulerError::InvalidTrigger(format!("invalid time format: {}", at)))?;
        return Ok(format!(
            "{} {} {} * * *",
            time.second(),
            time.minute(),
            time.hour()
        ));
    }

    if let Some(interval) = trigger.interval.as_deref().filter(|s| !s.is_empty()) {
        let duration = parse_duration(interval)
            .map_err(|_| SchedulerError::InvalidTrigger(format!("invalid interval: {}", interval)))?;
        if duration.subsec_nanos() != 0 {
            return Err(SchedulerError::UnsupportedInterval(interval.to_string()));
        }
        let expr = match duration.as_secs() {
            60 => "0 * * * * *",
            300 => "0 */5 * * * *",
            900 => "0 */15 * * * *",
            1800 => "0 */30 * * * *",
            3600 => "0 0 * * * *",
            _ => return Err(SchedulerError::UnsupportedInterval(interval.to_string())),
        };
        return Ok(expr.to_string());
    }

    Err(SchedulerError::NoSchedule)
}

fn next_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// IANA timezone name; invalid names fall back to UTC
    pub timezone: String,

    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,

    /// Capacity of the fire event channel
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            handler_timeout: Duration::from_secs(30),
            channel_capacity: 100,
        }
    }
}

/// A registered time trigger
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTrigger {
    pub id: String,
    pub rule_id: String,
    pub trigger: TimeTrigger,
    pub entry_id: u64,
    pub cron_expression: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

/// Upcoming fire time reported in statistics
#[derive(Debug, Clone, Serialize)]
pub struct NextSchedule {
    pub trigger_id: String,
    pub rule_id: String,
    pub next_run: Option<DateTime<Utc>>,
    pub prev_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatistics {
    pub running: bool,
    pub total_triggers: usize,
    pub timezone: String,
    pub cron_entries: usize,
    pub next_schedules: Vec<NextSchedule>,
}

struct ScheduleEntry {
    info: ScheduledTrigger,
    schedule: Schedule,
    handler: Option<TriggerHandler>,
    in_flight: Arc<AtomicBool>,
}

/// Work collected while holding the entry table
struct Firing {
    info: ScheduledTrigger,
    handler: Option<TriggerHandler>,
    in_flight: Arc<AtomicBool>,
    fired_at: DateTime<Utc>,
}

type EntryKey = (String, String);

/// Cron-based scheduler for time triggers
///
/// Entries are keyed by `(rule_id, trigger_id)` so equal trigger ids in
/// different rules do not collide.
pub struct Scheduler {
    entries: DashMap<EntryKey, ScheduleEntry>,
    timezone: RwLock<Tz>,
    handler_timeout: Duration,
    next_entry_id: AtomicU64,
    changed: Notify,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<Event>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.entries.len())
            .field("timezone", &self.timezone())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let timezone = match config.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = %config.timezone, "Invalid timezone, using UTC");
                Tz::UTC
            }
        };
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));

        Self {
            entries: DashMap::new(),
            timezone: RwLock::new(timezone),
            handler_timeout: config.handler_timeout,
            next_entry_id: AtomicU64::new(1),
            changed: Notify::new(),
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Start the dispatcher task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(token).await });

        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel);
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(timezone = %self.timezone(), "Automation scheduler started");
        Ok(())
    }

    /// Stop the dispatcher and wait for it to exit
    pub async fn stop(&self) -> SchedulerResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(cancel) = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler dispatcher ended abnormally");
            }
        }

        info!("Automation scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn timezone(&self) -> Tz {
        *self.timezone.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a time trigger, replacing any entry with the same key
    pub fn schedule_trigger(
        &self,
        rule_id: &str,
        trigger: &TimeTrigger,
        handler: Option<TriggerHandler>,
    ) -> SchedulerResult<()> {
        trigger
            .validate()
            .map_err(|e| SchedulerError::InvalidTrigger(e.to_string()))?;
        let expr = cron_expression(trigger)?;
        let schedule = parse_cron(&expr)?;
        let next_run = next_fire(&schedule, self.timezone(), Utc::now());

        let info = ScheduledTrigger {
            id: trigger.id.clone(),
            rule_id: rule_id.to_string(),
            trigger: trigger.clone(),
            entry_id: self.next_entry_id.fetch_add(1, Ordering::SeqCst),
            cron_expression: expr.clone(),
            next_run,
            last_run: None,
            run_count: 0,
        };
        self.entries.insert(
            (rule_id.to_string(), trigger.id.clone()),
            ScheduleEntry {
                info,
                schedule,
                handler,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        );
        self.changed.notify_one();

        info!(
            trigger_id = %trigger.id,
            rule_id = %rule_id,
            cron_expr = %expr,
            next_run = ?next_run,
            "Trigger scheduled"
        );
        Ok(())
    }

    pub fn unschedule_trigger(&self, rule_id: &str, trigger_id: &str) -> SchedulerResult<()> {
        self.entries
            .remove(&(rule_id.to_string(), trigger_id.to_string()))
            .ok_or_else(|| SchedulerError::NotFound(trigger_id.to_string()))?;
        self.changed.notify_one();
        info!(trigger_id = %trigger_id, rule_id = %rule_id, "Trigger unscheduled");
        Ok(())
    }

    /// Remove every entry of a rule; returns how many were removed
    pub fn unschedule_triggers_for_rule(&self, rule_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(rule, _), _| rule != rule_id);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.changed.notify_one();
            debug!(rule_id = %rule_id, removed, "Unscheduled rule triggers");
        }
        removed
    }

    pub fn scheduled_triggers(&self) -> Vec<ScheduledTrigger> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    pub fn scheduled_triggers_for_rule(&self, rule_id: &str) -> Vec<ScheduledTrigger> {
        self.entries
            .iter()
            .filter(|e| e.info.rule_id == rule_id)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Recompute every entry from its trigger under the current timezone
    ///
    /// Entries that no longer translate are dropped and logged. Returns the
    /// number of entries kept.
    pub fn reschedule_all(&self) -> usize {
        let tz = self.timezone();
        let now = Utc::now();
        info!("Rescheduling all triggers");

        self.entries.retain(|_, entry| {
            let rebuilt = cron_expression(&entry.info.trigger)
                .and_then(|expr| parse_cron(&expr).map(|schedule| (expr, schedule)));
            match rebuilt {
                Ok((expr, schedule)) => {
                    entry.info.next_run = next_fire(&schedule, tz, now);
                    entry.info.cron_expression = expr;
                    entry.schedule = schedule;
                    true
                }
                Err(e) => {
                    error!(trigger_id = %entry.info.id, error = %e, "Failed to reschedule trigger");
                    false
                }
            }
        });
        self.changed.notify_one();

        let kept = self.entries.len();
        info!(rescheduled_count = kept, "Trigger rescheduling completed");
        kept
    }

    /// Take the fire event receiver; only the first call gets it
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let mut next_schedules: Vec<NextSchedule> = self
            .entries
            .iter()
            .map(|e| NextSchedule {
                trigger_id: e.info.id.clone(),
                rule_id: e.info.rule_id.clone(),
                next_run: e.info.next_run,
                prev_run: e.info.last_run,
            })
            .collect();
        next_schedules.sort_by_key(|s| (s.next_run.is_none(), s.next_run));
        next_schedules.truncate(MAX_NEXT_SCHEDULES);

        SchedulerStatistics {
            running: self.is_running(),
            total_triggers: self.entries.len(),
            timezone: self.timezone().to_string(),
            cron_entries: self
                .entries
                .iter()
                .filter(|e| e.info.next_run.is_some())
                .count(),
            next_schedules,
        }
    }

    /// Check that a trigger validates and translates to a schedule
    pub fn validate_schedule(&self, trigger: &TimeTrigger) -> SchedulerResult<()> {
        trigger
            .validate()
            .map_err(|e| SchedulerError::InvalidTrigger(e.to_string()))?;
        let expr = cron_expression(trigger)?;
        parse_cron(&expr).map(|_| ())
    }

    /// Next `count` fire times of a registered trigger
    pub fn next_runs(
        &self,
        rule_id: &str,
        trigger_id: &str,
        count: usize,
    ) -> SchedulerResult<Vec<DateTime<Utc>>> {
        let entry = self
            .entries
            .get(&(rule_id.to_string(), trigger_id.to_string()))
            .ok_or_else(|| SchedulerError::NotFound(trigger_id.to_string()))?;
        let tz = self.timezone();
        Ok(entry
            .schedule
            .after(&Utc::now().with_timezone(&tz))
            .take(count)
            .map(|dt| dt.with_timezone(&Utc))
            .collect())
    }

    /// Switch timezone and reschedule every entry
    pub fn set_timezone(&self, name: &str) -> SchedulerResult<()> {
        let tz = name
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))?;
        *self.timezone.write().unwrap_or_else(PoisonError::into_inner) = tz;
        info!(timezone = %tz, "Scheduler timezone changed");
        self.reschedule_all();
        Ok(())
    }

    // --- Dispatch ---

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("Scheduler dispatcher started");
        loop {
            self.fire_due(Utc::now());

            let wait = self
                .earliest_next_run()
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Scheduler dispatcher stopped");
    }

    fn earliest_next_run(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|e| e.info.next_run).min()
    }

    fn fire_due(&self, now: DateTime<Utc>) {
        let tz = self.timezone();
        let mut due = Vec::new();

        for mut entry in self.entries.iter_mut() {
            let Some(next_run) = entry.info.next_run else {
                continue;
            };
            if next_run > now {
                continue;
            }

            let entry = &mut *entry;
            entry.info.next_run = next_fire(&entry.schedule, tz, now);

            if entry.in_flight.load(Ordering::SeqCst) {
                debug!(
                    trigger_id = %entry.info.id,
                    rule_id = %entry.info.rule_id,
                    "Previous run still in progress, skipping"
                );
                continue;
            }

            entry.info.run_count += 1;
            entry.info.last_run = Some(now);
            due.push(Firing {
                info: entry.info.clone(),
                handler: entry.handler.clone(),
                in_flight: Arc::clone(&entry.in_flight),
                fired_at: now,
            });
        }

        for firing in due {
            self.dispatch(firing);
        }
    }

    fn dispatch(&self, firing: Firing) {
        let Firing {
            info,
            handler,
            in_flight,
            fired_at,
        } = firing;

        debug!(trigger_id = %info.id, rule_id = %info.rule_id, "Executing scheduled trigger");

        let event = Event::new(events::TIME_TRIGGER, SCHEDULER_SOURCE)
            .with_field("trigger_id", json!(info.id))
            .with_field("rule_id", json!(info.rule_id))
            .with_field("trigger_time", json!(fired_at.to_rfc3339()))
            .with_field("run_count", json!(info.run_count))
            .at(fired_at);

        match self.event_tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(trigger_id = %info.id, "Event channel full, dropping trigger event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(trigger_id = %info.id, "Event channel closed");
            }
        }

        let Some(handler) = handler else {
            return;
        };
        in_flight.store(true, Ordering::SeqCst);
        let timeout = self.handler_timeout;

        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let trigger = Trigger::Time(info.trigger.clone());
            match tokio::time::timeout(timeout, handler(trigger, event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        trigger_id = %info.id,
                        rule_id = %info.rule_id,
                        error = %e,
                        "Trigger handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        trigger_id = %info.id,
                        rule_id = %info.rule_id,
                        ?timeout,
                        "Trigger handler timed out"
                    );
                }
            }
            in_flight.store(false, Ordering::SeqCst);
            debug!(
                trigger_id = %info.id,
                rule_id = %info.rule_id,
                duration = ?started.elapsed(),
                "Scheduled trigger execution completed"
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::HandlerFuture;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(SchedulerConfig::default()))
    }

    #[test]
    fn test_parse_cron_field_counts() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 30 7 * * *").is_ok());
        assert!(parse_cron("0 30 7 * * * 2030").is_ok());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    fn weekdays(expr: &str, count: usize) -> Vec<chrono::Weekday> {
        use chrono::Datelike;
        parse_cron(expr)
            .unwrap()
            .upcoming(Utc)
            .take(count)
            .map(|dt| dt.weekday())
            .collect()
    }

    #[test]
    fn test_parse_cron_standard_weekday_numbers() {
        use chrono::Weekday::*;

        let mut workdays = weekdays("0 7 * * 1-5", 10);
        workdays.sort_by_key(|d| d.num_days_from_monday());
        workdays.dedup();
        assert_eq!(workdays, vec![Mon, Tue, Wed, Thu, Fri]);

        assert!(weekdays("0 7 * * 1", 3).iter().all(|d| *d == Mon));
        assert!(weekdays("0 7 * * 0", 3).iter().all(|d| *d == Sun));
        assert!(weekdays("0 7 * * 7", 3).iter().all(|d| *d == Sun));
        assert!(weekdays("0 0 7 * * 6", 3).iter().all(|d| *d == Sat));

        let mut weekend = weekdays("0 9 * * 6,0", 6);
        weekend.sort_by_key(|d| d.num_days_from_monday());
        weekend.dedup();
        assert_eq!(weekend, vec![Sat, Sun]);

        assert!(weekdays("0 7 * * MON", 3).iter().all(|d| *d == Mon));
        assert!(parse_cron("0 7 * * 8").is_err());
        assert!(parse_cron("0 7 * * 5-1").is_err());
    }

    #[test]
    fn test_cron_expression_translation() {
        assert_eq!(
            cron_expression(&TimeTrigger::at("t", "07:30")).unwrap(),
            "0 30 7 * * *"
        );
        assert_eq!(
            cron_expression(&TimeTrigger::at("t", "23:59:15")).unwrap(),
            "15 59 23 * * *"
        );
        assert_eq!(
            cron_expression(&TimeTrigger::interval("t", "5m")).unwrap(),
            "0 */5 * * * *"
        );
        assert_eq!(
            cron_expression(&TimeTrigger::interval("t", "1h")).unwrap(),
            "0 0 * * * *"
        );
        assert!(matches!(
            cron_expression(&TimeTrigger::interval("t", "2m")),
            Err(SchedulerError::UnsupportedInterval(_))
        ));
        assert!(matches!(
            cron_expression(&TimeTrigger::new("t")),
            Err(SchedulerError::NoSchedule)
        ));
    }

    #[test]
    fn test_schedule_and_unschedule() {
        let scheduler = scheduler();
        scheduler
            .schedule_trigger("rule_1", &TimeTrigger::interval("t1", "1m"), None)
            .unwrap();
        assert_eq!(scheduler.statistics().total_triggers, 1);

        let scheduled = scheduler.scheduled_triggers_for_rule("rule_1");
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].cron_expression, "0 * * * * *");
        assert!(scheduled[0].next_run.is_some());

        scheduler.unschedule_trigger("rule_1", "t1").unwrap();
        assert_eq!(scheduler.statistics().total_triggers, 0);
        assert!(matches!(
            scheduler.unschedule_trigger("rule_1", "t1"),
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[test]
    fn test_same_trigger_id_in_two_rules() {
        let scheduler = scheduler();
        let trigger = TimeTrigger::at("morning", "07:00");
        scheduler.schedule_trigger("rule_a", &trigger, None).unwrap();
        scheduler.schedule_trigger("rule_b", &trigger, None).unwrap();
        assert_eq!(scheduler.scheduled_triggers().len(), 2);

        assert_eq!(scheduler.unschedule_triggers_for_rule("rule_a"), 1);
        assert_eq!(scheduler.scheduled_triggers()[0].rule_id, "rule_b");
    }

    #[test]
    fn test_rejects_invalid_triggers() {
        let scheduler = scheduler();
        assert!(scheduler
            .schedule_trigger("r", &TimeTrigger::interval("t", "7m"), None)
            .is_err());
        assert!(scheduler
            .schedule_trigger("r", &TimeTrigger::cron("t", "bogus"), None)
            .is_err());
        assert!(scheduler.validate_schedule(&TimeTrigger::at("t", "25:00")).is_err());
        assert!(scheduler.validate_schedule(&TimeTrigger::cron("t", "0 7 * * *")).is_ok());
        assert_eq!(scheduler.statistics().total_triggers, 0);
    }

    #[test]
    fn test_next_runs_follow_schedule() {
        let scheduler = scheduler();
        scheduler
            .schedule_trigger("r", &TimeTrigger::at("t", "06:15"), None)
            .unwrap();
        let runs = scheduler.next_runs("r", "t", 3).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1] - runs[0], chrono::Duration::days(1));
        assert_eq!(runs[2] - runs[1], chrono::Duration::days(1));
        assert!(runs.iter().all(|r| r.format("%H:%M:%S").to_string() == "06:15:00"));
    }

    #[test]
    fn test_timezone_fallback_and_change() {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
            timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        }));
        assert_eq!(scheduler.timezone(), Tz::UTC);

        scheduler
            .schedule_trigger("r", &TimeTrigger::at("t", "06:00"), None)
            .unwrap();
        scheduler.set_timezone("Europe/Berlin").unwrap();
        assert_eq!(scheduler.statistics().timezone, "Europe/Berlin");

        let next = scheduler.next_runs("r", "t", 1).unwrap()[0];
        let local = next.with_timezone(&chrono_tz::Europe::Berlin);
        assert_eq!(local.format("%H:%M").to_string(), "06:00");

        assert!(scheduler.set_timezone("Nowhere/Else").is_err());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = scheduler();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_fires_event_and_handler() {
        let scheduler = scheduler();
        let mut rx = scheduler.take_event_receiver().unwrap();
        assert!(scheduler.take_event_receiver().is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: TriggerHandler = Arc::new(move |_trigger: Trigger, _event: Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) }) as HandlerFuture
        });

        scheduler
            .schedule_trigger("rule_1", &TimeTrigger::cron("tick", "* * * * * *"), Some(handler))
            .unwrap();
        scheduler.start().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("scheduler should fire within the timeout")
            .unwrap();
        assert_eq!(event.event_type, events::TIME_TRIGGER);
        assert_eq!(event.source, SCHEDULER_SOURCE);
        assert_eq!(event.data.get("rule_id"), Some(&json!("rule_1")));
        assert_eq!(event.data.get("trigger_id"), Some(&json!("tick")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(scheduler.scheduled_triggers()[0].run_count >= 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_skips_while_previous_run_in_flight() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: TriggerHandler = Arc::new(move |_trigger: Trigger, _event: Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }) as HandlerFuture
        });

        scheduler
            .schedule_trigger("rule_1", &TimeTrigger::cron("tick", "* * * * * *"), Some(handler))
            .unwrap();
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2600)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.scheduled_triggers()[0].run_count, 1);
        scheduler.stop().await.unwrap();
    }
}
