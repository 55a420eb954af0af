//! Capacity monitor: time windows, daily budget, restoration events
//!
//! Classifies wall time into day/night/off-hours windows, decides whether
//! tasks may run right now, and watches for the moment a paused daemon gets
//! its capacity back (midnight budget reset, mode switch, or usage drop).
//! Subscribers are notified inline, in registration order; a panicking
//! callback never starves the rest.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveDate, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TimeBasedUsageConfig;

/// Time-of-day capacity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityMode {
    Day,
    Night,
    OffHours,
}

impl std::fmt::Display for CapacityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Night => write!(f, "night"),
            Self::OffHours => write!(f, "off-hours"),
        }
    }
}

/// The contiguous window of hours around a wall time, end exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub mode: CapacityMode,
    pub start_hour: u32,
    pub end_hour: u32,
}

/// Usage reported by the stats provider for the current local day
#[derive(Debug, Clone, Copy, Default)]
pub struct DailyUsage {
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// Source of daily usage numbers the monitor gates on
pub trait UsageStatsProvider: Send + Sync {
    fn current_daily_usage(&self) -> DailyUsage;
    fn active_task_count(&self) -> usize;
    fn daily_budget(&self) -> f64;
}

/// Why capacity came back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorationReason {
    BudgetReset,
    ModeSwitch,
    UsageDecreased,
}

/// Emitted on the paused -> not-paused transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRestoredEvent {
    pub reason: RestorationReason,
    /// Remaining budget fraction at the last evaluation
    pub previous_capacity: f64,
    pub new_capacity: f64,
    pub time_window: TimeWindow,
    pub timestamp: i64,
}

type RestoredCallback = Arc<dyn Fn(&CapacityRestoredEvent) + Send + Sync>;

struct Observation {
    paused: bool,
    day: NaiveDate,
    mode: CapacityMode,
    capacity: f64,
}

struct Decision {
    paused: bool,
    mode: CapacityMode,
    window: TimeWindow,
    capacity: f64,
}

/// Watches time and usage; answers "may tasks run now?"
pub struct CapacityMonitor {
    config: TimeBasedUsageConfig,
    provider: Arc<dyn UsageStatsProvider>,
    last: Mutex<Option<Observation>>,
    subscribers: Mutex<Vec<(u64, RestoredCallback)>>,
    next_sub_id: Mutex<u64>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl CapacityMonitor {
    pub fn new(config: TimeBasedUsageConfig, provider: Arc<dyn UsageStatsProvider>) -> Self {
        Self {
            config,
            provider,
            last: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: Mutex::new(1),
            timer: Mutex::new(None),
        }
    }

    /// Classify a local hour; day wins when the configured sets overlap
    pub fn classify_hour(&self, hour: u32) -> CapacityMode {
        if self.config.day_mode_hours.contains(&hour) {
            CapacityMode::Day
        } else if self.config.night_mode_hours.contains(&hour) {
            CapacityMode::Night
        } else {
            CapacityMode::OffHours
        }
    }

    /// The contiguous window of same-mode hours containing `now`
    pub fn time_window(&self, now: DateTime<Local>) -> TimeWindow {
        let mode = self.classify_hour(now.hour());
        let mut start = now.hour();
        for _ in 0..23 {
            let prev = (start + 23) % 24;
            if self.classify_hour(prev) == mode {
                start = prev;
            } else {
                break;
            }
        }
        let mut end = now.hour();
        for _ in 0..23 {
            let next = (end + 1) % 24;
            if self.classify_hour(next) == mode {
                end = next;
            } else {
                break;
            }
        }
        TimeWindow {
            mode,
            start_hour: start,
            end_hour: (end + 1) % 24,
        }
    }

    /// Whether new work must be held back right now
    pub fn should_pause_tasks(&self, now: DateTime<Local>) -> bool {
        self.decide(now).paused
    }

    /// Milliseconds until the window class next changes
    ///
    /// At an exact transition instant this returns the distance to the
    /// transition after it, never zero.
    pub fn time_until_mode_switch(&self, now: DateTime<Local>) -> Duration {
        let current = self.classify_hour(now.hour());
        let hour_start = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);

        for k in 1..=48 {
            let boundary = hour_start + ChronoDuration::hours(k);
            if self.classify_hour(boundary.hour()) != current {
                return (boundary - now).to_std().unwrap_or_default();
            }
        }
        // Uniform schedule: no switch inside the scan horizon
        (hour_start + ChronoDuration::hours(48) - now).to_std().unwrap_or_default()
    }

    /// Milliseconds until the next local midnight, DST-correct
    pub fn time_until_budget_reset(&self, now: DateTime<Local>) -> Duration {
        let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
        let midnight = next_local_instant(tomorrow);
        (midnight - now).to_std().unwrap_or(Duration::from_millis(1))
    }

    /// Re-evaluate the pause decision, emitting a restoration event on the
    /// paused -> not-paused transition. Returns the current decision.
    pub fn evaluate(&self, now: DateTime<Local>) -> bool {
        let decision = self.decide(now);

        let event = {
            let mut last = self.last.lock().expect("capacity state lock poisoned");
            let event = match last.as_ref() {
                Some(prev) if prev.paused && !decision.paused => {
                    let reason = if prev.day != now.date_naive() {
                        RestorationReason::BudgetReset
                    } else if prev.mode != decision.mode {
                        RestorationReason::ModeSwitch
                    } else {
                        RestorationReason::UsageDecreased
                    };
                    Some(CapacityRestoredEvent {
                        reason,
                        previous_capacity: prev.capacity,
                        new_capacity: decision.capacity,
                        time_window: decision.window.clone(),
                        timestamp: now.timestamp_millis(),
                    })
                }
                _ => None,
            };
            *last = Some(Observation {
                paused: decision.paused,
                day: now.date_naive(),
                mode: decision.mode,
                capacity: decision.capacity,
            });
            event
        };

        if let Some(event) = event {
            info!(reason = ?event.reason, "Capacity restored");
            self.notify(&event);
        }

        decision.paused
    }

    /// Register a restoration callback; starts the internal timer with the
    /// first subscriber. Returns a subscription id for `unsubscribe`.
    pub fn on_capacity_restored<F>(self: &Arc<Self>, callback: F) -> u64
    where
        F: Fn(&CapacityRestoredEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_sub_id.lock().expect("capacity state lock poisoned");
            let id = *next;
            *next += 1;
            id
        };

        let start_timer = {
            let mut subs = self.subscribers.lock().expect("capacity state lock poisoned");
            subs.push((id, Arc::new(callback)));
            subs.len() == 1
        };

        if start_timer {
            self.start_timer();
        }
        id
    }

    /// Remove a subscription; stops the timer with the last subscriber
    pub fn unsubscribe(&self, id: u64) -> bool {
        let (removed, empty) = {
            let mut subs = self.subscribers.lock().expect("capacity state lock poisoned");
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            (subs.len() != before, subs.is_empty())
        };

        if empty && let Some(handle) = self.timer.lock().expect("capacity state lock poisoned").take() {
            handle.abort();
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("capacity state lock poisoned").len()
    }

    fn decide(&self, now: DateTime<Local>) -> Decision {
        let window = self.time_window(now);
        let mode = window.mode;

        let usage = self.provider.current_daily_usage();
        let budget = self.provider.daily_budget();
        let ratio = if budget > 0.0 {
            usage.total_cost / budget
        } else if usage.total_cost > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let capacity = (1.0 - ratio).max(0.0);

        let paused = self.config.enabled
            && (mode == CapacityMode::OffHours
                || ratio >= self.threshold(mode)
                || self.provider.active_task_count() > self.max_active(mode));

        debug!(%mode, ratio, paused, "Capacity decision");
        Decision {
            paused,
            mode,
            window,
            capacity,
        }
    }

    fn threshold(&self, mode: CapacityMode) -> f64 {
        match mode {
            CapacityMode::Day => self.config.day_mode_capacity_threshold,
            CapacityMode::Night => self.config.night_mode_capacity_threshold,
            // Off-hours pauses unconditionally before the threshold matters
            CapacityMode::OffHours => 0.0,
        }
    }

    fn max_active(&self, mode: CapacityMode) -> usize {
        match mode {
            CapacityMode::Day => self.config.day_mode_thresholds.max_active_tasks,
            CapacityMode::Night => self.config.night_mode_thresholds.max_active_tasks,
            CapacityMode::OffHours => 0,
        }
    }

    fn notify(&self, event: &CapacityRestoredEvent) {
        let callbacks: Vec<RestoredCallback> = {
            let subs = self.subscribers.lock().expect("capacity state lock poisoned");
            subs.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("Capacity restoration subscriber panicked; continuing delivery");
            }
        }
    }

    fn start_timer(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime; capacity timer not started");
            return;
        }

        let weak: Weak<CapacityMonitor> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = match weak.upgrade() {
                    Some(monitor) => {
                        let now = Local::now();
                        let until_switch = monitor.time_until_mode_switch(now);
                        let until_reset = monitor.time_until_budget_reset(now);
                        until_switch.min(until_reset) + Duration::from_millis(50)
                    }
                    None => break,
                };
                tokio::time::sleep(sleep_for).await;
                match weak.upgrade() {
                    Some(monitor) => {
                        monitor.evaluate(Local::now());
                    }
                    None => break,
                }
            }
        });
        *self.timer.lock().expect("capacity state lock poisoned") = Some(handle);
    }
}

/// Earliest valid local instant on the given date
///
/// Midnight can be skipped (spring-forward) or duplicated (fall-back); take
/// the first hour that exists, earliest side of any ambiguity.
fn next_local_instant(date: NaiveDate) -> DateTime<Local> {
    for hour in 0..3 {
        if let Some(naive) = date.and_hms_opt(hour, 0, 0) {
            match Local.from_local_datetime(&naive) {
                LocalResult::Single(dt) => return dt,
                LocalResult::Ambiguous(earliest, _) => return earliest,
                LocalResult::None => continue,
            }
        }
    }
    Local::now() + ChronoDuration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MockStats {
        cost: StdMutex<f64>,
        active: StdMutex<usize>,
        budget: f64,
    }

    impl MockStats {
        fn new(budget: f64) -> Arc<Self> {
            Arc::new(Self {
                cost: StdMutex::new(0.0),
                active: StdMutex::new(0),
                budget,
            })
        }

        fn set_cost(&self, cost: f64) {
            *self.cost.lock().unwrap() = cost;
        }

        fn set_active(&self, active: usize) {
            *self.active.lock().unwrap() = active;
        }
    }

    impl UsageStatsProvider for MockStats {
        fn current_daily_usage(&self) -> DailyUsage {
            DailyUsage {
                total_cost: *self.cost.lock().unwrap(),
                total_tokens: 0,
            }
        }

        fn active_task_count(&self) -> usize {
            *self.active.lock().unwrap()
        }

        fn daily_budget(&self) -> f64 {
            self.budget
        }
    }

    fn config() -> TimeBasedUsageConfig {
        // day 8-17, night 22-5, off-hours 6,7,18-21
        TimeBasedUsageConfig::default()
    }

    fn monitor_with(stats: Arc<MockStats>) -> CapacityMonitor {
        CapacityMonitor::new(config(), stats)
    }

    fn at(hour: u32, min: u32, sec: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 16, hour, min, sec).unwrap()
    }

    #[test]
    fn test_classify_hours() {
        let monitor = monitor_with(MockStats::new(10.0));
        assert_eq!(monitor.classify_hour(10), CapacityMode::Day);
        assert_eq!(monitor.classify_hour(23), CapacityMode::Night);
        assert_eq!(monitor.classify_hour(3), CapacityMode::Night);
        assert_eq!(monitor.classify_hour(6), CapacityMode::OffHours);
        assert_eq!(monitor.classify_hour(19), CapacityMode::OffHours);
    }

    #[test]
    fn test_day_wins_overlap() {
        let mut cfg = config();
        cfg.night_mode_hours.push(9); // overlap with day
        let monitor = CapacityMonitor::new(cfg, MockStats::new(10.0));
        assert_eq!(monitor.classify_hour(9), CapacityMode::Day);
    }

    #[test]
    fn test_time_window_bounds() {
        let monitor = monitor_with(MockStats::new(10.0));
        let window = monitor.time_window(at(10, 30, 0));
        assert_eq!(window.mode, CapacityMode::Day);
        assert_eq!(window.start_hour, 8);
        assert_eq!(window.end_hour, 18);

        // Night wraps across midnight: 22..=23, 0..=5
        let window = monitor.time_window(at(2, 0, 0));
        assert_eq!(window.mode, CapacityMode::Night);
        assert_eq!(window.start_hour, 22);
        assert_eq!(window.end_hour, 6);
    }

    #[test]
    fn test_pause_in_off_hours() {
        let stats = MockStats::new(10.0);
        let monitor = monitor_with(stats);
        assert!(monitor.should_pause_tasks(at(6, 30, 0)));
        assert!(!monitor.should_pause_tasks(at(10, 0, 0)));
    }

    #[test]
    fn test_pause_when_budget_threshold_hit() {
        let stats = MockStats::new(10.0);
        let monitor = monitor_with(stats.clone());

        stats.set_cost(6.9); // 69% < 70% day threshold
        assert!(!monitor.should_pause_tasks(at(10, 0, 0)));

        stats.set_cost(7.0); // exactly at threshold
        assert!(monitor.should_pause_tasks(at(10, 0, 0)));

        // Night threshold is looser (90%)
        stats.set_cost(8.5);
        assert!(!monitor.should_pause_tasks(at(23, 0, 0)));
        stats.set_cost(9.0);
        assert!(monitor.should_pause_tasks(at(23, 0, 0)));
    }

    #[test]
    fn test_pause_when_active_tasks_exceed_cap() {
        let stats = MockStats::new(10.0);
        let monitor = monitor_with(stats.clone());

        stats.set_active(3); // at day cap
        assert!(!monitor.should_pause_tasks(at(10, 0, 0)));
        stats.set_active(4); // over day cap
        assert!(monitor.should_pause_tasks(at(10, 0, 0)));

        // Night cap is 1
        stats.set_active(2);
        assert!(monitor.should_pause_tasks(at(23, 0, 0)));
    }

    #[test]
    fn test_disabled_never_pauses() {
        let mut cfg = config();
        cfg.enabled = false;
        let stats = MockStats::new(10.0);
        stats.set_cost(100.0);
        let monitor = CapacityMonitor::new(cfg, stats);
        assert!(!monitor.should_pause_tasks(at(6, 0, 0)));
    }

    #[test]
    fn test_time_until_mode_switch() {
        let monitor = monitor_with(MockStats::new(10.0));

        // 07:30 off-hours, day starts at 08:00
        let d = monitor.time_until_mode_switch(at(7, 30, 0));
        assert_eq!(d, Duration::from_secs(30 * 60));

        // Exactly on the transition: distance to the next transition, never 0
        let d = monitor.time_until_mode_switch(at(8, 0, 0));
        assert_eq!(d, Duration::from_secs(10 * 3600));
    }

    #[test]
    fn test_time_until_budget_reset() {
        let monitor = monitor_with(MockStats::new(10.0));

        let d = monitor.time_until_budget_reset(at(23, 0, 0));
        assert_eq!(d, Duration::from_secs(3600));

        let just_before = at(23, 59, 59) + ChronoDuration::milliseconds(999);
        let d = monitor.time_until_budget_reset(just_before);
        assert_eq!(d, Duration::from_millis(1));
    }

    #[test]
    fn test_restoration_reason_budget_reset() {
        let stats = MockStats::new(10.0);
        let monitor = monitor_with(stats.clone());

        stats.set_cost(10.0);
        assert!(monitor.evaluate(at(12, 0, 0)));

        // Next local day, usage rolled over
        stats.set_cost(0.0);
        let next_day = Local.with_ymd_and_hms(2025, 6, 17, 12, 5, 0).unwrap();

        let events = Arc::new(StdMutex::new(Vec::new()));
        let monitor = Arc::new(monitor);
        let sink = events.clone();
        monitor.on_capacity_restored(move |e| sink.lock().unwrap().push(e.clone()));
        assert!(!monitor.evaluate(next_day));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, RestorationReason::BudgetReset);
        assert!(events[0].new_capacity > events[0].previous_capacity);
    }

    #[test]
    fn test_restoration_reason_mode_switch() {
        let stats = MockStats::new(10.0);
        let monitor = Arc::new(monitor_with(stats));

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        monitor.on_capacity_restored(move |e| sink.lock().unwrap().push(e.reason));

        assert!(monitor.evaluate(at(7, 59, 0))); // off-hours
        assert!(!monitor.evaluate(at(8, 0, 0))); // day

        assert_eq!(*events.lock().unwrap(), vec![RestorationReason::ModeSwitch]);
    }

    #[test]
    fn test_restoration_reason_usage_decreased() {
        let stats = MockStats::new(10.0);
        let monitor = Arc::new(monitor_with(stats.clone()));

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        monitor.on_capacity_restored(move |e| sink.lock().unwrap().push(e.reason));

        stats.set_cost(8.0);
        assert!(monitor.evaluate(at(12, 0, 0)));
        stats.set_cost(1.0);
        assert!(!monitor.evaluate(at(12, 30, 0)));

        assert_eq!(*events.lock().unwrap(), vec![RestorationReason::UsageDecreased]);
    }

    #[test]
    fn test_no_event_without_transition() {
        let stats = MockStats::new(10.0);
        let monitor = Arc::new(monitor_with(stats));

        let count = Arc::new(StdMutex::new(0usize));
        let sink = count.clone();
        monitor.on_capacity_restored(move |_| *sink.lock().unwrap() += 1);

        assert!(!monitor.evaluate(at(10, 0, 0)));
        assert!(!monitor.evaluate(at(10, 5, 0)));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_subscribers_in_order_and_panic_contained() {
        let stats = MockStats::new(10.0);
        let monitor = Arc::new(monitor_with(stats.clone()));

        let order = Arc::new(StdMutex::new(Vec::new()));
        let first = order.clone();
        monitor.on_capacity_restored(move |_| first.lock().unwrap().push("first"));
        monitor.on_capacity_restored(move |_| panic!("subscriber bug"));
        let third = order.clone();
        monitor.on_capacity_restored(move |_| third.lock().unwrap().push("third"));

        stats.set_cost(9.0);
        monitor.evaluate(at(12, 0, 0));
        stats.set_cost(0.0);
        monitor.evaluate(at(12, 10, 0));

        assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let stats = MockStats::new(10.0);
        let monitor = Arc::new(monitor_with(stats.clone()));

        let count = Arc::new(StdMutex::new(0usize));
        let sink = count.clone();
        let id = monitor.on_capacity_restored(move |_| *sink.lock().unwrap() += 1);
        assert_eq!(monitor.subscriber_count(), 1);

        assert!(monitor.unsubscribe(id));
        assert!(!monitor.unsubscribe(id));
        assert_eq!(monitor.subscriber_count(), 0);

        stats.set_cost(9.0);
        monitor.evaluate(at(12, 0, 0));
        stats.set_cost(0.0);
        monitor.evaluate(at(12, 10, 0));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timer_lifecycle_with_runtime() {
        let stats = MockStats::new(10.0);
        let monitor = Arc::new(monitor_with(stats));

        let id = monitor.on_capacity_restored(|_| {});
        assert!(monitor.timer.lock().unwrap().is_some(), "first subscriber starts the timer");

        monitor.unsubscribe(id);
        assert!(monitor.timer.lock().unwrap().is_none(), "last unsubscribe stops the timer");
    }
}
