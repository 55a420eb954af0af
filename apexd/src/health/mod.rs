//! Daemon health monitoring
//!
//! Tracks uptime, resident memory, restart history, and runs periodic
//! health checks on the configured interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;

/// Default ceiling before a check reports unhealthy (2 GiB)
const DEFAULT_MAX_RSS_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Snapshot returned by a health check
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub uptime: Duration,
    pub memory_rss_bytes: Option<u64>,
    pub restart_count: usize,
    pub checks_run: u64,
    pub last_check_at: Option<i64>,
}

/// Supervises the daemon's own process health
pub struct HealthMonitor {
    started: Instant,
    interval: Duration,
    enabled: bool,
    max_rss_bytes: u64,
    restart_history: Mutex<Vec<i64>>,
    checks_run: AtomicU64,
    last_check_at: Mutex<Option<i64>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            started: Instant::now(),
            interval: Duration::from_millis(config.interval_ms),
            enabled: config.enabled,
            max_rss_bytes: DEFAULT_MAX_RSS_BYTES,
            restart_history: Mutex::new(Vec::new()),
            checks_run: AtomicU64::new(0),
            last_check_at: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Record a daemon restart (called on startup after a crash)
    pub fn record_restart(&self) {
        self.restart_history
            .lock()
            .expect("health lock poisoned")
            .push(apexstore::now_ms());
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Run one health check and return the snapshot
    pub fn check(&self) -> HealthReport {
        self.checks_run.fetch_add(1, Ordering::SeqCst);
        let now = apexstore::now_ms();
        *self.last_check_at.lock().expect("health lock poisoned") = Some(now);

        let memory = read_rss_bytes();
        let healthy = memory.map(|m| m < self.max_rss_bytes).unwrap_or(true);
        if !healthy {
            warn!(?memory, "Health check failed: memory over ceiling");
        }

        HealthReport {
            healthy,
            uptime: self.uptime(),
            memory_rss_bytes: memory,
            restart_count: self.restart_history.lock().expect("health lock poisoned").len(),
            checks_run: self.checks_run.load(Ordering::SeqCst),
            last_check_at: Some(now),
        }
    }

    /// Spawn the periodic check task (no-op when disabled)
    pub fn start(self: &Arc<Self>) {
        if !self.enabled {
            debug!("Health checks disabled");
            return;
        }
        let mut timer = self.timer.lock().expect("health lock poisoned");
        if timer.is_some() {
            return;
        }

        let weak: Weak<HealthMonitor> = Arc::downgrade(self);
        let interval = self.interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(monitor) => {
                        let report = monitor.check();
                        debug!(uptime_secs = report.uptime.as_secs(), rss = ?report.memory_rss_bytes, "Health check");
                    }
                    None => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().expect("health lock poisoned").take() {
            handle.abort();
        }
    }
}

/// Resident set size of this process, when the platform exposes it
fn read_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_ms: 10,
        }
    }

    #[test]
    fn test_check_counts_and_uptime() {
        let monitor = HealthMonitor::new(&config());
        let first = monitor.check();
        assert_eq!(first.checks_run, 1);
        assert!(first.last_check_at.is_some());

        let second = monitor.check();
        assert_eq!(second.checks_run, 2);
        assert!(second.uptime >= first.uptime);
    }

    #[test]
    fn test_restart_history() {
        let monitor = HealthMonitor::new(&config());
        assert_eq!(monitor.check().restart_count, 0);
        monitor.record_restart();
        monitor.record_restart();
        assert_eq!(monitor.check().restart_count, 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_readable_on_linux() {
        let rss = read_rss_bytes();
        assert!(rss.is_some());
        assert!(rss.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_periodic_checks_run() {
        let monitor = Arc::new(HealthMonitor::new(&config()));
        monitor.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.stop();
        assert!(monitor.check().checks_run > 1, "timer ran checks");
    }

    #[tokio::test]
    async fn test_disabled_monitor_does_not_spawn() {
        let monitor = Arc::new(HealthMonitor::new(&HealthCheckConfig {
            enabled: false,
            interval_ms: 10,
        }));
        monitor.start();
        assert!(monitor.timer.lock().unwrap().is_none());
    }
}
