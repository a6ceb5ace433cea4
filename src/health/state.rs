//! Sliding-window health state for one backend server
//!
//! A server changes status only after enough results of the opposite kind
//! accumulate in the window, so single probe hiccups do not flap it.

use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not enough samples yet
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckResult {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub window_size: usize,
    /// Failures in the window that make a server unhealthy
    pub unhealthy_threshold: usize,
    /// Successes in the window that make a server healthy again
    pub healthy_threshold: usize,
    /// Samples needed before leaving Unknown
    pub min_samples: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::from_failure_threshold(5)
    }
}

impl WindowConfig {
    /// Window twice the threshold wide, symmetric recovery
    pub fn from_failure_threshold(threshold: u32) -> Self {
        let threshold = threshold.max(1) as usize;
        Self {
            window_size: threshold * 2,
            unhealthy_threshold: threshold,
            healthy_threshold: threshold,
            min_samples: (threshold / 2).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthWindow {
    status: HealthStatus,
    window: VecDeque<CheckResult>,
    config: WindowConfig,
    last_success: Option<Instant>,
}

impl HealthWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            status: HealthStatus::Unknown,
            window: VecDeque::with_capacity(config.window_size),
            config,
            last_success: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Healthy or not yet known
    pub fn is_available(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Returns true if the status changed
    pub fn record_success(&mut self) -> bool {
        self.last_success = Some(Instant::now());
        self.push(CheckResult::Success)
    }

    /// Returns true if the status changed
    pub fn record_failure(&mut self) -> bool {
        self.push(CheckResult::Failure)
    }

    fn count(&self, result: CheckResult) -> usize {
        self.window.iter().filter(|r| **r == result).count()
    }

    fn push(&mut self, result: CheckResult) -> bool {
        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(result);

        let old = self.status;
        self.status = self.next_status();
        old != self.status
    }

    fn next_status(&self) -> HealthStatus {
        if self.window.len() < self.config.min_samples {
            return HealthStatus::Unknown;
        }
        let failures = self.count(CheckResult::Failure);
        let successes = self.count(CheckResult::Success);
        let down = failures >= self.config.unhealthy_threshold;
        let up = successes >= self.config.healthy_threshold;

        match self.status {
            HealthStatus::Unknown if down => HealthStatus::Unhealthy,
            HealthStatus::Unknown if up => HealthStatus::Healthy,
            HealthStatus::Unknown => HealthStatus::Unknown,
            HealthStatus::Healthy if down => HealthStatus::Unhealthy,
            HealthStatus::Healthy => HealthStatus::Healthy,
            HealthStatus::Unhealthy if up => HealthStatus::Healthy,
            HealthStatus::Unhealthy => HealthStatus::Unhealthy,
        }
    }
}

impl Default for HealthWindow {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}
