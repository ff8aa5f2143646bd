use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of samples the success and error rates are averaged over.
pub const RATE_WINDOW: u64 = 100;

const UPTIME_MAX: f64 = 100.0;
const UPTIME_RECOVERY_STEP: f64 = 0.1;
const UPTIME_FAILURE_PENALTY: f64 = 5.0;

/// Running health statistics for one provider.
///
/// Fed by health check cycles and by generation requests alike; callers
/// serialize updates per provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Online mean over every sample
    pub average_response_time_ms: f64,
    /// Percentage, averaged over the last `min(total_requests, 100)` samples
    pub success_rate: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Score in `[0, 100]`
    pub uptime: f64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            average_response_time_ms: 0.0,
            success_rate: 100.0,
            error_rate: 0.0,
            total_requests: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            uptime: UPTIME_MAX,
        }
    }
}

impl HealthMetrics {
    /// Fold one sample into the running values.
    pub fn record(&mut self, response_time: Duration, success: bool) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        let sample_ms = response_time.as_secs_f64() * 1000.0;
        self.average_response_time_ms = (self.average_response_time_ms * (n - 1.0) + sample_ms) / n;

        // The previous rate is re-weighted by (window - 1) / window even
        // while fewer than RATE_WINDOW samples exist.
        let window = self.total_requests.min(RATE_WINDOW) as f64;
        let (ok, failed) = if success { (100.0, 0.0) } else { (0.0, 100.0) };
        self.success_rate = (self.success_rate * (window - 1.0) + ok) / window;
        self.error_rate = (self.error_rate * (window - 1.0) + failed) / window;

        let now = Utc::now();
        if success {
            self.consecutive_failures = 0;
            self.last_success = Some(now);
            self.uptime = (self.uptime + UPTIME_RECOVERY_STEP).min(UPTIME_MAX);
        } else {
            self.consecutive_failures += 1;
            self.last_failure = Some(now);
            self.uptime =
                (self.uptime - UPTIME_FAILURE_PENALTY * self.consecutive_failures as f64).max(0.0);
        }
    }
}
