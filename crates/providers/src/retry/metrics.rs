use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use super::RetryContext;
use crate::error::{ErrorKind, ProviderError};

const RECENT_ERROR_LIMIT: usize = 50;

/// One classified failure seen by the executor.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub provider: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// System-wide retry statistics, independent of per-provider health metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Attempts beyond the first, over all operations
    pub total_retries: u64,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
    pub errors_by_provider: HashMap<String, u64>,
    pub recent_errors: VecDeque<ErrorRecord>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl RetryMetrics {
    pub(super) fn record_success(&mut self, attempts: u32) {
        self.total_operations += 1;
        self.successful_operations += 1;
        self.total_retries += u64::from(attempts.saturating_sub(1));
    }

    pub(super) fn record_failure(&mut self, attempts: u32) {
        self.total_operations += 1;
        self.failed_operations += 1;
        self.total_retries += u64::from(attempts.saturating_sub(1));
    }

    pub(super) fn record_error(&mut self, context: &RetryContext, error: &ProviderError) {
        let kind = error.kind();
        let now = Utc::now();
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
        if let Some(provider) = context.provider.as_ref() {
            *self.errors_by_provider.entry(provider.clone()).or_insert(0) += 1;
        }

        if self.recent_errors.len() == RECENT_ERROR_LIMIT {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(ErrorRecord {
            timestamp: now,
            operation: context.operation.clone(),
            provider: context.provider.clone(),
            kind,
            message: error.to_string(),
        });
        self.last_error_at = Some(now);
    }

    /// Percentage of finished operations that succeeded; 100 before any ran.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 100.0;
        }
        self.successful_operations as f64 / self.total_operations as f64 * 100.0
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_kind.values().sum()
    }
}
