//! Per-connection traffic report: accumulating counters plus a bounded log of
//! recent issues. Mutated only by the owning connection's processing tasks,
//! read concurrently by observers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::StreamError;

/// Issues kept per report; older entries are dropped first.
const MAX_ISSUES: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct ReportIssue {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug)]
pub struct Report {
    started: DateTime<Utc>,
    events_received: AtomicU64,
    bytes_received: AtomicU64,
    events_sent: AtomicU64,
    errors: AtomicU64,
    issues: Mutex<Vec<ReportIssue>>,
}

/// Point-in-time copy of a report, for display layers.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub started: DateTime<Utc>,
    pub events_received: u64,
    pub bytes_received: u64,
    pub events_sent: u64,
    pub errors: u64,
    pub issues: Vec<ReportIssue>,
}

impl Report {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            events_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            issues: Mutex::new(Vec::new()),
        }
    }

    pub fn record_received(&self, bytes: u64) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &StreamError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut issues = self.issues.lock();
        if issues.len() == MAX_ISSUES {
            issues.remove(0);
        }
        issues.push(ReportIssue {
            timestamp: Utc::now(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            started: self.started,
            events_received: self.events_received(),
            bytes_received: self.bytes_received(),
            events_sent: self.events_sent(),
            errors: self.errors(),
            issues: self.issues.lock().clone(),
        }
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}
