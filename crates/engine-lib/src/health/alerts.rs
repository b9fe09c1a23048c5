//! Health alerts
//!
//! Handles:
//! - Alert classification by kind and severity
//! - A bounded history of recently processed alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// What the alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Memory,
    Thermal,
    ErrorRate,
    System,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::Memory => write!(f, "memory"),
            AlertKind::Thermal => write!(f, "thermal"),
            AlertKind::ErrorRate => write!(f, "error_rate"),
            AlertKind::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ring buffer of processed alerts. The oldest entry is dropped at capacity.
#[derive(Debug)]
pub struct AlertHistory {
    entries: VecDeque<Alert>,
    capacity: usize,
}

impl AlertHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, alert: Alert) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(alert);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent alerts, newest last
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Highest severity currently in the history
    pub fn max_severity(&self) -> Option<AlertSeverity> {
        self.entries.iter().map(|a| a.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut history = AlertHistory::new(100);
        for i in 0..150 {
            history.push(Alert::new(
                AlertKind::System,
                AlertSeverity::Info,
                format!("alert {}", i),
            ));
        }

        assert_eq!(history.len(), 100);
        let recent = history.recent(2);
        assert_eq!(recent[0].message, "alert 148");
        assert_eq!(recent[1].message, "alert 149");
        assert_eq!(history.recent(1000).first().unwrap().message, "alert 50");
    }

    #[test]
    fn test_max_severity() {
        let mut history = AlertHistory::new(10);
        assert_eq!(history.max_severity(), None);
        history.push(Alert::new(AlertKind::Thermal, AlertSeverity::Warning, "warm"));
        history.push(Alert::new(AlertKind::Memory, AlertSeverity::Critical, "full"));
        history.push(Alert::new(AlertKind::System, AlertSeverity::Info, "ok"));
        assert_eq!(history.max_severity(), Some(AlertSeverity::Critical));
    }

    #[test]
    fn test_serialization() {
        let alert = Alert::new(AlertKind::ErrorRate, AlertSeverity::Warning, "3% errors");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "error_rate");
        assert_eq!(json["severity"], "warning");
    }
}
