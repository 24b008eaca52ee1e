use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref GROUP_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9+_\-]{1,32}$").unwrap();
}

/// Returns true when `name` may be used as a group id.
pub fn is_valid_group_name(name: &str) -> bool {
    GROUP_PATTERN.is_match(name)
}

/// One recorded player count of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub series_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: i32,
}

impl Sample {
    pub fn new(series_id: impl Into<String>, timestamp: i64, value: i32) -> Self {
        Self {
            series_id: series_id.into(),
            timestamp,
            value,
        }
    }

    pub fn point(&self) -> Point {
        Point {
            timestamp: self.timestamp,
            value: self.value,
        }
    }
}

/// A sample stripped of its series id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: i64,
    pub value: i32,
}

impl Point {
    pub fn new(timestamp: i64, value: i32) -> Self {
        Self { timestamp, value }
    }
}

/// Inclusive millisecond range, normally one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub members: Vec<String>,
}

/// Result of aggregating one bucket of series over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakResult {
    Peak { timestamp: i64, value: i64 },
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Group,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeakReport {
    pub label: String,
    pub kind: ReportKind,
    pub window: Window,
    pub result: PeakResult,
}

/// Outcome of a membership mutation whose failure modes are expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Applied(T),
    AlreadyExists,
    NotFound,
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub player_count: i32,
}
