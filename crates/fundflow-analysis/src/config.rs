//! Trace configuration and validation.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use eyre::{eyre, Report, Result};
use fundflow_data::types::ClusterType;

/// Default fraction of the case total an output must exceed to be followed.
pub const DEFAULT_THRESHOLD: f64 = 0.05;

/// Default hop limit.
pub const DEFAULT_MAX_HOPS: u32 = 5;

/// Default per-address transaction cap.
pub const DEFAULT_MAX_RECORDS: usize = 100;

/// Categories that end a path by default.
pub const DEFAULT_STOP_LIST: [ClusterType; 5] = [
    ClusterType::Exchange,
    ClusterType::Mining,
    ClusterType::Mixer,
    ClusterType::Gambling,
    ClusterType::Darknet,
];

/// How child paths are numbered when a hop branches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PathNumbering {
    /// Every extra branch takes the next value of a trace-wide counter, so
    /// path ids are unique across the whole trace.
    #[default]
    Global,
    /// Extra branches take `parent_path + rank`. Sibling subtrees can reuse
    /// the same ids.
    Offset,
}

impl PathNumbering {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathNumbering::Global => "global",
            PathNumbering::Offset => "offset",
        }
    }
}

impl fmt::Display for PathNumbering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathNumbering {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(PathNumbering::Global),
            "offset" => Ok(PathNumbering::Offset),
            other => Err(eyre!("unknown path numbering '{other}' (expected global|offset)")),
        }
    }
}

/// Parameters of one trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceConfig {
    /// Fraction of the case total, in (0, 1).
    pub threshold: f64,
    /// Deepest hop that may be explored.
    pub max_hops: u32,
    /// Cluster categories that stop traversal.
    pub stop_list: HashSet<ClusterType>,
    /// Reporting timezone for event times.
    pub timezone: Tz,
    /// Transaction cap per address fetch.
    pub max_records: usize,
    pub path_numbering: PathNumbering,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            max_hops: DEFAULT_MAX_HOPS,
            stop_list: DEFAULT_STOP_LIST.into_iter().collect(),
            timezone: Tz::CET,
            max_records: DEFAULT_MAX_RECORDS,
            path_numbering: PathNumbering::Global,
        }
    }
}

impl TraceConfig {
    /// Checks every parameter is inside its allowed range.
    ///
    /// # Errors
    /// Returns error describing the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 || self.threshold >= 1.0 {
            return Err(eyre!(
                "threshold must be strictly between 0 and 1, got {}",
                self.threshold
            ));
        }
        if self.max_hops == 0 {
            return Err(eyre!("max_hops must be at least 1"));
        }
        if self.max_records == 0 {
            return Err(eyre!("max_records must be at least 1"));
        }
        Ok(())
    }

    /// Whether `cluster_type` ends a path.
    pub fn stops_at(&self, cluster_type: ClusterType) -> bool {
        self.stop_list.contains(&cluster_type)
    }
}

/// Parses a comma-separated list of cluster categories. An empty string
/// yields an empty list.
///
/// # Errors
/// Returns error naming the first unknown category.
pub fn parse_stop_list(value: &str) -> Result<HashSet<ClusterType>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ClusterType::from_str)
        .collect()
}

/// Parses an IANA timezone name such as `CET` or `Europe/Madrid`.
///
/// # Errors
/// Returns error if the name is unknown.
pub fn parse_timezone(value: &str) -> Result<Tz> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|err| eyre!("unknown timezone '{value}': {err}"))
}
