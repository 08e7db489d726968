//! Core domain model for customer bug sync: raw source records, the canonical
//! storage row, and the pure transforms between them.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub mod change;
pub mod closed_loop;
pub mod normalize;

pub use change::{detect_change, ChangeVerdict};
pub use closed_loop::{classify, ClosedLoop};
pub use normalize::{normalize, sanitize_quotes, NormalizeError, SOURCE_TIMESTAMP_FORMAT};

pub const CRATE_NAME: &str = "ccb-core";

/// Destination table for canonical rows.
pub const BUG_TABLE: &str = "ceph_customer_bugs";

/// Column order of [`BUG_TABLE`].
pub const BUG_COLUMNS: [&str; 16] = [
    "reported_date",
    "bug_id",
    "summary",
    "version",
    "target",
    "component",
    "severity",
    "assignee",
    "qa_contact",
    "state",
    "resolution",
    "closed_loop",
    "qa_whiteboard",
    "triaged",
    "reported_by",
    "customer_data",
];

/// Identifier/summary pair returned by a source query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugStub {
    pub id: i64,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugFlag {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExternalBugType {
    #[serde(default)]
    pub description: String,
}

/// External tracker reference attached to a bug (customer case, Polarion item, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBug {
    #[serde(rename = "type", default)]
    pub kind: ExternalBugType,
    #[serde(default)]
    pub ext_description: Option<String>,
}

/// Full bug record as fetched from the source, before normalization.
///
/// `creation_time` is kept verbatim; it is expected in
/// [`SOURCE_TIMESTAMP_FORMAT`] and parsed by [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBug {
    pub id: i64,
    pub product: String,
    pub component: String,
    pub status: String,
    pub resolution: String,
    pub version: String,
    pub target_release: Vec<String>,
    pub summary: String,
    pub creation_time: String,
    pub severity: String,
    pub assigned_to: String,
    pub qa_contact: String,
    pub qa_whiteboard: String,
    pub creator: String,
    #[serde(default)]
    pub flags: Vec<BugFlag>,
    #[serde(default)]
    pub external_bugs: Vec<ExternalBug>,
}

/// Normalized, storage-ready row of [`BUG_TABLE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBugRow {
    pub reported_date: NaiveDateTime,
    pub bug_id: i32,
    pub summary: String,
    pub version: String,
    pub target: String,
    pub component: String,
    pub severity: String,
    pub assignee: String,
    pub qa_contact: String,
    pub state: String,
    pub resolution: String,
    pub closed_loop: bool,
    pub qa_whiteboard: String,
    pub triaged: bool,
    pub reported_by: String,
    pub customer_data: String,
}

pub const STATE_CLOSED: &str = "CLOSED";
pub const RECHECK_RESOLUTIONS: [&str; 2] = ["ERRATA", "CURRENTRELEASE"];
pub const RECHECK_SEVERITIES: [&str; 2] = ["urgent", "high"];

/// Lower bound (exclusive) on `target` for rows revisited on every sync.
///
/// Compared lexically as text, not as a version number.
pub const RECHECK_TARGET_FLOOR: &str = "5";

/// Lower bound (inclusive) on `target` for the published projection.
pub const PUBLISH_TARGET_FLOOR: &str = "5";

impl CanonicalBugRow {
    /// Row still tracked by the target-release re-check pass.
    pub fn is_active_target(&self) -> bool {
        self.target.as_str() > RECHECK_TARGET_FLOOR
    }

    /// Closed high-impact row whose closed loop has not been completed yet.
    pub fn is_closed_loop_pending(&self) -> bool {
        !self.closed_loop
            && self.state == STATE_CLOSED
            && RECHECK_RESOLUTIONS.contains(&self.resolution.as_str())
            && RECHECK_SEVERITIES.contains(&self.severity.as_str())
    }

    pub fn is_published(&self) -> bool {
        self.target.as_str() >= PUBLISH_TARGET_FLOOR
    }
}
