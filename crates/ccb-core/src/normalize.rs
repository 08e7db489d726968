//! Raw bug record → canonical row.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::closed_loop::classify;
use crate::{CanonicalBugRow, ExternalBug, RawBug};

/// Fixed layout of source creation timestamps, e.g. `20240105T10:15:00`.
pub const SOURCE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H:%M:%S";

const TRIAGED_TOKEN: &str = "triaged";
const EMPTY_DESCRIPTION_PLACEHOLDER: &str = "None";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("bug {bug_id}: creation time {value:?} does not match YYYYMMDDThh:mm:ss")]
    MalformedTimestamp { bug_id: i64, value: String },
    #[error("bug {bug_id}: target release list is empty")]
    MissingTargetRelease { bug_id: i64 },
    #[error("bug id {bug_id} does not fit the bug_id column")]
    BugIdOutOfRange { bug_id: i64 },
}

impl NormalizeError {
    pub fn bug_id(&self) -> i64 {
        match self {
            Self::MalformedTimestamp { bug_id, .. }
            | Self::MissingTargetRelease { bug_id }
            | Self::BugIdOutOfRange { bug_id } => *bug_id,
        }
    }
}

/// Strip double quotes, then single quotes.
pub fn sanitize_quotes(input: &str) -> String {
    input.replace('"', "").replace('\'', "")
}

pub fn parse_source_timestamp(bug_id: i64, value: &str) -> Result<NaiveDateTime, NormalizeError> {
    NaiveDateTime::parse_from_str(value, SOURCE_TIMESTAMP_FORMAT).map_err(|_| {
        NormalizeError::MalformedTimestamp {
            bug_id,
            value: value.to_string(),
        }
    })
}

/// Concatenate the customer-facing descriptions of all external references.
///
/// Descriptions are joined without a separator, in source order; missing,
/// empty and `"None"` descriptions are skipped.
pub fn customer_data(external_bugs: &[ExternalBug]) -> String {
    let joined = external_bugs
        .iter()
        .filter_map(|ext| ext.ext_description.as_deref())
        .filter(|desc| !desc.is_empty() && *desc != EMPTY_DESCRIPTION_PLACEHOLDER)
        .collect::<String>();
    sanitize_quotes(&joined)
}

pub fn normalize(raw: &RawBug) -> Result<CanonicalBugRow, NormalizeError> {
    let bug_id =
        i32::try_from(raw.id).map_err(|_| NormalizeError::BugIdOutOfRange { bug_id: raw.id })?;
    let reported_date = parse_source_timestamp(raw.id, &raw.creation_time)?;
    let target = raw
        .target_release
        .first()
        .cloned()
        .ok_or(NormalizeError::MissingTargetRelease { bug_id: raw.id })?;

    let qa_whiteboard = raw.qa_whiteboard.to_lowercase();
    let triaged = qa_whiteboard.contains(TRIAGED_TOKEN);
    let closed_loop = classify(&raw.flags, &raw.external_bugs).is_closed_loop();

    Ok(CanonicalBugRow {
        reported_date,
        bug_id,
        summary: sanitize_quotes(&raw.summary),
        version: raw.version.clone(),
        target,
        component: raw.component.clone(),
        severity: raw.severity.clone(),
        assignee: raw.assigned_to.clone(),
        qa_contact: raw.qa_contact.clone(),
        state: raw.status.clone(),
        resolution: raw.resolution.clone(),
        closed_loop,
        qa_whiteboard,
        triaged,
        reported_by: raw.creator.clone(),
        customer_data: customer_data(&raw.external_bugs),
    })
}
