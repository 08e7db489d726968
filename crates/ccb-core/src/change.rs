//! Semantic change detection between a freshly fetched row and the stored one.

use crate::normalize::sanitize_quotes;
use crate::CanonicalBugRow;

/// Outcome of comparing two canonical rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeVerdict {
    Unchanged,
    /// Names of the columns whose values differ.
    Changed { fields: Vec<&'static str> },
}

impl ChangeVerdict {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Compare every tracked column of `fetched` against `stored`.
///
/// `reported_date`, `bug_id` and `summary` are not tracked. Text columns are
/// compared as whitespace-separated token sequences with quote characters
/// removed, so quoting and spacing artifacts never count as a change.
pub fn detect_change(fetched: &CanonicalBugRow, stored: &CanonicalBugRow) -> ChangeVerdict {
    let text_columns: [(&'static str, &str, &str); 11] = [
        ("version", &fetched.version, &stored.version),
        ("target", &fetched.target, &stored.target),
        ("component", &fetched.component, &stored.component),
        ("severity", &fetched.severity, &stored.severity),
        ("assignee", &fetched.assignee, &stored.assignee),
        ("qa_contact", &fetched.qa_contact, &stored.qa_contact),
        ("state", &fetched.state, &stored.state),
        ("resolution", &fetched.resolution, &stored.resolution),
        ("qa_whiteboard", &fetched.qa_whiteboard, &stored.qa_whiteboard),
        ("reported_by", &fetched.reported_by, &stored.reported_by),
        ("customer_data", &fetched.customer_data, &stored.customer_data),
    ];
    let flag_columns = [
        ("closed_loop", fetched.closed_loop, stored.closed_loop),
        ("triaged", fetched.triaged, stored.triaged),
    ];

    let mut fields = text_columns
        .iter()
        .filter(|(_, a, b)| !same_tokens(a, b))
        .map(|(name, _, _)| *name)
        .collect::<Vec<_>>();
    fields.extend(
        flag_columns
            .iter()
            .filter(|(_, a, b)| a != b)
            .map(|(name, _, _)| *name),
    );

    if fields.is_empty() {
        ChangeVerdict::Unchanged
    } else {
        ChangeVerdict::Changed { fields }
    }
}

fn same_tokens(a: &str, b: &str) -> bool {
    tokens(a) == tokens(b)
}

fn tokens(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(sanitize_quotes)
        .filter(|token| !token.is_empty())
        .collect()
}
