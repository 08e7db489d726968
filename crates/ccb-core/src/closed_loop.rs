//! Closed-loop classification from QE flags and external references.

use crate::{BugFlag, ExternalBug};

pub const QE_TEST_COVERAGE_FLAG: &str = "qe_test_coverage";

/// External reference kinds that count as a formal requirement or test case.
pub const POLARION_REFERENCE_KINDS: [&str; 2] = ["Polarion Requirement", "Polarion test case"];

const FLAG_DECLINED: &str = "-";
const FLAG_REQUESTED: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClosedLoop {
    pub qe_test_coverage: bool,
    pub polarion_requirement: bool,
}

impl ClosedLoop {
    pub fn is_closed_loop(&self) -> bool {
        self.qe_test_coverage && self.polarion_requirement
    }
}

/// Derive the closed-loop state of a bug.
///
/// Every flag is inspected before coverage is decided: a coverage flag still
/// in the requested (`?`) state forces coverage off wherever it appears in the
/// list. A declined (`-`) coverage flag satisfies the requirement on its own,
/// and the external references are only consulted when it does not.
pub fn classify(flags: &[BugFlag], external_bugs: &[ExternalBug]) -> ClosedLoop {
    let mut has_coverage_flag = false;
    let mut coverage_requested = false;
    let mut polarion_requirement = false;

    for flag in flags
        .iter()
        .filter(|f| f.name.contains(QE_TEST_COVERAGE_FLAG))
    {
        has_coverage_flag = true;
        match flag.status.as_str() {
            FLAG_DECLINED => polarion_requirement = true,
            FLAG_REQUESTED => coverage_requested = true,
            _ => {}
        }
    }

    if !polarion_requirement {
        polarion_requirement = external_bugs.iter().any(|ext| {
            POLARION_REFERENCE_KINDS
                .iter()
                .any(|kind| ext.kind.description.contains(kind))
        });
    }

    ClosedLoop {
        qe_test_coverage: has_coverage_flag && !coverage_requested,
        polarion_requirement,
    }
}
