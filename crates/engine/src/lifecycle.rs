//! Lifecycle rules for package revisions.
//!
//! | from \ to        | Draft | Proposed | Published      | DeletionProposed |
//! |------------------|-------|----------|----------------|------------------|
//! | Draft            | noop  | yes      | no             | no               |
//! | Proposed         | yes   | noop     | approval only  | no               |
//! | Published        | no    | no       | no             | yes              |
//! | DeletionProposed | no    | no       | yes            | noop             |
//!
//! Any revision may be deleted.

use kpt_core::{Error, Result};
use kpt_pkg::ConditionStatus;
use kpt_repository::{Lifecycle, PackageRevision};

fn forbidden(from: Lifecycle, to: Lifecycle, why: &str) -> Error {
    Error::lifecycle_forbidden(format!("cannot move from {} to {}: {}", from, to, why)).with_op("engine.lifecycle")
}

/// Checks a lifecycle change requested through a plain update.
pub fn check_update(from: Lifecycle, to: Lifecycle) -> Result<()> {
    use Lifecycle::*;
    match (from, to) {
        (Draft, Draft) | (Draft, Proposed) | (Proposed, Draft) | (Proposed, Proposed) => Ok(()),
        (DeletionProposed, DeletionProposed) => Ok(()),
        (Published, DeletionProposed) | (DeletionProposed, Published) => Ok(()),
        (Proposed, Published) => Err(forbidden(from, to, "publishing requires approval")),
        (Draft, Published) => Err(forbidden(from, to, "only proposed revisions can be approved")),
        (Published, _) => Err(forbidden(from, to, "published revisions are immutable")),
        _ => Err(forbidden(from, to, "transition not allowed")),
    }
}

/// Checks that `rev` can be approved: it is Proposed and every readiness
/// gate has a condition with status True.
pub fn check_approval(rev: &PackageRevision) -> Result<()> {
    if rev.lifecycle != Lifecycle::Proposed {
        return Err(forbidden(rev.lifecycle, Lifecycle::Published, "only proposed revisions can be approved"));
    }
    let unmet: Vec<&str> = rev
        .readiness_gates
        .iter()
        .filter(|gate| {
            !rev.conditions
                .iter()
                .any(|c| &c.condition_type == *gate && c.status == ConditionStatus::True)
        })
        .map(String::as_str)
        .collect();
    if !unmet.is_empty() {
        return Err(forbidden(Lifecycle::Proposed, Lifecycle::Published, &format!("readiness gates not met: {}", unmet.join(", "))));
    }
    Ok(())
}
