//! Identifies which template produced an existing set of score rows.
//!
//! Only structure is compared: the set of `(subject, sub-subject-or-main)`
//! pairs present in the rows against the columns of each candidate. Order
//! metadata and student coverage play no part. Two templates with the same
//! set are indistinguishable; the earlier candidate wins.

use crate::error::EngineResult;
use crate::store::{ScoreRecord, ScoreStore, TemplateFilter};
use crate::template::{StructureSet, Template};
use tracing::debug;

pub fn structure_set_of_records(records: &[ScoreRecord]) -> StructureSet {
    records.iter().map(|r| r.structure_key()).collect()
}

/// Returns the first candidate whose structure set equals the rows'.
/// `None` means "no confirmed template"; callers must not substitute a
/// default in that case.
pub fn match_template<'a>(records: &[ScoreRecord], candidates: &'a [Template]) -> Option<&'a Template> {
    if records.is_empty() {
        return None;
    }
    let existing = structure_set_of_records(records);
    let found = candidates.iter().find(|t| {
        let candidate = t.structure_set();
        candidate.len() == existing.len() && existing.is_subset(&candidate)
    });
    debug!(
        columns = existing.len(),
        candidates = candidates.len(),
        matched = found.map(|t| t.id),
        "structural match"
    );
    found
}

/// The teacher's templates for the grade level, or all of the teacher's
/// templates when none exist for that grade. Inactive templates are included:
/// rows produced before a deactivation must still be identified.
pub fn candidate_templates<S: ScoreStore + ?Sized>(
    store: &S,
    teacher_id: i64,
    grade_level: Option<i64>,
) -> EngineResult<Vec<Template>> {
    if grade_level.is_some() {
        let by_grade = store.list_templates(&TemplateFilter {
            teacher_id: Some(teacher_id),
            grade_level,
            is_active: None,
        })?;
        if !by_grade.is_empty() {
            return Ok(by_grade);
        }
    }
    store.list_templates(&TemplateFilter {
        teacher_id: Some(teacher_id),
        grade_level: None,
        is_active: None,
    })
}
