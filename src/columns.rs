use crate::store::ScoreRecord;
use crate::template::{StructureKey, Template};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub subject_id: i64,
    pub sub_subject_id: Option<i64>,
    pub order: usize,
}

impl Column {
    pub fn key(&self) -> StructureKey {
        StructureKey::new(self.subject_id, self.sub_subject_id)
    }
}

fn numbered(keys: Vec<StructureKey>) -> Vec<Column> {
    keys.into_iter()
        .enumerate()
        .map(|(order, k)| Column {
            subject_id: k.subject_id,
            sub_subject_id: k.sub_subject_id,
            order,
        })
        .collect()
}

pub fn columns_from_template(template: &Template) -> Vec<Column> {
    numbered(template.column_keys())
}

/// Without a template there is no order to trust: distinct pairs are
/// collected in first-appearance order, then stable-sorted by
/// `(subjectId, subSubjectId or 0)`.
pub fn columns_from_records(records: &[ScoreRecord]) -> Vec<Column> {
    let mut seen: HashSet<StructureKey> = HashSet::new();
    let mut keys: Vec<StructureKey> = records
        .iter()
        .map(|r| r.structure_key())
        .filter(|k| seen.insert(*k))
        .collect();
    keys.sort_by_key(|k| (k.subject_id, k.sub_subject_id.unwrap_or(0)));
    numbered(keys)
}

pub fn derive_columns(template: Option<&Template>, records: &[ScoreRecord]) -> Vec<Column> {
    match template {
        Some(t) => columns_from_template(t),
        None => columns_from_records(records),
    }
}
