use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// One scorable position: a subject's main column (`sub_subject_id = None`)
/// or one of its sub-subjects. Student-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureKey {
    pub subject_id: i64,
    pub sub_subject_id: Option<i64>,
}

impl StructureKey {
    pub fn new(subject_id: i64, sub_subject_id: Option<i64>) -> Self {
        Self {
            subject_id,
            sub_subject_id,
        }
    }
}

impl fmt::Display for StructureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_subject_id {
            Some(sub) => write!(f, "{}-{}", self.subject_id, sub),
            None => write!(f, "{}-main", self.subject_id),
        }
    }
}

pub type StructureSet = BTreeSet<StructureKey>;

/// Submitted `(subjectId, subSubjectId?)` pair. Position in the submitted list
/// is the only ordering input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateItem {
    pub subject_id: i64,
    #[serde(default)]
    pub sub_subject_id: Option<i64>,
}

impl TemplateItem {
    pub fn key(&self) -> StructureKey {
        StructureKey::new(self.subject_id, self.sub_subject_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubSubjectEntry {
    pub sub_subject_id: i64,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectEntry {
    pub subject_id: i64,
    pub order: u32,
    pub sub_subjects: Vec<SubSubjectEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub teacher_id: i64,
    pub grade_level: Option<i64>,
    pub is_active: bool,
    pub subjects: Vec<SubjectEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl Template {
    /// Column keys in `(subjectOrder, subSubjectOrder)` order. A subject
    /// without sub-subjects contributes its main column.
    pub fn column_keys(&self) -> Vec<StructureKey> {
        let mut subjects: Vec<&SubjectEntry> = self.subjects.iter().collect();
        subjects.sort_by_key(|s| s.order);

        let mut keys = Vec::new();
        for subject in subjects {
            if subject.sub_subjects.is_empty() {
                keys.push(StructureKey::new(subject.subject_id, None));
                continue;
            }
            let mut subs: Vec<&SubSubjectEntry> = subject.sub_subjects.iter().collect();
            subs.sort_by_key(|s| s.order);
            keys.extend(
                subs.into_iter()
                    .map(|s| StructureKey::new(subject.subject_id, Some(s.sub_subject_id))),
            );
        }
        keys
    }

    pub fn structure_set(&self) -> StructureSet {
        self.column_keys().into_iter().collect()
    }
}

/// Recomputes canonical order from submission order.
///
/// `subjectOrder` comes from a running counter bumped the first time a subject
/// is seen; `subSubjectOrder` counts independently inside each subject. Any
/// order integers a client may hold are ignored.
pub fn assign_orders(items: &[TemplateItem]) -> EngineResult<Vec<SubjectEntry>> {
    if items.is_empty() {
        return Err(EngineError::BadParams(
            "template needs at least one item".to_string(),
        ));
    }

    let mut entries: Vec<SubjectEntry> = Vec::new();
    let mut positions: HashMap<i64, usize> = HashMap::new();
    let mut seen: HashSet<StructureKey> = HashSet::new();

    for item in items {
        if !seen.insert(item.key()) {
            return Err(EngineError::BadParams(format!(
                "duplicate template item {}",
                item.key()
            )));
        }

        let pos = *positions.entry(item.subject_id).or_insert_with(|| {
            entries.push(SubjectEntry {
                subject_id: item.subject_id,
                order: entries.len() as u32,
                sub_subjects: Vec::new(),
            });
            entries.len() - 1
        });

        if let Some(sub_subject_id) = item.sub_subject_id {
            let bucket = &mut entries[pos].sub_subjects;
            bucket.push(SubSubjectEntry {
                sub_subject_id,
                order: bucket.len() as u32,
            });
        }
    }

    Ok(entries)
}
