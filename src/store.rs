use crate::error::{EngineError, EngineResult};
use crate::template::{assign_orders, StructureKey, SubSubjectEntry, SubjectEntry, Template, TemplateItem};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub id: i64,
    pub student_id: i64,
    pub class_id: i64,
    pub month: u32,
    pub year: i32,
    pub subject_id: i64,
    pub sub_subject_id: Option<i64>,
    pub score: Option<f64>,
    pub template_id: Option<i64>,
}

impl ScoreRecord {
    pub fn structure_key(&self) -> StructureKey {
        StructureKey::new(self.subject_id, self.sub_subject_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplate {
    pub name: String,
    pub teacher_id: i64,
    #[serde(default)]
    pub grade_level: Option<i64>,
    pub items: Vec<TemplateItem>,
}

/// Full-replacement update. There is deliberately no grade level here: it is
/// fixed at creation because materialized rows depend on it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub items: Option<Vec<TemplateItem>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFilter {
    #[serde(default)]
    pub teacher_id: Option<i64>,
    #[serde(default)]
    pub grade_level: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub template_id: i64,
    pub class_id: i64,
    pub month: u32,
    pub year: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub created: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreQuery {
    pub class_id: i64,
    pub month: u32,
    pub year: i32,
    #[serde(default)]
    pub student_id: Option<i64>,
    #[serde(default)]
    pub subject_id: Option<i64>,
    #[serde(default)]
    pub template_id: Option<i64>,
}

impl ScoreQuery {
    pub fn period(class_id: i64, month: u32, year: i32) -> Self {
        Self {
            class_id,
            month,
            year,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub id: i64,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateOutcome {
    pub updated: usize,
    pub not_found: Vec<i64>,
}

/// The remote template/score store. Every call is one request/response.
pub trait ScoreStore {
    fn create_template(&self, new: &NewTemplate) -> EngineResult<Template>;
    fn update_template(&self, id: i64, patch: &TemplatePatch) -> EngineResult<Template>;
    fn get_template(&self, id: i64) -> EngineResult<Template>;
    fn list_templates(&self, filter: &TemplateFilter) -> EngineResult<Vec<Template>>;
    fn delete_template(&self, id: i64) -> EngineResult<()>;
    /// Creates a null-score row for every student × template column that has
    /// no row with the same identity key yet. Safe to repeat.
    fn apply_template(&self, req: &ApplyRequest) -> EngineResult<ApplyOutcome>;
    fn get_scores(&self, query: &ScoreQuery) -> EngineResult<Vec<ScoreRecord>>;
    /// `updated` counts distinct ids; a repeated id keeps its last score.
    fn bulk_update_scores(&self, updates: &[ScoreUpdate]) -> EngineResult<BulkUpdateOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: i64,
    pub name: String,
    pub teacher_id: i64,
    pub grade_level: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: i64,
    pub class_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubSubject {
    pub id: i64,
    pub subject_id: i64,
    pub name: String,
}

/// Class roster and subject catalogue lookups.
pub trait Roster {
    fn class_info(&self, class_id: i64) -> EngineResult<ClassInfo>;
    fn class_students(&self, class_id: i64) -> EngineResult<Vec<Student>>;
    fn subjects(&self) -> EngineResult<Vec<Subject>>;
    fn sub_subjects(&self, subject_id: i64) -> EngineResult<Vec<SubSubject>>;
}

/// Memoized `sub_subjects_of(subjectId)` lookups, kept for the lifetime of a
/// workspace session.
#[derive(Debug, Default)]
pub struct SubSubjectCache {
    by_subject: HashMap<i64, Vec<SubSubject>>,
}

impl SubSubjectCache {
    pub fn sub_subjects_of<R: Roster + ?Sized>(
        &mut self,
        roster: &R,
        subject_id: i64,
    ) -> EngineResult<&[SubSubject]> {
        if !self.by_subject.contains_key(&subject_id) {
            let loaded = roster.sub_subjects(subject_id)?;
            self.by_subject.insert(subject_id, loaded);
        }
        Ok(self
            .by_subject
            .get(&subject_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]))
    }

    pub fn forget(&mut self, subject_id: i64) {
        self.by_subject.remove(&subject_id);
    }

    pub fn clear(&mut self) {
        self.by_subject.clear();
    }
}

pub fn check_period(month: u32, year: i32) -> EngineResult<()> {
    if !(1..=12).contains(&month) {
        return Err(EngineError::BadParams(format!(
            "month must be 1..12, got {}",
            month
        )));
    }
    if year <= 0 {
        return Err(EngineError::BadParams(format!(
            "year must be positive, got {}",
            year
        )));
    }
    Ok(())
}

/// Range and precision check for a score about to be persisted.
pub fn check_score_value(v: f64) -> EngineResult<f64> {
    let invalid = |reason| EngineError::Validation {
        input: v.to_string(),
        reason,
    };
    if !v.is_finite() {
        return Err(invalid("not a number"));
    }
    if !(SCORE_MIN..=SCORE_MAX).contains(&v) {
        return Err(invalid("out of range 0..10"));
    }
    let cents = v * 100.0;
    if (cents - cents.round()).abs() > 1e-6 {
        return Err(invalid("more than 2 decimal places"));
    }
    Ok(v)
}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create_class(
        &self,
        name: &str,
        teacher_id: i64,
        grade_level: Option<i64>,
    ) -> EngineResult<ClassInfo> {
        self.conn.execute(
            "INSERT INTO classes(name, teacher_id, grade_level) VALUES(?, ?, ?)",
            (name, teacher_id, grade_level),
        )?;
        self.class_info(self.conn.last_insert_rowid())
    }

    pub fn list_classes(&self, teacher_id: Option<i64>) -> EngineResult<Vec<ClassInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, teacher_id, grade_level FROM classes
             WHERE (?1 IS NULL OR teacher_id = ?1)
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([teacher_id], |r| {
                Ok(ClassInfo {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    teacher_id: r.get(2)?,
                    grade_level: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_student(&self, class_id: i64, name: &str) -> EngineResult<Student> {
        self.class_info(class_id)?;
        let sort_order: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
            [class_id],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO students(class_id, name, sort_order) VALUES(?, ?, ?)",
            (class_id, name, sort_order),
        )?;
        Ok(Student {
            id: self.conn.last_insert_rowid(),
            class_id,
            name: name.to_string(),
        })
    }

    pub fn create_subject(&self, name: &str) -> EngineResult<Subject> {
        let sort_order: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects",
            [],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO subjects(name, sort_order) VALUES(?, ?)",
            (name, sort_order),
        )?;
        Ok(Subject {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    pub fn create_sub_subject(&self, subject_id: i64, name: &str) -> EngineResult<SubSubject> {
        let exists = self
            .conn
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some();
        if !exists {
            return Err(EngineError::not_found("subject", subject_id));
        }
        let sort_order: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM sub_subjects WHERE subject_id = ?",
            [subject_id],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO sub_subjects(subject_id, name, sort_order) VALUES(?, ?, ?)",
            (subject_id, name, sort_order),
        )?;
        Ok(SubSubject {
            id: self.conn.last_insert_rowid(),
            subject_id,
            name: name.to_string(),
        })
    }

    fn check_items_exist(&self, items: &[TemplateItem]) -> EngineResult<()> {
        for item in items {
            let found = match item.sub_subject_id {
                None => self
                    .conn
                    .query_row(
                        "SELECT 1 FROM subjects WHERE id = ?",
                        [item.subject_id],
                        |r| r.get::<_, i64>(0),
                    )
                    .optional()?,
                Some(sub) => self
                    .conn
                    .query_row(
                        "SELECT 1 FROM sub_subjects WHERE id = ? AND subject_id = ?",
                        (sub, item.subject_id),
                        |r| r.get::<_, i64>(0),
                    )
                    .optional()?,
            };
            if found.is_none() {
                return Err(EngineError::not_found("template item", item.key()));
            }
        }
        Ok(())
    }

    fn write_entries(conn: &Connection, template_id: i64, entries: &[SubjectEntry]) -> EngineResult<()> {
        conn.execute(
            "DELETE FROM template_sub_subjects WHERE template_id = ?",
            [template_id],
        )?;
        conn.execute(
            "DELETE FROM template_subjects WHERE template_id = ?",
            [template_id],
        )?;
        let mut subject_stmt = conn.prepare(
            "INSERT INTO template_subjects(template_id, subject_id, subject_order) VALUES(?, ?, ?)",
        )?;
        let mut sub_stmt = conn.prepare(
            "INSERT INTO template_sub_subjects(template_id, subject_id, sub_subject_id, sub_subject_order)
             VALUES(?, ?, ?, ?)",
        )?;
        for entry in entries {
            subject_stmt.execute((template_id, entry.subject_id, entry.order))?;
            for sub in &entry.sub_subjects {
                sub_stmt.execute((template_id, entry.subject_id, sub.sub_subject_id, sub.order))?;
            }
        }
        Ok(())
    }

    fn load_entries(&self, template_id: i64) -> EngineResult<Vec<SubjectEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject_id, subject_order FROM template_subjects
             WHERE template_id = ? ORDER BY subject_order",
        )?;
        let mut entries = stmt
            .query_map([template_id], |r| {
                Ok(SubjectEntry {
                    subject_id: r.get(0)?,
                    order: r.get(1)?,
                    sub_subjects: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sub_stmt = self.conn.prepare(
            "SELECT subject_id, sub_subject_id, sub_subject_order FROM template_sub_subjects
             WHERE template_id = ? ORDER BY subject_id, sub_subject_order",
        )?;
        let subs = sub_stmt
            .query_map([template_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    SubSubjectEntry {
                        sub_subject_id: r.get(1)?,
                        order: r.get(2)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let index: HashMap<i64, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.subject_id, i))
            .collect();
        for (subject_id, sub) in subs {
            if let Some(&i) = index.get(&subject_id) {
                entries[i].sub_subjects.push(sub);
            }
        }
        Ok(entries)
    }
}

impl ScoreStore for SqliteStore<'_> {
    fn create_template(&self, new: &NewTemplate) -> EngineResult<Template> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(EngineError::BadParams("name must not be empty".to_string()));
        }
        let entries = assign_orders(&new.items)?;
        self.check_items_exist(&new.items)?;

        let now = now_stamp();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO templates(name, teacher_id, grade_level, is_active, created_at, updated_at)
             VALUES(?, ?, ?, 1, ?, ?)",
            (name, new.teacher_id, new.grade_level, &now, &now),
        )?;
        let id = tx.last_insert_rowid();
        Self::write_entries(&tx, id, &entries)?;
        tx.commit()?;

        info!(template_id = id, columns = new.items.len(), "template created");
        self.get_template(id)
    }

    fn update_template(&self, id: i64, patch: &TemplatePatch) -> EngineResult<Template> {
        let current = self.get_template(id)?;
        let entries = match &patch.items {
            Some(items) => {
                let entries = assign_orders(items)?;
                self.check_items_exist(items)?;
                Some(entries)
            }
            None => None,
        };
        let name = match &patch.name {
            Some(n) if n.trim().is_empty() => {
                return Err(EngineError::BadParams("name must not be empty".to_string()))
            }
            Some(n) => n.trim().to_string(),
            None => current.name,
        };
        let is_active = patch.is_active.unwrap_or(current.is_active);

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE templates SET name = ?, is_active = ?, updated_at = ? WHERE id = ?",
            (&name, is_active, now_stamp(), id),
        )?;
        if let Some(entries) = &entries {
            Self::write_entries(&tx, id, entries)?;
        }
        tx.commit()?;

        debug!(template_id = id, replaced_items = entries.is_some(), "template updated");
        self.get_template(id)
    }

    fn get_template(&self, id: i64) -> EngineResult<Template> {
        let header = self
            .conn
            .query_row(
                "SELECT id, name, teacher_id, grade_level, is_active, created_at, updated_at
                 FROM templates WHERE id = ?",
                [id],
                |r| {
                    Ok(Template {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        teacher_id: r.get(2)?,
                        grade_level: r.get(3)?,
                        is_active: r.get(4)?,
                        subjects: Vec::new(),
                        created_at: r.get(5)?,
                        updated_at: r.get(6)?,
                    })
                },
            )
            .optional()?;
        let Some(mut template) = header else {
            return Err(EngineError::not_found("template", id));
        };
        template.subjects = self.load_entries(id)?;
        Ok(template)
    }

    fn list_templates(&self, filter: &TemplateFilter) -> EngineResult<Vec<Template>> {
        let mut sql = String::from("SELECT id FROM templates WHERE 1 = 1");
        let mut bind: Vec<Value> = Vec::new();
        if let Some(teacher_id) = filter.teacher_id {
            sql.push_str(" AND teacher_id = ?");
            bind.push(Value::Integer(teacher_id));
        }
        if let Some(grade_level) = filter.grade_level {
            sql.push_str(" AND grade_level = ?");
            bind.push(Value::Integer(grade_level));
        }
        if let Some(is_active) = filter.is_active {
            sql.push_str(" AND is_active = ?");
            bind.push(Value::Integer(is_active as i64));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(bind), |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter().map(|id| self.get_template(id)).collect()
    }

    fn delete_template(&self, id: i64) -> EngineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE scores SET template_id = NULL WHERE template_id = ?",
            [id],
        )?;
        tx.execute(
            "DELETE FROM template_sub_subjects WHERE template_id = ?",
            [id],
        )?;
        tx.execute("DELETE FROM template_subjects WHERE template_id = ?", [id])?;
        let removed = tx.execute("DELETE FROM templates WHERE id = ?", [id])?;
        if removed == 0 {
            return Err(EngineError::not_found("template", id));
        }
        tx.commit()?;
        info!(template_id = id, "template deleted");
        Ok(())
    }

    fn apply_template(&self, req: &ApplyRequest) -> EngineResult<ApplyOutcome> {
        check_period(req.month, req.year)?;
        let template = self.get_template(req.template_id)?;
        let students = self.class_students(req.class_id)?;
        let columns = template.column_keys();

        let existing: HashSet<(i64, StructureKey)> = self
            .get_scores(&ScoreQuery::period(req.class_id, req.month, req.year))?
            .into_iter()
            .map(|r| (r.student_id, r.structure_key()))
            .collect();

        let now = now_stamp();
        let mut outcome = ApplyOutcome {
            created: 0,
            skipped: 0,
        };
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO scores(student_id, class_id, month, year, subject_id, sub_subject_id,
                                    score, template_id, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?)",
            )?;
            for student in &students {
                for key in &columns {
                    if existing.contains(&(student.id, *key)) {
                        outcome.skipped += 1;
                        continue;
                    }
                    insert.execute((
                        student.id,
                        req.class_id,
                        req.month,
                        req.year,
                        key.subject_id,
                        key.sub_subject_id,
                        req.template_id,
                        &now,
                    ))?;
                    outcome.created += 1;
                }
            }
        }
        tx.commit()?;

        info!(
            template_id = req.template_id,
            class_id = req.class_id,
            month = req.month,
            year = req.year,
            created = outcome.created,
            skipped = outcome.skipped,
            "template applied"
        );
        Ok(outcome)
    }

    fn get_scores(&self, query: &ScoreQuery) -> EngineResult<Vec<ScoreRecord>> {
        let mut sql = String::from(
            "SELECT id, student_id, class_id, month, year, subject_id, sub_subject_id, score, template_id
             FROM scores WHERE class_id = ? AND month = ? AND year = ?",
        );
        let mut bind: Vec<Value> = vec![
            Value::Integer(query.class_id),
            Value::Integer(query.month as i64),
            Value::Integer(query.year as i64),
        ];
        if let Some(student_id) = query.student_id {
            sql.push_str(" AND student_id = ?");
            bind.push(Value::Integer(student_id));
        }
        if let Some(subject_id) = query.subject_id {
            sql.push_str(" AND subject_id = ?");
            bind.push(Value::Integer(subject_id));
        }
        if let Some(template_id) = query.template_id {
            sql.push_str(" AND template_id = ?");
            bind.push(Value::Integer(template_id));
        }
        // Insertion order doubles as first-appearance order for column inference.
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind), |r| {
                Ok(ScoreRecord {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    class_id: r.get(2)?,
                    month: r.get(3)?,
                    year: r.get(4)?,
                    subject_id: r.get(5)?,
                    sub_subject_id: r.get(6)?,
                    score: r.get(7)?,
                    template_id: r.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn bulk_update_scores(&self, updates: &[ScoreUpdate]) -> EngineResult<BulkUpdateOutcome> {
        for u in updates {
            if let Some(v) = u.score {
                check_score_value(v)?;
            }
        }

        // A repeated id keeps its last score and counts once.
        let mut latest: Vec<ScoreUpdate> = Vec::with_capacity(updates.len());
        let mut slot: HashMap<i64, usize> = HashMap::with_capacity(updates.len());
        for u in updates {
            match slot.get(&u.id) {
                Some(&i) => latest[i] = *u,
                None => {
                    slot.insert(u.id, latest.len());
                    latest.push(*u);
                }
            }
        }

        let now = now_stamp();
        let mut outcome = BulkUpdateOutcome::default();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE scores SET score = ?, updated_at = ? WHERE id = ?")?;
            for u in &latest {
                match stmt.execute((u.score, &now, u.id))? {
                    0 => outcome.not_found.push(u.id),
                    _ => outcome.updated += 1,
                }
            }
        }
        tx.commit()?;

        debug!(
            updated = outcome.updated,
            not_found = outcome.not_found.len(),
            "scores bulk updated"
        );
        Ok(outcome)
    }
}

impl Roster for SqliteStore<'_> {
    fn class_info(&self, class_id: i64) -> EngineResult<ClassInfo> {
        self.conn
            .query_row(
                "SELECT id, name, teacher_id, grade_level FROM classes WHERE id = ?",
                [class_id],
                |r| {
                    Ok(ClassInfo {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        teacher_id: r.get(2)?,
                        grade_level: r.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::not_found("class", class_id))
    }

    fn class_students(&self, class_id: i64) -> EngineResult<Vec<Student>> {
        self.class_info(class_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, class_id, name FROM students WHERE class_id = ? ORDER BY sort_order, id",
        )?;
        let rows = stmt
            .query_map([class_id], |r| {
                Ok(Student {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    name: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn subjects(&self) -> EngineResult<Vec<Subject>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM subjects ORDER BY sort_order, id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Subject {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn sub_subjects(&self, subject_id: i64) -> EngineResult<Vec<SubSubject>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject_id, name FROM sub_subjects WHERE subject_id = ? ORDER BY sort_order, id",
        )?;
        let rows = stmt
            .query_map([subject_id], |r| {
                Ok(SubSubject {
                    id: r.get(0)?,
                    subject_id: r.get(1)?,
                    name: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    struct Fixture {
        class_id: i64,
        math: i64,
        khmer: i64,
        reading: i64,
        writing: i64,
    }

    fn seed(store: &SqliteStore<'_>, students: usize) -> Fixture {
        let class = store.create_class("7A", 1, Some(7)).expect("class");
        for i in 0..students {
            store
                .create_student(class.id, &format!("Student {}", i + 1))
                .expect("student");
        }
        let math = store.create_subject("Math").expect("math").id;
        let khmer = store.create_subject("Khmer").expect("khmer").id;
        let reading = store.create_sub_subject(khmer, "Reading").expect("reading").id;
        let writing = store.create_sub_subject(khmer, "Writing").expect("writing").id;
        Fixture {
            class_id: class.id,
            math,
            khmer,
            reading,
            writing,
        }
    }

    fn three_column_template(store: &SqliteStore<'_>, f: &Fixture) -> Template {
        store
            .create_template(&NewTemplate {
                name: "Monthly".to_string(),
                teacher_id: 1,
                grade_level: Some(7),
                items: vec![
                    TemplateItem {
                        subject_id: f.math,
                        sub_subject_id: None,
                    },
                    TemplateItem {
                        subject_id: f.khmer,
                        sub_subject_id: Some(f.reading),
                    },
                    TemplateItem {
                        subject_id: f.khmer,
                        sub_subject_id: Some(f.writing),
                    },
                ],
            })
            .expect("create template")
    }

    #[test]
    fn apply_is_idempotent() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 9);
        let t = three_column_template(&store, &f);

        let req = ApplyRequest {
            template_id: t.id,
            class_id: f.class_id,
            month: 3,
            year: 2025,
        };
        let first = store.apply_template(&req).expect("apply");
        assert_eq!(first, ApplyOutcome { created: 27, skipped: 0 });
        let second = store.apply_template(&req).expect("re-apply");
        assert_eq!(second, ApplyOutcome { created: 0, skipped: 27 });

        let rows = store
            .get_scores(&ScoreQuery::period(f.class_id, 3, 2025))
            .expect("scores");
        assert_eq!(rows.len(), 27);
        assert!(rows.iter().all(|r| r.score.is_none()));
    }

    #[test]
    fn apply_only_fills_missing_rows() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 2);
        let narrow = store
            .create_template(&NewTemplate {
                name: "Math only".to_string(),
                teacher_id: 1,
                grade_level: Some(7),
                items: vec![TemplateItem {
                    subject_id: f.math,
                    sub_subject_id: None,
                }],
            })
            .expect("narrow");
        let wide = three_column_template(&store, &f);

        let mut req = ApplyRequest {
            template_id: narrow.id,
            class_id: f.class_id,
            month: 1,
            year: 2025,
        };
        assert_eq!(store.apply_template(&req).expect("narrow").created, 2);
        req.template_id = wide.id;
        assert_eq!(
            store.apply_template(&req).expect("wide"),
            ApplyOutcome { created: 4, skipped: 2 }
        );
    }

    #[test]
    fn apply_rejects_bad_month() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 1);
        let t = three_column_template(&store, &f);
        let res = store.apply_template(&ApplyRequest {
            template_id: t.id,
            class_id: f.class_id,
            month: 13,
            year: 2025,
        });
        assert!(matches!(res, Err(EngineError::BadParams(_))));
    }

    #[test]
    fn update_replaces_items_and_keeps_grade_level() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 0);
        let t = three_column_template(&store, &f);

        let updated = store
            .update_template(
                t.id,
                &TemplatePatch {
                    name: None,
                    is_active: Some(false),
                    items: Some(vec![
                        TemplateItem {
                            subject_id: f.khmer,
                            sub_subject_id: Some(f.writing),
                        },
                        TemplateItem {
                            subject_id: f.math,
                            sub_subject_id: None,
                        },
                    ]),
                },
            )
            .expect("update");

        assert_eq!(updated.grade_level, Some(7));
        assert!(!updated.is_active);
        assert_eq!(updated.name, "Monthly");
        assert_eq!(
            updated.column_keys(),
            vec![
                StructureKey::new(f.khmer, Some(f.writing)),
                StructureKey::new(f.math, None),
            ]
        );
    }

    #[test]
    fn list_filters_by_grade_and_activity() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 0);
        let a = three_column_template(&store, &f);
        let b = store
            .create_template(&NewTemplate {
                name: "Grade 8".to_string(),
                teacher_id: 1,
                grade_level: Some(8),
                items: vec![TemplateItem {
                    subject_id: f.math,
                    sub_subject_id: None,
                }],
            })
            .expect("b");
        store
            .update_template(
                b.id,
                &TemplatePatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .expect("deactivate");

        let grade7 = store
            .list_templates(&TemplateFilter {
                teacher_id: Some(1),
                grade_level: Some(7),
                is_active: None,
            })
            .expect("list");
        assert_eq!(grade7.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a.id]);

        let active = store
            .list_templates(&TemplateFilter {
                is_active: Some(true),
                ..Default::default()
            })
            .expect("active");
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn unknown_items_are_rejected() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 0);
        // Reading belongs to Khmer, not Math.
        let res = store.create_template(&NewTemplate {
            name: "Broken".to_string(),
            teacher_id: 1,
            grade_level: None,
            items: vec![TemplateItem {
                subject_id: f.math,
                sub_subject_id: Some(f.reading),
            }],
        });
        assert!(matches!(res, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn delete_detaches_scores() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 2);
        let t = three_column_template(&store, &f);
        store
            .apply_template(&ApplyRequest {
                template_id: t.id,
                class_id: f.class_id,
                month: 5,
                year: 2025,
            })
            .expect("apply");

        store.delete_template(t.id).expect("delete");
        let rows = store
            .get_scores(&ScoreQuery::period(f.class_id, 5, 2025))
            .expect("scores");
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.template_id.is_none()));
        assert!(matches!(
            store.delete_template(t.id),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn bulk_update_reports_not_found() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 1);
        let t = three_column_template(&store, &f);
        store
            .apply_template(&ApplyRequest {
                template_id: t.id,
                class_id: f.class_id,
                month: 2,
                year: 2025,
            })
            .expect("apply");
        let rows = store
            .get_scores(&ScoreQuery::period(f.class_id, 2, 2025))
            .expect("scores");

        let outcome = store
            .bulk_update_scores(&[
                ScoreUpdate {
                    id: rows[0].id,
                    score: Some(7.25),
                },
                ScoreUpdate {
                    id: 9999,
                    score: Some(1.0),
                },
            ])
            .expect("bulk");
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.not_found, vec![9999]);

        let math = store
            .get_scores(&ScoreQuery {
                subject_id: Some(f.math),
                ..ScoreQuery::period(f.class_id, 2, 2025)
            })
            .expect("math");
        assert_eq!(math[0].score, Some(7.25));
    }

    #[test]
    fn bulk_update_repeated_id_counts_once_and_keeps_last() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let f = seed(&store, 1);
        let t = three_column_template(&store, &f);
        store
            .apply_template(&ApplyRequest {
                template_id: t.id,
                class_id: f.class_id,
                month: 4,
                year: 2025,
            })
            .expect("apply");
        let id = store
            .get_scores(&ScoreQuery::period(f.class_id, 4, 2025))
            .expect("scores")[0]
            .id;

        let outcome = store
            .bulk_update_scores(&[
                ScoreUpdate {
                    id,
                    score: Some(3.0),
                },
                ScoreUpdate { id, score: None },
                ScoreUpdate {
                    id,
                    score: Some(6.5),
                },
            ])
            .expect("bulk");
        assert_eq!(outcome.updated, 1);
        assert!(outcome.not_found.is_empty());

        let rows = store
            .get_scores(&ScoreQuery::period(f.class_id, 4, 2025))
            .expect("scores");
        assert_eq!(rows[0].score, Some(6.5));
    }

    #[test]
    fn bulk_update_rejects_out_of_range_before_writing() {
        let conn = db::open_in_memory().expect("db");
        let store = SqliteStore::new(&conn);
        let res = store.bulk_update_scores(&[ScoreUpdate {
            id: 1,
            score: Some(10.5),
        }]);
        assert!(matches!(res, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn check_score_value_precision() {
        assert!(check_score_value(10.0).is_ok());
        assert!(check_score_value(0.01).is_ok());
        assert!(check_score_value(9.99).is_ok());
        assert!(check_score_value(9.995).is_err());
        assert!(check_score_value(-0.5).is_err());
        assert!(check_score_value(f64::NAN).is_err());
    }

    struct CountingRoster {
        calls: std::cell::Cell<usize>,
    }

    impl Roster for CountingRoster {
        fn class_info(&self, class_id: i64) -> EngineResult<ClassInfo> {
            Err(EngineError::not_found("class", class_id))
        }
        fn class_students(&self, _class_id: i64) -> EngineResult<Vec<Student>> {
            Ok(Vec::new())
        }
        fn subjects(&self) -> EngineResult<Vec<Subject>> {
            Ok(Vec::new())
        }
        fn sub_subjects(&self, subject_id: i64) -> EngineResult<Vec<SubSubject>> {
            self.calls.set(self.calls.get() + 1);
            Ok(vec![SubSubject {
                id: subject_id * 10,
                subject_id,
                name: "Part".to_string(),
            }])
        }
    }

    #[test]
    fn sub_subject_cache_loads_once_per_subject() {
        let roster = CountingRoster {
            calls: std::cell::Cell::new(0),
        };
        let mut cache = SubSubjectCache::default();
        assert_eq!(cache.sub_subjects_of(&roster, 3).expect("first")[0].id, 30);
        assert_eq!(cache.sub_subjects_of(&roster, 3).expect("second").len(), 1);
        assert_eq!(roster.calls.get(), 1);
        cache.sub_subjects_of(&roster, 4).expect("other subject");
        assert_eq!(roster.calls.get(), 2);
        cache.forget(3);
        cache.sub_subjects_of(&roster, 3).expect("reloaded");
        assert_eq!(roster.calls.get(), 3);
    }
}
